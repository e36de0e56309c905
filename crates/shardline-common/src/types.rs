//! Core type definitions for Shardline
//!
//! Reserved names of the on-disk layout and the small enums shared by the
//! storage engine and the CLI.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hidden volume holding staging and multipart state on every disk
pub const SYSTEM_VOLUME: &str = ".shardline.sys";

/// Staging prefix inside [`SYSTEM_VOLUME`]
pub const TMP_PREFIX: &str = "tmp";

/// Multipart upload prefix inside [`SYSTEM_VOLUME`]
pub const MULTIPART_PREFIX: &str = "multipart";

/// Object descriptor file name
pub const DESCRIPTOR_FILE: &str = "xl.json";

/// Descriptor format tag
pub const DESCRIPTOR_FORMAT: &str = "xl";

/// Descriptor version written by this build
pub const DESCRIPTOR_VERSION: &str = "1.0.1";

/// Descriptor versions this build can read
pub const SUPPORTED_DESCRIPTOR_VERSIONS: &[&str] = &["1.0.0", "1.0.1"];

/// Erasure algorithm tag stored in descriptors
pub const ERASURE_ALGORITHM: &str = "reedsolomon/vandermonde";

/// How thoroughly healing inspects each disk's copy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealScanMode {
    /// Check that every part file exists
    #[default]
    Normal,
    /// Re-read every part file and verify its bitrot checksums
    Deep,
}

impl fmt::Display for HealScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => f.write_str("normal"),
            Self::Deep => f.write_str("deep"),
        }
    }
}

impl FromStr for HealScanMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "deep" => Ok(Self::Deep),
            other => Err(crate::Error::invalid_argument(format!(
                "unknown heal scan mode: {other}"
            ))),
        }
    }
}

/// State of one disk's copy of an object or bucket, as reported by healing
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveState {
    Ok,
    Offline,
    Missing,
    Corrupt,
}

impl fmt::Display for DriveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::Offline => "offline",
            Self::Missing => "missing",
            Self::Corrupt => "corrupt",
        };
        f.write_str(s)
    }
}

/// What a heal result describes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealItemKind {
    Bucket,
    Object,
}
