//! Bitrot checksum algorithms for Shardline
//!
//! Every shard written to disk is protected by one of these hashes. Whole-shard
//! algorithms produce a single digest per part file; the streaming algorithm
//! hashes every shard-sized chunk independently and interleaves the digests with
//! the data.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::Error;

/// Bitrot protection algorithm
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BitrotAlgorithm {
    /// SHA-256 over the whole shard file
    Sha256,
    /// BLAKE3 over the whole shard file
    Blake3,
    /// BLAKE3 per shard-sized chunk, digests stored inline
    Blake3S,
}

/// Default algorithm for newly written objects
pub const DEFAULT_BITROT_ALGORITHM: BitrotAlgorithm = BitrotAlgorithm::Blake3S;

impl BitrotAlgorithm {
    /// All algorithms known to this build
    pub const ALL: [Self; 3] = [Self::Sha256, Self::Blake3, Self::Blake3S];

    /// Canonical name, as persisted in descriptors
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Blake3 => "blake3",
            Self::Blake3S => "blake3S",
        }
    }

    /// Look up an algorithm by its canonical name
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|algo| algo.as_str() == name)
    }

    /// Whether this build can compute the algorithm
    #[must_use]
    pub const fn available(self) -> bool {
        true
    }

    /// Whether digests are interleaved with every shard chunk
    #[must_use]
    pub const fn is_streaming(self) -> bool {
        matches!(self, Self::Blake3S)
    }

    /// Digest length in bytes
    #[must_use]
    pub const fn hash_size(self) -> usize {
        32
    }

    /// Create a fresh hasher for this algorithm
    #[must_use]
    pub fn new_hasher(self) -> BitrotHasher {
        match self {
            Self::Sha256 => BitrotHasher::Sha256(Sha256::new()),
            Self::Blake3 | Self::Blake3S => BitrotHasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    /// Hash a buffer in one shot
    #[must_use]
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        let mut hasher = self.new_hasher();
        hasher.update(data);
        hasher.sum()
    }
}

impl Default for BitrotAlgorithm {
    fn default() -> Self {
        DEFAULT_BITROT_ALGORITHM
    }
}

impl fmt::Display for BitrotAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BitrotAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| Error::BitrotHashAlgoInvalid(s.to_string()))
    }
}

impl Serialize for BitrotAlgorithm {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for BitrotAlgorithm {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// Incremental hasher for a [`BitrotAlgorithm`]
#[derive(Clone)]
pub enum BitrotHasher {
    Sha256(Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl BitrotHasher {
    /// Feed more data into the hash
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Blake3(h) => {
                h.update(data);
            }
        }
    }

    /// Digest of everything written so far, without consuming the state
    #[must_use]
    pub fn sum(&self) -> Vec<u8> {
        match self {
            Self::Sha256(h) => h.clone().finalize().to_vec(),
            Self::Blake3(h) => h.finalize().as_bytes().to_vec(),
        }
    }

    /// Consume the hasher and return its digest
    #[must_use]
    pub fn finalize(self) -> Vec<u8> {
        self.sum()
    }

    /// Reset the hasher for reuse
    pub fn reset(&mut self) {
        match self {
            Self::Sha256(h) => Digest::reset(h),
            Self::Blake3(h) => {
                h.reset();
            }
        }
    }

    /// Digest length in bytes
    #[must_use]
    pub const fn output_size(&self) -> usize {
        32
    }
}

impl fmt::Debug for BitrotHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256(_) => f.write_str("BitrotHasher(sha256)"),
            Self::Blake3(_) => f.write_str("BitrotHasher(blake3)"),
        }
    }
}

/// Hex-encoded SHA-256 of a buffer, used for etags and path hashing
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
