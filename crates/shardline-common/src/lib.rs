//! Shardline Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, bitrot hash algorithms,
//! configuration and small shared enums used across all Shardline
//! components.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{BitrotAlgorithm, BitrotHasher, DEFAULT_BITROT_ALGORITHM, sha256_hex};
pub use config::Config;
pub use error::{Error, ErrorClass, ErrorKind, Result, to_object_err};
pub use types::*;
