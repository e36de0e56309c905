//! Erasure coder for fixed-size object blocks
//!
//! An object is cut into `block_size` blocks; each block is split into
//! `data_blocks` equal shards (the last one zero padded) and extended with
//! `parity_blocks` parity shards. Shard `i` of every block is appended to the
//! same shard file, so shard files grow by [`Erasure::shard_size`] per full
//! block.

use crate::backend::{ErasureBackend, GaloisBackend};
use shardline_common::{Error as CommonError, Result};
use std::sync::Arc;
use thiserror::Error;

/// Errors specific to erasure coding operations
#[derive(Debug, Error)]
pub enum ErasureError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("encoding failed: {0}")]
    EncodingFailed(String),

    #[error("decoding failed: {0}")]
    DecodingFailed(String),

    #[error("insufficient shards: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    #[error("shard size mismatch")]
    ShardSizeMismatch,
}

impl From<ErasureError> for CommonError {
    fn from(e: ErasureError) -> Self {
        match e {
            ErasureError::InsufficientShards {
                available,
                required,
            } => Self::InsufficientShards {
                available,
                required,
            },
            other => Self::ErasureCoding(other.to_string()),
        }
    }
}

/// Erasure coder bound to a data/parity split and block size
#[derive(Clone)]
pub struct Erasure {
    data_blocks: usize,
    parity_blocks: usize,
    block_size: usize,
    backend: Arc<dyn ErasureBackend>,
}

impl std::fmt::Debug for Erasure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Erasure")
            .field("data_blocks", &self.data_blocks)
            .field("parity_blocks", &self.parity_blocks)
            .field("block_size", &self.block_size)
            .field("backend", &self.backend.capabilities().name)
            .finish()
    }
}

impl Erasure {
    /// Create a coder using the default GF(2^8) backend
    pub fn new(data_blocks: usize, parity_blocks: usize, block_size: usize) -> Result<Self> {
        let backend = GaloisBackend::new(data_blocks, parity_blocks)?;
        Self::with_backend(Arc::new(backend), block_size)
    }

    /// Create a coder over an explicit backend
    pub fn with_backend(backend: Arc<dyn ErasureBackend>, block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(ErasureError::InvalidConfig("block_size must be > 0".into()).into());
        }
        Ok(Self {
            data_blocks: backend.data_shards(),
            parity_blocks: backend.parity_shards(),
            block_size,
            backend,
        })
    }

    /// Get the number of data shards
    #[must_use]
    pub const fn data_blocks(&self) -> usize {
        self.data_blocks
    }

    /// Get the number of parity shards
    #[must_use]
    pub const fn parity_blocks(&self) -> usize {
        self.parity_blocks
    }

    /// Get the total number of shards (data + parity)
    #[must_use]
    pub const fn total_blocks(&self) -> usize {
        self.data_blocks + self.parity_blocks
    }

    /// Get the erasure block size
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Algorithm tag to persist alongside shards written by this coder
    #[must_use]
    pub fn algorithm(&self) -> &'static str {
        self.backend.capabilities().algorithm
    }

    /// Encode one block into `data + parity` shards
    ///
    /// Empty input yields empty shards so callers can still create every
    /// shard file for a zero-length object.
    pub fn encode_data(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let total = self.total_blocks();
        if data.is_empty() {
            return Ok(vec![Vec::new(); total]);
        }

        let per_shard = data.len().div_ceil(self.data_blocks);
        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(total);
        for chunk_start in (0..self.data_blocks).map(|i| i * per_shard) {
            let mut shard = vec![0u8; per_shard];
            if chunk_start < data.len() {
                let end = (chunk_start + per_shard).min(data.len());
                shard[..end - chunk_start].copy_from_slice(&data[chunk_start..end]);
            }
            shards.push(shard);
        }
        shards.resize_with(total, || vec![0u8; per_shard]);

        self.backend.encode(&mut shards)?;
        Ok(shards)
    }

    /// Rebuild missing data shards only
    ///
    /// A no-op when every data shard is present.
    pub fn decode_data_blocks(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
        self.check_shard_count(shards.len())?;
        if shards[..self.data_blocks].iter().all(Option::is_some) {
            return Ok(());
        }
        self.backend.reconstruct(shards, true)?;
        Ok(())
    }

    /// Rebuild every missing shard, data and parity
    pub fn decode_data_and_parity_blocks(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
        self.check_shard_count(shards.len())?;
        if shards.iter().all(Option::is_some) {
            return Ok(());
        }
        self.backend.reconstruct(shards, false)?;
        Ok(())
    }

    /// Re-encode the data shards and compare against the stored parity
    pub fn verify(&self, shards: &[Vec<u8>]) -> Result<bool> {
        if shards.len() != self.total_blocks() {
            return Ok(false);
        }
        let Some(first_len) = shards.first().map(Vec::len) else {
            return Ok(false);
        };
        if !shards.iter().all(|s| s.len() == first_len) {
            return Err(ErasureError::ShardSizeMismatch.into());
        }
        if first_len == 0 {
            return Ok(true);
        }
        Ok(self.backend.verify(shards)?)
    }

    /// Size of one shard of a full block
    #[must_use]
    pub const fn shard_size(&self) -> usize {
        self.block_size.div_ceil(self.data_blocks)
    }

    /// Final size of each shard file for an object of `total_length` bytes
    ///
    /// `-1` (unknown length) is passed through unchanged.
    #[must_use]
    pub fn shard_file_size(&self, total_length: i64) -> i64 {
        if total_length == 0 {
            return 0;
        }
        if total_length == -1 {
            return -1;
        }
        let block_size = self.block_size as i64;
        let num_shards = total_length / block_size;
        let last_block_size = total_length % block_size;
        let last_shard_size = ceil_frac(last_block_size, self.data_blocks as i64);
        num_shards * self.shard_size() as i64 + last_shard_size
    }

    /// Offset inside a shard file up to which a range read must fetch
    #[must_use]
    pub fn shard_file_till_offset(&self, start_offset: i64, length: i64, total_length: i64) -> i64 {
        let shard_size = self.shard_size() as i64;
        let shard_file_size = self.shard_file_size(total_length);
        let end_shard = (start_offset + length) / self.block_size as i64;
        let till_offset = end_shard * shard_size + shard_size;
        till_offset.min(shard_file_size)
    }

    fn check_shard_count(&self, count: usize) -> Result<()> {
        if count == self.total_blocks() {
            Ok(())
        } else {
            Err(ErasureError::InvalidConfig(format!(
                "expected {} shards, got {count}",
                self.total_blocks()
            ))
            .into())
        }
    }
}

/// Ceiling division for non-negative numerators
#[must_use]
pub const fn ceil_frac(numerator: i64, denominator: i64) -> i64 {
    if denominator == 0 {
        return 0;
    }
    if numerator <= 0 {
        return 0;
    }
    (numerator + denominator - 1) / denominator
}
