//! GF(2^8) Reed-Solomon backend using reed-solomon-erasure
//!
//! Vandermonde-derived systematic code, the same construction used by the
//! klauspost/Backblaze family of encoders. Works for any shard length,
//! including odd lengths and single bytes.

use super::{BackendCapabilities, BackendResult, ErasureBackend};
use crate::ErasureError;
use reed_solomon_erasure::galois_8::ReedSolomon;
use shardline_common::ERASURE_ALGORITHM;

/// Largest shard set GF(2^8) can address
pub const MAX_TOTAL_SHARDS: usize = 256;

/// Reed-Solomon backend over GF(2^8)
pub struct GaloisBackend {
    inner: ReedSolomon,
}

impl GaloisBackend {
    /// Create a new backend
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self, ErasureError> {
        if data_shards == 0 {
            return Err(ErasureError::InvalidConfig("data_shards must be > 0".into()));
        }
        if parity_shards == 0 {
            return Err(ErasureError::InvalidConfig(
                "parity_shards must be > 0".into(),
            ));
        }
        if data_shards + parity_shards > MAX_TOTAL_SHARDS {
            return Err(ErasureError::InvalidConfig(format!(
                "total shards must be <= {MAX_TOTAL_SHARDS}"
            )));
        }

        let inner = ReedSolomon::new(data_shards, parity_shards)
            .map_err(|e| ErasureError::InvalidConfig(e.to_string()))?;
        Ok(Self { inner })
    }
}

impl ErasureBackend for GaloisBackend {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            name: "galois_8",
            algorithm: ERASURE_ALGORITHM,
            max_total_shards: MAX_TOTAL_SHARDS,
        }
    }

    fn data_shards(&self) -> usize {
        self.inner.data_shard_count()
    }

    fn parity_shards(&self) -> usize {
        self.inner.parity_shard_count()
    }

    fn encode(&self, shards: &mut [Vec<u8>]) -> BackendResult<()> {
        if shards.len() != self.total_shards() {
            return Err(ErasureError::InvalidConfig(format!(
                "expected {} shards, got {}",
                self.total_shards(),
                shards.len()
            )));
        }
        self.inner
            .encode(shards)
            .map_err(|e| ErasureError::EncodingFailed(e.to_string()))
    }

    fn reconstruct(&self, shards: &mut [Option<Vec<u8>>], data_only: bool) -> BackendResult<()> {
        let k = self.data_shards();
        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < k {
            return Err(ErasureError::InsufficientShards {
                available,
                required: k,
            });
        }

        let result = if data_only {
            self.inner.reconstruct_data(shards)
        } else {
            self.inner.reconstruct(shards)
        };
        result.map_err(|e| ErasureError::DecodingFailed(e.to_string()))
    }

    fn verify(&self, shards: &[Vec<u8>]) -> BackendResult<bool> {
        self.inner
            .verify(shards)
            .map_err(|e| ErasureError::DecodingFailed(e.to_string()))
    }
}
