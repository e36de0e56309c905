//! Erasure coding backend abstraction
//!
//! The [`Erasure`](crate::Erasure) coder works on whole shard sets and only
//! needs three primitives from a backend: compute parity in place, rebuild
//! missing shards in place, and check parity consistency.

pub mod galois;

use crate::ErasureError;

/// Result type for backend operations
pub type BackendResult<T> = Result<T, ErasureError>;

/// Capabilities of an erasure coding backend
#[derive(Clone, Debug, Default)]
pub struct BackendCapabilities {
    /// Backend name for identification
    pub name: &'static str,
    /// Algorithm tag persisted in object descriptors
    pub algorithm: &'static str,
    /// Maximum data + parity shards supported
    pub max_total_shards: usize,
}

/// Core trait for Reed-Solomon style erasure backends
///
/// Every method operates on a full shard set of `data_shards() +
/// parity_shards()` entries, data shards first.
pub trait ErasureBackend: Send + Sync {
    /// Get backend capabilities
    fn capabilities(&self) -> BackendCapabilities;

    /// Get the number of data shards (k)
    fn data_shards(&self) -> usize;

    /// Get the number of parity shards (m)
    fn parity_shards(&self) -> usize;

    /// Get total number of shards (k + m)
    fn total_shards(&self) -> usize {
        self.data_shards() + self.parity_shards()
    }

    /// Overwrite the parity shards with parity computed from the data shards
    ///
    /// All shards must already be allocated with the same length.
    fn encode(&self, shards: &mut [Vec<u8>]) -> BackendResult<()>;

    /// Rebuild `None` entries in place
    ///
    /// With `data_only` set, missing parity shards are left as `None`.
    fn reconstruct(&self, shards: &mut [Option<Vec<u8>>], data_only: bool) -> BackendResult<()>;

    /// Check that the parity shards match the data shards
    fn verify(&self, shards: &[Vec<u8>]) -> BackendResult<bool>;
}

pub use galois::GaloisBackend;
