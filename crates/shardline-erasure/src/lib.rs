//! Shardline Erasure Coding
//!
//! Splits erasure blocks into data shards, computes parity and rebuilds
//! missing shards. Also owns the shard-size arithmetic every reader and
//! writer relies on to locate a block inside a shard file.
//!
//! # Example
//!
//! ```
//! use shardline_erasure::Erasure;
//!
//! let erasure = Erasure::new(4, 2, 1024).unwrap();
//! let mut shards: Vec<Option<Vec<u8>>> = erasure
//!     .encode_data(b"Hello, World!")
//!     .unwrap()
//!     .into_iter()
//!     .map(Some)
//!     .collect();
//!
//! shards[0] = None;
//! shards[5] = None;
//! erasure.decode_data_and_parity_blocks(&mut shards).unwrap();
//! assert!(shards.iter().all(Option::is_some));
//! ```

pub mod backend;
pub mod codec;

pub use backend::{BackendCapabilities, ErasureBackend, GaloisBackend};
pub use codec::{Erasure, ErasureError};
