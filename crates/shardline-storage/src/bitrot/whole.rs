//! Whole-file bitrot layout: raw shard bytes, one digest per file

use super::BitrotVerifier;
use crate::disk::StorageApi;
use bytes::Bytes;
use shardline_common::{BitrotAlgorithm, BitrotHasher, Error, Result};
use std::sync::Arc;

#[derive(Debug)]
pub struct WholeBitrotWriter {
    disk: Arc<dyn StorageApi>,
    volume: String,
    path: String,
    algorithm: BitrotAlgorithm,
    hasher: BitrotHasher,
}

impl WholeBitrotWriter {
    pub(super) fn new(
        disk: Arc<dyn StorageApi>,
        volume: &str,
        path: &str,
        algorithm: BitrotAlgorithm,
    ) -> Self {
        Self {
            disk,
            volume: volume.to_string(),
            path: path.to_string(),
            algorithm,
            hasher: algorithm.new_hasher(),
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.hasher.update(data);
        self.disk
            .append_file(&self.volume, &self.path, Bytes::copy_from_slice(data))
            .await
    }

    /// Digest of everything written so far
    #[must_use]
    pub fn sum(&self) -> Vec<u8> {
        self.hasher.sum()
    }

    #[must_use]
    pub const fn algorithm(&self) -> BitrotAlgorithm {
        self.algorithm
    }
}

/// Reads a whole-layout shard file
///
/// The first read loads the file from the requested offset to `till_offset`
/// in one verified call; later reads are served from that buffer.
#[derive(Debug)]
pub struct WholeBitrotReader {
    disk: Arc<dyn StorageApi>,
    volume: String,
    path: String,
    till_offset: i64,
    verifier: BitrotVerifier,
    buf: Option<Vec<u8>>,
    pos: usize,
}

impl WholeBitrotReader {
    pub(super) fn new(
        disk: Arc<dyn StorageApi>,
        volume: &str,
        path: &str,
        till_offset: i64,
        verifier: BitrotVerifier,
    ) -> Self {
        Self {
            disk,
            volume: volume.to_string(),
            path: path.to_string(),
            till_offset,
            verifier,
            buf: None,
            pos: 0,
        }
    }

    pub async fn read_at(&mut self, buf: &mut [u8], offset: i64) -> Result<usize> {
        if self.buf.is_none() {
            let len = usize::try_from(self.till_offset - offset)
                .map_err(|_| Error::invalid_argument("read offset beyond shard end"))?;
            let start = u64::try_from(offset)
                .map_err(|_| Error::invalid_argument("negative shard offset"))?;
            let mut data = vec![0u8; len];
            self.disk
                .read_file(&self.volume, &self.path, start, &mut data, Some(&self.verifier))
                .await?;
            self.buf = Some(data);
            self.pos = 0;
        }

        let data = self.buf.as_deref().unwrap_or_default();
        let remaining = data.len().saturating_sub(self.pos);
        if remaining < buf.len() {
            return Err(Error::LessData);
        }
        buf.copy_from_slice(&data[self.pos..self.pos + buf.len()]);
        self.pos += buf.len();
        Ok(buf.len())
    }
}
