//! Streaming bitrot layout: `[hash][chunk]` frames, one per erasure block

use crate::disk::{FileReader, StorageApi};
use crate::pool::BufferPool;
use bytes::Bytes;
use shardline_common::{BitrotAlgorithm, Error, Result};
use std::fmt;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::debug;

#[derive(Debug)]
pub struct StreamingBitrotWriter {
    disk: Arc<dyn StorageApi>,
    volume: String,
    path: String,
    algorithm: BitrotAlgorithm,
    /// Frame buffers; a frame goes back once the disk is done with it
    pool: Option<Arc<BufferPool>>,
    shard_size: usize,
}

impl StreamingBitrotWriter {
    pub(super) fn new(
        disk: Arc<dyn StorageApi>,
        volume: &str,
        path: &str,
        algorithm: BitrotAlgorithm,
        shard_size: usize,
        pool: Option<Arc<BufferPool>>,
    ) -> Self {
        Self {
            disk,
            volume: volume.to_string(),
            path: path.to_string(),
            algorithm,
            pool,
            shard_size,
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if data.len() > self.shard_size {
            return Err(Error::invalid_argument(format!(
                "chunk of {} bytes exceeds shard size {}",
                data.len(),
                self.shard_size
            )));
        }

        let hash = self.algorithm.digest(data);
        let bytes = match &self.pool {
            Some(pool) => {
                let mut frame = pool.acquire().await?;
                frame.clear();
                frame.extend_from_slice(&hash);
                frame.extend_from_slice(data);
                Bytes::from_owner(frame)
            }
            None => {
                let mut frame = Vec::with_capacity(hash.len() + data.len());
                frame.extend_from_slice(&hash);
                frame.extend_from_slice(data);
                Bytes::from(frame)
            }
        };
        self.disk.append_file(&self.volume, &self.path, bytes).await
    }
}

/// Reads a streaming-layout shard file block by block
///
/// Reads must start on a shard boundary and follow each other without gaps.
pub struct StreamingBitrotReader {
    disk: Arc<dyn StorageApi>,
    volume: String,
    path: String,
    till_offset: i64,
    algorithm: BitrotAlgorithm,
    shard_size: i64,
    stream: Option<FileReader>,
    /// Next expected shard offset
    curr_offset: i64,
    hash: Vec<u8>,
}

impl fmt::Debug for StreamingBitrotReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingBitrotReader")
            .field("volume", &self.volume)
            .field("path", &self.path)
            .field("till_offset", &self.till_offset)
            .field("curr_offset", &self.curr_offset)
            .field("open", &self.stream.is_some())
            .finish_non_exhaustive()
    }
}

impl StreamingBitrotReader {
    pub(super) fn new(
        disk: Arc<dyn StorageApi>,
        volume: &str,
        path: &str,
        till_offset: i64,
        algorithm: BitrotAlgorithm,
        shard_size: i64,
    ) -> Self {
        let hash_size = algorithm.hash_size() as i64;
        // Bytes of the file up to the end of the last frame needed
        let till = if shard_size > 0 {
            (till_offset + shard_size - 1) / shard_size * hash_size + till_offset
        } else {
            till_offset
        };
        Self {
            disk,
            volume: volume.to_string(),
            path: path.to_string(),
            till_offset: till,
            algorithm,
            shard_size,
            stream: None,
            curr_offset: 0,
            hash: vec![0u8; algorithm.hash_size()],
        }
    }

    pub async fn read_at(&mut self, buf: &mut [u8], offset: i64) -> Result<usize> {
        if self.shard_size <= 0 || offset % self.shard_size != 0 {
            return Err(Error::invalid_argument(format!(
                "shard offset {offset} is not aligned to shard size {}",
                self.shard_size
            )));
        }

        let stream = match self.stream.as_mut() {
            Some(stream) => {
                if offset != self.curr_offset {
                    return Err(Error::invalid_argument(format!(
                        "expected shard offset {}, got {offset}",
                        self.curr_offset
                    )));
                }
                stream
            }
            None => {
                let hash_size = self.algorithm.hash_size() as i64;
                let stream_offset = offset / self.shard_size * hash_size + offset;
                let length = self.till_offset - stream_offset;
                let (start, len) = match (u64::try_from(stream_offset), u64::try_from(length)) {
                    (Ok(start), Ok(len)) => (start, len),
                    _ => return Err(Error::invalid_argument("shard range out of bounds")),
                };
                debug!(
                    "opening shard stream {}/{} at {} for {} bytes",
                    self.volume, self.path, start, len
                );
                let stream = self
                    .disk
                    .read_file_stream(&self.volume, &self.path, start, len)
                    .await?;
                self.curr_offset = offset;
                self.stream.insert(stream)
            }
        };

        stream
            .read_exact(&mut self.hash)
            .await
            .map_err(|_| Error::LessData)?;
        stream.read_exact(buf).await.map_err(|_| Error::LessData)?;

        let actual = self.algorithm.digest(buf);
        if actual != self.hash {
            return Err(Error::checksum_mismatch(&self.hash, &actual));
        }
        self.curr_offset += buf.len() as i64;
        Ok(buf.len())
    }
}
