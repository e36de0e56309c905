//! Bounded shard buffer pools
//!
//! Encoding and bitrot writing reuse fixed-size buffers instead of
//! allocating one per block. A pool hands out at most `capacity` buffers at a
//! time; callers wait for a buffer to come back when it is exhausted. The
//! buffer is returned when the [`PooledBuffer`] guard drops, whatever path
//! the caller leaves by.

use parking_lot::Mutex;
use shardline_common::{Error, Result};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

/// Pool of equally sized byte buffers
#[derive(Debug)]
pub struct BufferPool {
    /// Idle buffers
    buffers: Mutex<Vec<Vec<u8>>>,
    /// Limits buffers in flight to `capacity`
    permits: Arc<Semaphore>,
    /// Size of each buffer
    buffer_size: usize,
    /// Maximum buffers in flight
    capacity: usize,
    /// Buffers reused from the idle list
    hits: AtomicU64,
    /// Buffers freshly allocated
    misses: AtomicU64,
}

impl BufferPool {
    /// Create a pool of `capacity` buffers of `buffer_size` bytes
    ///
    /// Buffers are allocated lazily on first use.
    #[must_use]
    pub fn new(capacity: usize, buffer_size: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            buffers: Mutex::new(Vec::with_capacity(capacity)),
            permits: Arc::new(Semaphore::new(capacity)),
            buffer_size,
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Wait for a free buffer
    ///
    /// The buffer is `buffer_size` bytes long and zero filled on first
    /// allocation; reused buffers keep their previous content.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledBuffer> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::internal("buffer pool closed"))?;

        let reused = self.buffers.lock().pop();
        let mut buf = if let Some(buf) = reused {
            self.hits.fetch_add(1, Ordering::Relaxed);
            buf
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            Vec::with_capacity(self.buffer_size)
        };
        buf.resize(self.buffer_size, 0);

        Ok(PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Get the size of each buffer
    #[must_use]
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Get the maximum number of buffers in flight
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffers currently available without waiting
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Get (hits, misses) counters
    #[must_use]
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    fn release(&self, buf: Vec<u8>) {
        trace!("returning buffer to pool: {} bytes", buf.capacity());
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.capacity {
            buffers.push(buf);
        }
    }
}

/// A buffer borrowed from a [`BufferPool`]
///
/// Dereferences to the underlying `Vec<u8>`; the vector may be resized
/// freely while borrowed.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        // Only `None` during drop
        self.buf.as_ref().map_or(&EMPTY, |b| b)
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.get_or_insert_with(Vec::new)
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

static EMPTY: Vec<u8> = Vec::new();

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

/// One buffer pool per disk position of an erasure set
#[derive(Debug, Clone)]
pub struct DiskBufferPools {
    pools: Vec<Arc<BufferPool>>,
}

impl DiskBufferPools {
    /// Create `disk_count` pools of `capacity` buffers each
    #[must_use]
    pub fn new(disk_count: usize, capacity: usize, buffer_size: usize) -> Self {
        Self {
            pools: (0..disk_count)
                .map(|_| BufferPool::new(capacity, buffer_size))
                .collect(),
        }
    }

    /// Get the pool for a disk position
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Arc<BufferPool>> {
        self.pools.get(index)
    }

    /// Number of pools
    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// Whether there are no pools
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}
