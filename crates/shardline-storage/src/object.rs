//! Object layer over one erasure set
//!
//! [`ErasureSet`] turns an ordered list of disks into buckets and objects.
//! Writes are staged under the system volume and committed with a
//! quorum-checked rename; reads vote on the per-disk descriptors and decode
//! from whichever disks agree.

use crate::bitrot::{BitrotReader, BitrotWriter, new_bitrot_reader, new_bitrot_writer};
use crate::disk::{
    DiskInfo, DiskSlot, LocalDisk, StorageApi, errors_of, eval_disks, fan_out, path_join,
    retain_slash,
};
use crate::erasure_io::{erasure_decode, erasure_encode};
use crate::metadata::{
    ChecksumInfo, ObjectDescriptor, ObjectInfo, PartInfo, shuffle_descriptors, shuffle_disks,
};
use crate::persist::{commit_all, delete_all, persist_unique, read_all_descriptors};
use crate::pool::{BufferPool, DiskBufferPools};
use crate::quorum::{
    list_online_disks, object_quorum_from_meta, reduce_read_quorum_errs,
    reduce_write_quorum_errs, resolve_quorum,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use shardline_common::config::StorageConfig;
use shardline_common::error::{
    BUCKET_METADATA_OP_IGNORED_ERRS, BUCKET_OP_IGNORED_ERRS, OBJECT_METADATA_OP_IGNORED_ERRS,
    OBJECT_OP_IGNORED_ERRS,
};
use shardline_common::{BitrotAlgorithm, Error, Result, SYSTEM_VOLUME, TMP_PREFIX, to_object_err};
use std::collections::BTreeMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Largest erasure set the coder supports
const MAX_SET_SIZE: usize = 256;

/// Bucket metadata
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BucketInfo {
    pub name: String,
    pub created: DateTime<Utc>,
}

/// Hashes everything read through it
///
/// Produces the hex SHA-256 etag of an uploaded stream without a second
/// pass over the data.
pub(crate) struct EtagReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R> EtagReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    pub(crate) fn etag(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for EtagReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.hasher.update(&buf.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}

/// An ordered set of disks storing erasure-coded objects
#[derive(Debug)]
pub struct ErasureSet {
    disks: Vec<DiskSlot>,
    block_size: usize,
    parity_blocks: usize,
    bitrot_algorithm: BitrotAlgorithm,
    /// Block buffers for encoding
    pool: Arc<BufferPool>,
    /// Streaming frame buffers, one pool per disk
    frame_pools: DiskBufferPools,
}

impl ErasureSet {
    /// Create a set over `disks`; `None` marks an offline disk
    pub fn new(disks: Vec<DiskSlot>, config: &StorageConfig) -> Result<Self> {
        let count = disks.len();
        if !(2..=MAX_SET_SIZE).contains(&count) {
            return Err(Error::invalid_argument(format!(
                "erasure set needs 2 to {MAX_SET_SIZE} disks, got {count}"
            )));
        }
        let parity_blocks = config.parity_for(count);
        if parity_blocks == 0 || parity_blocks > count / 2 {
            return Err(Error::invalid_argument(format!(
                "parity {parity_blocks} invalid for {count} disks"
            )));
        }
        if config.block_size == 0 {
            return Err(Error::invalid_argument("block size must be positive"));
        }

        let data_blocks = count - parity_blocks;
        let shard_size = config.block_size.div_ceil(data_blocks);
        let capacity = config.buffer_pool_capacity;
        Ok(Self {
            frame_pools: DiskBufferPools::new(
                count,
                capacity,
                shard_size + config.bitrot_algorithm.hash_size(),
            ),
            pool: BufferPool::new(capacity, config.block_size),
            disks,
            block_size: config.block_size,
            parity_blocks,
            bitrot_algorithm: config.bitrot_algorithm,
        })
    }

    /// Open local directory disks; directories that cannot be opened are
    /// treated as offline
    pub fn open_local(config: &StorageConfig) -> Result<Self> {
        let disks = config
            .disks
            .iter()
            .map(|path| match LocalDisk::new(path) {
                Ok(disk) => Some(Arc::new(disk) as Arc<dyn StorageApi>),
                Err(e) => {
                    warn!("disk {} offline: {}", path.display(), e);
                    None
                }
            })
            .collect();
        Self::new(disks, config)
    }

    /// Create the system volume on every disk
    pub async fn init(&self) -> Result<()> {
        let results = fan_out(&self.disks, |_, disk| async move {
            match disk.make_vol(SYSTEM_VOLUME).await {
                Err(Error::VolumeExists) => Ok(()),
                other => other,
            }
        })
        .await;
        let errs = errors_of(&results);
        reduce_write_quorum_errs(&errs, BUCKET_OP_IGNORED_ERRS, self.bucket_write_quorum())
    }

    #[must_use]
    pub fn disks(&self) -> &[DiskSlot] {
        &self.disks
    }

    #[must_use]
    pub fn disk_count(&self) -> usize {
        self.disks.len()
    }

    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    #[must_use]
    pub const fn bitrot_algorithm(&self) -> BitrotAlgorithm {
        self.bitrot_algorithm
    }

    /// Data and parity counts for new objects
    #[must_use]
    pub fn default_layout(&self) -> (usize, usize) {
        (self.disks.len() - self.parity_blocks, self.parity_blocks)
    }

    pub(crate) fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub(crate) fn bucket_write_quorum(&self) -> usize {
        self.disks.len() / 2 + 1
    }

    pub(crate) fn bucket_read_quorum(&self) -> usize {
        self.disks.len() / 2
    }

    /// Capacity report per disk, index-aligned with the set
    pub async fn storage_info(&self) -> Vec<Result<DiskInfo>> {
        fan_out(&self.disks, |_, disk| async move { disk.disk_info().await }).await
    }

    /// Open one bitrot writer per shard position, `None` where it fails
    pub(crate) async fn shard_writers(
        &self,
        disks: &[DiskSlot],
        distribution: &[usize],
        volume: &str,
        path: &str,
        shard_size: usize,
    ) -> Vec<Option<BitrotWriter>> {
        let mut writers = Vec::with_capacity(disks.len());
        for (shard, disk) in disks.iter().enumerate() {
            let Some(disk) = disk.clone() else {
                writers.push(None);
                continue;
            };
            // Pools are per disk, shards arrive in distribution order
            let disk_index = distribution
                .iter()
                .position(|&d| d == shard + 1)
                .unwrap_or(shard);
            let pool = self.frame_pools.get(disk_index);
            match new_bitrot_writer(disk, volume, path, self.bitrot_algorithm, shard_size, pool).await
            {
                Ok(writer) => writers.push(Some(writer)),
                Err(e) => {
                    warn!("cannot create shard {}/{} on shard {}: {}", volume, path, shard, e);
                    writers.push(None);
                }
            }
        }
        writers
    }

    /// Bucket existence check with object-layer errors
    async fn check_bucket(&self, bucket: &str) -> Result<()> {
        self.get_bucket_info(bucket).await.map(|_| ())
    }

    pub async fn make_bucket(&self, bucket: &str) -> Result<()> {
        let results = fan_out(&self.disks, |_, disk| async move { disk.make_vol(bucket).await }).await;
        let errs = errors_of(&results);

        match reduce_write_quorum_errs(&errs, BUCKET_OP_IGNORED_ERRS, self.bucket_write_quorum()) {
            Ok(()) => {
                info!("created bucket {}", bucket);
                Ok(())
            }
            Err(Error::WriteQuorum) => {
                warn!("bucket {} below write quorum, removing partial volumes", bucket);
                let created = eval_disks(&self.disks, &errs);
                fan_out(&created, |_, disk| async move { disk.delete_vol(bucket, false).await })
                    .await;
                Err(Error::WriteQuorum)
            }
            Err(e) => Err(to_object_err(e, bucket, "")),
        }
    }

    pub async fn get_bucket_info(&self, bucket: &str) -> Result<BucketInfo> {
        let mut errs = Vec::with_capacity(self.disks.len());
        for disk in &self.disks {
            let Some(disk) = disk else {
                errs.push(Some(Error::DiskNotFound));
                continue;
            };
            match disk.stat_vol(bucket).await {
                Ok(vol) => {
                    return Ok(BucketInfo {
                        name: vol.name,
                        created: vol.created,
                    });
                }
                Err(e) if e.is_ignored(BUCKET_METADATA_OP_IGNORED_ERRS) => errs.push(Some(e)),
                Err(e) => return Err(to_object_err(e, bucket, "")),
            }
        }
        let err = reduce_read_quorum_errs(&errs, &[], self.bucket_read_quorum())
            .err()
            .unwrap_or(Error::VolumeNotFound);
        Err(to_object_err(err, bucket, ""))
    }

    /// Buckets visible on the first reachable disk, sorted by name
    pub async fn list_buckets(&self) -> Result<Vec<BucketInfo>> {
        for disk in self.disks.iter().flatten() {
            match disk.list_vols().await {
                Ok(vols) => {
                    let mut buckets: Vec<BucketInfo> = vols
                        .into_iter()
                        .filter(|v| v.name != SYSTEM_VOLUME)
                        .map(|v| BucketInfo {
                            name: v.name,
                            created: v.created,
                        })
                        .collect();
                    buckets.sort_by(|a, b| a.name.cmp(&b.name));
                    return Ok(buckets);
                }
                Err(e) => debug!("list_vols failed on {}: {}", disk.endpoint(), e),
            }
        }
        Err(Error::ReadQuorum)
    }

    pub async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        let results =
            fan_out(&self.disks, |_, disk| async move { disk.delete_vol(bucket, false).await })
                .await;
        let errs = errors_of(&results);

        match reduce_write_quorum_errs(&errs, BUCKET_OP_IGNORED_ERRS, self.bucket_write_quorum()) {
            Ok(()) => {
                info!("deleted bucket {}", bucket);
                Ok(())
            }
            Err(Error::WriteQuorum) => {
                warn!("bucket delete {} below write quorum, restoring volumes", bucket);
                let deleted = eval_disks(&self.disks, &errs);
                fan_out(&deleted, |_, disk| async move { disk.make_vol(bucket).await }).await;
                Err(Error::WriteQuorum)
            }
            Err(e) => Err(to_object_err(e, bucket, "")),
        }
    }

    /// Store an object read from `reader`
    ///
    /// `size` is the expected length, or `-1` to read to end of stream. A
    /// stream shorter than `size` fails with `LessData`.
    pub async fn put_object<R: AsyncRead + Unpin + Send>(
        &self,
        bucket: &str,
        object: &str,
        reader: R,
        size: i64,
        user_meta: BTreeMap<String, String>,
    ) -> Result<ObjectInfo> {
        self.check_bucket(bucket).await?;

        let temp_dir = path_join(&[TMP_PREFIX, &Uuid::new_v4().to_string()]);
        let result = self
            .put_object_staged(bucket, object, reader, size, user_meta, &temp_dir)
            .await;
        delete_all(&self.disks, SYSTEM_VOLUME, &retain_slash(&temp_dir)).await;
        result
    }

    async fn put_object_staged<R: AsyncRead + Unpin + Send>(
        &self,
        bucket: &str,
        object: &str,
        reader: R,
        size: i64,
        user_meta: BTreeMap<String, String>,
        temp_dir: &str,
    ) -> Result<ObjectInfo> {
        let (data_blocks, parity_blocks) = self.default_layout();
        let write_quorum = write_quorum_for(data_blocks, parity_blocks);

        let mut desc = ObjectDescriptor::new(object, data_blocks, parity_blocks, self.block_size);
        let erasure = desc.erasure.coder()?;
        let distribution = desc.erasure.distribution.clone();
        let disks = shuffle_disks(&self.disks, &distribution);

        let part_path = path_join(&[temp_dir, "part.1"]);
        let mut writers = self
            .shard_writers(
                &disks,
                &distribution,
                SYSTEM_VOLUME,
                &part_path,
                erasure.shard_size(),
            )
            .await;

        let mut hashing = EtagReader::new(reader.take(read_limit(size)));
        let written =
            erasure_encode(&erasure, &mut hashing, &mut writers, write_quorum, &self.pool)
                .await
                .map_err(|e| to_object_err(e, bucket, object))?;
        check_size(size, written)?;

        let etag = hashing.etag();
        desc.stat.size = written;
        desc.stat.mod_time = Utc::now();
        desc.meta = user_meta;
        desc.meta.insert("etag".to_string(), etag);
        desc.upsert_part(PartInfo {
            number: 1,
            name: "part.1".to_string(),
            etag: String::new(),
            size: written,
            actual_size: written,
        });

        let descriptors = per_disk_descriptors(&desc, "part.1", &writers);
        let disks = persist_unique(&disks, SYSTEM_VOLUME, temp_dir, &descriptors, write_quorum)
            .await
            .map_err(|e| to_object_err(e, bucket, object))?;
        commit_all(
            &disks,
            SYSTEM_VOLUME,
            &retain_slash(temp_dir),
            bucket,
            &retain_slash(object),
            write_quorum,
        )
        .await
        .map_err(|e| to_object_err(e, bucket, object))?;

        debug!("stored {}/{} ({} bytes)", bucket, object, written);
        Ok(desc.to_object_info(bucket, object))
    }

    /// Quorum descriptor and the disks and descriptors agreeing with it,
    /// both in shard order
    pub(crate) async fn quorum_view(
        &self,
        bucket: &str,
        object: &str,
    ) -> Result<(ObjectDescriptor, Vec<DiskSlot>, Vec<Option<ObjectDescriptor>>)> {
        let (descriptors, errs) = read_all_descriptors(&self.disks, bucket, object).await;
        let (read_quorum, _) = object_quorum_from_meta(&descriptors, &errs)
            .map_err(|e| to_object_err(e, bucket, object))?;
        reduce_read_quorum_errs(&errs, OBJECT_OP_IGNORED_ERRS, read_quorum)
            .map_err(|e| to_object_err(e, bucket, object))?;

        let (online, mod_time) = list_online_disks(&self.disks, &descriptors, &errs);
        let mod_time = mod_time.ok_or(Error::ReadQuorum)?;
        let desc = resolve_quorum(&descriptors, mod_time, read_quorum)?;

        let distribution = &desc.erasure.distribution;
        let disks = shuffle_disks(&online, distribution);
        let descriptors = shuffle_descriptors(&descriptors, distribution);
        Ok((desc, disks, descriptors))
    }

    pub async fn get_object_info(&self, bucket: &str, object: &str) -> Result<ObjectInfo> {
        let (desc, _, _) = self.quorum_view(bucket, object).await?;
        Ok(desc.to_object_info(bucket, object))
    }

    /// Write `length` bytes of an object starting at `offset` to `writer`
    ///
    /// A negative `length` reads to the end of the object.
    pub async fn get_object<W: AsyncWrite + Unpin + Send>(
        &self,
        bucket: &str,
        object: &str,
        offset: i64,
        length: i64,
        writer: &mut W,
    ) -> Result<()> {
        let (desc, disks, descriptors) = self.quorum_view(bucket, object).await?;

        let size = desc.stat.size;
        let length = if length < 0 { size - offset } else { length };
        if offset < 0 || length < 0 || offset > size || offset + length > size {
            return Err(Error::InvalidRange {
                offset,
                length,
                size,
            });
        }
        if length == 0 {
            return Ok(());
        }

        let erasure = desc.erasure.coder()?;
        let (mut part_index, mut part_offset) = desc.object_to_part_offset(offset)?;
        let mut remaining = length;
        while remaining > 0 {
            let part = desc.parts.get(part_index).ok_or(Error::InvalidRange {
                offset,
                length,
                size,
            })?;
            let part_length = (part.size - part_offset).min(remaining);
            let till = erasure.shard_file_till_offset(part_offset, part_length, part.size);
            let part_path = path_join(&[object, &part.name]);

            let mut readers: Vec<Option<BitrotReader>> = disks
                .iter()
                .zip(&descriptors)
                .map(|(disk, meta)| {
                    let (disk, meta) = (disk.clone()?, meta.as_ref()?);
                    let checksum = meta.erasure.checksum_info(&part.name);
                    Some(new_bitrot_reader(
                        disk,
                        bucket,
                        &part_path,
                        till,
                        checksum.algorithm,
                        checksum.hash,
                        erasure.shard_size() as i64,
                    ))
                })
                .collect();

            erasure_decode(
                &erasure,
                writer,
                &mut readers,
                part_offset,
                part_length,
                part.size,
            )
            .await
            .map_err(|e| to_object_err(e, bucket, object))?;

            remaining -= part_length;
            part_index += 1;
            part_offset = 0;
        }
        Ok(())
    }

    /// Delete an object from every disk
    ///
    /// The object exists when half the disks hold a readable descriptor.
    /// Missing or damaged descriptors on the other disks do not block the
    /// delete.
    pub async fn delete_object(&self, bucket: &str, object: &str) -> Result<()> {
        self.check_bucket(bucket).await?;
        let (descriptors, errs) = read_all_descriptors(&self.disks, bucket, object).await;
        match reduce_read_quorum_errs(
            &errs,
            OBJECT_METADATA_OP_IGNORED_ERRS,
            self.bucket_read_quorum(),
        ) {
            Ok(()) => {}
            Err(Error::ReadQuorum) => return Err(to_object_err(Error::FileNotFound, bucket, object)),
            Err(e) => return Err(to_object_err(e, bucket, object)),
        }

        let write_quorum = object_quorum_from_meta(&descriptors, &errs)
            .map_or(self.bucket_write_quorum(), |(_, write)| write);
        let errs = delete_all(&self.disks, bucket, &retain_slash(object)).await;
        reduce_write_quorum_errs(&errs, OBJECT_OP_IGNORED_ERRS, write_quorum)
            .map_err(|e| to_object_err(e, bucket, object))?;
        info!("deleted {}/{}", bucket, object);
        Ok(())
    }
}

/// How many bytes to read from a stream advertised as `size` bytes
///
/// One byte past a known size is read so a longer stream can be told
/// apart from an exact one.
pub(crate) fn read_limit(size: i64) -> u64 {
    u64::try_from(size).map_or(u64::MAX, |size| size.saturating_add(1))
}

/// Compare the bytes consumed with the advertised size; a negative size
/// is unknown and accepts any length
pub(crate) fn check_size(size: i64, written: i64) -> Result<()> {
    if size < 0 || written == size {
        Ok(())
    } else if written < size {
        Err(Error::LessData)
    } else {
        Err(Error::MoreData)
    }
}

/// Write quorum for a data/parity split
pub(crate) const fn write_quorum_for(data_blocks: usize, parity_blocks: usize) -> usize {
    if data_blocks == parity_blocks {
        data_blocks + 1
    } else {
        data_blocks
    }
}

/// Copies of `desc`, one per shard writer that survived, each carrying
/// that writer's checksum for `part_name`
pub(crate) fn per_disk_descriptors(
    desc: &ObjectDescriptor,
    part_name: &str,
    writers: &[Option<BitrotWriter>],
) -> Vec<Option<ObjectDescriptor>> {
    writers
        .iter()
        .map(|writer| {
            writer.as_ref().map(|writer| {
                let mut desc = desc.clone();
                desc.erasure.upsert_checksum(ChecksumInfo {
                    name: part_name.to_string(),
                    algorithm: writer.algorithm(),
                    hash: writer.sum(),
                });
                desc
            })
        })
        .collect()
}
