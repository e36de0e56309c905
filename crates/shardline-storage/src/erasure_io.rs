//! Erasure coding over shard streams
//!
//! Glue between the block coder and the bitrot readers and writers: objects
//! are cut into `block_size` blocks, and shard `i` of every block goes to
//! writer `i`. Readers and writers are indexed in shard order.

use crate::bitrot::{BitrotReader, BitrotWriter};
use crate::pool::BufferPool;
use crate::quorum::reduce_write_quorum_errs;
use futures::future::join_all;
use shardline_common::error::OBJECT_OP_IGNORED_ERRS;
use shardline_common::{Error, Result};
use shardline_erasure::Erasure;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Fill `buf` from `reader`, stopping early only at end of stream
async fn read_full<R: AsyncRead + Unpin + Send>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Write shard `i` to writer `i`, dropping writers that fail
async fn write_shards(
    writers: &mut [Option<BitrotWriter>],
    shards: &[Vec<u8>],
    write_quorum: usize,
) -> Result<()> {
    let futures = writers
        .iter_mut()
        .zip(shards)
        .map(|(writer, shard)| async move {
            match writer {
                Some(writer) => writer.write(shard).await,
                None => Err(Error::DiskNotFound),
            }
        });
    let results = join_all(futures).await;

    let mut errs = Vec::with_capacity(results.len());
    for (index, result) in results.into_iter().enumerate() {
        match result {
            Ok(()) => errs.push(None),
            Err(e) => {
                if writers[index].take().is_some() {
                    warn!("shard writer {} failed: {}", index, e);
                }
                errs.push(Some(e));
            }
        }
    }
    reduce_write_quorum_errs(&errs, OBJECT_OP_IGNORED_ERRS, write_quorum)
}

/// Encode `reader` into `writers`, returning the number of bytes consumed
///
/// Every block must reach `write_quorum` writers. An empty stream still
/// runs one (empty) block so every shard file exists.
pub async fn erasure_encode<R: AsyncRead + Unpin + Send>(
    erasure: &Erasure,
    reader: &mut R,
    writers: &mut [Option<BitrotWriter>],
    write_quorum: usize,
    pool: &Arc<BufferPool>,
) -> Result<i64> {
    let mut buf = pool.acquire().await?;
    buf.resize(erasure.block_size(), 0);

    let mut total: i64 = 0;
    loop {
        let n = read_full(reader, &mut buf).await?;
        if n == 0 && total != 0 {
            break;
        }
        let shards = erasure.encode_data(&buf[..n])?;
        write_shards(writers, &shards, write_quorum).await?;
        total += n as i64;
        if n < buf.len() {
            break;
        }
    }
    Ok(total)
}

/// Reads one block worth of shards from a set of bitrot readers
///
/// Readers are tried in shard order so data shards are preferred; a reader
/// that fails is dropped for the rest of the stream and the next untried
/// reader takes its place.
struct ParallelReader<'a> {
    readers: &'a mut [Option<BitrotReader>],
    data_blocks: usize,
    offset: i64,
    shard_size: i64,
    shard_file_size: i64,
}

impl<'a> ParallelReader<'a> {
    fn new(readers: &'a mut [Option<BitrotReader>], erasure: &Erasure, offset: i64, total: i64) -> Self {
        let block_size = erasure.block_size() as i64;
        let shard_size = erasure.shard_size() as i64;
        Self {
            readers,
            data_blocks: erasure.data_blocks(),
            offset: offset / block_size * shard_size,
            shard_size,
            shard_file_size: erasure.shard_file_size(total),
        }
    }

    async fn read(&mut self) -> Result<Vec<Option<Vec<u8>>>> {
        let total = self.readers.len();
        let chunk = usize::try_from(self.shard_size.min(self.shard_file_size - self.offset))
            .map_err(|_| Error::LessData)?;
        let offset = self.offset;

        let mut shards: Vec<Option<Vec<u8>>> = vec![None; total];
        let mut success = 0;
        let mut next = 0;
        while success < self.data_blocks {
            let mut batch = Vec::new();
            while batch.len() < self.data_blocks - success && next < total {
                if let Some(reader) = self.readers[next].take() {
                    batch.push((next, reader));
                }
                next += 1;
            }
            if batch.is_empty() {
                break;
            }

            let reads = batch.into_iter().map(|(index, mut reader)| async move {
                let mut buf = vec![0u8; chunk];
                let result = reader.read_at(&mut buf, offset).await;
                (index, reader, result.map(|_| buf))
            });
            for (index, reader, result) in join_all(reads).await {
                match result {
                    Ok(buf) => {
                        self.readers[index] = Some(reader);
                        shards[index] = Some(buf);
                        success += 1;
                    }
                    Err(e @ Error::ChecksumMismatch { .. }) => {
                        warn!("bitrot detected on shard {} at offset {}: {}", index, offset, e);
                    }
                    Err(e) => {
                        warn!("shard {} unreadable at offset {}: {}", index, offset, e);
                    }
                }
            }
        }

        if success < self.data_blocks {
            return Err(Error::ReadQuorum);
        }
        self.offset += chunk as i64;
        Ok(shards)
    }
}

/// Write `[offset, offset + length)` of the concatenated data shards
async fn write_data_blocks<W: AsyncWrite + Unpin + Send>(
    writer: &mut W,
    shards: &[Option<Vec<u8>>],
    data_blocks: usize,
    offset: usize,
    length: usize,
) -> Result<i64> {
    let mut skip = offset;
    let mut remaining = length;
    for shard in shards.iter().take(data_blocks) {
        if remaining == 0 {
            break;
        }
        let shard = shard.as_deref().ok_or(Error::ReadQuorum)?;
        if skip >= shard.len() {
            skip -= shard.len();
            continue;
        }
        let end = shard.len().min(skip + remaining);
        writer.write_all(&shard[skip..end]).await?;
        remaining -= end - skip;
        skip = 0;
    }
    if remaining != 0 {
        return Err(Error::LessData);
    }
    Ok(length as i64)
}

/// Decode `length` bytes starting at `offset` of an object of `total_length`
/// bytes into `writer`
pub async fn erasure_decode<W: AsyncWrite + Unpin + Send>(
    erasure: &Erasure,
    writer: &mut W,
    readers: &mut [Option<BitrotReader>],
    offset: i64,
    length: i64,
    total_length: i64,
) -> Result<i64> {
    if offset < 0 || length < 0 {
        return Err(Error::invalid_argument("negative offset or length"));
    }
    if offset + length > total_length {
        return Err(Error::invalid_argument(format!(
            "range {offset}+{length} exceeds object size {total_length}"
        )));
    }
    if length == 0 {
        return Ok(0);
    }

    let block_size = erasure.block_size() as i64;
    let mut reader = ParallelReader::new(readers, erasure, offset, total_length);
    let start_block = offset / block_size;
    let end_block = (offset + length) / block_size;

    let mut written: i64 = 0;
    for block in start_block..=end_block {
        let (block_offset, block_length) = if start_block == end_block {
            (offset % block_size, length)
        } else if block == start_block {
            let block_offset = offset % block_size;
            (block_offset, block_size - block_offset)
        } else if block == end_block {
            (0, (offset + length) % block_size)
        } else {
            (0, block_size)
        };
        if block_length == 0 {
            break;
        }

        let mut shards = reader.read().await?;
        erasure.decode_data_blocks(&mut shards)?;
        written += write_data_blocks(
            writer,
            &shards,
            erasure.data_blocks(),
            usize::try_from(block_offset).unwrap_or(0),
            usize::try_from(block_length).unwrap_or(0),
        )
        .await?;
    }
    writer.flush().await?;

    if written != length {
        return Err(Error::LessData);
    }
    Ok(written)
}

/// Rebuild every shard of a `size`-byte part into the present `writers`
///
/// Writers that fail are dropped; the heal fails once none is left.
pub async fn erasure_heal(
    erasure: &Erasure,
    readers: &mut [Option<BitrotReader>],
    writers: &mut [Option<BitrotWriter>],
    size: i64,
) -> Result<()> {
    if writers.len() != erasure.total_blocks() {
        return Err(Error::invalid_argument(format!(
            "expected {} writers, got {}",
            erasure.total_blocks(),
            writers.len()
        )));
    }

    let block_size = erasure.block_size() as i64;
    let end_block = (size + block_size - 1) / block_size;
    let mut reader = ParallelReader::new(readers, erasure, 0, size);
    for block in 0..end_block {
        let mut shards = reader.read().await?;
        erasure.decode_data_and_parity_blocks(&mut shards)?;

        for (index, writer) in writers.iter_mut().enumerate() {
            let Some(w) = writer else { continue };
            let shard = shards[index].as_deref().unwrap_or_default();
            if let Err(e) = w.write(shard).await {
                warn!("heal writer {} failed at block {}: {}", index, block, e);
                *writer = None;
            }
        }
        if writers.iter().all(Option::is_none) {
            return Err(Error::WriteQuorum);
        }
    }
    debug!("healed {} blocks", end_block);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitrot::{new_bitrot_reader, new_bitrot_writer};
    use crate::disk::StorageApi;
    use crate::testing::{TestSet, random_bytes};
    use shardline_common::BitrotAlgorithm;

    const BLOCK: usize = 1024;

    async fn encode(
        set: &TestSet,
        erasure: &Erasure,
        data: &[u8],
        algo: BitrotAlgorithm,
    ) -> Vec<Vec<u8>> {
        for disk in &set.disks {
            disk.make_vol("bucket").await.unwrap();
        }
        let mut writers = Vec::new();
        for disk in set.slots() {
            let disk = disk.unwrap();
            writers.push(Some(
                new_bitrot_writer(disk, "bucket", "obj/part.1", algo, erasure.shard_size(), None)
                    .await
                    .unwrap(),
            ));
        }
        let pool = BufferPool::new(1, BLOCK);
        let mut input = data;
        let n = erasure_encode(erasure, &mut input, &mut writers, erasure.data_blocks(), &pool)
            .await
            .unwrap();
        assert_eq!(n, data.len() as i64);
        writers.iter().map(|w| w.as_ref().unwrap().sum()).collect()
    }

    fn readers(
        set: &TestSet,
        erasure: &Erasure,
        sums: &[Vec<u8>],
        algo: BitrotAlgorithm,
        till: i64,
        offline: &[usize],
    ) -> Vec<Option<BitrotReader>> {
        set.slots_without(offline)
            .into_iter()
            .zip(sums)
            .map(|(disk, sum)| {
                disk.map(|disk| {
                    new_bitrot_reader(
                        disk,
                        "bucket",
                        "obj/part.1",
                        till,
                        algo,
                        sum.clone(),
                        erasure.shard_size() as i64,
                    )
                })
            })
            .collect()
    }

    #[tokio::test]
    async fn test_encode_decode_ranges() {
        let erasure = Erasure::new(4, 2, BLOCK).unwrap();
        let data = random_bytes(BLOCK * 3 + 100);
        let total = data.len() as i64;

        for algo in BitrotAlgorithm::ALL {
            let set = TestSet::new(6);
            let sums = encode(&set, &erasure, &data, algo).await;

            let ranges: &[(i64, i64)] = &[
                (0, total),
                (0, 1),
                (10, 1000),
                (BLOCK as i64 - 5, 10),
                (BLOCK as i64, BLOCK as i64 * 2),
                (total - 1, 1),
                (1500, total - 1500),
            ];
            for &(offset, length) in ranges {
                let till = erasure.shard_file_till_offset(offset, length, total);
                // Two shards missing, one of them a data shard
                let mut rs = readers(&set, &erasure, &sums, algo, till, &[1, 5]);
                let mut out = Vec::new();
                let n = erasure_decode(&erasure, &mut out, &mut rs, offset, length, total)
                    .await
                    .unwrap();
                assert_eq!(n, length);
                let (start, end) = (offset as usize, (offset + length) as usize);
                assert_eq!(out, &data[start..end], "{algo} {offset}+{length}");
            }
        }
    }

    #[tokio::test]
    async fn test_decode_too_many_missing() {
        let erasure = Erasure::new(4, 2, BLOCK).unwrap();
        let data = random_bytes(BLOCK);
        let set = TestSet::new(6);
        let sums = encode(&set, &erasure, &data, BitrotAlgorithm::Blake3S).await;

        let till = erasure.shard_file_till_offset(0, BLOCK as i64, BLOCK as i64);
        let mut rs = readers(&set, &erasure, &sums, BitrotAlgorithm::Blake3S, till, &[0, 2, 4]);
        let mut out = Vec::new();
        let err = erasure_decode(&erasure, &mut out, &mut rs, 0, BLOCK as i64, BLOCK as i64)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReadQuorum));
    }

    #[tokio::test]
    async fn test_decode_falls_back_on_bitrot() {
        let erasure = Erasure::new(4, 2, BLOCK).unwrap();
        let data = random_bytes(BLOCK * 2);
        let total = data.len() as i64;
        let set = TestSet::new(6);
        let sums = encode(&set, &erasure, &data, BitrotAlgorithm::Blake3S).await;

        let file = set.path(0).join("bucket/obj/part.1");
        let mut raw = std::fs::read(&file).unwrap();
        raw[40] ^= 0xff;
        std::fs::write(&file, raw).unwrap();

        let till = erasure.shard_file_till_offset(0, total, total);
        let mut rs = readers(&set, &erasure, &sums, BitrotAlgorithm::Blake3S, till, &[]);
        let mut out = Vec::new();
        erasure_decode(&erasure, &mut out, &mut rs, 0, total, total)
            .await
            .unwrap();
        assert_eq!(out, data);
        assert!(rs[0].is_none());
    }

    #[tokio::test]
    async fn test_decode_argument_checks() {
        let erasure = Erasure::new(2, 2, BLOCK).unwrap();
        let mut out = Vec::new();
        let mut rs: Vec<Option<BitrotReader>> = (0..4).map(|_| None).collect();
        for (offset, length) in [(-1, 1), (0, -1), (5, 10)] {
            assert!(matches!(
                erasure_decode(&erasure, &mut out, &mut rs, offset, length, 10).await,
                Err(Error::InvalidArgument(_))
            ));
        }
        assert_eq!(
            erasure_decode(&erasure, &mut out, &mut rs, 3, 0, 10)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_encode_write_quorum() {
        let erasure = Erasure::new(2, 2, BLOCK).unwrap();
        let set = TestSet::new(4);
        for disk in &set.disks {
            disk.make_vol("bucket").await.unwrap();
        }
        set.disks[0].fail("append_file", Error::DiskFull);
        set.disks[1].fail("append_file", Error::DiskFull);

        let mut writers = Vec::new();
        for disk in set.slots() {
            writers.push(Some(
                new_bitrot_writer(
                    disk.unwrap(),
                    "bucket",
                    "obj/part.1",
                    BitrotAlgorithm::Blake3S,
                    erasure.shard_size(),
                    None,
                )
                .await
                .unwrap(),
            ));
        }
        let pool = BufferPool::new(1, BLOCK);
        let data = random_bytes(100);
        let err = erasure_encode(&erasure, &mut data.as_slice(), &mut writers, 3, &pool)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WriteQuorum));
        assert!(writers[0].is_none());
        assert!(writers[2].is_some());
    }

    #[tokio::test]
    async fn test_heal_rebuilds_missing_shards() {
        let erasure = Erasure::new(4, 2, BLOCK).unwrap();
        let data = random_bytes(BLOCK * 2 + 33);
        let total = data.len() as i64;
        let algo = BitrotAlgorithm::Sha256;
        let set = TestSet::new(6);
        let sums = encode(&set, &erasure, &data, algo).await;
        let original = std::fs::read(set.path(2).join("bucket/obj/part.1")).unwrap();

        // Shards 2 and 4 rebuilt into a staging file
        let till = erasure.shard_file_size(total);
        let mut rs = readers(&set, &erasure, &sums, algo, till, &[2, 4]);
        let mut writers: Vec<Option<BitrotWriter>> = Vec::new();
        for (i, disk) in set.slots().into_iter().enumerate() {
            if i == 2 || i == 4 {
                writers.push(Some(
                    new_bitrot_writer(
                        disk.unwrap(),
                        "bucket",
                        "healed/part.1",
                        algo,
                        erasure.shard_size(),
                        None,
                    )
                    .await
                    .unwrap(),
                ));
            } else {
                writers.push(None);
            }
        }
        erasure_heal(&erasure, &mut rs, &mut writers, total)
            .await
            .unwrap();

        let healed = std::fs::read(set.path(2).join("bucket/healed/part.1")).unwrap();
        assert_eq!(healed, original);
        assert_eq!(writers[2].as_ref().unwrap().sum(), sums[2]);
        assert_eq!(writers[4].as_ref().unwrap().sum(), sums[4]);
    }
}
