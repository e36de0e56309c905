//! Bitrot protection for shard files
//!
//! Shards are written and read through these wrappers so that silent
//! on-disk corruption is detected before corrupted bytes reach the decoder.
//!
//! # Layouts
//!
//! - **Whole** (`sha256`, `blake3`): the shard file holds raw shard bytes and
//!   one digest over the whole file is kept in the object descriptor.
//! - **Streaming** (`blake3S`): the shard file is a sequence of
//!   `[hash][chunk]` pairs, one per erasure block, so any block can be
//!   verified on its own.

mod streaming;
mod whole;

pub use streaming::{StreamingBitrotReader, StreamingBitrotWriter};
pub use whole::{WholeBitrotReader, WholeBitrotWriter};

use crate::disk::StorageApi;
use crate::pool::BufferPool;
use shardline_common::{BitrotAlgorithm, Error, Result};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Expected digest for a whole shard file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BitrotVerifier {
    algorithm: BitrotAlgorithm,
    sum: Vec<u8>,
}

impl BitrotVerifier {
    #[must_use]
    pub const fn new(algorithm: BitrotAlgorithm, sum: Vec<u8>) -> Self {
        Self { algorithm, sum }
    }

    #[must_use]
    pub const fn algorithm(&self) -> BitrotAlgorithm {
        self.algorithm
    }

    #[must_use]
    pub fn sum(&self) -> &[u8] {
        &self.sum
    }

    /// Compare a computed digest with the expected one
    pub fn verify(&self, actual: &[u8]) -> Result<()> {
        if actual == self.sum.as_slice() {
            Ok(())
        } else {
            Err(Error::checksum_mismatch(&self.sum, actual))
        }
    }
}

/// On-disk size of a shard file holding `size` shard bytes
#[must_use]
pub fn bitrot_shard_file_size(size: i64, shard_size: i64, algo: BitrotAlgorithm) -> i64 {
    if !algo.is_streaming() || size <= 0 || shard_size <= 0 {
        return size;
    }
    let blocks = (size + shard_size - 1) / shard_size;
    blocks * algo.hash_size() as i64 + size
}

/// Shard writer for either layout
#[derive(Debug)]
pub enum BitrotWriter {
    Whole(WholeBitrotWriter),
    Streaming(StreamingBitrotWriter),
}

impl BitrotWriter {
    /// Append one shard chunk
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Whole(w) => w.write(data).await,
            Self::Streaming(w) => w.write(data).await,
        }
    }

    /// Digest to store in the descriptor (empty for streaming files)
    #[must_use]
    pub fn sum(&self) -> Vec<u8> {
        match self {
            Self::Whole(w) => w.sum(),
            Self::Streaming(_) => Vec::new(),
        }
    }

    #[must_use]
    pub const fn algorithm(&self) -> BitrotAlgorithm {
        match self {
            Self::Whole(w) => w.algorithm(),
            Self::Streaming(_) => BitrotAlgorithm::Blake3S,
        }
    }
}

/// Create the shard file and return a writer for it
///
/// Streaming writers take their frame buffers from `pool` when one is
/// given.
pub async fn new_bitrot_writer(
    disk: Arc<dyn StorageApi>,
    volume: &str,
    path: &str,
    algo: BitrotAlgorithm,
    shard_size: usize,
    pool: Option<&Arc<BufferPool>>,
) -> Result<BitrotWriter> {
    disk.create_file(volume, path).await?;
    if algo.is_streaming() {
        Ok(BitrotWriter::Streaming(StreamingBitrotWriter::new(
            disk,
            volume,
            path,
            algo,
            shard_size,
            pool.cloned(),
        )))
    } else {
        Ok(BitrotWriter::Whole(WholeBitrotWriter::new(
            disk, volume, path, algo,
        )))
    }
}

/// Shard reader for either layout
#[derive(Debug)]
pub enum BitrotReader {
    Whole(WholeBitrotReader),
    Streaming(StreamingBitrotReader),
}

impl BitrotReader {
    /// Read `buf.len()` shard bytes starting at shard offset `offset`
    pub async fn read_at(&mut self, buf: &mut [u8], offset: i64) -> Result<usize> {
        match self {
            Self::Whole(r) => r.read_at(buf, offset).await,
            Self::Streaming(r) => r.read_at(buf, offset).await,
        }
    }
}

/// Create a reader over a shard file
///
/// `till_offset` is the shard offset up to which reads will go, as computed
/// by `Erasure::shard_file_till_offset`.
#[must_use]
pub fn new_bitrot_reader(
    disk: Arc<dyn StorageApi>,
    volume: &str,
    path: &str,
    till_offset: i64,
    algo: BitrotAlgorithm,
    sum: Vec<u8>,
    shard_size: i64,
) -> BitrotReader {
    if algo.is_streaming() {
        BitrotReader::Streaming(StreamingBitrotReader::new(
            disk, volume, path, till_offset, algo, shard_size,
        ))
    } else {
        BitrotReader::Whole(WholeBitrotReader::new(
            disk,
            volume,
            path,
            till_offset,
            BitrotVerifier::new(algo, sum),
        ))
    }
}

/// Re-verify a complete shard file
///
/// `want_size` is the file's actual size on disk; `part_size` is the shard
/// byte count the descriptor expects for this part.
pub async fn bitrot_verify<R: AsyncRead + Unpin + Send>(
    reader: &mut R,
    want_size: i64,
    part_size: i64,
    algo: BitrotAlgorithm,
    want: &[u8],
    shard_size: i64,
) -> Result<()> {
    let mut chunk = vec![0u8; 64 * 1024];

    if !algo.is_streaming() {
        let mut hasher = algo.new_hasher();
        let mut read: i64 = 0;
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            hasher.update(&chunk[..n]);
            read += n as i64;
        }
        if read != want_size {
            return Err(Error::FileUnexpectedSize);
        }
        return BitrotVerifier::new(algo, want.to_vec()).verify(&hasher.finalize());
    }

    if want_size != bitrot_shard_file_size(part_size, shard_size, algo) {
        return Err(Error::FileUnexpectedSize);
    }

    let hash_size = algo.hash_size();
    let mut expected = vec![0u8; hash_size];
    let mut block = vec![0u8; usize::try_from(shard_size).unwrap_or(0)];
    let mut left = want_size;
    while left > 0 {
        reader
            .read_exact(&mut expected)
            .await
            .map_err(|_| Error::FileUnexpectedSize)?;
        left -= hash_size as i64;

        let len = usize::try_from(left.min(shard_size)).unwrap_or(0);
        reader
            .read_exact(&mut block[..len])
            .await
            .map_err(|_| Error::FileUnexpectedSize)?;
        left -= len as i64;

        let actual = algo.digest(&block[..len]);
        if actual != expected {
            return Err(Error::checksum_mismatch(&expected, &actual));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::LocalDisk;
    use rand::RngCore;

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    async fn setup() -> (tempfile::TempDir, Arc<dyn StorageApi>) {
        let dir = tempfile::tempdir().unwrap();
        let disk: Arc<dyn StorageApi> = Arc::new(LocalDisk::new(dir.path()).unwrap());
        disk.make_vol("bucket").await.unwrap();
        (dir, disk)
    }

    async fn write_shard(
        disk: &Arc<dyn StorageApi>,
        algo: BitrotAlgorithm,
        data: &[u8],
        shard_size: usize,
    ) -> Vec<u8> {
        let mut writer =
            new_bitrot_writer(Arc::clone(disk), "bucket", "obj/part.1", algo, shard_size, None)
                .await
                .unwrap();
        for chunk in data.chunks(shard_size) {
            writer.write(chunk).await.unwrap();
        }
        writer.sum()
    }

    #[test]
    fn test_shard_file_size() {
        assert_eq!(bitrot_shard_file_size(100, 10, BitrotAlgorithm::Sha256), 100);
        assert_eq!(
            bitrot_shard_file_size(100, 10, BitrotAlgorithm::Blake3S),
            10 * 32 + 100
        );
        assert_eq!(
            bitrot_shard_file_size(101, 10, BitrotAlgorithm::Blake3S),
            11 * 32 + 101
        );
        assert_eq!(bitrot_shard_file_size(0, 10, BitrotAlgorithm::Blake3S), 0);
    }

    #[test]
    fn test_verifier() {
        let sum = BitrotAlgorithm::Sha256.digest(b"data");
        let verifier = BitrotVerifier::new(BitrotAlgorithm::Sha256, sum.clone());
        assert!(verifier.verify(&sum).is_ok());
        let err = verifier.verify(&[0u8; 32]).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn test_roundtrip_all_algorithms() {
        let shard_size = 64;
        let data = random_bytes(64 * 5 + 17);
        for algo in BitrotAlgorithm::ALL {
            let (_dir, disk) = setup().await;
            let sum = write_shard(&disk, algo, &data, shard_size).await;

            let info = disk.stat_file("bucket", "obj/part.1").await.unwrap();
            assert_eq!(
                info.size as i64,
                bitrot_shard_file_size(data.len() as i64, shard_size as i64, algo)
            );

            // Read from the second block to the end
            let mut reader = new_bitrot_reader(
                Arc::clone(&disk),
                "bucket",
                "obj/part.1",
                data.len() as i64,
                algo,
                sum,
                shard_size as i64,
            );
            let mut offset = shard_size;
            while offset < data.len() {
                let len = shard_size.min(data.len() - offset);
                let mut buf = vec![0u8; len];
                reader.read_at(&mut buf, offset as i64).await.unwrap();
                assert_eq!(buf, &data[offset..offset + len], "{algo}");
                offset += len;
            }
        }
    }

    #[tokio::test]
    async fn test_flipped_byte_detected() {
        let shard_size = 32;
        let data = random_bytes(32 * 4);
        for algo in BitrotAlgorithm::ALL {
            let (dir, disk) = setup().await;
            let sum = write_shard(&disk, algo, &data, shard_size).await;

            let file = dir.path().join("bucket/obj/part.1");
            let mut raw = std::fs::read(&file).unwrap();
            let last = raw.len() - 1;
            raw[last] ^= 0xff;
            std::fs::write(&file, &raw).unwrap();

            let mut reader = new_bitrot_reader(
                Arc::clone(&disk),
                "bucket",
                "obj/part.1",
                data.len() as i64,
                algo,
                sum,
                shard_size as i64,
            );
            let mut first = vec![0u8; shard_size];
            let result = if algo.is_streaming() {
                // Earlier blocks stay readable, the damaged one is rejected
                reader.read_at(&mut first, 0).await.unwrap();
                for i in 1..3 {
                    reader
                        .read_at(&mut first, (i * shard_size) as i64)
                        .await
                        .unwrap();
                }
                reader.read_at(&mut first, (3 * shard_size) as i64).await
            } else {
                reader.read_at(&mut first, 0).await
            };
            assert!(
                matches!(result, Err(Error::ChecksumMismatch { .. })),
                "{algo}: {result:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_streaming_frames_from_pool() {
        let (dir, disk) = setup().await;
        let pool = BufferPool::new(1, 32 + 32);
        let data = random_bytes(32 * 3);
        let mut writer = new_bitrot_writer(
            Arc::clone(&disk),
            "bucket",
            "obj/part.1",
            BitrotAlgorithm::Blake3S,
            32,
            Some(&pool),
        )
        .await
        .unwrap();
        // A single frame buffer serves every write once the disk is done
        for chunk in data.chunks(32) {
            writer.write(chunk).await.unwrap();
            assert_eq!(pool.available(), 1);
        }
        assert_eq!(pool.stats(), (2, 1));

        let raw = std::fs::read(dir.path().join("bucket/obj/part.1")).unwrap();
        assert_eq!(raw.len(), 3 * (32 + 32));
        assert_eq!(&raw[32..64], &data[..32]);
    }

    #[tokio::test]
    async fn test_streaming_rejects_unaligned_offsets() {
        let (_dir, disk) = setup().await;
        let data = random_bytes(128);
        write_shard(&disk, BitrotAlgorithm::Blake3S, &data, 32).await;

        let mut reader = new_bitrot_reader(
            Arc::clone(&disk),
            "bucket",
            "obj/part.1",
            128,
            BitrotAlgorithm::Blake3S,
            Vec::new(),
            32,
        );
        let mut buf = vec![0u8; 32];
        assert!(matches!(
            reader.read_at(&mut buf, 5).await,
            Err(Error::InvalidArgument(_))
        ));
        reader.read_at(&mut buf, 0).await.unwrap();
        assert!(matches!(
            reader.read_at(&mut buf, 64).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_bitrot_verify_file() {
        let shard_size = 50;
        let data = random_bytes(50 * 3 + 7);
        for algo in BitrotAlgorithm::ALL {
            let (dir, disk) = setup().await;
            let sum = write_shard(&disk, algo, &data, shard_size).await;
            let file_size = disk.stat_file("bucket", "obj/part.1").await.unwrap().size;

            let mut stream = disk
                .read_file_stream("bucket", "obj/part.1", 0, file_size)
                .await
                .unwrap();
            bitrot_verify(
                &mut stream,
                file_size as i64,
                data.len() as i64,
                algo,
                &sum,
                shard_size as i64,
            )
            .await
            .unwrap();

            let file = dir.path().join("bucket/obj/part.1");
            let mut raw = std::fs::read(&file).unwrap();
            raw[40] ^= 0x01;
            std::fs::write(&file, &raw).unwrap();

            let mut stream = disk
                .read_file_stream("bucket", "obj/part.1", 0, file_size)
                .await
                .unwrap();
            let err = bitrot_verify(
                &mut stream,
                file_size as i64,
                data.len() as i64,
                algo,
                &sum,
                shard_size as i64,
            )
            .await
            .unwrap_err();
            assert!(err.is_corruption(), "{algo}: {err}");
        }
    }

    #[tokio::test]
    async fn test_bitrot_verify_wrong_size() {
        let (_dir, disk) = setup().await;
        let data = random_bytes(100);
        write_shard(&disk, BitrotAlgorithm::Blake3S, &data, 50).await;
        let file_size = disk.stat_file("bucket", "obj/part.1").await.unwrap().size;

        let mut stream = disk
            .read_file_stream("bucket", "obj/part.1", 0, file_size)
            .await
            .unwrap();
        let err = bitrot_verify(
            &mut stream,
            file_size as i64,
            101,
            BitrotAlgorithm::Blake3S,
            &[],
            50,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::FileUnexpectedSize));
    }
}
