//! Test-only disk wrappers

use crate::bitrot::BitrotVerifier;
use crate::object::ErasureSet;
use crate::disk::{DiskInfo, DiskSlot, FileInfo, FileReader, LocalDisk, StorageApi, VolInfo};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use shardline_common::config::StorageConfig;
use shardline_common::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::TempDir;

/// Wraps a disk, counting mutations and failing chosen operations
#[derive(Debug)]
pub struct TestDisk {
    inner: Arc<dyn StorageApi>,
    faults: Mutex<HashMap<&'static str, Error>>,
    writes: AtomicU64,
}

impl TestDisk {
    pub fn new(inner: Arc<dyn StorageApi>) -> Self {
        Self {
            inner,
            faults: Mutex::new(HashMap::new()),
            writes: AtomicU64::new(0),
        }
    }

    /// Make every call of `op` fail with `err`
    pub fn fail(&self, op: &'static str, err: Error) {
        self.faults.lock().insert(op, err);
    }

    pub fn heal(&self) {
        self.faults.lock().clear();
    }

    /// Number of mutating calls that reached the disk
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn reset_writes(&self) {
        self.writes.store(0, Ordering::SeqCst);
    }

    fn check(&self, op: &str) -> Result<()> {
        match self.faults.lock().get(op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn check_write(&self, op: &str) -> Result<()> {
        self.check(op)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl StorageApi for TestDisk {
    fn endpoint(&self) -> String {
        self.inner.endpoint()
    }

    fn is_online(&self) -> bool {
        self.inner.is_online()
    }

    async fn disk_info(&self) -> Result<DiskInfo> {
        self.check("disk_info")?;
        self.inner.disk_info().await
    }

    async fn make_vol(&self, volume: &str) -> Result<()> {
        self.check_write("make_vol")?;
        self.inner.make_vol(volume).await
    }

    async fn stat_vol(&self, volume: &str) -> Result<VolInfo> {
        self.check("stat_vol")?;
        self.inner.stat_vol(volume).await
    }

    async fn list_vols(&self) -> Result<Vec<VolInfo>> {
        self.check("list_vols")?;
        self.inner.list_vols().await
    }

    async fn delete_vol(&self, volume: &str, force: bool) -> Result<()> {
        self.check_write("delete_vol")?;
        self.inner.delete_vol(volume, force).await
    }

    async fn list_dir(&self, volume: &str, dir_path: &str) -> Result<Vec<String>> {
        self.check("list_dir")?;
        self.inner.list_dir(volume, dir_path).await
    }

    async fn read_all(&self, volume: &str, path: &str) -> Result<Vec<u8>> {
        self.check("read_all")?;
        self.inner.read_all(volume, path).await
    }

    async fn write_all(&self, volume: &str, path: &str, data: Bytes) -> Result<()> {
        self.check_write("write_all")?;
        self.inner.write_all(volume, path, data).await
    }

    async fn create_file(&self, volume: &str, path: &str) -> Result<()> {
        self.check_write("create_file")?;
        self.inner.create_file(volume, path).await
    }

    async fn append_file(&self, volume: &str, path: &str, data: Bytes) -> Result<()> {
        self.check_write("append_file")?;
        self.inner.append_file(volume, path, data).await
    }

    async fn read_file(
        &self,
        volume: &str,
        path: &str,
        offset: u64,
        buf: &mut [u8],
        verifier: Option<&BitrotVerifier>,
    ) -> Result<usize> {
        self.check("read_file")?;
        self.inner.read_file(volume, path, offset, buf, verifier).await
    }

    async fn read_file_stream(
        &self,
        volume: &str,
        path: &str,
        offset: u64,
        length: u64,
    ) -> Result<FileReader> {
        self.check("read_file_stream")?;
        self.inner.read_file_stream(volume, path, offset, length).await
    }

    async fn rename_file(
        &self,
        src_volume: &str,
        src_path: &str,
        dst_volume: &str,
        dst_path: &str,
    ) -> Result<()> {
        self.check_write("rename_file")?;
        self.inner
            .rename_file(src_volume, src_path, dst_volume, dst_path)
            .await
    }

    async fn delete_file(&self, volume: &str, path: &str) -> Result<()> {
        self.check_write("delete_file")?;
        self.inner.delete_file(volume, path).await
    }

    async fn stat_file(&self, volume: &str, path: &str) -> Result<FileInfo> {
        self.check("stat_file")?;
        self.inner.stat_file(volume, path).await
    }
}

/// A set of `n` wrapped local disks under one temp directory
pub struct TestSet {
    pub dir: TempDir,
    pub disks: Vec<Arc<TestDisk>>,
}

impl TestSet {
    pub fn new(n: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let disks = (0..n)
            .map(|i| {
                let local = LocalDisk::new(dir.path().join(format!("disk{i}"))).unwrap();
                Arc::new(TestDisk::new(Arc::new(local)))
            })
            .collect();
        Self { dir, disks }
    }

    /// All disks as online slots
    pub fn slots(&self) -> Vec<DiskSlot> {
        self.disks
            .iter()
            .map(|d| Some(Arc::clone(d) as Arc<dyn StorageApi>))
            .collect()
    }

    /// Slots with the given positions offline
    pub fn slots_without(&self, offline: &[usize]) -> Vec<DiskSlot> {
        let mut slots = self.slots();
        for &i in offline {
            slots[i] = None;
        }
        slots
    }

    /// Root directory of disk `i`
    pub fn path(&self, i: usize) -> std::path::PathBuf {
        self.dir.path().join(format!("disk{i}"))
    }

    /// Clear injected faults on every disk
    pub fn heal(&self) {
        for disk in &self.disks {
            disk.heal();
        }
    }

    pub fn total_writes(&self) -> u64 {
        self.disks.iter().map(|d| d.writes()).sum()
    }

    pub fn reset_writes(&self) {
        for disk in &self.disks {
            disk.reset_writes();
        }
    }
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

pub fn config(block_size: usize) -> StorageConfig {
    StorageConfig {
        block_size,
        ..StorageConfig::default()
    }
}

/// An initialised erasure set over `n` test disks holding bucket `bucket`
pub async fn set_with_bucket(n: usize, block_size: usize) -> (TestSet, ErasureSet) {
    let disks = TestSet::new(n);
    let set = ErasureSet::new(disks.slots(), &config(block_size)).unwrap();
    set.init().await.unwrap();
    set.make_bucket("bucket").await.unwrap();
    (disks, set)
}
