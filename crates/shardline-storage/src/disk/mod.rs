//! Disk abstraction
//!
//! Everything above this module talks to storage through [`StorageApi`]. An
//! erasure set is an ordered slice of [`DiskSlot`]s; `None` marks a disk that
//! is offline or was dropped after a failed write, and is reported as
//! [`Error::DiskNotFound`] by every fan-out.

mod local;

pub use local::{DiskStats, LocalDisk};

use crate::bitrot::BitrotVerifier;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use shardline_common::{Error, Result};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Sequential reader returned by [`StorageApi::read_file_stream`]
pub type FileReader = Box<dyn AsyncRead + Send + Unpin>;

/// One position of an erasure set; `None` is an offline disk
pub type DiskSlot = Option<Arc<dyn StorageApi>>;

/// Capacity report for one disk
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DiskInfo {
    pub endpoint: String,
    pub total: u64,
    pub free: u64,
    pub used: u64,
}

/// A volume (bucket directory) on one disk
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VolInfo {
    pub name: String,
    pub created: DateTime<Utc>,
}

/// Stat result for a file on one disk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub volume: String,
    pub name: String,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    pub is_dir: bool,
}

/// Per-disk storage interface consumed by the erasure engine
///
/// Paths are `/`-separated and relative to a volume. A path ending in `/`
/// names a directory.
#[async_trait]
pub trait StorageApi: Send + Sync + fmt::Debug {
    /// Human readable location of the disk
    fn endpoint(&self) -> String;

    /// Whether the disk is currently reachable
    fn is_online(&self) -> bool;

    async fn disk_info(&self) -> Result<DiskInfo>;

    /// Create a volume; `VolumeExists` if it is already there
    async fn make_vol(&self, volume: &str) -> Result<()>;

    async fn stat_vol(&self, volume: &str) -> Result<VolInfo>;

    async fn list_vols(&self) -> Result<Vec<VolInfo>>;

    /// Delete a volume; `VolumeNotEmpty` unless `force` is set
    async fn delete_vol(&self, volume: &str, force: bool) -> Result<()>;

    /// List entries of a directory, sub-directories suffixed with `/`
    async fn list_dir(&self, volume: &str, dir_path: &str) -> Result<Vec<String>>;

    async fn read_all(&self, volume: &str, path: &str) -> Result<Vec<u8>>;

    /// Replace a file's content atomically
    async fn write_all(&self, volume: &str, path: &str, data: Bytes) -> Result<()>;

    /// Create (or truncate) a file, creating parent directories
    async fn create_file(&self, volume: &str, path: &str) -> Result<()>;

    async fn append_file(&self, volume: &str, path: &str, data: Bytes) -> Result<()>;

    /// Fill `buf` from `offset`
    ///
    /// With a verifier the whole file is hashed and the read fails with
    /// `ChecksumMismatch` unless the digest matches.
    async fn read_file(
        &self,
        volume: &str,
        path: &str,
        offset: u64,
        buf: &mut [u8],
        verifier: Option<&BitrotVerifier>,
    ) -> Result<usize>;

    /// Stream `length` bytes starting at `offset`
    async fn read_file_stream(
        &self,
        volume: &str,
        path: &str,
        offset: u64,
        length: u64,
    ) -> Result<FileReader>;

    /// Rename a file, or a directory when both paths end in `/`
    async fn rename_file(
        &self,
        src_volume: &str,
        src_path: &str,
        dst_volume: &str,
        dst_path: &str,
    ) -> Result<()>;

    /// Delete a file or a whole directory tree
    async fn delete_file(&self, volume: &str, path: &str) -> Result<()>;

    async fn stat_file(&self, volume: &str, path: &str) -> Result<FileInfo>;
}

/// Run `f` against every disk concurrently, index-aligned with `disks`
///
/// Offline slots resolve to `DiskNotFound` without calling `f`.
pub async fn fan_out<T, F, Fut>(disks: &[DiskSlot], f: F) -> Vec<Result<T>>
where
    F: Fn(usize, Arc<dyn StorageApi>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let futures = disks.iter().enumerate().map(|(index, disk)| {
        let call = disk.clone().map(|disk| f(index, disk));
        async move {
            match call {
                Some(call) => call.await,
                None => Err(Error::DiskNotFound),
            }
        }
    });
    join_all(futures).await
}

/// Collapse fan-out results into the per-disk error vector used for quorum
#[must_use]
pub fn errors_of<T>(results: &[Result<T>]) -> Vec<Option<Error>> {
    results.iter().map(|r| r.as_ref().err().cloned()).collect()
}

/// Keep only the disks whose operation succeeded
#[must_use]
pub fn eval_disks(disks: &[DiskSlot], errs: &[Option<Error>]) -> Vec<DiskSlot> {
    if disks.len() != errs.len() {
        return vec![None; disks.len()];
    }
    disks
        .iter()
        .zip(errs)
        .map(|(disk, err)| if err.is_none() { disk.clone() } else { None })
        .collect()
}

/// Number of online slots
#[must_use]
pub fn disk_count(disks: &[DiskSlot]) -> usize {
    disks.iter().filter(|d| d.is_some()).count()
}

/// Endpoint of a slot, or an empty string for an offline one
#[must_use]
pub fn endpoint_of(disk: &DiskSlot) -> String {
    disk.as_ref().map(|d| d.endpoint()).unwrap_or_default()
}

/// Join path elements with `/`, keeping a trailing slash on the last one
#[must_use]
pub fn path_join(elements: &[&str]) -> String {
    let mut out = String::new();
    for element in elements.iter().filter(|e| !e.is_empty()) {
        if !out.is_empty() && !out.ends_with('/') {
            out.push('/');
        }
        out.push_str(element.trim_start_matches('/'));
    }
    out
}

/// Ensure a directory path ends with `/`
#[must_use]
pub fn retain_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_join() {
        assert_eq!(path_join(&["object", "part.1"]), "object/part.1");
        assert_eq!(path_join(&["a/", "b/"]), "a/b/");
        assert_eq!(path_join(&["", "x"]), "x");
        assert_eq!(path_join(&["tmp", "/uuid", "xl.json"]), "tmp/uuid/xl.json");
        assert_eq!(retain_slash("object"), "object/");
        assert_eq!(retain_slash("object/"), "object/");
    }

    #[tokio::test]
    async fn test_fan_out_offline_slot() {
        let dir = tempfile::tempdir().unwrap();
        let disk: Arc<dyn StorageApi> = Arc::new(LocalDisk::new(dir.path()).unwrap());
        let disks: Vec<DiskSlot> = vec![Some(disk), None];

        let results = fan_out(&disks, |_, disk| async move { disk.make_vol("bucket").await }).await;
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(Error::DiskNotFound)));

        let errs = errors_of(&results);
        let remaining = eval_disks(&disks, &errs);
        assert_eq!(disk_count(&remaining), 1);
        assert_eq!(endpoint_of(&remaining[1]), "");
    }
}
