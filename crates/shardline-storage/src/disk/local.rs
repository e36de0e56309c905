//! Directory-backed disk
//!
//! Each volume is a directory under the disk root and object paths map to
//! nested files. Descriptor writes go through a sibling temp file and a
//! rename so a crash never leaves a half-written `xl.json`.

use super::{DiskInfo, FileInfo, FileReader, StorageApi, VolInfo};
use crate::bitrot::BitrotVerifier;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use shardline_common::{Error, Result};
use std::io::ErrorKind as IoErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Capacity of the pipe between a streaming read's producer task and its consumer
const STREAM_PIPE_SIZE: usize = 128 * 1024;

/// Chunk size used when hashing whole files
const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Disk statistics
#[derive(Debug, Default)]
pub struct DiskStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub checksum_errors: AtomicU64,
}

/// Disk rooted at a local directory
#[derive(Debug)]
pub struct LocalDisk {
    root: PathBuf,
    endpoint: String,
    stats: DiskStats,
}

impl LocalDisk {
    /// Open (creating if needed) a disk rooted at `root`
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            endpoint: root.display().to_string(),
            root,
            stats: DiskStats::default(),
        })
    }

    /// Get the disk root
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get statistics
    #[must_use]
    pub const fn stats(&self) -> &DiskStats {
        &self.stats
    }

    fn check_volume_name(volume: &str) -> Result<()> {
        if volume.is_empty() || volume == "." || volume == ".." || volume.contains('/') {
            return Err(Error::invalid_argument(format!("invalid volume name: {volume:?}")));
        }
        Ok(())
    }

    fn relative(path: &str) -> Result<PathBuf> {
        let rel = PathBuf::from(path.trim_start_matches('/'));
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(Error::FileAccessDenied);
        }
        Ok(rel)
    }

    /// Resolve an existing volume directory
    async fn vol_dir(&self, volume: &str) -> Result<PathBuf> {
        Self::check_volume_name(volume)?;
        let dir = self.root.join(volume);
        match fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(dir),
            Ok(_) => Err(Error::VolumeNotFound),
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                if fs::metadata(&self.root).await.is_err() {
                    Err(Error::DiskNotFound)
                } else {
                    Err(Error::VolumeNotFound)
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn file_path(&self, volume: &str, path: &str) -> Result<(PathBuf, PathBuf)> {
        let vol = self.vol_dir(volume).await?;
        let full = vol.join(Self::relative(path)?);
        Ok((vol, full))
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Remove empty directories from `path`'s parent up to (not including) `stop`
    async fn prune_empty_parents(path: &Path, stop: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == stop || !dir.starts_with(stop) {
                break;
            }
            if fs::remove_dir(dir).await.is_err() {
                break;
            }
            current = dir.parent();
        }
    }

    fn file_error(e: std::io::Error) -> Error {
        match e.kind() {
            IoErrorKind::IsADirectory | IoErrorKind::NotADirectory => Error::FileNotFound,
            _ => e.into(),
        }
    }
}

fn to_datetime(time: std::io::Result<std::time::SystemTime>) -> DateTime<Utc> {
    time.map_or(DateTime::UNIX_EPOCH, DateTime::<Utc>::from)
}

#[async_trait]
impl StorageApi for LocalDisk {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn is_online(&self) -> bool {
        self.root.is_dir()
    }

    async fn disk_info(&self) -> Result<DiskInfo> {
        if !self.is_online() {
            return Err(Error::DiskNotFound);
        }
        #[cfg(unix)]
        {
            let stat = nix::sys::statvfs::statvfs(&self.root)
                .map_err(|e| Error::from(std::io::Error::from(e)))?;
            #[allow(clippy::unnecessary_cast, clippy::useless_conversion)]
            let (total, free) = (
                stat.blocks() as u64 * stat.fragment_size() as u64,
                stat.blocks_available() as u64 * stat.fragment_size() as u64,
            );
            Ok(DiskInfo {
                endpoint: self.endpoint(),
                total,
                free,
                used: total.saturating_sub(free),
            })
        }
        #[cfg(not(unix))]
        {
            Ok(DiskInfo {
                endpoint: self.endpoint(),
                ..DiskInfo::default()
            })
        }
    }

    async fn make_vol(&self, volume: &str) -> Result<()> {
        Self::check_volume_name(volume)?;
        if fs::metadata(&self.root).await.is_err() {
            return Err(Error::DiskNotFound);
        }
        match fs::create_dir(self.root.join(volume)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::AlreadyExists => Err(Error::VolumeExists),
            Err(e) => Err(e.into()),
        }
    }

    async fn stat_vol(&self, volume: &str) -> Result<VolInfo> {
        let dir = self.vol_dir(volume).await?;
        let meta = fs::metadata(&dir).await?;
        Ok(VolInfo {
            name: volume.to_string(),
            created: to_datetime(meta.modified()),
        })
    }

    async fn list_vols(&self) -> Result<Vec<VolInfo>> {
        let mut entries = fs::read_dir(&self.root).await.map_err(|e| {
            if e.kind() == IoErrorKind::NotFound {
                Error::DiskNotFound
            } else {
                e.into()
            }
        })?;
        let mut vols = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_dir() {
                continue;
            }
            vols.push(VolInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                created: to_datetime(meta.modified()),
            });
        }
        vols.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(vols)
    }

    async fn delete_vol(&self, volume: &str, force: bool) -> Result<()> {
        let dir = self.vol_dir(volume).await?;
        let result = if force {
            fs::remove_dir_all(&dir).await
        } else {
            fs::remove_dir(&dir).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::DirectoryNotEmpty => Err(Error::VolumeNotEmpty),
            Err(e) if e.kind() == IoErrorKind::NotFound => Err(Error::VolumeNotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_dir(&self, volume: &str, dir_path: &str) -> Result<Vec<String>> {
        let (_, dir) = self.file_path(volume, dir_path).await?;
        let mut entries = fs::read_dir(&dir).await.map_err(Self::file_error)?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await?.is_dir() {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    async fn read_all(&self, volume: &str, path: &str) -> Result<Vec<u8>> {
        let (_, file) = self.file_path(volume, path).await?;
        let data = fs::read(&file).await.map_err(Self::file_error)?;
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_read
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(data)
    }

    async fn write_all(&self, volume: &str, path: &str, data: Bytes) -> Result<()> {
        let (_, file) = self.file_path(volume, path).await?;
        Self::ensure_parent(&file).await?;

        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or(Error::FileAccessDenied)?;
        let tmp = file.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

        let mut handle = fs::File::create(&tmp).await?;
        let write = async {
            handle.write_all(&data).await?;
            handle.sync_all().await
        };
        if let Err(e) = write.await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        drop(handle);

        if let Err(e) = fs::rename(&tmp, &file).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn create_file(&self, volume: &str, path: &str) -> Result<()> {
        let (_, file) = self.file_path(volume, path).await?;
        Self::ensure_parent(&file).await?;
        fs::File::create(&file).await?;
        Ok(())
    }

    async fn append_file(&self, volume: &str, path: &str, data: Bytes) -> Result<()> {
        let (_, file) = self.file_path(volume, path).await?;
        let mut handle = fs::OpenOptions::new()
            .append(true)
            .open(&file)
            .await
            .map_err(Self::file_error)?;
        handle.write_all(&data).await?;
        handle.flush().await?;

        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn read_file(
        &self,
        volume: &str,
        path: &str,
        offset: u64,
        buf: &mut [u8],
        verifier: Option<&BitrotVerifier>,
    ) -> Result<usize> {
        let (_, file) = self.file_path(volume, path).await?;
        let mut handle = fs::File::open(&file).await.map_err(Self::file_error)?;

        let short_read = |e: std::io::Error| {
            if e.kind() == IoErrorKind::UnexpectedEof {
                Error::LessData
            } else {
                e.into()
            }
        };

        let Some(verifier) = verifier else {
            handle.seek(std::io::SeekFrom::Start(offset)).await?;
            handle.read_exact(buf).await.map_err(short_read)?;
            self.stats.reads.fetch_add(1, Ordering::Relaxed);
            self.stats
                .bytes_read
                .fetch_add(buf.len() as u64, Ordering::Relaxed);
            return Ok(buf.len());
        };

        let mut hasher = verifier.algorithm().new_hasher();
        let mut chunk = vec![0u8; HASH_CHUNK_SIZE];

        let mut prefix = offset;
        while prefix > 0 {
            let want = usize::try_from(prefix).map_or(chunk.len(), |p| p.min(chunk.len()));
            handle.read_exact(&mut chunk[..want]).await.map_err(short_read)?;
            hasher.update(&chunk[..want]);
            prefix -= want as u64;
        }

        handle.read_exact(buf).await.map_err(short_read)?;
        hasher.update(buf);

        loop {
            let n = handle.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            hasher.update(&chunk[..n]);
        }

        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = verifier.verify(&hasher.finalize()) {
            self.stats.checksum_errors.fetch_add(1, Ordering::Relaxed);
            warn!(disk = %self.endpoint, volume, path, "bitrot detected: {}", e);
            return Err(e);
        }
        self.stats
            .bytes_read
            .fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(buf.len())
    }

    async fn read_file_stream(
        &self,
        volume: &str,
        path: &str,
        offset: u64,
        length: u64,
    ) -> Result<FileReader> {
        let (_, file) = self.file_path(volume, path).await?;
        let mut handle = fs::File::open(&file).await.map_err(Self::file_error)?;
        let size = handle.metadata().await?.len();
        if size < offset.saturating_add(length) {
            return Err(Error::FileUnexpectedSize);
        }
        handle.seek(std::io::SeekFrom::Start(offset)).await?;

        let (mut tx, rx) = tokio::io::duplex(STREAM_PIPE_SIZE);
        let endpoint = self.endpoint.clone();
        let path_str = path.to_string();
        tokio::spawn(async move {
            let mut limited = handle.take(length);
            match tokio::io::copy(&mut limited, &mut tx).await {
                Ok(_) => {}
                Err(e) if e.kind() == IoErrorKind::BrokenPipe => {
                    debug!(disk = %endpoint, path = %path_str, "stream reader closed early");
                }
                Err(e) => {
                    warn!(disk = %endpoint, path = %path_str, "stream read failed: {}", e);
                }
            }
        });

        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_read.fetch_add(length, Ordering::Relaxed);
        Ok(Box::new(rx))
    }

    async fn rename_file(
        &self,
        src_volume: &str,
        src_path: &str,
        dst_volume: &str,
        dst_path: &str,
    ) -> Result<()> {
        let src_is_dir = src_path.ends_with('/');
        if src_is_dir != dst_path.ends_with('/') {
            return Err(Error::FileAccessDenied);
        }
        let (src_vol, src) = self.file_path(src_volume, src_path).await?;
        let (_, dst) = self.file_path(dst_volume, dst_path).await?;

        let src_meta = fs::metadata(&src).await.map_err(Self::file_error)?;
        if src_meta.is_dir() != src_is_dir {
            return Err(Error::FileAccessDenied);
        }

        Self::ensure_parent(&dst).await?;
        if src_is_dir {
            match fs::remove_dir_all(&dst).await {
                Ok(()) => {}
                Err(e) if e.kind() == IoErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        fs::rename(&src, &dst).await?;

        Self::prune_empty_parents(&src, &src_vol).await;
        Ok(())
    }

    async fn delete_file(&self, volume: &str, path: &str) -> Result<()> {
        let (vol, target) = self.file_path(volume, path).await?;
        if target == vol {
            return Err(Error::FileAccessDenied);
        }
        let meta = fs::symlink_metadata(&target)
            .await
            .map_err(Self::file_error)?;
        if meta.is_dir() {
            fs::remove_dir_all(&target).await?;
        } else {
            fs::remove_file(&target).await?;
        }
        Self::prune_empty_parents(&target, &vol).await;
        Ok(())
    }

    async fn stat_file(&self, volume: &str, path: &str) -> Result<FileInfo> {
        let (_, file) = self.file_path(volume, path).await?;
        let meta = fs::metadata(&file).await.map_err(Self::file_error)?;
        Ok(FileInfo {
            volume: volume.to_string(),
            name: path.to_string(),
            size: meta.len(),
            mod_time: to_datetime(meta.modified()),
            is_dir: meta.is_dir(),
        })
    }
}
