//! Quorum-checked descriptor persistence and commits

use crate::disk::{DiskSlot, errors_of, eval_disks, fan_out, path_join, retain_slash};
use crate::metadata::ObjectDescriptor;
use crate::quorum::reduce_write_quorum_errs;
use bytes::Bytes;
use futures::future::join_all;
use shardline_common::error::OBJECT_OP_IGNORED_ERRS;
use shardline_common::{DESCRIPTOR_FILE, Error, ErrorKind, Result, SYSTEM_VOLUME, TMP_PREFIX};
use tracing::{debug, warn};
use uuid::Uuid;

/// Read `<path>/xl.json` from every disk
///
/// Index-aligned with `disks`: a descriptor where the read, parse and
/// validation succeeded, the error otherwise. A descriptor written by a
/// newer engine surfaces as `UnsupportedFormat`.
pub async fn read_all_descriptors(
    disks: &[DiskSlot],
    volume: &str,
    path: &str,
) -> (Vec<Option<ObjectDescriptor>>, Vec<Option<Error>>) {
    let file = path_join(&[path, DESCRIPTOR_FILE]);
    let results = fan_out(disks, |_, disk| {
        let file = file.clone();
        async move {
            let data = disk.read_all(volume, &file).await?;
            let descriptor = ObjectDescriptor::from_json(&data)?;
            descriptor.validate()?;
            Ok(descriptor)
        }
    })
    .await;

    let errs = errors_of(&results);
    let descriptors = results.into_iter().map(Result::ok).collect();
    (descriptors, errs)
}

/// Write the same descriptor to every disk, each with its own index
pub async fn persist_same(
    disks: &[DiskSlot],
    volume: &str,
    path: &str,
    descriptor: &ObjectDescriptor,
    write_quorum: usize,
) -> Result<Vec<DiskSlot>> {
    let descriptors = vec![Some(descriptor.clone()); disks.len()];
    persist_unique(disks, volume, path, &descriptors, write_quorum).await
}

/// Write one descriptor per disk
///
/// Disk `i` gets `descriptors[i]` with `erasure.index = i + 1`. Slots
/// without a descriptor are treated as offline. Below write quorum the
/// descriptors that did land are removed again.
pub async fn persist_unique(
    disks: &[DiskSlot],
    volume: &str,
    path: &str,
    descriptors: &[Option<ObjectDescriptor>],
    write_quorum: usize,
) -> Result<Vec<DiskSlot>> {
    let file = path_join(&[path, DESCRIPTOR_FILE]);
    let results = fan_out(disks, |index, disk| {
        let file = file.clone();
        let descriptor = descriptors.get(index).cloned().flatten();
        async move {
            let mut descriptor = descriptor.ok_or(Error::DiskNotFound)?;
            descriptor.erasure.index = index + 1;
            let data = descriptor.to_json()?;
            disk.write_all(volume, &file, Bytes::from(data)).await
        }
    })
    .await;

    let errs = errors_of(&results);
    for (index, err) in errs.iter().enumerate() {
        if let Some(err) = err.as_ref().filter(|e| !e.is_offline()) {
            warn!("descriptor write {}/{} failed on disk {}: {}", volume, file, index, err);
        }
    }

    match reduce_write_quorum_errs(&errs, OBJECT_OP_IGNORED_ERRS, write_quorum) {
        Ok(()) => Ok(eval_disks(disks, &errs)),
        Err(Error::WriteQuorum) => {
            debug!("undoing descriptor writes of {}/{}", volume, file);
            delete_all(&eval_disks(disks, &errs), volume, &file).await;
            Err(Error::WriteQuorum)
        }
        Err(e) => Err(e),
    }
}

/// Rename `src` to `dst` on every disk
///
/// Errors in `ignored` count as success. Below write quorum every
/// successful rename is moved back so no disk keeps a partial commit.
pub async fn rename_all(
    disks: &[DiskSlot],
    src_volume: &str,
    src_path: &str,
    dst_volume: &str,
    dst_path: &str,
    write_quorum: usize,
    ignored: &[ErrorKind],
) -> Result<Vec<DiskSlot>> {
    let results = fan_out(disks, |_, disk| async move {
        match disk
            .rename_file(src_volume, src_path, dst_volume, dst_path)
            .await
        {
            Err(e) if e.is_ignored(ignored) => Ok(()),
            other => other,
        }
    })
    .await;

    let errs = errors_of(&results);
    match reduce_write_quorum_errs(&errs, OBJECT_OP_IGNORED_ERRS, write_quorum) {
        Ok(()) => Ok(eval_disks(disks, &errs)),
        Err(Error::WriteQuorum) => {
            warn!(
                "rename {}/{} -> {}/{} below write quorum, undoing",
                src_volume, src_path, dst_volume, dst_path
            );
            let renamed = eval_disks(disks, &errs);
            let undo = fan_out(&renamed, |_, disk| async move {
                disk.rename_file(dst_volume, dst_path, src_volume, src_path)
                    .await
            })
            .await;
            for err in undo.iter().filter_map(|r| r.as_ref().err()) {
                if !err.is_offline() {
                    warn!("undo rename failed: {}", err);
                }
            }
            Err(Error::WriteQuorum)
        }
        Err(e) => Err(e),
    }
}

/// Rename `src` over `dst` on every disk, keeping what `dst` held
///
/// The previous content of `dst` is first moved under `tmp/` in the system
/// volume. At write quorum those copies are deleted. Below it the new
/// content goes back to `src` and the previous content is restored, so a
/// failed commit leaves every disk as it was. Disks where `dst` could not
/// be moved aside take no part in the commit.
pub async fn commit_all(
    disks: &[DiskSlot],
    src_volume: &str,
    src_path: &str,
    dst_volume: &str,
    dst_path: &str,
    write_quorum: usize,
) -> Result<Vec<DiskSlot>> {
    let backup_dir = path_join(&[TMP_PREFIX, &Uuid::new_v4().to_string()]);
    let backup = path_join(&[&backup_dir, "previous"]);
    let backup = if dst_path.ends_with('/') {
        retain_slash(&backup)
    } else {
        backup
    };
    let backup = backup.as_str();

    // Ok(true) where an existing `dst` was moved aside
    let moved = fan_out(disks, |_, disk| async move {
        match disk
            .rename_file(dst_volume, dst_path, SYSTEM_VOLUME, backup)
            .await
        {
            Ok(()) => Ok(true),
            Err(Error::FileNotFound | Error::VolumeNotFound) => Ok(false),
            Err(e) => Err(e),
        }
    })
    .await;
    let moved_errs = errors_of(&moved);
    for (index, err) in moved_errs.iter().enumerate() {
        if let Some(err) = err.as_ref().filter(|e| !e.is_offline()) {
            warn!("cannot set aside {}/{} on disk {}: {}", dst_volume, dst_path, index, err);
        }
    }
    let backed_up: Vec<DiskSlot> = disks
        .iter()
        .zip(&moved)
        .map(|(disk, moved)| disk.clone().filter(|_| matches!(moved, Ok(true))))
        .collect();

    let committed = rename_all(
        &eval_disks(disks, &moved_errs),
        src_volume,
        src_path,
        dst_volume,
        dst_path,
        write_quorum,
        &[],
    )
    .await;
    match committed {
        Ok(committed) => {
            delete_all(&backed_up, SYSTEM_VOLUME, &retain_slash(&backup_dir)).await;
            Ok(committed)
        }
        Err(e) => {
            debug!("restoring previous {}/{}", dst_volume, dst_path);
            let restored = fan_out(&backed_up, |_, disk| async move {
                disk.rename_file(SYSTEM_VOLUME, backup, dst_volume, dst_path)
                    .await
            })
            .await;
            for err in restored.iter().filter_map(|r| r.as_ref().err()) {
                if !err.is_offline() {
                    warn!("restoring {}/{} failed: {}", dst_volume, dst_path, err);
                }
            }
            Err(e)
        }
    }
}

/// Delete a file or directory tree on every disk
///
/// A missing path counts as deleted.
pub async fn delete_all(disks: &[DiskSlot], volume: &str, path: &str) -> Vec<Option<Error>> {
    let futures = disks.iter().map(|disk| async move {
        let disk = disk.as_ref()?;
        match disk.delete_file(volume, path).await {
            Ok(()) | Err(Error::FileNotFound | Error::VolumeNotFound) => None,
            Err(e) => Some(e),
        }
    });
    let results: Vec<Option<Error>> = join_all(futures).await;
    disks
        .iter()
        .zip(results)
        .map(|(disk, err)| if disk.is_none() { Some(Error::DiskNotFound) } else { err })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestSet;

    async fn make_vols(set: &TestSet, volume: &str) {
        for disk in &set.disks {
            crate::disk::StorageApi::make_vol(disk.as_ref(), volume)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_persist_same_sets_indices() {
        let set = TestSet::new(4);
        make_vols(&set, "bucket").await;
        let disks = set.slots();
        let desc = ObjectDescriptor::new("object", 2, 2, 1024);

        let written = persist_same(&disks, "bucket", "object", &desc, 3)
            .await
            .unwrap();
        assert_eq!(crate::disk::disk_count(&written), 4);

        let (descs, errs) = read_all_descriptors(&disks, "bucket", "object").await;
        assert!(errs.iter().all(Option::is_none));
        for (i, d) in descs.iter().enumerate() {
            assert_eq!(d.as_ref().unwrap().erasure.index, i + 1);
        }
    }

    #[tokio::test]
    async fn test_persist_unique_quorum() {
        let set = TestSet::new(4);
        make_vols(&set, "bucket").await;
        let desc = ObjectDescriptor::new("object", 2, 2, 1024);
        let descs = vec![Some(desc); 4];

        // One failure still meets a quorum of three
        set.disks[1].fail("write_all", Error::DiskFull);
        let written = persist_unique(&set.slots(), "bucket", "object", &descs, 3)
            .await
            .unwrap();
        assert!(written[1].is_none());
        assert_eq!(crate::disk::disk_count(&written), 3);

        // Two failures do not, and the surviving writes are removed
        set.disks[2].fail("write_all", Error::DiskFull);
        let err = persist_unique(&set.slots(), "bucket", "other", &descs, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WriteQuorum));

        set.heal();
        let (_, errs) = read_all_descriptors(&set.slots(), "bucket", "other").await;
        assert!(errs.iter().all(|e| matches!(e, Some(Error::FileNotFound))));
    }

    #[tokio::test]
    async fn test_read_all_descriptors_corrupted() {
        let set = TestSet::new(2);
        make_vols(&set, "bucket").await;
        std::fs::create_dir_all(set.path(0).join("bucket/object")).unwrap();
        std::fs::write(set.path(0).join("bucket/object/xl.json"), b"{broken").unwrap();

        let (descs, errs) = read_all_descriptors(&set.slots(), "bucket", "object").await;
        assert!(descs.iter().all(Option::is_none));
        assert!(matches!(errs[0], Some(Error::CorruptedFormat)));
        assert!(matches!(errs[1], Some(Error::FileNotFound)));
    }

    #[tokio::test]
    async fn test_rename_all_undo_below_quorum() {
        let set = TestSet::new(4);
        make_vols(&set, "bucket").await;
        let desc = ObjectDescriptor::new("object", 2, 2, 1024);
        persist_same(&set.slots(), "bucket", "tmp/1/", &desc, 4)
            .await
            .unwrap();

        set.disks[0].fail("rename_file", Error::DiskFull);
        set.disks[1].fail("rename_file", Error::DiskFull);
        let err = rename_all(
            &set.slots(),
            "bucket",
            "tmp/1/",
            "bucket",
            "object/",
            3,
            &[],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::WriteQuorum));

        set.heal();
        let (_, errs) = read_all_descriptors(&set.slots(), "bucket", "tmp/1").await;
        assert!(errs.iter().all(Option::is_none));
        let (_, errs) = read_all_descriptors(&set.slots(), "bucket", "object").await;
        assert!(errs.iter().all(Option::is_some));
    }

    #[tokio::test]
    async fn test_rename_all_ignored_errors() {
        let set = TestSet::new(3);
        make_vols(&set, "bucket").await;
        let desc = ObjectDescriptor::new("object", 2, 1, 1024);
        persist_same(&set.slots_without(&[2]), "bucket", "tmp/1/", &desc, 2)
            .await
            .unwrap();

        // Disk 2 never got the staged directory
        let written = rename_all(
            &set.slots(),
            "bucket",
            "tmp/1/",
            "bucket",
            "object/",
            3,
            &[ErrorKind::FileNotFound],
        )
        .await
        .unwrap();
        assert_eq!(crate::disk::disk_count(&written), 3);
    }

    #[tokio::test]
    async fn test_commit_all_restores_previous() {
        let set = TestSet::new(4);
        make_vols(&set, "bucket").await;
        make_vols(&set, SYSTEM_VOLUME).await;
        let mut old = ObjectDescriptor::new("object", 2, 2, 1024);
        old.stat.size = 1;
        let mut new = old.clone();
        new.stat.size = 2;
        persist_same(&set.slots(), "bucket", "object/", &old, 4)
            .await
            .unwrap();
        persist_same(&set.slots(), "bucket", "tmp/1/", &new, 4)
            .await
            .unwrap();

        set.disks[0].fail("rename_file", Error::DiskFull);
        set.disks[1].fail("rename_file", Error::DiskFull);
        let err = commit_all(&set.slots(), "bucket", "tmp/1/", "bucket", "object/", 3)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WriteQuorum));

        // Every disk still holds the previous object and the staged one
        set.heal();
        let (descs, errs) = read_all_descriptors(&set.slots(), "bucket", "object").await;
        assert!(errs.iter().all(Option::is_none));
        assert!(descs.iter().flatten().all(|d| d.stat.size == 1));
        let (_, errs) = read_all_descriptors(&set.slots(), "bucket", "tmp/1").await;
        assert!(errs.iter().all(Option::is_none));

        let written = commit_all(&set.slots(), "bucket", "tmp/1/", "bucket", "object/", 3)
            .await
            .unwrap();
        assert_eq!(crate::disk::disk_count(&written), 4);
        let (descs, _) = read_all_descriptors(&set.slots(), "bucket", "object").await;
        assert!(descs.iter().all(|d| d.as_ref().unwrap().stat.size == 2));
        for i in 0..4 {
            let tmp = set.path(i).join(SYSTEM_VOLUME).join(TMP_PREFIX);
            assert!(!tmp.exists() || std::fs::read_dir(&tmp).unwrap().next().is_none());
        }
    }

    #[tokio::test]
    async fn test_commit_all_replaces_file() {
        let set = TestSet::new(3);
        make_vols(&set, "bucket").await;
        make_vols(&set, SYSTEM_VOLUME).await;
        let old = ObjectDescriptor::new("object", 2, 1, 1024);
        let mut new = old.clone();
        new.stat.size = 7;
        persist_same(&set.slots(), "bucket", "object", &old, 3)
            .await
            .unwrap();
        persist_same(&set.slots(), "bucket", "staged", &new, 3)
            .await
            .unwrap();

        set.disks[2].fail("rename_file", Error::FaultyDisk);
        let written = commit_all(
            &set.slots(),
            "bucket",
            "staged/xl.json",
            "bucket",
            "object/xl.json",
            2,
        )
        .await
        .unwrap();
        assert!(written[2].is_none());

        set.heal();
        let (descs, _) = read_all_descriptors(&set.slots(), "bucket", "object").await;
        let sizes: Vec<i64> = descs.iter().map(|d| d.as_ref().unwrap().stat.size).collect();
        assert_eq!(sizes, vec![7, 7, 0]);
    }

    #[tokio::test]
    async fn test_delete_all_missing_is_ok() {
        let set = TestSet::new(2);
        make_vols(&set, "bucket").await;
        let errs = delete_all(&set.slots_without(&[1]), "bucket", "nothing/").await;
        assert!(errs[0].is_none());
        assert!(matches!(errs[1], Some(Error::DiskNotFound)));
    }
}
