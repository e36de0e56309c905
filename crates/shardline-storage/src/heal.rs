//! Object and bucket healing
//!
//! Healing compares every disk's copy against the quorum, rebuilds the
//! shards of deficient disks from the healthy ones and commits fresh
//! descriptors on the rebuilt disks only. A consistent object is left
//! untouched.

use crate::bitrot::{BitrotReader, bitrot_shard_file_size, bitrot_verify, new_bitrot_reader};
use crate::disk::{
    DiskSlot, StorageApi, disk_count, endpoint_of, errors_of, eval_disks, fan_out, path_join,
    retain_slash,
};
use crate::erasure_io::erasure_heal;
use crate::metadata::{ChecksumInfo, ObjectDescriptor, PartInfo, shuffle_descriptors, shuffle_disks};
use crate::object::ErasureSet;
use crate::persist::{delete_all, persist_unique, read_all_descriptors};
use crate::quorum::{
    latest_descriptor, list_online_disks, reduce_write_quorum_errs, resolve_quorum,
};
use serde::Serialize;
use shardline_common::error::BUCKET_OP_IGNORED_ERRS;
use shardline_common::{
    DriveState, Error, HealItemKind, HealScanMode, Result, SYSTEM_VOLUME, TMP_PREFIX,
    to_object_err,
};
use shardline_erasure::Erasure;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// State of one disk before or after a heal
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealDriveInfo {
    pub endpoint: String,
    pub state: DriveState,
}

/// Outcome of healing one object or bucket
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealResultItem {
    pub kind: HealItemKind,
    pub bucket: String,
    pub object: String,
    pub disk_count: usize,
    pub data_blocks: usize,
    pub parity_blocks: usize,
    /// `-1` until the object's size is known
    pub object_size: i64,
    pub before: Vec<HealDriveInfo>,
    pub after: Vec<HealDriveInfo>,
}

impl HealResultItem {
    fn new(kind: HealItemKind, bucket: &str, object: &str, disks: &[DiskSlot]) -> Self {
        Self {
            kind,
            bucket: bucket.to_string(),
            object: object.to_string(),
            disk_count: disks.len(),
            data_blocks: 0,
            parity_blocks: 0,
            object_size: -1,
            before: Vec::new(),
            after: Vec::new(),
        }
    }

    /// Number of disks in `state` after the heal
    #[must_use]
    pub fn count_after(&self, state: DriveState) -> usize {
        self.after.iter().filter(|d| d.state == state).count()
    }
}

/// Drive state for a failed disk, descriptor or part check
///
/// Anything other than an absent disk or file is damage, including a
/// descriptor that is unparseable, invalid or of an unknown format.
fn drive_state(err: &Error) -> DriveState {
    match err {
        Error::DiskNotFound | Error::FaultyDisk => DriveState::Offline,
        Error::FileNotFound | Error::VolumeNotFound => DriveState::Missing,
        _ => DriveState::Corrupt,
    }
}

fn drive_infos(disks: &[DiskSlot], states: &[DriveState]) -> Vec<HealDriveInfo> {
    disks
        .iter()
        .zip(states)
        .map(|(disk, &state)| HealDriveInfo {
            endpoint: endpoint_of(disk),
            state,
        })
        .collect()
}

/// Check one shard file of a part
///
/// Normal scans compare the file size with the size the descriptor
/// implies; deep scans also re-hash the whole file.
async fn verify_part(
    disk: &Arc<dyn StorageApi>,
    bucket: &str,
    path: &str,
    erasure: &Erasure,
    part: &PartInfo,
    checksum: &ChecksumInfo,
    scan_mode: HealScanMode,
) -> Result<()> {
    let shard_size = erasure.shard_size() as i64;
    let part_shard_size = erasure.shard_file_size(part.size);
    let want = bitrot_shard_file_size(part_shard_size, shard_size, checksum.algorithm);

    let info = disk.stat_file(bucket, path).await?;
    if info.is_dir || i64::try_from(info.size).unwrap_or(i64::MAX) != want {
        return Err(Error::FileUnexpectedSize);
    }
    if scan_mode == HealScanMode::Deep {
        let mut reader = disk.read_file_stream(bucket, path, 0, info.size).await?;
        bitrot_verify(
            &mut reader,
            want,
            part_shard_size,
            checksum.algorithm,
            &checksum.hash,
            shard_size,
        )
        .await?;
    }
    Ok(())
}

/// Check every part of the object on the disks that agree on its version
///
/// Index-aligned with `disks`; `None` where every part verified.
async fn disks_with_all_parts(
    disks: &[DiskSlot],
    descriptors: &[Option<ObjectDescriptor>],
    bucket: &str,
    object: &str,
    scan_mode: HealScanMode,
) -> Vec<Option<Error>> {
    let results = fan_out(disks, |index, disk| {
        let descriptor = descriptors.get(index).cloned().flatten();
        async move {
            let desc = descriptor.ok_or(Error::FileNotFound)?;
            let erasure = desc.erasure.coder()?;
            for part in &desc.parts {
                let checksum = desc.erasure.checksum_info(&part.name);
                let path = path_join(&[object, &part.name]);
                if let Err(e) =
                    verify_part(&disk, bucket, &path, &erasure, part, &checksum, scan_mode).await
                {
                    debug!("{} on {} failed verification: {}", path, disk.endpoint(), e);
                    return Err(e);
                }
            }
            Ok(())
        }
    })
    .await;
    errors_of(&results)
}

impl ErasureSet {
    /// Heal one object
    ///
    /// Rebuilds the shards and descriptors of every disk whose copy is
    /// missing, outdated or fails verification. With `dry_run` only the
    /// drive states are reported. With `remove`, an object that can no
    /// longer be read from any quorum is deleted from every disk.
    pub async fn heal_object(
        &self,
        bucket: &str,
        object: &str,
        dry_run: bool,
        remove: bool,
        scan_mode: HealScanMode,
    ) -> Result<HealResultItem> {
        let disks = self.disks();
        let mut result = HealResultItem::new(HealItemKind::Object, bucket, object, disks);

        let (descriptors, errs) = read_all_descriptors(disks, bucket, object).await;
        // Disks outside the common version count as missing it
        let (online, mod_time) = list_online_disks(disks, &descriptors, &errs);
        let reference = match latest_descriptor(&descriptors, &errs) {
            Ok(reference) => reference,
            // Below read quorum the most common version still decides
            // whether what is left is dangling
            Err(err) => descriptors
                .iter()
                .flatten()
                .find(|d| Some(d.stat.mod_time) == mod_time)
                .cloned()
                .ok_or_else(|| to_object_err(err, bucket, object))?,
        };
        let (data_blocks, parity_blocks) =
            (reference.erasure.data_blocks, reference.erasure.parity_blocks);
        result.data_blocks = data_blocks;
        result.parity_blocks = parity_blocks;
        let data_errs =
            disks_with_all_parts(&online, &descriptors, bucket, object, scan_mode).await;

        let before: Vec<DriveState> = (0..disks.len())
            .map(|i| match (&disks[i], &errs[i], &online[i], &data_errs[i]) {
                (None, _, _, _) => DriveState::Offline,
                (_, Some(err), _, _) => drive_state(err),
                (_, None, None, _) => DriveState::Missing,
                (_, None, Some(_), Some(err)) => drive_state(err),
                (_, None, Some(_), None) => DriveState::Ok,
            })
            .collect();
        result.before = drive_infos(disks, &before);
        result.after = drive_infos(disks, &before);

        let verified = before.iter().filter(|s| **s == DriveState::Ok).count();
        let deficient = before
            .iter()
            .filter(|s| matches!(s, DriveState::Missing | DriveState::Corrupt))
            .count();
        if deficient == 0 || dry_run {
            debug!(
                "heal {}/{}: {} verified, {} deficient, dry run {}",
                bucket, object, verified, deficient, dry_run
            );
            return Ok(result);
        }

        if verified < data_blocks {
            let dangling = deficient > parity_blocks;
            if dangling && remove {
                let errs = delete_all(disks, bucket, &retain_slash(object)).await;
                let after: Vec<DriveState> = before
                    .iter()
                    .zip(&errs)
                    .map(|(state, err)| match (state, err) {
                        (DriveState::Offline, _) => DriveState::Offline,
                        (_, None) => DriveState::Missing,
                        (state, Some(_)) => *state,
                    })
                    .collect();
                result.after = drive_infos(disks, &after);
                info!("removed dangling object {}/{}", bucket, object);
                return Ok(result);
            }
            warn!(
                "cannot heal {}/{}: {} of {} shards verified{}",
                bucket,
                object,
                verified,
                data_blocks,
                if dangling { ", object is dangling" } else { "" }
            );
            return Err(Error::ReadQuorum);
        }

        let mod_time = mod_time.ok_or(Error::ReadQuorum)?;
        let latest = resolve_quorum(&descriptors, mod_time, data_blocks)?;
        result.object_size = latest.stat.size;

        self.heal_volume(SYSTEM_VOLUME, false, false).await?;
        self.heal_volume(bucket, false, false).await?;

        let sources: Vec<DiskSlot> = disks
            .iter()
            .zip(&before)
            .map(|(disk, state)| disk.clone().filter(|_| *state == DriveState::Ok))
            .collect();
        let targets: Vec<DiskSlot> = disks
            .iter()
            .zip(&before)
            .map(|(disk, state)| {
                disk.clone()
                    .filter(|_| matches!(state, DriveState::Missing | DriveState::Corrupt))
            })
            .collect();

        let temp_dir = path_join(&[TMP_PREFIX, &Uuid::new_v4().to_string()]);
        let healed = self
            .heal_shards(bucket, object, &latest, &descriptors, &sources, &targets, &temp_dir)
            .await;
        delete_all(disks, SYSTEM_VOLUME, &retain_slash(&temp_dir)).await;
        let healed = healed.map_err(|e| to_object_err(e, bucket, object))?;

        let after: Vec<DriveState> = before
            .iter()
            .zip(&healed)
            .map(|(state, healed)| if healed.is_some() { DriveState::Ok } else { *state })
            .collect();
        result.after = drive_infos(disks, &after);
        info!(
            "healed {}/{} on {} of {} deficient disks",
            bucket,
            object,
            disk_count(&healed),
            deficient
        );
        Ok(result)
    }

    /// Rebuild every part onto `targets` and commit the object there
    ///
    /// Returns the targets, in disk order, that now hold the healed object.
    #[allow(clippy::too_many_arguments)]
    async fn heal_shards(
        &self,
        bucket: &str,
        object: &str,
        latest: &ObjectDescriptor,
        descriptors: &[Option<ObjectDescriptor>],
        sources: &[DiskSlot],
        targets: &[DiskSlot],
        temp_dir: &str,
    ) -> Result<Vec<DiskSlot>> {
        let erasure = latest.erasure.coder()?;
        let distribution = &latest.erasure.distribution;
        let shard_size = erasure.shard_size();

        let source_disks = shuffle_disks(sources, distribution);
        let source_descs = shuffle_descriptors(descriptors, distribution);
        let mut target_disks = shuffle_disks(targets, distribution);

        let mut healed: Vec<Option<ObjectDescriptor>> = target_disks
            .iter()
            .map(|disk| disk.as_ref().map(|_| latest.new_from()))
            .collect();
        for desc in healed.iter_mut().flatten() {
            desc.parts.clone_from(&latest.parts);
        }

        for part in &latest.parts {
            let till = erasure.shard_file_till_offset(0, part.size, part.size);
            let part_path = path_join(&[object, &part.name]);
            let mut readers: Vec<Option<BitrotReader>> = source_disks
                .iter()
                .zip(&source_descs)
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
                        shard_size as i64,
                    ))
                })
                .collect();

            let staged = path_join(&[temp_dir, &part.name]);
            let mut writers = self
                .shard_writers(&target_disks, distribution, SYSTEM_VOLUME, &staged, shard_size)
                .await;
            erasure_heal(&erasure, &mut readers, &mut writers, part.size).await?;

            for (shard, writer) in writers.iter().enumerate() {
                match writer {
                    Some(writer) => {
                        if let Some(desc) = healed[shard].as_mut() {
                            desc.erasure.upsert_checksum(ChecksumInfo {
                                name: part.name.clone(),
                                algorithm: writer.algorithm(),
                                hash: writer.sum(),
                            });
                        }
                    }
                    None => {
                        target_disks[shard] = None;
                        healed[shard] = None;
                    }
                }
            }
            debug!("rebuilt {}/{} on {} disks", bucket, part_path, disk_count(&target_disks));
        }

        let quorum = disk_count(&target_disks);
        if quorum == 0 {
            return Err(Error::WriteQuorum);
        }
        let target_disks =
            persist_unique(&target_disks, SYSTEM_VOLUME, temp_dir, &healed, quorum).await?;

        let staged = retain_slash(temp_dir);
        let destination = retain_slash(object);
        let results = fan_out(&target_disks, |shard, disk| {
            let (staged, destination) = (&staged, &destination);
            async move {
                let renamed = disk
                    .rename_file(SYSTEM_VOLUME, staged, bucket, destination)
                    .await;
                if let Err(e) = &renamed {
                    warn!("heal commit of {}/{} failed on shard {}: {}", bucket, object, shard, e);
                }
                renamed
            }
        })
        .await;
        let committed = eval_disks(&target_disks, &errors_of(&results));
        if disk_count(&committed) == 0 {
            return Err(Error::WriteQuorum);
        }

        // Back to disk order
        Ok(distribution
            .iter()
            .map(|&shard| {
                shard
                    .checked_sub(1)
                    .and_then(|s| committed.get(s).cloned().flatten())
            })
            .collect())
    }

    /// Heal a bucket's volume across the set
    ///
    /// Recreates the volume where it is missing. With `remove`, a bucket
    /// present on fewer than half the disks is deleted instead.
    pub async fn heal_bucket(
        &self,
        bucket: &str,
        dry_run: bool,
        remove: bool,
    ) -> Result<HealResultItem> {
        if bucket == SYSTEM_VOLUME {
            return Err(Error::invalid_argument("cannot heal the system volume"));
        }
        self.heal_volume(bucket, dry_run, remove)
            .await
            .map_err(|e| to_object_err(e, bucket, ""))
    }

    async fn heal_volume(
        &self,
        volume: &str,
        dry_run: bool,
        remove: bool,
    ) -> Result<HealResultItem> {
        let disks = self.disks();
        let mut result = HealResultItem::new(HealItemKind::Bucket, volume, "", disks);

        let stats = fan_out(disks, |_, disk| async move { disk.stat_vol(volume).await }).await;
        let before: Vec<DriveState> = stats
            .iter()
            .map(|stat| match stat {
                Ok(_) => DriveState::Ok,
                Err(err) => drive_state(err),
            })
            .collect();
        result.before = drive_infos(disks, &before);
        result.after = drive_infos(disks, &before);

        let present = before.iter().filter(|s| **s == DriveState::Ok).count();
        if present == 0 {
            return Err(Error::VolumeNotFound);
        }
        let missing: Vec<DiskSlot> = disks
            .iter()
            .zip(&before)
            .map(|(disk, state)| disk.clone().filter(|_| *state == DriveState::Missing))
            .collect();
        if missing.iter().all(Option::is_none) || dry_run {
            return Ok(result);
        }

        if remove && present < self.bucket_read_quorum() {
            let holders: Vec<DiskSlot> = disks
                .iter()
                .zip(&before)
                .map(|(disk, state)| disk.clone().filter(|_| *state == DriveState::Ok))
                .collect();
            let results =
                fan_out(&holders, |_, disk| async move { disk.delete_vol(volume, true).await })
                    .await;
            let after: Vec<DriveState> = before
                .iter()
                .zip(&results)
                .map(|(state, res)| match (state, res) {
                    (DriveState::Ok, Ok(())) => DriveState::Missing,
                    (state, _) => *state,
                })
                .collect();
            result.after = drive_infos(disks, &after);
            info!("removed dangling bucket {} from {} disks", volume, present);
            return Ok(result);
        }

        let created = fan_out(&missing, |_, disk| async move {
            match disk.make_vol(volume).await {
                Err(Error::VolumeExists) => Ok(()),
                other => other,
            }
        })
        .await;
        let errs: Vec<Option<Error>> = before
            .iter()
            .zip(errors_of(&created))
            .map(|(state, err)| match state {
                DriveState::Ok => None,
                DriveState::Missing => err,
                DriveState::Offline => Some(Error::DiskNotFound),
                DriveState::Corrupt => Some(Error::FaultyDisk),
            })
            .collect();

        match reduce_write_quorum_errs(&errs, BUCKET_OP_IGNORED_ERRS, self.bucket_write_quorum()) {
            Ok(()) => {}
            Err(Error::WriteQuorum) => {
                let made = eval_disks(&missing, &errors_of(&created));
                warn!("healing volume {} below write quorum, undoing", volume);
                fan_out(&made, |_, disk| async move { disk.delete_vol(volume, false).await })
                    .await;
                return Err(Error::WriteQuorum);
            }
            Err(e) => return Err(e),
        }

        let after: Vec<DriveState> = before
            .iter()
            .zip(&errs)
            .map(|(state, err)| match (state, err) {
                (DriveState::Missing, None) => DriveState::Ok,
                (state, _) => *state,
            })
            .collect();
        result.after = drive_infos(disks, &after);
        if volume != SYSTEM_VOLUME {
            info!("healed bucket {}", volume);
        }
        Ok(result)
    }
}
