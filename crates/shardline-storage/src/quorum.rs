//! Quorum voting over per-disk outcomes
//!
//! Every fan-out produces one outcome per disk. These helpers fold the
//! outcomes into a single decision: an error reduction for operations, a
//! modification-time vote for descriptors, and a content vote picking the
//! descriptor the majority of disks agree on.

use crate::disk::DiskSlot;
use crate::metadata::ObjectDescriptor;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use shardline_common::error::OBJECT_OP_IGNORED_ERRS;
use shardline_common::{Error, ErrorKind, Result};

/// Most frequent outcome among `errs`, skipping `ignored` kinds
///
/// Outcomes are grouped by kind. Success wins ties; otherwise the kind seen
/// first wins. Returns the winning count and outcome (`None` = success).
#[must_use]
pub fn reduce_errs(errs: &[Option<Error>], ignored: &[ErrorKind]) -> (usize, Option<Error>) {
    // (kind, first instance, count) in first-occurrence order
    let mut groups: Vec<(Option<ErrorKind>, Option<&Error>, usize)> = Vec::new();
    for err in errs {
        if err.as_ref().is_some_and(|e| e.is_ignored(ignored)) {
            continue;
        }
        let kind = err.as_ref().map(Error::kind);
        match groups.iter_mut().find(|(k, _, _)| *k == kind) {
            Some(group) => group.2 += 1,
            None => groups.push((kind, err.as_ref(), 1)),
        }
    }

    let mut max = 0;
    let mut max_err: Option<&Error> = None;
    for (kind, first, count) in groups {
        if count > max || (count == max && kind.is_none()) {
            max = count;
            max_err = first;
        }
    }
    (max, max_err.cloned())
}

fn reduce_quorum_errs(
    errs: &[Option<Error>],
    ignored: &[ErrorKind],
    quorum: usize,
    quorum_err: Error,
) -> Result<()> {
    let (count, err) = reduce_errs(errs, ignored);
    if count >= quorum {
        err.map_or(Ok(()), Err)
    } else {
        Err(quorum_err)
    }
}

/// Reduce per-disk outcomes against a read quorum
pub fn reduce_read_quorum_errs(
    errs: &[Option<Error>],
    ignored: &[ErrorKind],
    read_quorum: usize,
) -> Result<()> {
    reduce_quorum_errs(errs, ignored, read_quorum, Error::ReadQuorum)
}

/// Reduce per-disk outcomes against a write quorum
pub fn reduce_write_quorum_errs(
    errs: &[Option<Error>],
    ignored: &[ErrorKind],
    write_quorum: usize,
) -> Result<()> {
    reduce_quorum_errs(errs, ignored, write_quorum, Error::WriteQuorum)
}

/// Most frequent modification time and its count
///
/// Missing times are skipped; on equal counts the later time wins.
#[must_use]
pub fn common_time(times: &[Option<DateTime<Utc>>]) -> (Option<DateTime<Utc>>, usize) {
    let mut counts: Vec<(DateTime<Utc>, usize)> = Vec::new();
    for time in times.iter().flatten() {
        match counts.iter_mut().find(|(t, _)| t == time) {
            Some(entry) => entry.1 += 1,
            None => counts.push((*time, 1)),
        }
    }

    let mut best: Option<DateTime<Utc>> = None;
    let mut max = 0;
    for (time, count) in counts {
        if count > max || (count == max && best.is_some_and(|b| time > b)) {
            max = count;
            best = Some(time);
        }
    }
    (best, max)
}

/// Modification time reported by each disk, `None` where the read failed
#[must_use]
pub fn list_object_mod_times(
    descriptors: &[Option<ObjectDescriptor>],
    errs: &[Option<Error>],
) -> Vec<Option<DateTime<Utc>>> {
    descriptors
        .iter()
        .zip(errs)
        .map(|(desc, err)| match (desc, err) {
            (Some(desc), None) => Some(desc.stat.mod_time),
            _ => None,
        })
        .collect()
}

/// Disks holding the most common version of an object
///
/// Returns the disk slice with every other disk cleared, and the common
/// modification time.
#[must_use]
pub fn list_online_disks(
    disks: &[DiskSlot],
    descriptors: &[Option<ObjectDescriptor>],
    errs: &[Option<Error>],
) -> (Vec<DiskSlot>, Option<DateTime<Utc>>) {
    let mod_times = list_object_mod_times(descriptors, errs);
    let (common, _) = common_time(&mod_times);
    let online = disks
        .iter()
        .zip(&mod_times)
        .map(|(disk, time)| match (common, time) {
            (Some(common), Some(time)) if *time == common => disk.clone(),
            _ => None,
        })
        .collect();
    (online, common)
}

/// First valid descriptor carrying the common modification time
///
/// Fails unless at least half the disks agree on that time.
pub fn latest_descriptor(
    descriptors: &[Option<ObjectDescriptor>],
    errs: &[Option<Error>],
) -> Result<ObjectDescriptor> {
    let half = descriptors.len() / 2;
    reduce_read_quorum_errs(errs, OBJECT_OP_IGNORED_ERRS, half)?;

    let mod_times = list_object_mod_times(descriptors, errs);
    let (common, count) = common_time(&mod_times);
    if count < half {
        return Err(Error::ReadQuorum);
    }
    let common = common.ok_or(Error::ReadQuorum)?;
    descriptors
        .iter()
        .flatten()
        .find(|d| d.is_valid() && d.stat.mod_time == common)
        .cloned()
        .ok_or(Error::ReadQuorum)
}

/// Read and write quorum of an object from its descriptors
///
/// Read quorum is the data shard count; write quorum adds one when data and
/// parity counts are equal, so two halves can never both commit.
pub fn object_quorum_from_meta(
    descriptors: &[Option<ObjectDescriptor>],
    errs: &[Option<Error>],
) -> Result<(usize, usize)> {
    let latest = latest_descriptor(descriptors, errs)?;
    let data = latest.erasure.data_blocks;
    let parity = latest.erasure.parity_blocks;
    let write = if data == parity { data + 1 } else { data };
    Ok((data, write))
}

/// Descriptor agreed on by at least `quorum` disks
///
/// Only valid descriptors with the given modification time vote; they are
/// grouped by the SHA-256 of their concatenated part names. The largest
/// group wins, ties going to the group holding the lowest disk index, and
/// that group's lowest-index member is returned.
pub fn resolve_quorum(
    descriptors: &[Option<ObjectDescriptor>],
    mod_time: DateTime<Utc>,
    quorum: usize,
) -> Result<ObjectDescriptor> {
    let mut groups: Vec<(Vec<u8>, usize, usize)> = Vec::new();
    for (index, desc) in descriptors.iter().enumerate() {
        let Some(desc) = desc else { continue };
        if !desc.is_valid() || desc.stat.mod_time != mod_time {
            continue;
        }
        let mut hasher = Sha256::new();
        for part in &desc.parts {
            hasher.update(part.name.as_bytes());
        }
        let hash = hasher.finalize().to_vec();
        match groups.iter_mut().find(|(h, _, _)| *h == hash) {
            Some(group) => group.1 += 1,
            None => groups.push((hash, 1, index)),
        }
    }

    let mut best: Option<(usize, usize)> = None;
    for (_, count, first) in &groups {
        if best.is_none_or(|(max, _)| *count > max) {
            best = Some((*count, *first));
        }
    }

    match best {
        Some((count, first)) if count >= quorum => descriptors[first]
            .clone()
            .ok_or(Error::ReadQuorum),
        _ => Err(Error::ReadQuorum),
    }
}
