//! Multipart uploads
//!
//! Upload state lives in the system volume:
//!
//! ```text
//! .shardline.sys/multipart/<sha256(bucket/object)>/<upload-id>/xl.json
//! .shardline.sys/multipart/<sha256(bucket/object)>/<upload-id>/part.N
//! ```
//!
//! Parts are staged under `tmp/` and renamed into the upload directory.
//! Completion stages descriptors listing the chosen parts, commits them
//! into the upload directory and renames that directory over the object.
//! Both commits keep the previous content until they reach quorum, so a
//! failed completion can be retried.

use crate::disk::{DiskSlot, errors_of, fan_out, path_join, retain_slash};
use crate::erasure_io::erasure_encode;
use crate::metadata::{
    ChecksumInfo, ObjectDescriptor, ObjectInfo, PartInfo, shuffle_descriptors, shuffle_disks,
};
use crate::object::{ErasureSet, EtagReader, check_size, read_limit, write_quorum_for};
use crate::persist::{
    commit_all, delete_all, persist_same, persist_unique, read_all_descriptors, rename_all,
};
use crate::quorum::{
    list_online_disks, object_quorum_from_meta, reduce_read_quorum_errs,
    reduce_write_quorum_errs, resolve_quorum,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shardline_common::error::OBJECT_OP_IGNORED_ERRS;
use shardline_common::{
    DESCRIPTOR_FILE, Error, MULTIPART_PREFIX, Result, SYSTEM_VOLUME, TMP_PREFIX, sha256_hex,
    to_object_err,
};
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Highest part number accepted
pub const MAX_PART_NUMBER: u32 = 10_000;

/// A freshly initiated upload
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MultipartInfo {
    pub bucket: String,
    pub object: String,
    pub upload_id: String,
    pub initiated: DateTime<Utc>,
}

/// A part chosen for completion
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletePart {
    pub part_number: u32,
    pub etag: String,
}

fn upload_path(bucket: &str, object: &str, upload_id: &str) -> String {
    let key = sha256_hex(format!("{bucket}/{object}").as_bytes());
    path_join(&[MULTIPART_PREFIX, &key, upload_id])
}

fn part_name(number: u32) -> String {
    format!("part.{number}")
}

fn canonical_etag(etag: &str) -> &str {
    etag.trim_matches('"')
}

fn upload_err(err: Error, bucket: &str, object: &str, upload_id: &str) -> Error {
    match err {
        Error::FileNotFound => Error::InvalidUploadId(upload_id.to_string()),
        other => to_object_err(other, bucket, object),
    }
}

/// Etag of a completed upload: the first 32 hex digits of SHA-256 over the
/// decoded part etags, suffixed with the part count
fn complete_etag(parts: &[CompletePart]) -> Result<String> {
    let mut raw = Vec::new();
    for part in parts {
        let decoded = hex::decode(canonical_etag(&part.etag)).map_err(|_| Error::InvalidPart {
            part_number: part.part_number,
        })?;
        raw.extend_from_slice(&decoded);
    }
    let digest = sha256_hex(&raw);
    Ok(format!("{}-{}", &digest[..32], parts.len()))
}

/// Quorum state of an upload, index-aligned with the disks it was read from
struct UploadView {
    desc: ObjectDescriptor,
    disks: Vec<DiskSlot>,
    descriptors: Vec<Option<ObjectDescriptor>>,
    errs: Vec<Option<Error>>,
    write_quorum: usize,
}

impl ErasureSet {
    /// Upload state agreed on by a read quorum
    async fn upload_view(
        &self,
        disks: &[DiskSlot],
        bucket: &str,
        object: &str,
        upload_id: &str,
    ) -> Result<UploadView> {
        let path = upload_path(bucket, object, upload_id);
        let (descriptors, errs) = read_all_descriptors(disks, SYSTEM_VOLUME, &path).await;
        let (read_quorum, write_quorum) = object_quorum_from_meta(&descriptors, &errs)
            .map_err(|e| upload_err(e, bucket, object, upload_id))?;
        reduce_read_quorum_errs(&errs, OBJECT_OP_IGNORED_ERRS, read_quorum)
            .map_err(|e| upload_err(e, bucket, object, upload_id))?;

        let (online, mod_time) = list_online_disks(disks, &descriptors, &errs);
        let desc = resolve_quorum(&descriptors, mod_time.ok_or(Error::ReadQuorum)?, read_quorum)?;
        Ok(UploadView {
            disks: online,
            descriptors,
            errs,
            desc,
            write_quorum,
        })
    }

    /// Upload state agreed on by a write quorum, for operations changing it
    async fn writable_upload_view(
        &self,
        disks: &[DiskSlot],
        bucket: &str,
        object: &str,
        upload_id: &str,
    ) -> Result<UploadView> {
        let view = self.upload_view(disks, bucket, object, upload_id).await?;
        reduce_write_quorum_errs(&view.errs, OBJECT_OP_IGNORED_ERRS, view.write_quorum)
            .map_err(|e| upload_err(e, bucket, object, upload_id))?;
        resolve_quorum(&view.descriptors, view.desc.stat.mod_time, view.write_quorum)
            .map_err(|_| Error::WriteQuorum)?;
        Ok(view)
    }

    /// Start an upload for `object`
    pub async fn new_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        user_meta: BTreeMap<String, String>,
    ) -> Result<MultipartInfo> {
        self.get_bucket_info(bucket).await?;

        let (data_blocks, parity_blocks) = self.default_layout();
        let write_quorum = write_quorum_for(data_blocks, parity_blocks);
        let mut desc =
            ObjectDescriptor::new(object, data_blocks, parity_blocks, self.block_size());
        desc.stat.mod_time = Utc::now();
        desc.meta = user_meta;

        let upload_id = Uuid::new_v4().to_string();
        let upload = upload_path(bucket, object, &upload_id);
        let temp_dir = path_join(&[TMP_PREFIX, &Uuid::new_v4().to_string()]);

        let result = async {
            let disks =
                persist_same(self.disks(), SYSTEM_VOLUME, &temp_dir, &desc, write_quorum).await?;
            rename_all(
                &disks,
                SYSTEM_VOLUME,
                &retain_slash(&temp_dir),
                SYSTEM_VOLUME,
                &retain_slash(&upload),
                write_quorum,
                &[],
            )
            .await
        }
        .await;
        delete_all(self.disks(), SYSTEM_VOLUME, &retain_slash(&temp_dir)).await;
        result.map_err(|e| to_object_err(e, bucket, object))?;

        info!("started upload {} for {}/{}", upload_id, bucket, object);
        Ok(MultipartInfo {
            bucket: bucket.to_string(),
            object: object.to_string(),
            upload_id,
            initiated: desc.stat.mod_time,
        })
    }

    /// Upload one part; uploading the same number again replaces it
    pub async fn put_object_part<R: AsyncRead + Unpin + Send>(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_number: u32,
        reader: R,
        size: i64,
    ) -> Result<PartInfo> {
        if !(1..=MAX_PART_NUMBER).contains(&part_number) {
            return Err(Error::InvalidPart { part_number });
        }
        self.get_bucket_info(bucket).await?;

        let temp_dir = path_join(&[TMP_PREFIX, &Uuid::new_v4().to_string()]);
        let result = self
            .put_object_part_staged(bucket, object, upload_id, part_number, reader, size, &temp_dir)
            .await;
        delete_all(self.disks(), SYSTEM_VOLUME, &retain_slash(&temp_dir)).await;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn put_object_part_staged<R: AsyncRead + Unpin + Send>(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_number: u32,
        reader: R,
        size: i64,
        temp_dir: &str,
    ) -> Result<PartInfo> {
        let view = self
            .writable_upload_view(self.disks(), bucket, object, upload_id)
            .await?;
        let write_quorum = view.write_quorum;
        let distribution = view.desc.erasure.distribution.clone();
        let erasure = view.desc.erasure.coder()?;
        let disks = shuffle_disks(&view.disks, &distribution);

        let name = part_name(part_number);
        let temp_part = path_join(&[temp_dir, &name]);
        let mut writers = self
            .shard_writers(&disks, &distribution, SYSTEM_VOLUME, &temp_part, erasure.shard_size())
            .await;

        let mut hashing = EtagReader::new(reader.take(read_limit(size)));
        let written = erasure_encode(&erasure, &mut hashing, &mut writers, write_quorum, self.pool())
            .await
            .map_err(|e| to_object_err(e, bucket, object))?;
        check_size(size, written)?;
        let etag = hashing.etag();

        let upload = upload_path(bucket, object, upload_id);
        let disks = commit_all(
            &disks,
            SYSTEM_VOLUME,
            &temp_part,
            SYSTEM_VOLUME,
            &path_join(&[&upload, &name]),
            write_quorum,
        )
        .await
        .map_err(|e| to_object_err(e, bucket, object))?;

        // Re-read in shard order: other parts may have landed meanwhile
        let view = self
            .writable_upload_view(&disks, bucket, object, upload_id)
            .await?;
        let part = PartInfo {
            number: part_number,
            name: name.clone(),
            etag,
            size: written,
            actual_size: written,
        };
        let mut desc = view.desc;
        desc.stat.mod_time = Utc::now();
        desc.upsert_part(part.clone());

        let descriptors: Vec<Option<ObjectDescriptor>> = view
            .descriptors
            .iter()
            .zip(&writers)
            .map(|(own, writer)| {
                let (own, writer) = (own.as_ref()?, writer.as_ref()?);
                let mut updated = desc.clone();
                updated.erasure.checksums.clone_from(&own.erasure.checksums);
                updated.erasure.upsert_checksum(ChecksumInfo {
                    name: name.clone(),
                    algorithm: writer.algorithm(),
                    hash: writer.sum(),
                });
                Some(updated)
            })
            .collect();

        let disks = persist_unique(&view.disks, SYSTEM_VOLUME, temp_dir, &descriptors, write_quorum)
            .await
            .map_err(|e| to_object_err(e, bucket, object))?;
        commit_all(
            &disks,
            SYSTEM_VOLUME,
            &path_join(&[temp_dir, DESCRIPTOR_FILE]),
            SYSTEM_VOLUME,
            &path_join(&[&upload, DESCRIPTOR_FILE]),
            write_quorum,
        )
        .await
        .map_err(|e| to_object_err(e, bucket, object))?;

        debug!("stored part {} of upload {} ({} bytes)", part_number, upload_id, written);
        Ok(part)
    }

    /// Parts uploaded so far, ascending by number
    pub async fn list_object_parts(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
    ) -> Result<Vec<PartInfo>> {
        self.get_bucket_info(bucket).await?;
        let view = self.upload_view(self.disks(), bucket, object, upload_id).await?;
        Ok(view.desc.parts)
    }

    /// Assemble the listed parts into the final object
    ///
    /// Parts must be listed in strictly ascending order and each etag must
    /// match the uploaded part. Uploaded parts left out are discarded.
    pub async fn complete_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        parts: &[CompletePart],
    ) -> Result<ObjectInfo> {
        self.get_bucket_info(bucket).await?;
        if parts.is_empty() {
            return Err(Error::invalid_argument("no parts to complete"));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(Error::InvalidPartOrder);
        }

        let view = self
            .writable_upload_view(self.disks(), bucket, object, upload_id)
            .await?;
        let write_quorum = view.write_quorum;
        let distribution = view.desc.erasure.distribution.clone();
        let disks = shuffle_disks(&view.disks, &distribution);
        let own = shuffle_descriptors(&view.descriptors, &distribution);

        let mut desc = view.desc;
        let mut chosen = Vec::with_capacity(parts.len());
        for part in parts {
            let invalid = Error::InvalidPart {
                part_number: part.part_number,
            };
            let index = desc.part_index(part.part_number).ok_or_else(|| invalid.clone())?;
            let stored = &desc.parts[index];
            if canonical_etag(&stored.etag) != canonical_etag(&part.etag) {
                return Err(invalid);
            }
            chosen.push(stored.clone());
        }
        let etag = complete_etag(parts)?;

        desc.stat.size = chosen.iter().map(|p| p.size).sum();
        desc.stat.mod_time = Utc::now();
        desc.parts = chosen;
        desc.meta.insert("etag".to_string(), etag);

        let descriptors: Vec<Option<ObjectDescriptor>> = own
            .iter()
            .map(|own| {
                let own = own.as_ref()?;
                let mut updated = desc.clone();
                updated.erasure.checksums = own
                    .erasure
                    .checksums
                    .iter()
                    .filter(|c| desc.parts.iter().any(|p| p.name == c.name))
                    .cloned()
                    .collect();
                Some(updated)
            })
            .collect();

        let upload = upload_path(bucket, object, upload_id);
        let temp_dir = path_join(&[TMP_PREFIX, &Uuid::new_v4().to_string()]);
        let committed = async {
            let disks =
                persist_unique(&disks, SYSTEM_VOLUME, &temp_dir, &descriptors, write_quorum)
                    .await?;
            let disks = commit_all(
                &disks,
                SYSTEM_VOLUME,
                &path_join(&[&temp_dir, DESCRIPTOR_FILE]),
                SYSTEM_VOLUME,
                &path_join(&[&upload, DESCRIPTOR_FILE]),
                write_quorum,
            )
            .await?;
            commit_all(
                &disks,
                SYSTEM_VOLUME,
                &retain_slash(&upload),
                bucket,
                &retain_slash(object),
                write_quorum,
            )
            .await
        }
        .await;
        delete_all(self.disks(), SYSTEM_VOLUME, &retain_slash(&temp_dir)).await;
        let disks = committed.map_err(|e| to_object_err(e, bucket, object))?;
        self.remove_unlisted_parts(&disks, bucket, object, &desc.parts)
            .await;

        info!(
            "completed upload {} for {}/{} ({} parts, {} bytes)",
            upload_id,
            bucket,
            object,
            desc.parts.len(),
            desc.stat.size
        );
        Ok(desc.to_object_info(bucket, object))
    }

    /// Delete part files the completed object does not list
    ///
    /// This also catches parts dropped by an earlier completion attempt
    /// that failed after its descriptors were committed.
    async fn remove_unlisted_parts(
        &self,
        disks: &[DiskSlot],
        bucket: &str,
        object: &str,
        parts: &[PartInfo],
    ) {
        let dir = retain_slash(object);
        let results = fan_out(disks, |_, disk| {
            let dir = &dir;
            async move {
                for entry in disk.list_dir(bucket, dir).await? {
                    let listed = parts.iter().any(|p| p.name == entry);
                    if entry.starts_with("part.") && !listed {
                        disk.delete_file(bucket, &path_join(&[object, &entry])).await?;
                    }
                }
                Ok(())
            }
        })
        .await;
        for err in errors_of(&results).into_iter().flatten() {
            if !err.is_offline() {
                warn!("removing unlisted parts of {}/{} failed: {}", bucket, object, err);
            }
        }
    }

    /// Discard an upload and every part uploaded to it
    pub async fn abort_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
    ) -> Result<()> {
        self.get_bucket_info(bucket).await?;
        let view = self
            .writable_upload_view(self.disks(), bucket, object, upload_id)
            .await?;
        let upload = upload_path(bucket, object, upload_id);
        let errs = delete_all(self.disks(), SYSTEM_VOLUME, &retain_slash(&upload)).await;
        reduce_write_quorum_errs(&errs, OBJECT_OP_IGNORED_ERRS, view.write_quorum)
            .map_err(|e| to_object_err(e, bucket, object))?;
        info!("aborted upload {} for {}/{}", upload_id, bucket, object);
        Ok(())
    }
}
