//! Shardline Storage Engine - Erasure-coded object storage
//!
//! This crate implements the object engine for Shardline including:
//! - Disk abstraction (`StorageApi`) and a directory-backed `LocalDisk`
//! - Bitrot-protected shard readers and writers (whole and streaming)
//! - Object descriptors (`xl.json`) with quorum resolution
//! - Quorum-checked descriptor persistence and commits
//! - Erasure encode/decode/heal over sets of shard streams
//! - Object layer (buckets, objects, multipart uploads)
//! - Object and bucket healing

pub mod bitrot;
pub mod disk;
pub mod erasure_io;
pub mod heal;
pub mod metadata;
pub mod multipart;
pub mod object;
pub mod persist;
pub mod pool;
pub mod quorum;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports
pub use bitrot::{
    BitrotReader, BitrotVerifier, BitrotWriter, bitrot_shard_file_size, bitrot_verify,
    new_bitrot_reader, new_bitrot_writer,
};
pub use disk::{
    DiskInfo, DiskSlot, FileInfo, FileReader, LocalDisk, StorageApi, VolInfo, disk_count,
    eval_disks,
};
pub use erasure_io::{erasure_decode, erasure_encode, erasure_heal};
pub use heal::{HealDriveInfo, HealResultItem};
pub use metadata::{
    ChecksumInfo, ErasureInfo, ObjectDescriptor, ObjectInfo, PartInfo, StatInfo, hash_order,
    part_size_from_index, shuffle_by_distribution, shuffle_descriptors, shuffle_disks,
};
pub use multipart::{CompletePart, MAX_PART_NUMBER, MultipartInfo};
pub use object::{BucketInfo, ErasureSet};
pub use persist::{
    commit_all, delete_all, persist_same, persist_unique, read_all_descriptors, rename_all,
};
pub use pool::{BufferPool, DiskBufferPools, PooledBuffer};
pub use quorum::{
    common_time, latest_descriptor, list_object_mod_times, list_online_disks,
    object_quorum_from_meta, reduce_errs, reduce_read_quorum_errs, reduce_write_quorum_errs,
    resolve_quorum,
};
