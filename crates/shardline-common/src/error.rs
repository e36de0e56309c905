//! Error types for Shardline
//!
//! Every disk-level call returns its own [`Error`]. Per-disk errors are
//! collected and reduced against a set of ignorable [`ErrorKind`]s and a
//! quorum threshold, so callers only ever see one reduced outcome.

use std::sync::Arc;
use thiserror::Error;

/// Common result type for Shardline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Shardline
#[derive(Debug, Clone, Error)]
pub enum Error {
    // Disk errors
    #[error("disk not found")]
    DiskNotFound,

    #[error("disk is faulty")]
    FaultyDisk,

    #[error("disk is full")]
    DiskFull,

    #[error("disk access denied")]
    DiskAccessDenied,

    #[error("volume not found")]
    VolumeNotFound,

    #[error("volume already exists")]
    VolumeExists,

    #[error("volume is not empty")]
    VolumeNotEmpty,

    #[error("file not found")]
    FileNotFound,

    #[error("file access denied")]
    FileAccessDenied,

    #[error("file size does not match the expected size")]
    FileUnexpectedSize,

    #[error("corrupted backend format")]
    CorruptedFormat,

    #[error("disk I/O error: {0}")]
    DiskIo(Arc<std::io::Error>),

    // Integrity errors
    #[error("bitrot verification mismatch - expected {expected}, received {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("unsupported bitrot algorithm: {0}")]
    BitrotHashAlgoInvalid(String),

    // Quorum errors
    #[error("read failed: insufficient number of disks online")]
    ReadQuorum,

    #[error("write failed: insufficient number of disks online")]
    WriteQuorum,

    // Format errors
    #[error("unsupported descriptor format: version {version:?}, format {format:?}")]
    UnsupportedFormat { version: String, format: String },

    // Erasure coding errors
    #[error("erasure coding error: {0}")]
    ErasureCoding(String),

    #[error("insufficient shards for reconstruction: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    #[error("less data available than what was requested")]
    LessData,

    #[error("more data was sent than what was advertised")]
    MoreData,

    // Object layer errors
    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("bucket already exists: {0}")]
    BucketAlreadyExists(String),

    #[error("bucket not empty: {0}")]
    BucketNotEmpty(String),

    #[error("object not found: {bucket}/{key}")]
    ObjectNotFound { bucket: String, key: String },

    #[error("invalid range: offset {offset}, length {length}, object size {size}")]
    InvalidRange { offset: i64, length: i64, size: i64 },

    #[error("invalid upload id: {0}")]
    InvalidUploadId(String),

    #[error("invalid part: {part_number}")]
    InvalidPart { part_number: u32 },

    #[error("invalid part order")]
    InvalidPartOrder,

    // Internal errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Data-free discriminant of [`Error`], used for quorum reduction and
/// ignorable-error sets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DiskNotFound,
    FaultyDisk,
    DiskFull,
    DiskAccessDenied,
    VolumeNotFound,
    VolumeExists,
    VolumeNotEmpty,
    FileNotFound,
    FileAccessDenied,
    FileUnexpectedSize,
    CorruptedFormat,
    DiskIo,
    ChecksumMismatch,
    BitrotHashAlgoInvalid,
    ReadQuorum,
    WriteQuorum,
    UnsupportedFormat,
    ErasureCoding,
    InsufficientShards,
    LessData,
    MoreData,
    BucketNotFound,
    BucketAlreadyExists,
    BucketNotEmpty,
    ObjectNotFound,
    InvalidRange,
    InvalidUploadId,
    InvalidPart,
    InvalidPartOrder,
    InvalidArgument,
    Serialization,
    Internal,
}

/// Broad failure class, mirrors how callers are expected to react.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transport/disk failure, tolerated up to the quorum threshold
    Disk,
    /// Checksum mismatch, always fatal for the read in progress
    Integrity,
    /// Read or write quorum not reached
    Quorum,
    /// On-disk layout this engine does not understand
    Format,
    /// Object-layer condition (not found, bad range, bad part...)
    Object,
    /// Programming or encoding error
    Internal,
}

/// Errors ignored by every disk fan-out: the disk is simply not there.
pub const BASE_IGNORED_ERRS: &[ErrorKind] = &[ErrorKind::DiskNotFound, ErrorKind::FaultyDisk];

/// Errors ignored while writing object data and descriptors.
pub const OBJECT_OP_IGNORED_ERRS: &[ErrorKind] = &[
    ErrorKind::DiskNotFound,
    ErrorKind::FaultyDisk,
    ErrorKind::DiskAccessDenied,
];

/// Errors ignored when deciding whether an object exists: a disk that
/// lacks the descriptor or holds a damaged one does not count against it.
pub const OBJECT_METADATA_OP_IGNORED_ERRS: &[ErrorKind] = &[
    ErrorKind::DiskNotFound,
    ErrorKind::FaultyDisk,
    ErrorKind::DiskAccessDenied,
    ErrorKind::VolumeNotFound,
    ErrorKind::FileNotFound,
    ErrorKind::FileAccessDenied,
    ErrorKind::CorruptedFormat,
];

/// Errors ignored while creating or deleting buckets.
pub const BUCKET_OP_IGNORED_ERRS: &[ErrorKind] = &[
    ErrorKind::DiskNotFound,
    ErrorKind::FaultyDisk,
    ErrorKind::DiskAccessDenied,
];

/// Errors ignored while reading bucket metadata.
pub const BUCKET_METADATA_OP_IGNORED_ERRS: &[ErrorKind] = &[
    ErrorKind::DiskNotFound,
    ErrorKind::FaultyDisk,
    ErrorKind::DiskAccessDenied,
    ErrorKind::VolumeNotFound,
];

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a checksum mismatch error from raw digests
    #[must_use]
    pub fn checksum_mismatch(expected: &[u8], actual: &[u8]) -> Self {
        Self::ChecksumMismatch {
            expected: hex::encode(expected),
            actual: hex::encode(actual),
        }
    }

    /// Get the data-free kind of this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::DiskNotFound => ErrorKind::DiskNotFound,
            Self::FaultyDisk => ErrorKind::FaultyDisk,
            Self::DiskFull => ErrorKind::DiskFull,
            Self::DiskAccessDenied => ErrorKind::DiskAccessDenied,
            Self::VolumeNotFound => ErrorKind::VolumeNotFound,
            Self::VolumeExists => ErrorKind::VolumeExists,
            Self::VolumeNotEmpty => ErrorKind::VolumeNotEmpty,
            Self::FileNotFound => ErrorKind::FileNotFound,
            Self::FileAccessDenied => ErrorKind::FileAccessDenied,
            Self::FileUnexpectedSize => ErrorKind::FileUnexpectedSize,
            Self::CorruptedFormat => ErrorKind::CorruptedFormat,
            Self::DiskIo(_) => ErrorKind::DiskIo,
            Self::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            Self::BitrotHashAlgoInvalid(_) => ErrorKind::BitrotHashAlgoInvalid,
            Self::ReadQuorum => ErrorKind::ReadQuorum,
            Self::WriteQuorum => ErrorKind::WriteQuorum,
            Self::UnsupportedFormat { .. } => ErrorKind::UnsupportedFormat,
            Self::ErasureCoding(_) => ErrorKind::ErasureCoding,
            Self::InsufficientShards { .. } => ErrorKind::InsufficientShards,
            Self::LessData => ErrorKind::LessData,
            Self::MoreData => ErrorKind::MoreData,
            Self::BucketNotFound(_) => ErrorKind::BucketNotFound,
            Self::BucketAlreadyExists(_) => ErrorKind::BucketAlreadyExists,
            Self::BucketNotEmpty(_) => ErrorKind::BucketNotEmpty,
            Self::ObjectNotFound { .. } => ErrorKind::ObjectNotFound,
            Self::InvalidRange { .. } => ErrorKind::InvalidRange,
            Self::InvalidUploadId(_) => ErrorKind::InvalidUploadId,
            Self::InvalidPart { .. } => ErrorKind::InvalidPart,
            Self::InvalidPartOrder => ErrorKind::InvalidPartOrder,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Get the failure class of this error
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::DiskNotFound
            | Self::FaultyDisk
            | Self::DiskFull
            | Self::DiskAccessDenied
            | Self::VolumeNotFound
            | Self::VolumeExists
            | Self::VolumeNotEmpty
            | Self::FileNotFound
            | Self::FileAccessDenied
            | Self::FileUnexpectedSize
            | Self::DiskIo(_) => ErrorClass::Disk,

            Self::ChecksumMismatch { .. } | Self::BitrotHashAlgoInvalid(_) => {
                ErrorClass::Integrity
            }

            Self::ReadQuorum | Self::WriteQuorum | Self::InsufficientShards { .. } => {
                ErrorClass::Quorum
            }

            Self::CorruptedFormat | Self::UnsupportedFormat { .. } => ErrorClass::Format,

            Self::BucketNotFound(_)
            | Self::BucketAlreadyExists(_)
            | Self::BucketNotEmpty(_)
            | Self::ObjectNotFound { .. }
            | Self::InvalidRange { .. }
            | Self::InvalidUploadId(_)
            | Self::InvalidPart { .. }
            | Self::InvalidPartOrder
            | Self::LessData
            | Self::MoreData => ErrorClass::Object,

            Self::ErasureCoding(_)
            | Self::InvalidArgument(_)
            | Self::Serialization(_)
            | Self::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Check whether this error's kind is in the given set
    #[must_use]
    pub fn is_ignored(&self, ignored: &[ErrorKind]) -> bool {
        ignored.contains(&self.kind())
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::FileNotFound
                | Self::VolumeNotFound
                | Self::BucketNotFound(_)
                | Self::ObjectNotFound { .. }
                | Self::InvalidUploadId(_)
        )
    }

    /// Check if this error means the stored data is damaged
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::FileUnexpectedSize | Self::CorruptedFormat
        )
    }

    /// Check if this error means the disk itself is unreachable
    #[must_use]
    pub const fn is_offline(&self) -> bool {
        matches!(self, Self::DiskNotFound | Self::FaultyDisk)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::FileNotFound,
            std::io::ErrorKind::PermissionDenied => Self::FileAccessDenied,
            std::io::ErrorKind::StorageFull => Self::DiskFull,
            _ => Self::DiskIo(Arc::new(e)),
        }
    }
}

/// Convert a disk-level error into its object-layer counterpart.
#[must_use]
pub fn to_object_err(err: Error, bucket: &str, object: &str) -> Error {
    match err {
        Error::VolumeNotFound => Error::BucketNotFound(bucket.to_string()),
        Error::VolumeExists => Error::BucketAlreadyExists(bucket.to_string()),
        Error::VolumeNotEmpty => Error::BucketNotEmpty(bucket.to_string()),
        Error::FileNotFound if !object.is_empty() => Error::ObjectNotFound {
            bucket: bucket.to_string(),
            key: object.to_string(),
        },
        other => other,
    }
}
