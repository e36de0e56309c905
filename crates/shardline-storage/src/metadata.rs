//! Object descriptors
//!
//! Every disk holding a shard of an object keeps an `xl.json` descriptor
//! next to the part files. Descriptors differ between disks only in
//! `erasure.index` and the per-part bitrot checksums.
//!
//! ```text
//! bucket/object/xl.json
//! bucket/object/part.1
//! bucket/object/part.2
//! ```

use crate::disk::DiskSlot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shardline_common::{
    BitrotAlgorithm, DEFAULT_BITROT_ALGORITHM, DESCRIPTOR_FORMAT, DESCRIPTOR_VERSION,
    ERASURE_ALGORITHM, Error, Result, SUPPORTED_DESCRIPTOR_VERSIONS,
};
use shardline_erasure::Erasure;
use std::collections::BTreeMap;
use tracing::debug;

/// Size and modification time of an object
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatInfo {
    pub size: i64,
    #[serde(rename = "modTime")]
    pub mod_time: DateTime<Utc>,
}

/// Bitrot checksum of one part file on one disk
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumInfo {
    /// Part file name, e.g. `part.1`
    pub name: String,
    pub algorithm: BitrotAlgorithm,
    /// Whole-file digest; empty for streaming files
    #[serde(with = "hex_bytes")]
    pub hash: Vec<u8>,
}

/// Erasure layout of an object
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureInfo {
    pub algorithm: String,
    #[serde(rename = "data")]
    pub data_blocks: usize,
    #[serde(rename = "parity")]
    pub parity_blocks: usize,
    #[serde(rename = "blockSize")]
    pub block_size: usize,
    /// 1-based position of this disk's shard
    pub index: usize,
    /// `distribution[i]` is the 1-based shard index stored on disk `i`
    pub distribution: Vec<usize>,
    #[serde(rename = "checksum", default, skip_serializing_if = "Vec::is_empty")]
    pub checksums: Vec<ChecksumInfo>,
}

impl ErasureInfo {
    /// Record a part's checksum, replacing any previous one
    pub fn upsert_checksum(&mut self, checksum: ChecksumInfo) {
        match self.checksums.iter_mut().find(|c| c.name == checksum.name) {
            Some(existing) => *existing = checksum,
            None => self.checksums.push(checksum),
        }
    }

    /// Checksum for a part, defaulting to an empty streaming checksum
    #[must_use]
    pub fn checksum_info(&self, part_name: &str) -> ChecksumInfo {
        self.checksums
            .iter()
            .find(|c| c.name == part_name)
            .cloned()
            .unwrap_or_else(|| ChecksumInfo {
                name: part_name.to_string(),
                algorithm: DEFAULT_BITROT_ALGORITHM,
                hash: Vec::new(),
            })
    }

    /// Build the erasure coder for this layout
    pub fn coder(&self) -> Result<Erasure> {
        Erasure::new(self.data_blocks, self.parity_blocks, self.block_size)
    }

    #[must_use]
    pub const fn shard_size(&self) -> usize {
        if self.data_blocks == 0 {
            0
        } else {
            self.block_size.div_ceil(self.data_blocks)
        }
    }
}

/// One uploaded part of an object
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartInfo {
    pub number: u32,
    pub name: String,
    #[serde(default)]
    pub etag: String,
    pub size: i64,
    #[serde(rename = "actualSize", default)]
    pub actual_size: i64,
}

/// The per-disk `xl.json` content
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    pub version: String,
    pub format: String,
    pub stat: StatInfo,
    pub erasure: ErasureInfo,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<PartInfo>,
}

/// Object metadata returned to callers
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ObjectInfo {
    pub bucket: String,
    pub name: String,
    pub size: i64,
    pub mod_time: DateTime<Utc>,
    pub etag: String,
    pub is_dir: bool,
    pub data_blocks: usize,
    pub parity_blocks: usize,
    pub parts: Vec<PartInfo>,
    pub user_defined: BTreeMap<String, String>,
}

impl ObjectDescriptor {
    /// Fresh descriptor for `object` with a key-derived distribution
    #[must_use]
    pub fn new(object: &str, data_blocks: usize, parity_blocks: usize, block_size: usize) -> Self {
        Self {
            version: DESCRIPTOR_VERSION.to_string(),
            format: DESCRIPTOR_FORMAT.to_string(),
            stat: StatInfo::default(),
            erasure: ErasureInfo {
                algorithm: ERASURE_ALGORITHM.to_string(),
                data_blocks,
                parity_blocks,
                block_size,
                index: 0,
                distribution: hash_order(object, data_blocks + parity_blocks),
                checksums: Vec::new(),
            },
            meta: BTreeMap::new(),
            parts: Vec::new(),
        }
    }

    /// Copy the object-wide fields of `self`, dropping parts and checksums
    ///
    /// Used to rebuild the descriptor of a disk being healed.
    #[must_use]
    pub fn new_from(&self) -> Self {
        let mut desc = Self {
            stat: self.stat.clone(),
            meta: self.meta.clone(),
            ..Self::default()
        };
        desc.version = DESCRIPTOR_VERSION.to_string();
        desc.format = DESCRIPTOR_FORMAT.to_string();
        desc.erasure = ErasureInfo {
            algorithm: self.erasure.algorithm.clone(),
            data_blocks: self.erasure.data_blocks,
            parity_blocks: self.erasure.parity_blocks,
            block_size: self.erasure.block_size,
            index: 0,
            distribution: self.erasure.distribution.clone(),
            checksums: Vec::new(),
        };
        desc
    }

    /// Check the version, format and erasure layout of a descriptor
    ///
    /// An unknown version or format is `UnsupportedFormat` and needs an
    /// explicit migration. A known format with an impossible layout is
    /// `CorruptedFormat`.
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_DESCRIPTOR_VERSIONS.contains(&self.version.as_str())
            || self.format != DESCRIPTOR_FORMAT
        {
            return Err(Error::UnsupportedFormat {
                version: self.version.clone(),
                format: self.format.clone(),
            });
        }
        let erasure = &self.erasure;
        if erasure.parity_blocks == 0
            || erasure.data_blocks < erasure.parity_blocks
            || erasure.distribution.len() != erasure.data_blocks + erasure.parity_blocks
        {
            return Err(Error::CorruptedFormat);
        }
        Ok(())
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Insert or replace a part, keeping parts sorted by number
    pub fn upsert_part(&mut self, part: PartInfo) {
        match self.parts.iter_mut().find(|p| p.number == part.number) {
            Some(existing) => *existing = part,
            None => {
                self.parts.push(part);
                self.parts.sort_by_key(|p| p.number);
            }
        }
    }

    /// Position of a part number in `parts`
    #[must_use]
    pub fn part_index(&self, number: u32) -> Option<usize> {
        self.parts.iter().position(|p| p.number == number)
    }

    /// Map an object offset to `(part index, offset inside that part)`
    pub fn object_to_part_offset(&self, offset: i64) -> Result<(usize, i64)> {
        if offset == 0 {
            return Ok((0, 0));
        }
        let mut part_offset = offset;
        for (index, part) in self.parts.iter().enumerate() {
            if part_offset < part.size {
                return Ok((index, part_offset));
            }
            part_offset -= part.size;
        }
        Err(Error::InvalidRange {
            offset,
            length: 0,
            size: self.stat.size,
        })
    }

    /// ETag recorded in the user metadata
    #[must_use]
    pub fn etag(&self) -> String {
        self.meta.get("etag").cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn to_object_info(&self, bucket: &str, object: &str) -> ObjectInfo {
        let mut user_defined = self.meta.clone();
        user_defined.remove("etag");
        ObjectInfo {
            bucket: bucket.to_string(),
            name: object.to_string(),
            size: self.stat.size,
            mod_time: self.stat.mod_time,
            etag: self.etag(),
            is_dir: object.ends_with('/'),
            data_blocks: self.erasure.data_blocks,
            parity_blocks: self.erasure.parity_blocks,
            parts: self.parts.clone(),
            user_defined,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Parse a descriptor; any malformed input is `CorruptedFormat`
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| {
            debug!("unparseable object descriptor: {}", e);
            Error::CorruptedFormat
        })
    }
}

/// Size of part `part_number` when `total_size` bytes are cut into
/// `part_size` pieces
///
/// Part numbers start at 1. Parts past the end have size 0 and an
/// unknown total (`-1`) gives an unknown part size.
pub fn part_size_from_index(total_size: i64, part_size: i64, part_number: u32) -> Result<i64> {
    if total_size < -1 {
        return Err(Error::invalid_argument(format!("invalid total size {total_size}")));
    }
    if part_size <= 0 {
        return Err(Error::invalid_argument("part size must be positive"));
    }
    if part_number < 1 {
        return Err(Error::invalid_argument("part numbers start at 1"));
    }
    if total_size == -1 {
        return Ok(-1);
    }
    let full_parts = total_size / part_size;
    let number = i64::from(part_number);
    Ok(if number <= full_parts {
        part_size
    } else if number == full_parts + 1 {
        total_size % part_size
    } else {
        0
    })
}

/// Key-derived shard distribution over `cardinality` disks
///
/// Returns a rotation of `1..=cardinality` starting after the CRC32 (IEEE)
/// of the key, so objects spread their data shards across the set.
#[must_use]
pub fn hash_order(key: &str, cardinality: usize) -> Vec<usize> {
    if cardinality == 0 {
        return Vec::new();
    }
    let start = crc32fast::hash(key.as_bytes()) as usize % cardinality;
    (1..=cardinality)
        .map(|i| 1 + (start + i) % cardinality)
        .collect()
}

/// Map disks from disk order onto shard order
#[must_use]
pub fn shuffle_disks(disks: &[DiskSlot], distribution: &[usize]) -> Vec<DiskSlot> {
    shuffle_by_distribution(disks, distribution)
}

/// Map per-disk descriptors from disk order onto shard order
#[must_use]
pub fn shuffle_descriptors(
    descriptors: &[Option<ObjectDescriptor>],
    distribution: &[usize],
) -> Vec<Option<ObjectDescriptor>> {
    shuffle_by_distribution(descriptors, distribution)
}

/// Reorder `items` so position `distribution[i] - 1` holds `items[i]`
///
/// An empty distribution leaves the order unchanged. Entries outside
/// `1..=items.len()` are skipped and their slot keeps the default value.
#[must_use]
pub fn shuffle_by_distribution<T: Clone + Default>(items: &[T], distribution: &[usize]) -> Vec<T> {
    if distribution.is_empty() {
        return items.to_vec();
    }
    let mut shuffled = vec![T::default(); items.len()];
    for (item, &block) in items.iter().zip(distribution) {
        if block == 0 || block > items.len() {
            continue;
        }
        shuffled[block - 1] = item.clone();
    }
    shuffled
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(number: u32, etag: &str, size: i64) -> PartInfo {
        PartInfo {
            number,
            name: format!("part.{number}"),
            etag: etag.to_string(),
            size,
            actual_size: size,
        }
    }

    #[test]
    fn test_hash_order() {
        let cases: &[(&str, &[usize])] = &[
            ("object", &[14, 15, 16, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13]),
            (
                "The Shining Script <v1>.pdf",
                &[16, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15],
            ),
            (
                "Cost Benefit Analysis (2009-2010).pptx",
                &[15, 16, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14],
            ),
            (
                "117Gn8rfHL2ACARPAhaFd0AGzic9pUbIA/5OCn5A",
                &[3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 1, 2],
            ),
            ("SHØRT", &[11, 12, 13, 14, 15, 16, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10]),
            ("a/b/c/", &[3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 1, 2]),
            ("/a/b/c", &[6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 1, 2, 3, 4, 5]),
        ];
        for (key, want) in cases {
            assert_eq!(hash_order(key, 16), *want, "{key}");
        }
        assert!(hash_order("object", 0).is_empty());
    }

    #[test]
    fn test_shuffle_by_distribution() {
        let disks: Vec<usize> = (0..16).collect();
        let dist = [16, 14, 12, 10, 8, 6, 4, 2, 1, 3, 5, 7, 9, 11, 13, 15];
        let shuffled = shuffle_by_distribution(&disks, &dist);
        assert_eq!(shuffled[0], 8);
        assert_eq!(shuffled[1], 7);
        assert_eq!(shuffled[2], 9);
        assert_eq!(shuffled[15], 0);

        assert_eq!(shuffle_by_distribution(&disks, &[]), disks);

        let slots = vec![Some(1), Some(2), Some(3)];
        assert_eq!(
            shuffle_by_distribution(&slots, &[2, 0, 1]),
            vec![Some(3), Some(1), None]
        );
    }

    #[test]
    fn test_is_valid() {
        let desc = ObjectDescriptor::new("obj", 4, 4, 1024);
        assert!(desc.is_valid());

        let mut old = desc.clone();
        old.version = "1.0.0".into();
        assert!(old.is_valid());

        let mut bad = desc.clone();
        bad.version = "2.0.0".into();
        assert!(!bad.is_valid());

        let mut bad = desc.clone();
        bad.erasure.parity_blocks = 5;
        assert!(!bad.is_valid());

        let mut bad = desc.clone();
        bad.erasure.distribution.pop();
        assert!(!bad.is_valid());

        let mut bad = desc;
        bad.format = "fs".into();
        assert!(!bad.is_valid());
    }

    #[test]
    fn test_validate_error_kinds() {
        let desc = ObjectDescriptor::new("obj", 2, 2, 1024);
        assert!(desc.validate().is_ok());

        let mut newer = desc.clone();
        newer.version = "3.0.0".into();
        match newer.validate() {
            Err(Error::UnsupportedFormat { version, format }) => {
                assert_eq!(version, "3.0.0");
                assert_eq!(format, "xl");
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut broken = desc;
        broken.erasure.distribution.clear();
        assert!(matches!(broken.validate(), Err(Error::CorruptedFormat)));
    }

    #[test]
    fn test_object_to_part_offset() {
        let mut desc = ObjectDescriptor::new("obj", 2, 2, 1024);
        desc.upsert_part(part(1, "", 100));
        desc.upsert_part(part(2, "", 50));
        desc.stat.size = 150;

        assert_eq!(desc.object_to_part_offset(0).unwrap(), (0, 0));
        assert_eq!(desc.object_to_part_offset(99).unwrap(), (0, 99));
        assert_eq!(desc.object_to_part_offset(100).unwrap(), (1, 0));
        assert_eq!(desc.object_to_part_offset(149).unwrap(), (1, 49));
        assert!(matches!(
            desc.object_to_part_offset(150),
            Err(Error::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_part_size_from_index() {
        const MIB: i64 = 1024 * 1024;
        let cases = [
            (0, 10, 1, 0),
            (4 * MIB, 2 * MIB, 1, 2 * MIB),
            (4 * MIB, 2 * MIB, 2, 2 * MIB),
            (4 * MIB, 2 * MIB, 3, 0),
            (5 * MIB, 2 * MIB, 1, 2 * MIB),
            (5 * MIB, 2 * MIB, 2, 2 * MIB),
            (5 * MIB, 2 * MIB, 3, MIB),
            (5 * MIB, 2 * MIB, 4, 0),
            (-1, 10, 1, -1),
        ];
        for (total, part_size, number, want) in cases {
            assert_eq!(
                part_size_from_index(total, part_size, number).unwrap(),
                want,
                "total {total}, part size {part_size}, part {number}"
            );
        }

        for (total, part_size, number) in [(10, 0, 1), (10, 1, 0), (-2, 10, 1)] {
            assert!(matches!(
                part_size_from_index(total, part_size, number),
                Err(Error::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_upsert_part_sorted() {
        let mut desc = ObjectDescriptor::new("obj", 2, 2, 1024);
        desc.upsert_part(part(3, "c", 10));
        desc.upsert_part(part(1, "a", 10));
        desc.upsert_part(part(3, "c2", 20));
        let numbers: Vec<u32> = desc.parts.iter().map(|p| p.number).collect();
        assert_eq!(numbers, vec![1, 3]);
        assert_eq!(desc.parts[1].etag, "c2");
        assert_eq!(desc.part_index(3), Some(1));
        assert_eq!(desc.part_index(2), None);
    }

    #[test]
    fn test_checksums() {
        let mut erasure = ObjectDescriptor::new("obj", 2, 2, 1024).erasure;
        erasure.upsert_checksum(ChecksumInfo {
            name: "part.1".into(),
            algorithm: BitrotAlgorithm::Sha256,
            hash: vec![1, 2, 3],
        });
        erasure.upsert_checksum(ChecksumInfo {
            name: "part.1".into(),
            algorithm: BitrotAlgorithm::Sha256,
            hash: vec![4, 5, 6],
        });
        assert_eq!(erasure.checksums.len(), 1);
        assert_eq!(erasure.checksum_info("part.1").hash, vec![4, 5, 6]);

        let missing = erasure.checksum_info("part.9");
        assert_eq!(missing.algorithm, DEFAULT_BITROT_ALGORITHM);
        assert!(missing.hash.is_empty());
    }

    #[test]
    fn test_json_layout() {
        let mut desc = ObjectDescriptor::new("obj", 2, 2, 1024);
        desc.erasure.index = 3;
        desc.erasure.upsert_checksum(ChecksumInfo {
            name: "part.1".into(),
            algorithm: BitrotAlgorithm::Sha256,
            hash: vec![0xab, 0xcd],
        });
        desc.upsert_part(part(1, "", 10));
        desc.meta.insert("etag".into(), "abc".into());

        let json: serde_json::Value = serde_json::from_slice(&desc.to_json().unwrap()).unwrap();
        assert_eq!(json["version"], "1.0.1");
        assert_eq!(json["format"], "xl");
        assert_eq!(json["erasure"]["data"], 2);
        assert_eq!(json["erasure"]["blockSize"], 1024);
        assert_eq!(json["erasure"]["checksum"][0]["algorithm"], "sha256");
        assert_eq!(json["erasure"]["checksum"][0]["hash"], "abcd");
        assert_eq!(json["parts"][0]["actualSize"], 10);
        assert!(json["stat"].get("modTime").is_some());

        let parsed = ObjectDescriptor::from_json(&desc.to_json().unwrap()).unwrap();
        assert_eq!(parsed, desc);
    }

    #[test]
    fn test_from_json_corrupted() {
        for input in [&b"not json"[..], b"{}", b"{\"version\": 1}"] {
            assert!(matches!(
                ObjectDescriptor::from_json(input),
                Err(Error::CorruptedFormat)
            ));
        }
    }

    #[test]
    fn test_new_from_drops_parts() {
        let mut desc = ObjectDescriptor::new("obj", 2, 2, 1024);
        desc.erasure.index = 2;
        desc.stat.size = 10;
        desc.upsert_part(part(1, "", 10));
        desc.meta.insert("etag".into(), "abc".into());

        let fresh = desc.new_from();
        assert!(fresh.parts.is_empty());
        assert!(fresh.erasure.checksums.is_empty());
        assert_eq!(fresh.erasure.index, 0);
        assert_eq!(fresh.erasure.distribution, desc.erasure.distribution);
        assert_eq!(fresh.stat, desc.stat);
        assert_eq!(fresh.etag(), "abc");
    }

    #[test]
    fn test_to_object_info() {
        let mut desc = ObjectDescriptor::new("obj", 2, 2, 1024);
        desc.stat.size = 42;
        desc.meta.insert("etag".into(), "abc".into());
        desc.meta.insert("content-type".into(), "text/plain".into());
        let info = desc.to_object_info("bucket", "dir/obj");
        assert_eq!(info.size, 42);
        assert_eq!(info.etag, "abc");
        assert!(!info.is_dir);
        assert_eq!(info.user_defined.len(), 1);
    }
}
