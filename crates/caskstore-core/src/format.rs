//! Binary format definitions for CaskStore segment and hint files
//!
//! Segment record: RecordHeader (28 bytes) + key_bytes + value_bytes
//! Hint entry:     HintHeader (16 bytes) + key_bytes
//!
//! All integers are little-endian, fields are packed with no padding.

use std::path::{Path, PathBuf};

use xxhash_rust::xxh3::Xxh3;

/// Size of the per-record digest in bytes
pub const CHECKSUM_SIZE: usize = 16;

/// Record header size in bytes
pub const RECORD_HEADER_SIZE: usize = CHECKSUM_SIZE + 4 + 4 + 4;

/// Hint header size in bytes
pub const HINT_HEADER_SIZE: usize = 4 + 4 + 4 + 4;

/// Digest stored on tombstones
pub const TOMBSTONE_CHECKSUM: [u8; CHECKSUM_SIZE] = [0; CHECKSUM_SIZE];

const STORE_PREFIX: &str = "store_";
const MERGE_PREFIX: &str = "merge_";
const OLD_PREFIX: &str = "old_";
const DATA_EXTENSION: &str = "data";
const HINT_EXTENSION: &str = "hint";

/// Name of the merge recovery manifest
pub const MANIFEST_FILENAME: &str = "merge.manifest";

/// Segment record header
///
/// Layout:
///   [0..16]  checksum:  [u8;16] - XXH3-128 of (key_bytes + value_bytes), zero for tombstones
///   [16..20] serial:    u32 LE
///   [20..24] key_len:   u32 LE
///   [24..28] value_len: u32 LE  - 0 marks a tombstone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub checksum: [u8; CHECKSUM_SIZE],
    pub serial: u32,
    pub key_len: u32,
    pub value_len: u32,
}

impl RecordHeader {
    pub fn to_bytes(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        buf[0..16].copy_from_slice(&self.checksum);
        buf[16..20].copy_from_slice(&self.serial.to_le_bytes());
        buf[20..24].copy_from_slice(&self.key_len.to_le_bytes());
        buf[24..28].copy_from_slice(&self.value_len.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; RECORD_HEADER_SIZE]) -> Self {
        let mut checksum = [0u8; CHECKSUM_SIZE];
        checksum.copy_from_slice(&buf[0..16]);
        Self {
            checksum,
            serial: read_u32(buf, 16),
            key_len: read_u32(buf, 20),
            value_len: read_u32(buf, 24),
        }
    }

    /// Bytes covered by this record, header included
    pub fn record_len(&self) -> u64 {
        RECORD_HEADER_SIZE as u64 + self.key_len as u64 + self.value_len as u64
    }

    pub fn is_tombstone(&self) -> bool {
        self.value_len == 0
    }
}

/// Hint entry header
///
/// Layout:
///   [0..4]   serial:       u32 LE
///   [4..8]   key_len:      u32 LE
///   [8..12]  value_len:    u32 LE
///   [12..16] value_offset: u32 LE - absolute offset of value_bytes in the data file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HintHeader {
    pub serial: u32,
    pub key_len: u32,
    pub value_len: u32,
    pub value_offset: u32,
}

impl HintHeader {
    pub fn to_bytes(&self) -> [u8; HINT_HEADER_SIZE] {
        let mut buf = [0u8; HINT_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.serial.to_le_bytes());
        buf[4..8].copy_from_slice(&self.key_len.to_le_bytes());
        buf[8..12].copy_from_slice(&self.value_len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.value_offset.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; HINT_HEADER_SIZE]) -> Self {
        Self {
            serial: read_u32(buf, 0),
            key_len: read_u32(buf, 4),
            value_len: read_u32(buf, 8),
            value_offset: read_u32(buf, 12),
        }
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Location of the most recent record for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyInfo {
    pub segment_id: u16,
    pub serial: u32,
    pub value_size: u32,
    pub value_offset: u32,
}

impl KeyInfo {
    /// Build from a hint entry belonging to `segment_id`
    pub fn from_hint(segment_id: u16, hint: &HintHeader) -> Self {
        Self {
            segment_id,
            serial: hint.serial,
            value_size: hint.value_len,
            value_offset: hint.value_offset,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value_size == 0
    }

    /// True when this entry names exactly that record
    pub fn points_to(&self, segment_id: u16, serial: u32) -> bool {
        self.segment_id == segment_id && self.serial == serial
    }
}

/// Digest over `key || value`. Tombstones carry zeroes instead.
pub fn record_checksum(key: &[u8], value: &[u8]) -> [u8; CHECKSUM_SIZE] {
    if value.is_empty() {
        return TOMBSTONE_CHECKSUM;
    }
    let mut hasher = Xxh3::new();
    hasher.update(key);
    hasher.update(value);
    hasher.digest128().to_le_bytes()
}

/// File naming scheme a segment is currently under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSet {
    /// `store_<id>.*`: live segments
    Store,
    /// `merge_<id>.*`: compaction output not yet swapped in
    Merge,
    /// `old_<id>.*`: retired segments awaiting deletion
    Old,
}

impl FileSet {
    fn prefix(self) -> &'static str {
        match self {
            FileSet::Store => STORE_PREFIX,
            FileSet::Merge => MERGE_PREFIX,
            FileSet::Old => OLD_PREFIX,
        }
    }

    pub fn data_path(self, dir: &Path, id: u16) -> PathBuf {
        dir.join(format!("{}{}.{}", self.prefix(), id, DATA_EXTENSION))
    }

    pub fn hint_path(self, dir: &Path, id: u16) -> PathBuf {
        dir.join(format!("{}{}.{}", self.prefix(), id, HINT_EXTENSION))
    }

    /// Parse a data file name of this set: "store_42.data" -> Some(42)
    pub fn parse_data_name(self, name: &str) -> Option<u16> {
        let stem = name.strip_suffix(DATA_EXTENSION)?.strip_suffix('.')?;
        stem.strip_prefix(self.prefix())?.parse().ok()
    }

    /// Parse a data or hint file name of this set
    pub fn parse_any_name(self, name: &str) -> Option<u16> {
        self.parse_data_name(name).or_else(|| {
            let stem = name.strip_suffix(HINT_EXTENSION)?.strip_suffix('.')?;
            stem.strip_prefix(self.prefix())?.parse().ok()
        })
    }
}
