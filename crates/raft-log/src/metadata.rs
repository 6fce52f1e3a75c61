//! Fixed-size binary records describing where an entry lives on disk.
//!
//! Hand-rolled little-endian encode/decode. These records must be
//! bit-exact, so they are hand-packed rather than routed through a
//! general-purpose serialization codec.

/// On-disk size of [`LogEntryMetadata`] in bytes.
pub const LOG_ENTRY_METADATA_LEN: usize = 32;

/// On-disk size of [`SnapshotMetadata`] in bytes.
pub const SNAPSHOT_METADATA_LEN: usize = 40;

/// One slot of a partition's allocation table: where an entry's payload
/// lives, how long it is, and the term/timestamp it was written with.
///
/// `offset == 0` means the slot is unused.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LogEntryMetadata {
    pub offset: u64,
    pub length: u64,
    pub term: i64,
    pub timestamp: i64,
}

impl LogEntryMetadata {
    pub fn to_bytes(self) -> [u8; LOG_ENTRY_METADATA_LEN] {
        let mut buf = [0u8; LOG_ENTRY_METADATA_LEN];
        buf[0..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..16].copy_from_slice(&self.length.to_le_bytes());
        buf[16..24].copy_from_slice(&self.term.to_le_bytes());
        buf[24..32].copy_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; LOG_ENTRY_METADATA_LEN]) -> Self {
        Self {
            offset: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            length: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            term: i64::from_le_bytes(buf[16..24].try_into().unwrap()),
            timestamp: i64::from_le_bytes(buf[24..32].try_into().unwrap()),
        }
    }

    pub fn is_unused(&self) -> bool {
        self.offset == 0
    }
}

/// Header of the snapshot file: where the compacted payload lives, how
/// long it is, the term/timestamp it was produced with, and the last index
/// it replaces (inclusive).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotMetadata {
    pub offset: u64,
    pub length: u64,
    pub term: i64,
    pub timestamp: i64,
    pub index: u64,
}

impl SnapshotMetadata {
    pub fn to_bytes(self) -> [u8; SNAPSHOT_METADATA_LEN] {
        let mut buf = [0u8; SNAPSHOT_METADATA_LEN];
        buf[0..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..16].copy_from_slice(&self.length.to_le_bytes());
        buf[16..24].copy_from_slice(&self.term.to_le_bytes());
        buf[24..32].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[32..40].copy_from_slice(&self.index.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; SNAPSHOT_METADATA_LEN]) -> Self {
        Self {
            offset: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            length: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            term: i64::from_le_bytes(buf[16..24].try_into().unwrap()),
            timestamp: i64::from_le_bytes(buf[24..32].try_into().unwrap()),
            index: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
        }
    }
}
