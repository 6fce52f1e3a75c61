//! Log entries and the ephemeral sentinel at index 0.

use std::sync::OnceLock;

/// A single entry in the audit trail.
///
/// Index 0 is never persisted - it is the reserved sentinel returned by
/// [`sentinel`] and by [`crate::log::PersistentLog::first`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub index: u64,
    pub term: i64,
    pub timestamp: i64,
    pub is_snapshot: bool,
    pub payload: Vec<u8>,
}

impl Entry {
    pub fn new(index: u64, term: i64, timestamp: i64, payload: Vec<u8>) -> Self {
        Self {
            index,
            term,
            timestamp,
            is_snapshot: false,
            payload,
        }
    }

    pub fn snapshot(index: u64, term: i64, timestamp: i64, payload: Vec<u8>) -> Self {
        Self {
            index,
            term,
            timestamp,
            is_snapshot: true,
            payload,
        }
    }
}

/// Returns the shared, immutable sentinel entry at index 0: term 0, empty
/// payload, timestamp at the epoch. It is never written to disk - readers
/// receive a clone of this value, not a reference into any partition.
pub fn sentinel() -> &'static Entry {
    static SENTINEL: OnceLock<Entry> = OnceLock::new();
    SENTINEL.get_or_init(|| Entry {
        index: 0,
        term: 0,
        timestamp: 0,
        is_snapshot: false,
        payload: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_is_well_formed() {
        let s = sentinel();
        assert_eq!(s.index, 0);
        assert_eq!(s.term, 0);
        assert!(s.payload.is_empty());
        assert!(!s.is_snapshot);
    }
}
