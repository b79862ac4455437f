//! Tablet partitioning used to split segments during recovery.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::identity::SegmentId;

/// One tablet: a key-hash range of a table, assigned to a recovery
/// partition, with the log position at which the tablet was created.
///
/// Entries written before the creation position belong to a previous
/// incarnation of the tablet and must not survive recovery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tablet {
    pub table_id: u64,
    pub start_key_hash: u64,
    pub end_key_hash: u64,
    pub partition_id: u64,
    pub ctime_head_segment_id: u64,
    pub ctime_head_offset: u32,
}

impl Tablet {
    pub fn contains(&self, table_id: u64, key_hash: u64) -> bool {
        self.table_id == table_id
            && self.start_key_hash <= key_hash
            && key_hash <= self.end_key_hash
    }

    /// Earliest log position at which entries for this tablet count as live.
    pub fn ctime(&self) -> LogPosition {
        LogPosition::new(SegmentId::new(self.ctime_head_segment_id), self.ctime_head_offset)
    }
}

/// A coordinator-supplied set of tablets describing how a crashed master's
/// log is partitioned for recovery. May be empty.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partitions {
    tablets: Vec<Tablet>,
}

impl Partitions {
    pub fn new(tablets: Vec<Tablet>) -> Self {
        Self { tablets }
    }

    pub fn push(&mut self, tablet: Tablet) {
        self.tablets.push(tablet);
    }

    pub fn tablets(&self) -> &[Tablet] {
        &self.tablets
    }

    pub fn is_empty(&self) -> bool {
        self.tablets.is_empty()
    }

    /// Number of recovery partitions: one output sub-segment is built per
    /// partition id in `0..partition_count()`.
    pub fn partition_count(&self) -> usize {
        self.tablets
            .iter()
            .map(|t| t.partition_id as usize + 1)
            .max()
            .unwrap_or(0)
    }

    /// The single tablet covering `(table_id, key_hash)`, if any.
    pub fn which_partition(&self, table_id: u64, key_hash: u64) -> Option<&Tablet> {
        self.tablets.iter().find(|t| t.contains(table_id, key_hash))
    }
}

/// A position in a master's log: segment id plus byte offset within it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogPosition {
    segment_id: SegmentId,
    offset: u32,
}

impl LogPosition {
    pub fn new(segment_id: SegmentId, offset: u32) -> Self {
        Self { segment_id, offset }
    }

    pub fn segment_id(self) -> SegmentId {
        self.segment_id
    }

    pub fn offset(self) -> u32 {
        self.offset
    }
}

impl fmt::Debug for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogPosition({},{})", self.segment_id, self.offset)
    }
}

/// Hash placing an object key on the tablet key-hash ring.
///
/// First eight little-endian bytes of SHA-256 over the table id and key.
/// Every participant (masters, backups, the coordinator building tablet
/// maps) must agree on this function.
pub fn key_hash(table_id: u64, key: &[u8]) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(table_id.to_le_bytes());
    hasher.update(key);
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[..8].try_into().unwrap_or([0u8; 8]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tablet(partition_id: u64, table_id: u64, start: u64, end: u64) -> Tablet {
        Tablet {
            table_id,
            start_key_hash: start,
            end_key_hash: end,
            partition_id,
            ctime_head_segment_id: 0,
            ctime_head_offset: 0,
        }
    }

    #[test]
    fn key_hash_is_stable_and_table_scoped() {
        assert_eq!(key_hash(123, b"9"), key_hash(123, b"9"));
        assert_ne!(key_hash(123, b"9"), key_hash(124, b"9"));
        assert_ne!(key_hash(123, b"9"), key_hash(123, b"10"));
    }

    #[test]
    fn which_partition_honors_table_and_range() {
        let h = key_hash(123, b"9");
        let partitions = Partitions::new(vec![
            tablet(0, 123, h, h),
            tablet(1, 125, 0, u64::MAX),
        ]);
        assert_eq!(
            partitions.which_partition(123, h).map(|t| t.partition_id),
            Some(0)
        );
        // Same hash, wrong table: only the full-range table 125 tablet matches.
        assert_eq!(
            partitions.which_partition(125, h).map(|t| t.partition_id),
            Some(1)
        );
        assert!(partitions.which_partition(124, h).is_none());
    }

    #[test]
    fn partition_count_spans_to_largest_id() {
        let partitions = Partitions::new(vec![tablet(2, 9, 0, 10)]);
        assert_eq!(partitions.partition_count(), 3);
        assert_eq!(Partitions::default().partition_count(), 0);
    }

    #[test]
    fn log_positions_order_lexicographically() {
        let early = LogPosition::new(SegmentId::new(3), 500);
        let late = LogPosition::new(SegmentId::new(4), 0);
        assert!(early < late);
        assert!(LogPosition::new(SegmentId::new(3), 499) < early);
    }
}
