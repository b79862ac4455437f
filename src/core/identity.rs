//! Identity atoms: servers, segments, replica keys.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a server in the cluster.
///
/// The index names a slot in the coordinator's server list; the generation
/// distinguishes successive occupants of the same slot. A restarted or
/// replacement server gets a new generation, so equality on both parts is
/// what "same server" means everywhere in this crate.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerId {
    index: u32,
    generation: u32,
}

impl ServerId {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }

    /// Packed form used in storage metadata: generation in the upper half.
    pub fn as_u64(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub fn from_u64(raw: u64) -> Self {
        Self {
            index: (raw & 0xffff_ffff) as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

impl fmt::Debug for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerId({}.{})", self.index, self.generation)
    }
}

/// Identifier of a segment within one master's log. Unique per master only.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(u64);

impl SegmentId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentId({})", self.0)
    }
}

/// Key of a replica in the index: which master's log, which segment.
///
/// `Ord` iterates a master's replicas in ascending segment order, which is
/// the order recovery listings are reported in.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ReplicaKey {
    pub master: ServerId,
    pub segment_id: SegmentId,
}

impl ReplicaKey {
    pub fn new(master: ServerId, segment_id: SegmentId) -> Self {
        Self { master, segment_id }
    }
}

impl fmt::Display for ReplicaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{},{}>", self.master, self.segment_id)
    }
}

/// Replication group advertised to masters on open responses.
///
/// `assign_group` replaces the whole group; there is no incremental update.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicationGroup {
    pub id: u64,
    pub members: Vec<ServerId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_id_packs_generation_high() {
        let id = ServerId::new(7, 3);
        assert_eq!(id.as_u64(), (3u64 << 32) | 7);
        assert_eq!(ServerId::from_u64(id.as_u64()), id);
    }

    #[test]
    fn server_id_generations_are_distinct_servers() {
        assert_ne!(ServerId::new(99, 0), ServerId::new(99, 1));
        assert_eq!(format!("{}", ServerId::new(99, 1)), "99.1");
    }

    #[test]
    fn replica_keys_order_by_master_then_segment() {
        let a = ReplicaKey::new(ServerId::new(1, 0), SegmentId::new(9));
        let b = ReplicaKey::new(ServerId::new(1, 0), SegmentId::new(10));
        let c = ReplicaKey::new(ServerId::new(2, 0), SegmentId::new(1));
        assert!(a < b);
        assert!(b < c);
    }
}
