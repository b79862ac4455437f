//! The replica index: (master, segment) → replica.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::{ReplicaKey, SegmentId, ServerId};
use crate::replica::Replica;

type Map = BTreeMap<ReplicaKey, Arc<Replica>>;

/// Owning map of every live replica. The map lock covers structural changes
/// only; replica mutation goes through each replica's own mutex, acquired
/// after this lock is released.
///
/// Handles are cheap clones sharing one map (the GC tasks hold one).
#[derive(Clone, Default)]
pub struct ReplicaIndex {
    inner: Arc<Mutex<Map>>,
}

impl ReplicaIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, returning any replica previously under the same key.
    pub fn insert(&self, replica: Arc<Replica>) -> Option<Arc<Replica>> {
        let key = ReplicaKey::new(replica.master, replica.segment_id);
        self.lock().insert(key, replica)
    }

    pub fn get(&self, master: ServerId, segment_id: SegmentId) -> Option<Arc<Replica>> {
        self.lock()
            .get(&ReplicaKey::new(master, segment_id))
            .cloned()
    }

    pub fn remove(&self, master: ServerId, segment_id: SegmentId) -> Option<Arc<Replica>> {
        self.lock().remove(&ReplicaKey::new(master, segment_id))
    }

    /// Snapshot of a master's replicas in ascending segment order.
    pub fn replicas_of(&self, master: ServerId) -> Vec<Arc<Replica>> {
        let lo = ReplicaKey::new(master, SegmentId::new(0));
        let hi = ReplicaKey::new(master, SegmentId::new(u64::MAX));
        self.lock().range(lo..=hi).map(|(_, r)| r.clone()).collect()
    }

    /// Remove one replica of `master`, lowest segment id first. The GC
    /// down-server task uses this to free one replica per tick.
    pub fn remove_first_of(&self, master: ServerId) -> Option<Arc<Replica>> {
        let mut map = self.lock();
        let lo = ReplicaKey::new(master, SegmentId::new(0));
        let hi = ReplicaKey::new(master, SegmentId::new(u64::MAX));
        let key = *map.range(lo..=hi).next()?.0;
        map.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Map> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(master: ServerId, segment_id: u64) -> Arc<Replica> {
        Arc::new(Replica::new(master, SegmentId::new(segment_id), 64, true))
    }

    #[test]
    fn lookup_and_remove_are_keyed_by_master_and_segment() {
        let index = ReplicaIndex::new();
        let master = ServerId::new(99, 0);
        index.insert(replica(master, 88));
        assert!(index.get(master, SegmentId::new(88)).is_some());
        assert!(index.get(master, SegmentId::new(89)).is_none());
        assert!(index.get(ServerId::new(99, 1), SegmentId::new(88)).is_none());
        assert!(index.remove(master, SegmentId::new(88)).is_some());
        assert!(index.remove(master, SegmentId::new(88)).is_none());
    }

    #[test]
    fn replicas_of_filters_and_sorts() {
        let index = ReplicaIndex::new();
        let a = ServerId::new(99, 0);
        let b = ServerId::new(99, 1);
        index.insert(replica(a, 89));
        index.insert(replica(a, 88));
        index.insert(replica(b, 88));
        let ids: Vec<u64> = index
            .replicas_of(a)
            .iter()
            .map(|r| r.segment_id.get())
            .collect();
        assert_eq!(ids, vec![88, 89]);
    }

    #[test]
    fn remove_first_of_steps_through_one_master() {
        let index = ReplicaIndex::new();
        let a = ServerId::new(99, 0);
        index.insert(replica(a, 89));
        index.insert(replica(a, 88));
        index.insert(replica(ServerId::new(99, 1), 88));
        assert_eq!(index.remove_first_of(a).unwrap().segment_id.get(), 88);
        assert_eq!(index.remove_first_of(a).unwrap().segment_id.get(), 89);
        assert!(index.remove_first_of(a).is_none());
        assert_eq!(index.len(), 1);
    }
}
