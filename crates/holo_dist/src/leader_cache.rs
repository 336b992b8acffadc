//! Last known leaseholder per range.

use std::sync::{Mutex, PoisonError};

use holo_batch::{RangeId, ReplicaDescriptor};

use crate::lru::LruMap;

/// Bounded cache of range id to the replica last reported as leader.
///
/// Entries are only written when a replica reports it is not the leader;
/// nothing refreshes them proactively.
pub struct LeaderCache {
    inner: Mutex<LruMap<RangeId, ReplicaDescriptor>>,
}

impl LeaderCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruMap::new(capacity)),
        }
    }

    /// Cached leader for `range_id`, if known.
    pub fn lookup(&self, range_id: RangeId) -> Option<ReplicaDescriptor> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.get(&range_id).copied()
    }

    /// Record `leader` for `range_id`; `None` (or a replica without a
    /// store) forgets any cached leader.
    pub fn update(&self, range_id: RangeId, leader: Option<ReplicaDescriptor>) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match leader.filter(|r| r.store_id != 0) {
            Some(replica) => {
                inner.put(range_id, replica);
            }
            None => {
                inner.remove(&range_id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(store_id: u64) -> ReplicaDescriptor {
        ReplicaDescriptor {
            node_id: store_id,
            store_id,
            replica_id: store_id,
        }
    }

    #[test]
    fn update_and_lookup() {
        let cache = LeaderCache::new(8);
        assert_eq!(cache.lookup(1), None);
        cache.update(1, Some(replica(2)));
        assert_eq!(cache.lookup(1), Some(replica(2)));
        cache.update(1, Some(replica(3)));
        assert_eq!(cache.lookup(1), Some(replica(3)));
    }

    #[test]
    fn clearing_forgets_leader() {
        let cache = LeaderCache::new(8);
        cache.update(1, Some(replica(2)));
        cache.update(1, None);
        assert_eq!(cache.lookup(1), None);

        cache.update(2, Some(replica(2)));
        cache.update(2, Some(ReplicaDescriptor::default()));
        assert_eq!(cache.lookup(2), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn bounded_by_capacity() {
        let cache = LeaderCache::new(2);
        cache.update(1, Some(replica(1)));
        cache.update(2, Some(replica(2)));
        cache.lookup(1);
        cache.update(3, Some(replica(3)));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.lookup(2), None);
        assert_eq!(cache.lookup(1), Some(replica(1)));
    }
}
