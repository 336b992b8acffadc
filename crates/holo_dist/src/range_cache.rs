//! Client-side cache of range descriptors.
//!
//! Descriptors are indexed by their end key so that the range containing a
//! key is the first entry ending after it. Misses are filled from a
//! `RangeDescriptorDb`, walking the two-level meta hierarchy: the descriptor
//! of the meta range holding a key's meta record is itself looked up through
//! this cache.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use holo_batch::{KvError, RKey, RangeDescriptor};

use crate::keys;
use crate::lru::LruMap;
use crate::stats::SenderStats;

/// Authoritative source of range descriptors.
#[async_trait]
pub trait RangeDescriptorDb: Send + Sync + 'static {
    /// Read the descriptors addressed by the meta record at or after
    /// `meta_key` (at or before, for `reverse`) from the meta range `desc`.
    /// The first descriptor returned is the one addressing the lookup key;
    /// any others are prefetched neighbours in the lookup direction.
    async fn range_lookup(
        &self,
        meta_key: &RKey,
        desc: &RangeDescriptor,
        consider_intents: bool,
        reverse: bool,
    ) -> Result<Vec<RangeDescriptor>, KvError>;

    /// Descriptor of the first range, which holds the meta1 records.
    async fn first_range(&self) -> Result<RangeDescriptor, KvError>;
}

struct CacheInner {
    by_end: BTreeMap<RKey, Arc<RangeDescriptor>>,
    lru: LruMap<RKey, ()>,
}

impl CacheInner {
    fn find(&self, key: &RKey, reverse: bool) -> Option<(RKey, Arc<RangeDescriptor>)> {
        let lower = if reverse {
            Bound::Included(key)
        } else {
            Bound::Excluded(key)
        };
        let (end, desc) = self
            .by_end
            .range::<RKey, _>((lower, Bound::Unbounded))
            .next()?;
        let contains = if reverse {
            desc.contains_exclusive_end_key(key)
        } else {
            desc.contains_key(key)
        };
        contains.then(|| (end.clone(), Arc::clone(desc)))
    }

    fn remove(&mut self, end: &RKey) {
        self.by_end.remove(end);
        self.lru.remove(end);
    }
}

/// LRU-bounded cache mapping keys to the descriptor of their range.
pub struct RangeDescriptorCache {
    db: Arc<dyn RangeDescriptorDb>,
    inner: Mutex<CacheInner>,
    stats: Arc<SenderStats>,
}

impl RangeDescriptorCache {
    pub fn new(db: Arc<dyn RangeDescriptorDb>, capacity: usize, stats: Arc<SenderStats>) -> Self {
        Self {
            db,
            inner: Mutex::new(CacheInner {
                by_end: BTreeMap::new(),
                lru: LruMap::new(capacity),
            }),
            stats,
        }
    }

    /// Descriptor of the range containing `key` (whose exclusive end is
    /// `key`, for `reverse`).
    ///
    /// Inputs:
    /// - `consider_intents`: skip the cache and read uncommitted meta records.
    /// - `reverse`: treat `key` as an exclusive end key.
    ///
    /// Output:
    /// - The cached descriptor, or one fetched from the descriptor db and
    ///   cached together with any prefetched neighbours.
    /// - `RangeKeyMismatch` when the fetched descriptor does not contain `key`.
    pub fn lookup_range_descriptor<'a>(
        &'a self,
        key: &'a RKey,
        consider_intents: bool,
        reverse: bool,
    ) -> BoxFuture<'a, Result<Arc<RangeDescriptor>, KvError>> {
        Box::pin(async move {
            if !consider_intents {
                if let Some(desc) = self.get_cached(key, reverse) {
                    return Ok(desc);
                }
            }

            let meta_key = keys::range_meta_key(key);
            self.stats.record_range_lookup();
            tracing::trace!(%key, %meta_key, consider_intents, reverse, "range descriptor cache miss");
            let descs = if meta_key.is_empty() {
                vec![self.db.first_range().await?]
            } else {
                let meta_desc = self.lookup_range_descriptor(&meta_key, false, reverse).await?;
                match self
                    .db
                    .range_lookup(&meta_key, &meta_desc, consider_intents, reverse)
                    .await
                {
                    Ok(descs) => descs,
                    Err(err) => {
                        if matches!(
                            err,
                            KvError::Send { .. }
                                | KvError::RangeNotFound { .. }
                                | KvError::RangeKeyMismatch { .. }
                        ) {
                            self.evict(&meta_key, Some(&meta_desc), reverse);
                        }
                        return Err(err);
                    }
                }
            };

            let first = match descs.first() {
                Some(first) => first,
                None => {
                    return Err(KvError::RangeKeyMismatch {
                        request_start: key.as_raw_key(),
                        request_end: holo_batch::Key::empty(),
                        range: None,
                    })
                }
            };
            let contains = if reverse {
                first.contains_exclusive_end_key(key)
            } else {
                first.contains_key(key)
            };
            if !contains {
                return Err(KvError::RangeKeyMismatch {
                    request_start: key.as_raw_key(),
                    request_end: holo_batch::Key::empty(),
                    range: Some(first.clone()),
                });
            }

            let mut descs = descs.into_iter().map(Arc::new);
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let mut result = None;
            if let Some(first) = descs.next() {
                Self::insert_locked(&mut inner, Arc::clone(&first));
                result = Some(first);
            }
            for desc in descs {
                Self::insert_locked(&mut inner, desc);
            }
            result.ok_or_else(|| KvError::Internal("range lookup lost its result".to_string()))
        })
    }

    /// Cached descriptor for `key` without consulting the descriptor db.
    pub fn get_cached(&self, key: &RKey, reverse: bool) -> Option<Arc<RangeDescriptor>> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let (end, desc) = inner.find(key, reverse)?;
        inner.lru.get(&end);
        Some(desc)
    }

    /// Cache `desc`, dropping cached descriptors that overlap it.
    pub fn insert(&self, desc: RangeDescriptor) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Self::insert_locked(&mut inner, Arc::new(desc));
    }

    fn insert_locked(inner: &mut CacheInner, desc: Arc<RangeDescriptor>) {
        let overlapping: Vec<RKey> = inner
            .by_end
            .range::<RKey, _>((Bound::Excluded(&desc.start_key), Bound::Unbounded))
            .take_while(|(_, cached)| cached.start_key < desc.end_key)
            .map(|(end, _)| end.clone())
            .collect();
        for end in &overlapping {
            inner.remove(end);
        }

        let end = desc.end_key.clone();
        inner.by_end.insert(end.clone(), desc);
        if let Some((evicted, ())) = inner.lru.put(end, ()) {
            inner.by_end.remove(&evicted);
        }
    }

    /// Evict the descriptor cached for `lookup_key`, then the meta
    /// descriptors that addressed it, up to the first range.
    ///
    /// When `observed` is given, the first level is only evicted if the
    /// cache still holds that exact descriptor, so a concurrently refreshed
    /// entry survives. Returns whether the first level was evicted.
    pub fn evict(
        &self,
        lookup_key: &RKey,
        observed: Option<&Arc<RangeDescriptor>>,
        reverse: bool,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut evicted_first = false;
        let mut key = lookup_key.clone();
        let mut level = 0;
        loop {
            if let Some((end, cached)) = inner.find(&key, reverse) {
                if level == 0 {
                    if let Some(observed) = observed {
                        if !Arc::ptr_eq(observed, &cached) {
                            tracing::trace!(%lookup_key, cached = %cached, "descriptor already replaced; not evicting");
                            return false;
                        }
                    }
                    evicted_first = true;
                }
                tracing::debug!(key = %key, desc = %cached, "evicting cached range descriptor");
                inner.remove(&end);
                self.stats.record_eviction();
            }
            key = keys::range_meta_key(&key);
            if key.is_empty() {
                break;
            }
            level += 1;
        }
        evicted_first
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_end
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::keys::{META1_PREFIX, META2_PREFIX};

    fn rk(s: &str) -> RKey {
        RKey::from(s)
    }

    fn desc(range_id: u64, start: RKey, end: RKey) -> RangeDescriptor {
        RangeDescriptor {
            range_id,
            start_key: start,
            end_key: end,
            replicas: Vec::new(),
        }
    }

    /// Serves lookups from a fixed list of ranges, decoding the addressed key
    /// from the meta key.
    struct StaticDb {
        ranges: Mutex<Vec<RangeDescriptor>>,
        max_ranges: usize,
        lookups: AtomicUsize,
        first_range_calls: AtomicUsize,
    }

    impl StaticDb {
        fn new(ranges: Vec<RangeDescriptor>) -> Arc<Self> {
            Arc::new(Self {
                ranges: Mutex::new(ranges),
                max_ranges: 8,
                lookups: AtomicUsize::new(0),
                first_range_calls: AtomicUsize::new(0),
            })
        }

        fn lookups(&self) -> usize {
            self.lookups.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RangeDescriptorDb for StaticDb {
        async fn range_lookup(
            &self,
            meta_key: &RKey,
            _desc: &RangeDescriptor,
            _consider_intents: bool,
            reverse: bool,
        ) -> Result<Vec<RangeDescriptor>, KvError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            let bytes = meta_key.as_bytes();
            let addressed = if let Some(rest) = bytes.strip_prefix(META1_PREFIX) {
                let mut key = META2_PREFIX.to_vec();
                key.extend_from_slice(rest);
                RKey(key)
            } else {
                RKey(bytes[META2_PREFIX.len()..].to_vec())
            };
            let ranges = self.ranges.lock().expect("lock").clone();
            let pos = ranges.iter().position(|d| {
                if reverse {
                    d.contains_exclusive_end_key(&addressed)
                } else {
                    d.contains_key(&addressed)
                }
            });
            let Some(pos) = pos else {
                return Ok(Vec::new());
            };
            let out = if reverse {
                ranges[..=pos].iter().rev().take(self.max_ranges).cloned().collect()
            } else {
                ranges[pos..].iter().take(self.max_ranges).cloned().collect()
            };
            Ok(out)
        }

        async fn first_range(&self) -> Result<RangeDescriptor, KvError> {
            self.first_range_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.ranges.lock().expect("lock")[0].clone())
        }
    }

    fn three_ranges() -> Vec<RangeDescriptor> {
        vec![
            desc(1, RKey::min(), rk("b")),
            desc(2, rk("b"), rk("m")),
            desc(3, rk("m"), RKey::max()),
        ]
    }

    fn cache(db: Arc<StaticDb>) -> RangeDescriptorCache {
        RangeDescriptorCache::new(db, 64, Arc::new(SenderStats::default()))
    }

    #[tokio::test]
    async fn miss_walks_meta_hierarchy_then_hits() {
        let db = StaticDb::new(three_ranges());
        let cache = cache(db.clone());

        let found = cache
            .lookup_range_descriptor(&rk("c"), false, false)
            .await
            .expect("lookup");
        assert_eq!(found.range_id, 2);
        assert_eq!(db.first_range_calls.load(Ordering::SeqCst), 1);
        assert_eq!(db.lookups(), 2);

        // Served from the cache, including prefetched neighbours.
        let again = cache
            .lookup_range_descriptor(&rk("d"), false, false)
            .await
            .expect("lookup");
        assert!(Arc::ptr_eq(&found, &again));
        let right = cache
            .lookup_range_descriptor(&rk("x"), false, false)
            .await
            .expect("lookup");
        assert_eq!(right.range_id, 3);
        assert_eq!(db.lookups(), 2);
    }

    #[tokio::test]
    async fn reverse_lookup_uses_exclusive_end() {
        let db = StaticDb::new(three_ranges());
        let cache = cache(db);
        let found = cache
            .lookup_range_descriptor(&rk("m"), false, true)
            .await
            .expect("lookup");
        assert_eq!(found.range_id, 2);
        assert_eq!(cache.get_cached(&rk("m"), true).map(|d| d.range_id), Some(2));
        // Prefetching follows the lookup direction.
        assert!(cache.get_cached(&rk("m"), false).is_none());
        assert_eq!(cache.get_cached(&rk("a"), false).map(|d| d.range_id), Some(1));
    }

    #[tokio::test]
    async fn evict_compares_observed_and_walks_up() {
        let db = StaticDb::new(three_ranges());
        let cache = cache(db.clone());
        let found = cache
            .lookup_range_descriptor(&rk("c"), false, false)
            .await
            .expect("lookup");

        let stale = Arc::new((*found).clone());
        assert!(!cache.evict(&rk("c"), Some(&stale), false));
        assert!(cache.get_cached(&rk("c"), false).is_some());

        assert!(cache.evict(&rk("c"), Some(&found), false));
        assert!(cache.get_cached(&rk("c"), false).is_none());
        // The first range addressed the meta records and went too.
        assert!(cache.get_cached(&rk("a"), false).is_none());

        cache
            .lookup_range_descriptor(&rk("c"), false, false)
            .await
            .expect("lookup");
        assert_eq!(db.first_range_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn insert_drops_overlapping_entries() {
        let cache = cache(StaticDb::new(three_ranges()));
        cache.insert(desc(2, rk("a"), rk("m")));
        cache.insert(desc(4, rk("m"), rk("z")));
        cache.insert(desc(2, rk("a"), rk("g")));
        assert_eq!(cache.get_cached(&rk("c"), false).map(|d| d.end_key.clone()), Some(rk("g")));
        assert!(cache.get_cached(&rk("h"), false).is_none());
        assert_eq!(cache.get_cached(&rk("n"), false).map(|d| d.range_id), Some(4));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn capacity_bounds_entries() {
        let db = StaticDb::new(three_ranges());
        let cache = RangeDescriptorCache::new(db, 2, Arc::new(SenderStats::default()));
        cache.insert(desc(1, rk("a"), rk("b")));
        cache.insert(desc(2, rk("b"), rk("c")));
        cache.get_cached(&rk("a"), false);
        cache.insert(desc(3, rk("c"), rk("d")));
        assert_eq!(cache.len(), 2);
        assert!(cache.get_cached(&rk("b"), false).is_none());
        assert!(cache.get_cached(&rk("a"), false).is_some());
    }

    #[tokio::test]
    async fn non_matching_lookup_result_is_rejected() {
        let db = StaticDb::new(three_ranges());
        let cache = cache(db.clone());
        cache
            .lookup_range_descriptor(&rk("c"), false, false)
            .await
            .expect("warm");
        // The authority moves on; the meta records now point elsewhere.
        *db.ranges.lock().expect("lock") = vec![
            desc(1, RKey::min(), rk("b")),
            desc(2, rk("b"), rk("m")),
            desc(3, rk("m"), rk("q")),
        ];
        let err = cache
            .lookup_range_descriptor(&rk("r"), true, false)
            .await
            .expect_err("no range for r");
        assert!(matches!(err, KvError::RangeKeyMismatch { range: None, .. }));
    }

    #[tokio::test]
    async fn considering_intents_bypasses_cache() {
        let db = StaticDb::new(three_ranges());
        let cache = cache(db.clone());
        cache
            .lookup_range_descriptor(&rk("c"), false, false)
            .await
            .expect("warm");
        let lookups = db.lookups();
        cache
            .lookup_range_descriptor(&rk("c"), true, false)
            .await
            .expect("lookup");
        assert_eq!(db.lookups(), lookups + 1);
    }
}
