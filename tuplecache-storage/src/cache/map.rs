//! Keyed storage for live cache entries, one map per operation kind, plus the
//! global cap on how many entries may exist at once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tuplecache_core::StorageResult;

use super::entry::{CacheEntry, EntrySettings, EvictionReason, Producer, Unwrapped};
use super::key::CacheKey;
use crate::shared_iterator::SharedIterator;

/// Counts live entries across every map and refuses new ones past the limit.
///
/// The capacity check and the insert are not atomic together, so under heavy
/// contention the count can briefly exceed the limit by the number of
/// concurrent inserters.
#[derive(Debug)]
pub struct AdmissionControl {
    live: AtomicUsize,
    limit: usize,
}

impl AdmissionControl {
    pub fn new(limit: usize) -> Self {
        Self {
            live: AtomicUsize::new(0),
            limit,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.live() < self.limit
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    fn admit(&self) {
        self.live.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Result of [`EntryMap::acquire`].
pub enum Lookup<T> {
    /// A handle on shared results. `created` is true if this call built them.
    Shared {
        iter: SharedIterator<T>,
        created: bool,
    },
    /// Sharing is not possible right now; read the backend directly.
    Bypass(BypassReason),
}

/// Why a lookup fell back to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    /// The global entry limit was reached.
    Capacity,
    /// The entry was evicted, or its buffer outgrew the configured bound,
    /// between lookup and clone.
    Unavailable,
}

/// Live entries for one operation kind.
pub struct EntryMap<T> {
    entries: DashMap<CacheKey, Arc<CacheEntry<T>>>,
    admission: Arc<AdmissionControl>,
    settings: EntrySettings,
}

impl<T> EntryMap<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(admission: Arc<AdmissionControl>, settings: EntrySettings) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            admission,
            settings,
        })
    }

    /// Find or create the entry for `key` and hand out a handle on its
    /// results.
    ///
    /// Once the global limit is reached every lookup bypasses, including
    /// lookups for keys that already have an entry, and the map is not
    /// touched.
    ///
    /// `producer` is only ever called if this call inserts the entry and then
    /// is first to use it. A producer error removes the entry so the next
    /// caller retries, and is returned unchanged.
    pub async fn acquire(
        self: &Arc<Self>,
        key: CacheKey,
        producer: Producer<T>,
    ) -> StorageResult<Lookup<T>> {
        if !self.admission.has_capacity() {
            return Ok(Lookup::Bypass(BypassReason::Capacity));
        }
        let entry = self.load_or_store(key, producer);

        match entry.unwrap().await {
            Ok(Unwrapped {
                iter: Some(iter),
                created,
            }) => Ok(Lookup::Shared { iter, created }),
            Ok(Unwrapped { iter: None, .. }) => Ok(Lookup::Bypass(BypassReason::Unavailable)),
            Err(err) => {
                entry.discard();
                Err(err)
            }
        }
    }

    /// Insert a new entry for `key` unless one is already present, returning
    /// whichever entry is in the map afterwards.
    fn load_or_store(self: &Arc<Self>, key: CacheKey, producer: Producer<T>) -> Arc<CacheEntry<T>> {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(existing) => Arc::clone(existing.get()),
            Entry::Vacant(slot) => {
                let map = Arc::downgrade(self);
                let entry = Arc::new_cyclic(|me: &Weak<CacheEntry<T>>| {
                    let me = me.clone();
                    let cleanup = Box::new(move || {
                        if let Some(map) = map.upgrade() {
                            map.remove_if_current(&key, me.as_ptr());
                        }
                    });
                    CacheEntry::new(self.settings, producer, cleanup)
                });
                // Counted while the shard is still locked, so no one can
                // remove the entry before it is counted.
                self.admission.admit();
                slot.insert(Arc::clone(&entry));
                entry
            }
        }
    }

    /// Remove `key` only if it still maps to the entry at `current`.
    fn remove_if_current(&self, key: &CacheKey, current: *const CacheEntry<T>) {
        let removed = self
            .entries
            .remove_if(key, |_, entry| std::ptr::eq(Arc::as_ptr(entry), current));
        if removed.is_some() {
            self.admission.release();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Evict every entry. Outstanding handles keep working until stopped.
    pub fn evict_all(&self) {
        // Evicting removes from the map, so collect first to avoid holding a
        // shard lock across the removal.
        let live: Vec<Arc<CacheEntry<T>>> = self
            .entries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for entry in live {
            entry.evict(EvictionReason::Shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tuplecache_core::{ReadContext, StorageError, StorageIterator};
    use tuplecache_test_utils::ScriptedIterator;

    use crate::cache::entry::ProducerFuture;

    fn settings() -> EntrySettings {
        EntrySettings {
            admission_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(1),
            batch_size: 10,
            max_buffered: None,
        }
    }

    fn producer(items: Vec<u32>) -> Producer<u32> {
        Box::new(move || -> ProducerFuture<u32> {
            let items = items.clone();
            Box::pin(async move {
                Ok(Box::new(ScriptedIterator::new(items)) as Box<dyn StorageIterator<u32>>)
            })
        })
    }

    fn failing(err: StorageError) -> Producer<u32> {
        Box::new(move || -> ProducerFuture<u32> {
            let err = err.clone();
            Box::pin(async move { Err(err) })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_key_shares_entry() {
        let admission = Arc::new(AdmissionControl::new(10));
        let map = EntryMap::new(Arc::clone(&admission), settings());
        let key = CacheKey::from_raw("k");

        let first = map.acquire(key.clone(), producer(vec![1, 2])).await.unwrap();
        let second = map.acquire(key.clone(), producer(vec![9])).await.unwrap();

        let ctx = ReadContext::background();
        match (first, second) {
            (
                Lookup::Shared { created: true, .. },
                Lookup::Shared {
                    mut iter,
                    created: false,
                },
            ) => {
                assert_eq!(iter.next(&ctx).await, Ok(1));
            }
            _ => panic!("expected the second lookup to share the first entry"),
        }
        assert_eq!(map.len(), 1);
        assert_eq!(admission.live(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_bypass() {
        let admission = Arc::new(AdmissionControl::new(1));
        let map = EntryMap::new(Arc::clone(&admission), settings());

        let _kept = map
            .acquire(CacheKey::from_raw("a"), producer(vec![1]))
            .await
            .unwrap();
        let other = map
            .acquire(CacheKey::from_raw("b"), producer(vec![2]))
            .await
            .unwrap();
        assert!(matches!(other, Lookup::Bypass(BypassReason::Capacity)));

        // At the limit even a key with a live entry goes to the backend.
        let again = map
            .acquire(CacheKey::from_raw("a"), producer(vec![1]))
            .await
            .unwrap();
        assert!(matches!(again, Lookup::Bypass(BypassReason::Capacity)));
        assert_eq!(admission.live(), 1);
        assert!(map.contains(&CacheKey::from_raw("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_error_removes_entry() {
        let admission = Arc::new(AdmissionControl::new(10));
        let map = EntryMap::new(Arc::clone(&admission), settings());
        let key = CacheKey::from_raw("k");

        let result = map
            .acquire(key.clone(), failing(StorageError::query_failed("boom")))
            .await;
        assert!(matches!(result, Err(StorageError::QueryFailed { .. })));
        assert!(!map.contains(&key));
        assert_eq!(admission.live(), 0);

        let retry = map.acquire(key.clone(), producer(vec![1])).await.unwrap();
        assert!(matches!(retry, Lookup::Shared { created: true, .. }));
        assert_eq!(admission.live(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_eviction_releases_slot() {
        let admission = Arc::new(AdmissionControl::new(10));
        let map = EntryMap::new(Arc::clone(&admission), settings());
        let key = CacheKey::from_raw("k");

        drop(map.acquire(key.clone(), producer(vec![1])).await.unwrap());
        assert_eq!(admission.live(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(!map.contains(&key));
        assert_eq!(admission.live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_cleanup_leaves_replacement() {
        let admission = Arc::new(AdmissionControl::new(10));
        let map = EntryMap::new(Arc::clone(&admission), settings());
        let key = CacheKey::from_raw("k");

        let stale = map.load_or_store(key.clone(), producer(vec![1]));
        map.remove_if_current(&key, Arc::as_ptr(&stale));
        assert_eq!(admission.live(), 0);

        let fresh = map.load_or_store(key.clone(), producer(vec![2]));
        assert!(!Arc::ptr_eq(&stale, &fresh));

        // The stale entry's cleanup must not remove its replacement.
        stale.discard();
        assert!(map.contains(&key));
        assert_eq!(admission.live(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_all_empties_map() {
        let admission = Arc::new(AdmissionControl::new(10));
        let map = EntryMap::new(Arc::clone(&admission), settings());
        let ctx = ReadContext::background();

        let mut held = None;
        for name in ["a", "b", "c"] {
            if let Lookup::Shared { iter, .. } = map
                .acquire(CacheKey::from_raw(name), producer(vec![7]))
                .await
                .unwrap()
            {
                held = Some(iter);
            }
        }
        map.evict_all();

        assert!(map.is_empty());
        assert_eq!(admission.live(), 0);
        let mut held = held.unwrap();
        assert_eq!(held.next(&ctx).await, Ok(7));
    }
}
