//! Memoised aggregation results
//!
//! Entries are keyed by the serialised query and tagged with the aggregate
//! generation they were computed at. Every insert that adds records bumps
//! the generation, so an entry from an older generation is never served and
//! is evicted the next time the cache is touched. When the cache is full the
//! least recently used entry goes first.

use super::CellAggregates;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

pub const DEFAULT_CACHE_CAPACITY: usize = 256;

struct CacheEntry {
    generation: u64,
    cells: Arc<CellAggregates>,
}

/// Bounded least-recently-used memo of aggregation results
pub struct AggregateCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl AggregateCache {
    /// A capacity of zero is treated as one
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Cached cells for `key`, if computed at `generation`
    ///
    /// A hit promotes the entry to most recently used.
    pub fn get(&self, key: &str, generation: u64) -> Option<Arc<CellAggregates>> {
        let mut entries = self.lock();
        evict_stale(&mut entries, generation);
        entries.get(key).map(|entry| entry.cells.clone())
    }

    /// Store cells, evicting the least recently used entry when full
    pub fn insert(&self, key: String, generation: u64, cells: Arc<CellAggregates>) {
        let mut entries = self.lock();
        evict_stale(&mut entries, generation);
        if let Some((evicted, _)) = entries.push(key.clone(), CacheEntry { generation, cells }) {
            if evicted != key {
                debug!("aggregate cache full, evicted least recently used entry");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for AggregateCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

fn evict_stale(entries: &mut LruCache<String, CacheEntry>, generation: u64) {
    let stale: Vec<String> = entries
        .iter()
        .filter(|(_, entry)| entry.generation < generation)
        .map(|(key, _)| key.clone())
        .collect();
    for key in &stale {
        entries.pop(key);
    }
    if !stale.is_empty() {
        debug!("evicted {} stale aggregate cache entries", stale.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lens::aggregate::HexAggregate;
    use crate::lens::hex::CellId;

    fn cells(count: u64) -> Arc<CellAggregates> {
        let mut map = CellAggregates::new();
        map.insert(
            CellId::new("87194ad37ffffff").unwrap(),
            HexAggregate {
                count,
                ..Default::default()
            },
        );
        Arc::new(map)
    }

    #[test]
    fn test_hit_at_same_generation() {
        let cache = AggregateCache::default();
        cache.insert("q".to_string(), 3, cells(1));
        let hit = cache.get("q", 3).unwrap();
        assert_eq!(hit.values().next().unwrap().count, 1);
        assert!(cache.get("other", 3).is_none());
    }

    #[test]
    fn test_newer_generation_evicts() {
        let cache = AggregateCache::default();
        cache.insert("a".to_string(), 1, cells(1));
        cache.insert("b".to_string(), 1, cells(2));
        assert_eq!(cache.len(), 2);

        assert!(cache.get("a", 2).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_bound() {
        let cache = AggregateCache::new(2);
        cache.insert("a".to_string(), 0, cells(1));
        cache.insert("b".to_string(), 0, cells(2));
        cache.insert("c".to_string(), 0, cells(3));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("c", 0).is_some());

        cache.insert("c".to_string(), 0, cells(4));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("c", 0).unwrap().values().next().unwrap().count, 4);
    }

    #[test]
    fn test_recently_read_entry_survives_eviction() {
        let cache = AggregateCache::new(2);
        cache.insert("a".to_string(), 0, cells(1));
        cache.insert("b".to_string(), 0, cells(2));
        assert!(cache.get("a", 0).is_some());

        cache.insert("c".to_string(), 0, cells(3));
        assert!(cache.get("a", 0).is_some());
        assert!(cache.get("b", 0).is_none());
        assert!(cache.get("c", 0).is_some());
    }

    #[test]
    fn test_zero_capacity_holds_one_entry() {
        let cache = AggregateCache::new(0);
        cache.insert("a".to_string(), 0, cells(1));
        cache.insert("b".to_string(), 0, cells(2));
        assert_eq!(cache.len(), 1);
        assert!(cache.get("b", 0).is_some());
    }
}
