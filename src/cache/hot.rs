//! HOT: the shared RAM-resident cache of dequantized F32 tensors.
//!
//! Every model's tensors live in its own memory-mapped workspace
//! ([`crate::workspace::file::Workspace`]); HOT additionally holds a copy of
//! the hottest tensors as owned `Arc<[f32]>` buffers so repeated lookups
//! (embeddings, output projection) avoid touching the mmap at all. Eviction
//! is strict LRU by a monotonic touch clock, tie-broken by insertion order
//! — ties only occur among entries that have never been touched again
//! since insertion, so the tie-break is "oldest insertion first".

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HotCacheError {
    #[error("HOT cache entry too large: {size} bytes exceeds budget {budget} bytes")]
    EntryTooLarge { size: usize, budget: usize },
}

/// Identifies a tensor by the model that owns it and its name within that
/// model's tensor catalog.
pub type HotKey = (String, String);

struct HotEntry {
    data: Arc<[f32]>,
    byte_size: usize,
    last_touch: u64,
    insertion_order: u64,
}

struct HotCacheInner {
    entries: HashMap<HotKey, HotEntry>,
    byte_budget: usize,
    bytes_used: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Monotonic clock shared by all HOT cache instances in the process, used
/// purely for LRU ordering (never wall-clock time).
static TOUCH_CLOCK: AtomicU64 = AtomicU64::new(0);
static INSERTION_CLOCK: AtomicU64 = AtomicU64::new(0);

fn next_touch() -> u64 {
    TOUCH_CLOCK.fetch_add(1, Ordering::Relaxed)
}

fn next_insertion() -> u64 {
    INSERTION_CLOCK.fetch_add(1, Ordering::Relaxed)
}

/// Shared HOT tensor cache.
pub struct HotCache {
    inner: Mutex<HotCacheInner>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HotStats {
    pub entries: usize,
    pub bytes_used: usize,
    pub byte_budget: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl HotCache {
    pub fn new(byte_budget: usize) -> Self {
        Self {
            inner: Mutex::new(HotCacheInner {
                entries: HashMap::new(),
                byte_budget,
                bytes_used: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    /// Look up a tensor, bumping its LRU touch time on hit.
    pub fn lookup(&self, model: &str, tensor: &str) -> Option<Arc<[f32]>> {
        let mut inner = self.inner.lock().unwrap();
        let key = (model.to_string(), tensor.to_string());
        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.last_touch = next_touch();
            inner.hits += 1;
            Some(entry.data.clone())
        } else {
            inner.misses += 1;
            None
        }
    }

    /// Insert (or refresh) a tensor, evicting cold entries until there is
    /// room. A single entry larger than the whole budget is rejected rather
    /// than evicting everything to fit it.
    pub fn prefetch(
        &self,
        model: &str,
        tensor: &str,
        data: Arc<[f32]>,
    ) -> Result<(), HotCacheError> {
        let byte_size = data.len() * std::mem::size_of::<f32>();
        let mut inner = self.inner.lock().unwrap();
        if byte_size > inner.byte_budget {
            return Err(HotCacheError::EntryTooLarge {
                size: byte_size,
                budget: inner.byte_budget,
            });
        }

        let key = (model.to_string(), tensor.to_string());
        if let Some(existing) = inner.entries.remove(&key) {
            inner.bytes_used -= existing.byte_size;
        }

        while inner.bytes_used + byte_size > inner.byte_budget {
            if !evict_one(&mut inner) {
                break;
            }
        }

        inner.entries.insert(
            key,
            HotEntry {
                data,
                byte_size,
                last_touch: next_touch(),
                insertion_order: next_insertion(),
            },
        );
        inner.bytes_used += byte_size;
        Ok(())
    }

    /// Evict every tensor belonging to `model` (called on model unload).
    pub fn evict_model(&self, model: &str) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let keys: Vec<HotKey> = inner
            .entries
            .keys()
            .filter(|(m, _)| m == model)
            .cloned()
            .collect();
        let count = keys.len();
        for key in keys {
            if let Some(entry) = inner.entries.remove(&key) {
                inner.bytes_used -= entry.byte_size;
                inner.evictions += 1;
            }
        }
        count
    }

    pub fn stats(&self) -> HotStats {
        let inner = self.inner.lock().unwrap();
        HotStats {
            entries: inner.entries.len(),
            bytes_used: inner.bytes_used,
            byte_budget: inner.byte_budget,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }
}

/// Evict the single coldest entry (lowest last_touch, ties broken by lowest
/// insertion_order). Returns false if the cache is already empty.
fn evict_one(inner: &mut HotCacheInner) -> bool {
    let victim = inner
        .entries
        .iter()
        .min_by_key(|(_, e)| (e.last_touch, e.insertion_order))
        .map(|(k, _)| k.clone());

    match victim {
        Some(key) => {
            if let Some(entry) = inner.entries.remove(&key) {
                inner.bytes_used -= entry.byte_size;
                inner.evictions += 1;
            }
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(n: usize) -> Arc<[f32]> {
        vec![0.0f32; n].into()
    }

    #[test]
    fn test_lookup_miss_then_hit() {
        let cache = HotCache::new(1024 * 1024);
        assert!(cache.lookup("m1", "t1").is_none());
        cache.prefetch("m1", "t1", data(16)).unwrap();
        assert!(cache.lookup("m1", "t1").is_some());
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_lru_eviction_order() {
        // Budget for exactly 2 entries of 16 f32 (64 bytes) each.
        let cache = HotCache::new(128);
        cache.prefetch("m", "a", data(16)).unwrap();
        cache.prefetch("m", "b", data(16)).unwrap();

        // Touch "a" so "b" becomes the coldest.
        cache.lookup("m", "a");

        cache.prefetch("m", "c", data(16)).unwrap();

        assert!(cache.lookup("m", "b").is_none(), "b should have been evicted");
        assert!(cache.lookup("m", "a").is_some());
        assert!(cache.lookup("m", "c").is_some());
    }

    #[test]
    fn test_tie_break_by_insertion_order() {
        let cache = HotCache::new(128);
        cache.prefetch("m", "first", data(16)).unwrap();
        cache.prefetch("m", "second", data(16)).unwrap();
        // Neither touched again: "first" has the lower insertion order and
        // must be evicted first.
        cache.prefetch("m", "third", data(16)).unwrap();

        assert!(cache.lookup("m", "first").is_none());
        assert!(cache.lookup("m", "second").is_some());
    }

    #[test]
    fn test_entry_too_large_rejected() {
        let cache = HotCache::new(64);
        let err = cache.prefetch("m", "huge", data(32)).unwrap_err();
        assert!(matches!(err, HotCacheError::EntryTooLarge { .. }));
    }

    #[test]
    fn test_evict_model_removes_only_that_models_tensors() {
        let cache = HotCache::new(1024 * 1024);
        cache.prefetch("m1", "t1", data(4)).unwrap();
        cache.prefetch("m2", "t1", data(4)).unwrap();

        let evicted = cache.evict_model("m1");
        assert_eq!(evicted, 1);
        assert!(cache.lookup("m1", "t1").is_none());
        assert!(cache.lookup("m2", "t1").is_some());
    }
}
