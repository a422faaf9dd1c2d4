//! Integration coverage combining the tiered memory allocator with the
//! content-addressed cache store: allocator bookkeeping tracks *where* a
//! context's bytes notionally live, while the store independently holds
//! the actual bytes on disk, compressed and checksummed.

use snap_tier::kv::store::{CacheStore, Compression, FileCacheStore, WriteOptions};
use snap_tier::tiered::allocator::{AllocatorError, EvictionPolicy, MemoryTier, TieredMemoryAllocator};

#[test]
fn test_allocate_write_and_promote_preserves_stored_payload() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = FileCacheStore::open(tmp.path()).unwrap();
    let allocator = TieredMemoryAllocator::new(1024, 1024, 1024, EvictionPolicy::Lru);

    let payload = b"ctx-42 kv state bytes";
    store
        .write(
            "ctx-42",
            payload,
            WriteOptions {
                compression: Compression::Zstd,
                model: Some("m1".to_string()),
            },
        )
        .unwrap();
    let result = allocator.allocate(payload.len(), MemoryTier::Cpu, "ctx-42").unwrap();
    assert_eq!(result.tier, MemoryTier::Cpu);

    let promoted = allocator.promote("ctx-42", MemoryTier::Vram).unwrap();
    assert!(promoted);

    // The allocator's tier bookkeeping moved, but the cache store still
    // holds the same bytes under the same id — the two are independent.
    assert_eq!(store.read("ctx-42").unwrap(), payload);
}

#[test]
fn test_allocator_cascades_to_lower_tier_while_store_tracks_by_model() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = FileCacheStore::open(tmp.path()).unwrap();
    let allocator = TieredMemoryAllocator::new(256, 1024, 1024, EvictionPolicy::Lru);

    for (id, model) in [("a", "m1"), ("b", "m1"), ("c", "m2")] {
        store
            .write(
                id,
                format!("payload-{id}").as_bytes(),
                WriteOptions {
                    compression: Compression::None,
                    model: Some(model.to_string()),
                },
            )
            .unwrap();
    }

    allocator.allocate(256, MemoryTier::Vram, "a").unwrap();
    let result = allocator.allocate(256, MemoryTier::Vram, "b").unwrap();
    assert_eq!(result.tier, MemoryTier::Cpu);

    let mut m1_ids = store.list_by_model("m1");
    m1_ids.sort();
    assert_eq!(m1_ids, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(store.list_by_model("m2"), vec!["c".to_string()]);
}

#[test]
fn test_allocator_eviction_frees_space_for_new_owner_store_entry_survives() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = FileCacheStore::open(tmp.path()).unwrap();
    let allocator = TieredMemoryAllocator::new(256, 1024, 1024, EvictionPolicy::Lru);

    store.write("old", b"stale context", WriteOptions::default()).unwrap();
    allocator.allocate(256, MemoryTier::Vram, "old").unwrap();

    store.write("new", b"fresh context", WriteOptions::default()).unwrap();
    let result = allocator.allocate(256, MemoryTier::Vram, "new").unwrap();
    assert_eq!(result.tier, MemoryTier::Vram);

    // Eviction only touches the allocator's block bookkeeping; the store
    // entry for the evicted owner remains readable until something calls
    // `remove` on it explicitly.
    assert!(store.exists("old"));
    assert_eq!(store.read("old").unwrap(), b"stale context");
    assert!(allocator.touch("old").is_err());
}

#[test]
fn test_demote_direction_mismatch_rejected_independent_of_store_state() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = FileCacheStore::open(tmp.path()).unwrap();
    let allocator = TieredMemoryAllocator::new(1024, 1024, 1024, EvictionPolicy::Lru);

    store.write("ctx", b"data", WriteOptions::default()).unwrap();
    allocator.allocate(128, MemoryTier::Cpu, "ctx").unwrap();

    let err = allocator.demote("ctx", MemoryTier::Vram).unwrap_err();
    assert!(matches!(err, AllocatorError::InvalidTransition { .. }));
    assert_eq!(store.read("ctx").unwrap(), b"data");
}
