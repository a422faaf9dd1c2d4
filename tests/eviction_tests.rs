//! Integration coverage combining model-residency eviction
//! ([`snap_tier::model::registry`]) with the precomputed-context store
//! ([`snap_tier::kv::context_manager`]): evicting a model's VRAM residency
//! must not touch its already-persisted KV contexts, since the two track
//! different kinds of state.

use std::sync::Arc;

use snap_tier::inference::backend::StubBackend;
use snap_tier::kv::context_manager::ContextManager;
use snap_tier::kv::store::FileCacheStore;
use snap_tier::model::registry::{ModelRegistry, ModelState, RegistryError};

fn load_resident(registry: &ModelRegistry, name: &str, vram_mb: u64) {
    registry.begin_ingest(name).unwrap();
    registry.mark_cached(name).unwrap();
    registry.begin_bind(name).unwrap();
    registry.reserve_vram(vram_mb).unwrap();
    registry.mark_resident(name, vram_mb, 32, 32).unwrap();
}

#[test]
fn test_vram_eviction_of_lru_model_leaves_its_context_cache_intact() {
    let tmp = tempfile::TempDir::new().unwrap();
    let registry = ModelRegistry::new(150);
    load_resident(&registry, "a", 100);
    load_resident(&registry, "b", 100);
    registry.switch_active("b").unwrap();

    let backend = Arc::new(StubBackend::new());
    let store = Arc::new(FileCacheStore::open(tmp.path()).unwrap());
    let manager = ContextManager::new(store, backend.clone());
    let handle = backend.open_model_skeleton("a.gguf", 32, true).unwrap();
    let ctx = backend.new_context(&handle, 4096, 512, 4, true).unwrap();
    let info = manager.ingest("a", &handle, &ctx, "hello from model a").unwrap();

    // Loading "c" overflows the 150MB budget; "a" is LRU and not active,
    // so it gets evicted instead of "b".
    registry.begin_ingest("c").unwrap();
    registry.mark_cached("c").unwrap();
    registry.begin_bind("c").unwrap();
    let evicted = registry.reserve_vram(100).unwrap();
    assert_eq!(evicted, vec!["a".to_string()]);
    assert_eq!(registry.state("a"), ModelState::Evicted);

    // The context precomputed against "a" is untouched by that eviction.
    assert_eq!(manager.get_info(&info.id).unwrap().model_id, "a");
    let pieces = manager.query(&info.id, &handle, &ctx, "more text").unwrap();
    assert!(!pieces.is_empty());
}

#[test]
fn test_reserve_vram_errors_when_every_resident_model_is_active_or_absent() {
    let registry = ModelRegistry::new(100);
    load_resident(&registry, "only", 100);
    registry.switch_active("only").unwrap();

    let err = registry.reserve_vram(50).unwrap_err();
    assert!(matches!(err, RegistryError::Vram(_)));
    assert_eq!(registry.state("only"), ModelState::Resident);
}

#[test]
fn test_context_ttl_expiry_independent_of_model_state() {
    let tmp = tempfile::TempDir::new().unwrap();
    let registry = ModelRegistry::new(8192);
    load_resident(&registry, "m1", 100);

    let backend = Arc::new(StubBackend::new());
    let store = Arc::new(FileCacheStore::open(tmp.path()).unwrap());
    let manager = ContextManager::new(store, backend.clone());
    let handle = backend.open_model_skeleton("m1.gguf", 32, true).unwrap();
    let ctx = backend.new_context(&handle, 4096, 512, 4, true).unwrap();
    let info = manager.ingest("m1", &handle, &ctx, "content to expire").unwrap();

    registry.mark_evicted("m1").unwrap();
    assert_eq!(registry.state("m1"), ModelState::Evicted);

    assert!(manager.expired(info.created_at + 10).is_empty());
    let far_future = info.created_at + 24 * 60 * 60 + 1;
    assert_eq!(manager.expired(far_future), vec![info.id]);
}
