//! snap-tier: tiered tensor cache and model-switching core for multi-model
//! LLM serving.
//!
//! Extends GPU VRAM capacity by transparently paging KV cache blocks
//! through a hierarchy of storage tiers:
//!   GPU VRAM (hot) → Host RAM (warm) → Local SSD (cool) → NFS/HDD (cold)
//! and, on top of that, tracks model residency (dequantize-once,
//! mmap'd workspaces, VRAM-aware load/switch/evict) and precomputed
//! per-(model, content) KV contexts.
//!
//! Exposes an OpenAI-compatible HTTP API for drop-in integration.

pub mod cache;
pub mod config;
pub mod error;
pub mod gpu;
pub mod inference;
pub mod kv;
pub mod model;
pub mod server;
pub mod tiered;
pub mod transfer;
pub mod workspace;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{error, info};

use cache::hot::HotCache;
use cache::pager::new_shared_pager;
use config::{Cli, Config};
use inference::backend::{InferenceBackend, StubBackend};
use inference::engine::InferenceEngine;
use kv::auto_tiering::{self, AutoTieringConfig, TieringPolicy};
use kv::context_manager::ContextManager;
use kv::store::{CacheStore, FileCacheStore};
use model::bridge::ModelBridge;
use model::dequant_cache::DequantCache;
use model::registry::ModelRegistry;
use server::openai_api::{build_router, AppState};
use tiered::allocator::{EvictionPolicy, TieredMemoryAllocator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "snap_tier=debug,tower_http=debug"
    } else {
        "snap_tier=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("snap-tier v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;
    let config = Arc::new(config);

    info!(
        model = %config.model.model_path.display(),
        context_size = config.model.context_size,
        block_size = config.model.block_size,
        "Configuration loaded"
    );

    // Print tier capacities.
    info!(
        gpu_vram = config.tiers.gpu_vram_budget,
        host_ram = config.tiers.host_ram_budget,
        local_ssd = config.tiers.local_ssd_budget,
        nfs = config.tiers.nfs_budget,
        "Tier capacities"
    );

    // Compute KV cache sizing.
    let block_bytes = config.kv_block_bytes();
    let tokens_gpu = config.tokens_for_budget(config.tiers.gpu_vram_budget);
    let tokens_ram = config.tokens_for_budget(config.tiers.host_ram_budget);
    let tokens_ssd = config.tokens_for_budget(config.tiers.local_ssd_budget);

    info!(
        block_bytes,
        tokens_gpu,
        tokens_ram,
        tokens_ssd,
        total_tokens = tokens_gpu + tokens_ram + tokens_ssd,
        "KV cache capacity (FP16 equivalent)"
    );

    // Initialize the tiered cache pager.
    let pager = new_shared_pager(config.clone());

    // Initialize the inference engine.
    let engine = InferenceEngine::new(pager.clone(), config.clone());

    // Model residency: registry tracks state/VRAM, bridge drives
    // dequantize-then-bind, HOT cache holds the always-resident tensors.
    std::fs::create_dir_all(&config.workspace.root)?;
    std::fs::create_dir_all(&config.workspace.models_path)?;
    std::fs::create_dir_all(&config.cache_store.root)?;

    let registry = Arc::new(ModelRegistry::new(config.registry.vram_budget_mb));
    let dequant_cache = Arc::new(DequantCache::new());
    let hot_cache = Arc::new(HotCache::new(config.tiers.gpu_vram_budget.max(1 << 20)));
    let backend: Arc<dyn InferenceBackend> = Arc::new(StubBackend::new());

    let bridge = Arc::new(ModelBridge::new(
        config.workspace.root.clone(),
        registry.clone(),
        dequant_cache.clone(),
        hot_cache.clone(),
        backend.clone(),
    ));

    // Content-addressed KV-cache store plus the context manager that
    // precomputes and persists per-(model, content) KV state.
    let cache_store: Arc<dyn CacheStore> =
        Arc::new(FileCacheStore::open(config.cache_store.root.clone())?);
    if config.cache_store.capacity_bytes > 0 {
        cache_store.set_capacity(config.cache_store.capacity_bytes);
    }
    let context_manager = Arc::new(ContextManager::new(cache_store.clone(), backend.clone()));

    // Three-tier allocator backing model/context residency across VRAM,
    // host RAM, and local SSD.
    let allocator = Arc::new(TieredMemoryAllocator::new(
        config.tiers.gpu_vram_budget,
        config.tiers.host_ram_budget,
        config.tiers.local_ssd_budget,
        EvictionPolicy::Lru,
    ));

    // Background worker: demotes idle contexts, promotes hot ones, evicts
    // past-TTL entries, and handles emergency pressure relief.
    let _auto_tiering_handle = auto_tiering::spawn(
        context_manager.clone(),
        allocator.clone(),
        AutoTieringConfig {
            policy: TieringPolicy::default(),
            interval: std::time::Duration::from_secs(config.auto_tiering.interval_secs),
            gpu_pressure_threshold: config.auto_tiering.gpu_pressure_threshold,
            cpu_pressure_threshold: config.auto_tiering.cpu_pressure_threshold,
            target_utilization: config.auto_tiering.target_utilization,
        },
    );

    // Build application state.
    let state = Arc::new(AppState {
        engine: RwLock::new(engine),
        config: config.clone(),
        pager,
        start_time: Instant::now(),
        registry,
        bridge,
        context_manager,
        allocator,
        cache_store,
        backend,
        backend_contexts: AsyncMutex::new(HashMap::new()),
    });

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = cli.listen;
    info!(addr = listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
