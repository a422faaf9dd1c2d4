//! Background policy actor: on a fixed interval, takes a snapshot of
//! context access statistics, computes promotion/demotion/eviction
//! decisions against a policy, then applies them to the allocator and
//! context manager.
//!
//! Single worker: the snapshot is read under lock, decisions are computed
//! lock-free, and only the apply step re-acquires state.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::kv::context_manager::ContextManager;
use crate::tiered::allocator::{MemoryTier, TieredMemoryAllocator};

#[derive(Debug, Clone, Copy)]
pub enum TieringPolicy {
    AccessFrequency {
        hot_threshold: u64,
        warm_threshold: u64,
    },
    Recency {
        hot_threshold_secs: u64,
        warm_threshold_secs: u64,
        cold_threshold_secs: u64,
    },
    Adaptive,
}

impl Default for TieringPolicy {
    fn default() -> Self {
        TieringPolicy::Recency {
            hot_threshold_secs: 60,
            warm_threshold_secs: 300,
            cold_threshold_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AutoTieringConfig {
    pub policy: TieringPolicy,
    pub interval: Duration,
    pub gpu_pressure_threshold: f64,
    pub cpu_pressure_threshold: f64,
    pub target_utilization: f64,
}

impl Default for AutoTieringConfig {
    fn default() -> Self {
        Self {
            policy: TieringPolicy::default(),
            interval: Duration::from_secs(30),
            gpu_pressure_threshold: 0.85,
            cpu_pressure_threshold: 0.85,
            target_utilization: 0.70,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Promote(MemoryTier),
    Demote(MemoryTier),
    Evict,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub context_id: String,
    pub decision: Decision,
}

/// One evaluation pass: snapshot statistics, compute a plan, return it
/// without touching any shared state. Exposed standalone so the worker
/// loop and tests exercise the same decision logic.
pub fn evaluate(
    context_manager: &ContextManager,
    allocator: &TieredMemoryAllocator,
    config: &AutoTieringConfig,
    now: u64,
) -> Vec<Plan> {
    let mut plans = Vec::new();
    let snapshot = context_manager.list();

    for info in &snapshot {
        let idle_secs = now.saturating_sub(info.last_accessed);

        if now.saturating_sub(info.last_accessed) > info.ttl_secs {
            plans.push(Plan {
                context_id: info.id.clone(),
                decision: Decision::Evict,
            });
            continue;
        }

        let decision = match config.policy {
            TieringPolicy::AccessFrequency {
                hot_threshold,
                warm_threshold,
            } => {
                if info.access_count >= hot_threshold && info.tier != MemoryTier::Vram {
                    Some(Decision::Promote(MemoryTier::Vram))
                } else if info.access_count >= warm_threshold && info.tier == MemoryTier::Ssd {
                    Some(Decision::Promote(MemoryTier::Cpu))
                } else if info.access_count < warm_threshold && info.tier != MemoryTier::Ssd {
                    Some(Decision::Demote(MemoryTier::Ssd))
                } else {
                    None
                }
            }
            TieringPolicy::Recency {
                hot_threshold_secs,
                warm_threshold_secs,
                cold_threshold_secs,
            } => {
                if idle_secs <= hot_threshold_secs && info.tier != MemoryTier::Vram {
                    Some(Decision::Promote(MemoryTier::Vram))
                } else if idle_secs > cold_threshold_secs {
                    Some(Decision::Evict)
                } else if idle_secs > warm_threshold_secs && info.tier != MemoryTier::Ssd {
                    Some(Decision::Demote(MemoryTier::Ssd))
                } else {
                    None
                }
            }
            TieringPolicy::Adaptive => {
                if idle_secs <= 60 && info.access_count >= 4 && info.tier != MemoryTier::Vram {
                    Some(Decision::Promote(MemoryTier::Vram))
                } else if idle_secs > 3600 {
                    Some(Decision::Evict)
                } else if idle_secs > 300 && info.tier != MemoryTier::Ssd {
                    Some(Decision::Demote(MemoryTier::Ssd))
                } else {
                    None
                }
            }
        };

        if let Some(decision) = decision {
            plans.push(Plan {
                context_id: info.id.clone(),
                decision,
            });
        }
    }

    // `TieredMemoryAllocator::stats` returns tiers in declaration order: [Vram, Cpu, Ssd].
    let tier_stats = allocator.stats();
    let gpu = &tier_stats[0];
    if gpu.capacity > 0 && gpu.used as f64 / gpu.capacity as f64 > config.gpu_pressure_threshold {
        plans.extend(emergency_demotions(
            &snapshot,
            MemoryTier::Vram,
            gpu.used,
            gpu.capacity,
            config.target_utilization,
        ));
    }
    let cpu = &tier_stats[1];
    if cpu.capacity > 0 && cpu.used as f64 / cpu.capacity as f64 > config.cpu_pressure_threshold {
        plans.extend(emergency_demotions(
            &snapshot,
            MemoryTier::Cpu,
            cpu.used,
            cpu.capacity,
            config.target_utilization,
        ));
    }

    plans
}

/// Demote the least-recently-accessed entries resident in `tier` until
/// projected utilization drops to `target`.
fn emergency_demotions(
    snapshot: &[crate::kv::context_manager::ContextInfo],
    tier: MemoryTier,
    used: usize,
    capacity: usize,
    target: f64,
) -> Vec<Plan> {
    let mut candidates: Vec<_> = snapshot.iter().filter(|c| c.tier == tier).collect();
    candidates.sort_by_key(|c| c.last_accessed);

    let target_bytes = (capacity as f64 * target) as usize;
    let mut freed = 0usize;
    let mut plans = Vec::new();
    for info in candidates {
        if used.saturating_sub(freed) <= target_bytes {
            break;
        }
        let next = tier.next_lower().unwrap_or(MemoryTier::Ssd);
        plans.push(Plan {
            context_id: info.id.clone(),
            decision: Decision::Demote(next),
        });
        freed += info.byte_size as usize;
    }
    plans
}

/// Apply a previously computed plan: reacquires allocator/context-manager
/// state only here, never during `evaluate`.
pub fn apply(context_manager: &ContextManager, allocator: &TieredMemoryAllocator, plans: &[Plan]) {
    for plan in plans {
        match plan.decision {
            Decision::Promote(tier) => {
                match allocator.promote(&plan.context_id, tier) {
                    Ok(true) => {
                        let _ = context_manager.set_tier(&plan.context_id, tier);
                        debug!(context_id = %plan.context_id, ?tier, "promoted");
                    }
                    Ok(false) => {}
                    Err(e) => warn!(context_id = %plan.context_id, error = %e, "promotion failed"),
                }
            }
            Decision::Demote(tier) => match allocator.demote(&plan.context_id, tier) {
                Ok(true) => {
                    let _ = context_manager.set_tier(&plan.context_id, tier);
                    debug!(context_id = %plan.context_id, ?tier, "demoted");
                }
                Ok(false) => {}
                Err(e) => warn!(context_id = %plan.context_id, error = %e, "demotion failed"),
            },
            Decision::Evict => match context_manager.remove(&plan.context_id) {
                Ok(_) => info!(context_id = %plan.context_id, "evicted expired context"),
                Err(e) => warn!(context_id = %plan.context_id, error = %e, "eviction failed"),
            },
        }
    }
}

/// Spawns the background worker loop. Returns its `JoinHandle`; drop or
/// abort it to stop tiering.
pub fn spawn(
    context_manager: Arc<ContextManager>,
    allocator: Arc<TieredMemoryAllocator>,
    config: AutoTieringConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        loop {
            ticker.tick().await;
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let plans = evaluate(&context_manager, &allocator, &config, now);
            if !plans.is_empty() {
                debug!(plan_count = plans.len(), "auto-tiering evaluation produced plans");
                apply(&context_manager, &allocator, &plans);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::backend::StubBackend;
    use crate::kv::store::FileCacheStore;
    use crate::tiered::allocator::EvictionPolicy;
    use tempfile::TempDir;

    fn context_manager(tmp: &TempDir) -> (Arc<ContextManager>, Arc<StubBackend>) {
        let backend = Arc::new(StubBackend::new());
        let store = Arc::new(FileCacheStore::open(tmp.path()).unwrap());
        (
            Arc::new(ContextManager::new(store, backend.clone())),
            backend,
        )
    }

    #[test]
    fn test_recency_policy_promotes_hot_entries() {
        let tmp = TempDir::new().unwrap();
        let (cm, backend) = context_manager(&tmp);
        let handle = backend.open_model_skeleton("m.gguf", 32, true).unwrap();
        let ctx = backend.new_context(&handle, 4096, 512, 4, true).unwrap();
        let info = cm.ingest("m1", &handle, &ctx, "hello world").unwrap();

        let allocator = TieredMemoryAllocator::new(1 << 20, 1 << 20, 1 << 20, EvictionPolicy::Lru);
        allocator
            .allocate(info.byte_size as usize, MemoryTier::Ssd, &info.id)
            .unwrap();

        let config = AutoTieringConfig::default();
        let plans = evaluate(&cm, &allocator, &config, info.created_at);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].decision, Decision::Promote(MemoryTier::Vram));
    }

    #[test]
    fn test_recency_policy_evicts_past_ttl() {
        let tmp = TempDir::new().unwrap();
        let (cm, backend) = context_manager(&tmp);
        let handle = backend.open_model_skeleton("m.gguf", 32, true).unwrap();
        let ctx = backend.new_context(&handle, 4096, 512, 4, true).unwrap();
        let info = cm.ingest("m1", &handle, &ctx, "hello world").unwrap();

        let allocator = TieredMemoryAllocator::new(1 << 20, 1 << 20, 1 << 20, EvictionPolicy::Lru);
        let config = AutoTieringConfig::default();
        let far_future = info.created_at + info.ttl_secs + 1;
        let plans = evaluate(&cm, &allocator, &config, far_future);
        assert!(plans.iter().any(|p| p.decision == Decision::Evict));
    }

    #[test]
    fn test_apply_promote_updates_context_tier() {
        let tmp = TempDir::new().unwrap();
        let (cm, backend) = context_manager(&tmp);
        let handle = backend.open_model_skeleton("m.gguf", 32, true).unwrap();
        let ctx = backend.new_context(&handle, 4096, 512, 4, true).unwrap();
        let info = cm.ingest("m1", &handle, &ctx, "hello world").unwrap();

        let allocator = TieredMemoryAllocator::new(1 << 20, 1 << 20, 1 << 20, EvictionPolicy::Lru);
        allocator
            .allocate(info.byte_size as usize, MemoryTier::Ssd, &info.id)
            .unwrap();

        let plans = vec![Plan {
            context_id: info.id.clone(),
            decision: Decision::Promote(MemoryTier::Vram),
        }];
        apply(&cm, &allocator, &plans);
        assert_eq!(cm.get_info(&info.id).unwrap().tier, MemoryTier::Vram);
    }
}
