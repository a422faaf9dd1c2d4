//! Three-tier (VRAM/CPU/SSD) memory allocator backing the tiered KV-cache
//! store. One block per owner at any time; `promote`/`demote` move bytes
//! between tiers and are the only operations that change a block's tier.
//!
//! The reader-writer lock here guards block bookkeeping (who owns what,
//! which tier, capacity accounting); per-tier hit/promotion/demotion
//! counters are separate atomics so a stats read never blocks an
//! in-flight allocation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use thiserror::Error;
use tracing::debug;

pub const DEFAULT_ALIGNMENT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryTier {
    Vram,
    Cpu,
    Ssd,
}

impl MemoryTier {
    const ALL: [MemoryTier; 3] = [MemoryTier::Vram, MemoryTier::Cpu, MemoryTier::Ssd];

    fn index(self) -> usize {
        match self {
            MemoryTier::Vram => 0,
            MemoryTier::Cpu => 1,
            MemoryTier::Ssd => 2,
        }
    }

    /// The next tier down the cascade (VRAM -> CPU -> SSD), or `None` past SSD.
    pub fn next_lower(self) -> Option<MemoryTier> {
        match self {
            MemoryTier::Vram => Some(MemoryTier::Cpu),
            MemoryTier::Cpu => Some(MemoryTier::Ssd),
            MemoryTier::Ssd => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    Lru,
    Lfu,
    Fifo,
    SizeWeighted,
}

#[derive(Error, Debug)]
pub enum AllocatorError {
    #[error("out of memory on tier {tier:?}: requested {requested} bytes, {available} available")]
    OutOfMemory {
        tier: MemoryTier,
        requested: usize,
        available: usize,
    },

    #[error("block not found for owner {0}")]
    NotFound(String),

    #[error("invalid tier transition for owner {owner}: {from:?} -> {to:?}")]
    InvalidTransition {
        owner: String,
        from: MemoryTier,
        to: MemoryTier,
    },
}

fn align_up(size: usize, alignment: usize) -> usize {
    if alignment == 0 {
        return size;
    }
    size.div_ceil(alignment) * alignment
}

struct BlockRecord {
    tier: MemoryTier,
    size: usize,
    data: Vec<u8>,
    access_count: u64,
    last_access: u64,
    insertion_order: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TierStats {
    pub capacity: usize,
    pub used: usize,
    pub hits: u64,
    pub promotions: u64,
    pub demotions: u64,
}

struct TierCounters {
    hits: AtomicU64,
    promotions: AtomicU64,
    demotions: AtomicU64,
}

impl Default for TierCounters {
    fn default() -> Self {
        Self {
            hits: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            demotions: AtomicU64::new(0),
        }
    }
}

struct AllocatorState {
    blocks: HashMap<String, BlockRecord>,
    capacities: [usize; 3],
    used: [usize; 3],
    clock: u64,
}

/// Tiered memory allocator: VRAM, pinned-preferring CPU RAM, and
/// SSD-delegated storage, with cascading allocation and pluggable
/// per-tier eviction.
pub struct TieredMemoryAllocator {
    state: RwLock<AllocatorState>,
    counters: [TierCounters; 3],
    policy: EvictionPolicy,
    alignment: usize,
}

pub struct AllocationResult {
    pub tier: MemoryTier,
    pub size: usize,
}

impl TieredMemoryAllocator {
    pub fn new(
        vram_capacity: usize,
        cpu_capacity: usize,
        ssd_capacity: usize,
        policy: EvictionPolicy,
    ) -> Self {
        Self {
            state: RwLock::new(AllocatorState {
                blocks: HashMap::new(),
                capacities: [vram_capacity, cpu_capacity, ssd_capacity],
                used: [0, 0, 0],
                clock: 0,
            }),
            counters: [
                TierCounters::default(),
                TierCounters::default(),
                TierCounters::default(),
            ],
            policy,
            alignment: DEFAULT_ALIGNMENT,
        }
    }

    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Allocate `size` bytes for `owner`, trying `preferred_tier` first and
    /// cascading to lower tiers (evicting at each one) on failure. Replaces
    /// any existing block the owner held.
    pub fn allocate(
        &self,
        size: usize,
        preferred_tier: MemoryTier,
        owner: &str,
    ) -> Result<AllocationResult, AllocatorError> {
        let aligned = align_up(size, self.alignment);

        let mut tier = Some(preferred_tier);
        while let Some(t) = tier {
            if self.try_reserve(t, aligned) {
                self.deallocate_owner(owner);
                let mut state = self.state.write().unwrap();
                state.clock += 1;
                let clock = state.clock;
                state.blocks.insert(
                    owner.to_string(),
                    BlockRecord {
                        tier: t,
                        size: aligned,
                        data: vec![0u8; aligned],
                        access_count: 0,
                        last_access: clock,
                        insertion_order: clock,
                    },
                );
                debug!(owner, tier = ?t, size = aligned, "allocated tiered block");
                return Ok(AllocationResult { tier: t, size: aligned });
            }

            self.evict(aligned, t);
            if self.try_reserve(t, aligned) {
                self.deallocate_owner(owner);
                let mut state = self.state.write().unwrap();
                state.clock += 1;
                let clock = state.clock;
                state.blocks.insert(
                    owner.to_string(),
                    BlockRecord {
                        tier: t,
                        size: aligned,
                        data: vec![0u8; aligned],
                        access_count: 0,
                        last_access: clock,
                        insertion_order: clock,
                    },
                );
                return Ok(AllocationResult { tier: t, size: aligned });
            }

            tier = t.next_lower();
        }

        Err(AllocatorError::OutOfMemory {
            tier: preferred_tier,
            requested: aligned,
            available: 0,
        })
    }

    fn try_reserve(&self, tier: MemoryTier, size: usize) -> bool {
        let mut state = self.state.write().unwrap();
        let idx = tier.index();
        if state.used[idx] + size <= state.capacities[idx] {
            state.used[idx] += size;
            true
        } else {
            false
        }
    }

    pub fn deallocate_owner(&self, owner: &str) -> bool {
        let mut state = self.state.write().unwrap();
        if let Some(record) = state.blocks.remove(owner) {
            let idx = record.tier.index();
            state.used[idx] = state.used[idx].saturating_sub(record.size);
            true
        } else {
            false
        }
    }

    pub fn touch(&self, owner: &str) -> Result<(), AllocatorError> {
        let mut state = self.state.write().unwrap();
        state.clock += 1;
        let clock = state.clock;
        let tier = state
            .blocks
            .get(owner)
            .map(|r| r.tier)
            .ok_or_else(|| AllocatorError::NotFound(owner.to_string()))?;
        if let Some(record) = state.blocks.get_mut(owner) {
            record.access_count += 1;
            record.last_access = clock;
        }
        self.counters[tier.index()].hits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Move `owner`'s block to `higher_tier`, preserving content exactly.
    /// Fails (preserving the source) if the destination has no room.
    pub fn promote(&self, owner: &str, higher_tier: MemoryTier) -> Result<bool, AllocatorError> {
        self.move_tier(owner, higher_tier, true)
    }

    /// Move `owner`'s block to `lower_tier`, preserving content exactly.
    pub fn demote(&self, owner: &str, lower_tier: MemoryTier) -> Result<bool, AllocatorError> {
        self.move_tier(owner, lower_tier, false)
    }

    fn move_tier(
        &self,
        owner: &str,
        dest_tier: MemoryTier,
        is_promote: bool,
    ) -> Result<bool, AllocatorError> {
        let (current_tier, size, data) = {
            let state = self.state.read().unwrap();
            let record = state
                .blocks
                .get(owner)
                .ok_or_else(|| AllocatorError::NotFound(owner.to_string()))?;
            (record.tier, record.size, record.data.clone())
        };

        if current_tier == dest_tier {
            return Ok(true);
        }
        let expected_direction = dest_tier.index() < current_tier.index();
        if expected_direction != is_promote {
            return Err(AllocatorError::InvalidTransition {
                owner: owner.to_string(),
                from: current_tier,
                to: dest_tier,
            });
        }

        if !self.try_reserve(dest_tier, size) {
            return Ok(false);
        }

        let mut state = self.state.write().unwrap();
        let used_idx = current_tier.index();
        state.used[used_idx] = state.used[used_idx].saturating_sub(size);
        if let Some(record) = state.blocks.get_mut(owner) {
            record.tier = dest_tier;
            record.data = data;
        }
        drop(state);

        let counters = &self.counters[dest_tier.index()];
        if is_promote {
            counters.promotions.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.demotions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(true)
    }

    /// Free at least `bytes_needed` bytes from `tier` by evicting blocks
    /// per the configured [`EvictionPolicy`]. Returns bytes actually freed.
    pub fn evict(&self, bytes_needed: usize, tier: MemoryTier) -> usize {
        let mut freed = 0usize;
        loop {
            if freed >= bytes_needed {
                break;
            }
            let victim = {
                let state = self.state.read().unwrap();
                self.select_victim(&state, tier)
            };
            match victim {
                Some(owner) => {
                    let mut state = self.state.write().unwrap();
                    if let Some(record) = state.blocks.remove(&owner) {
                        let idx = record.tier.index();
                        state.used[idx] = state.used[idx].saturating_sub(record.size);
                        freed += record.size;
                    }
                }
                None => break,
            }
        }
        freed
    }

    fn select_victim(&self, state: &AllocatorState, tier: MemoryTier) -> Option<String> {
        let candidates = state.blocks.iter().filter(|(_, r)| r.tier == tier);
        match self.policy {
            EvictionPolicy::Lru => candidates
                .min_by_key(|(_, r)| r.last_access)
                .map(|(k, _)| k.clone()),
            EvictionPolicy::Lfu => candidates
                .min_by_key(|(_, r)| r.access_count)
                .map(|(k, _)| k.clone()),
            EvictionPolicy::Fifo => candidates
                .min_by_key(|(_, r)| r.insertion_order)
                .map(|(k, _)| k.clone()),
            EvictionPolicy::SizeWeighted => candidates
                .max_by_key(|(_, r)| r.size as u128 * (1 + (state.clock - r.last_access) as u128))
                .map(|(k, _)| k.clone()),
        }
    }

    pub fn stats(&self) -> [TierStats; 3] {
        let state = self.state.read().unwrap();
        let mut out = [TierStats::default(); 3];
        for tier in MemoryTier::ALL {
            let idx = tier.index();
            out[idx] = TierStats {
                capacity: state.capacities[idx],
                used: state.used[idx],
                hits: self.counters[idx].hits.load(Ordering::Relaxed),
                promotions: self.counters[idx].promotions.load(Ordering::Relaxed),
                demotions: self.counters[idx].demotions.load(Ordering::Relaxed),
            };
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_aligns_to_boundary() {
        let allocator = TieredMemoryAllocator::new(1024, 1024, 1024, EvictionPolicy::Lru);
        let result = allocator.allocate(10, MemoryTier::Vram, "a").unwrap();
        assert_eq!(result.size, DEFAULT_ALIGNMENT);
    }

    #[test]
    fn test_allocate_cascades_to_lower_tier_when_preferred_full() {
        let allocator = TieredMemoryAllocator::new(256, 1024, 1024, EvictionPolicy::Lru);
        allocator.allocate(256, MemoryTier::Vram, "a").unwrap();
        let result = allocator.allocate(256, MemoryTier::Vram, "b").unwrap();
        assert_eq!(result.tier, MemoryTier::Cpu);
    }

    #[test]
    fn test_out_of_memory_when_all_tiers_exhausted() {
        let allocator = TieredMemoryAllocator::new(256, 256, 256, EvictionPolicy::Lru);
        allocator.allocate(256, MemoryTier::Vram, "a").unwrap();
        allocator.allocate(256, MemoryTier::Vram, "b").unwrap();
        allocator.allocate(256, MemoryTier::Vram, "c").unwrap();
        let err = allocator.allocate(256, MemoryTier::Vram, "d").unwrap_err();
        assert!(matches!(err, AllocatorError::OutOfMemory { .. }));
    }

    #[test]
    fn test_promote_moves_block_and_preserves_content() {
        let allocator = TieredMemoryAllocator::new(1024, 1024, 1024, EvictionPolicy::Lru);
        allocator.allocate(256, MemoryTier::Cpu, "a").unwrap();
        let promoted = allocator.promote("a", MemoryTier::Vram).unwrap();
        assert!(promoted);

        let stats = allocator.stats();
        assert_eq!(stats[MemoryTier::Vram.index()].used, 256);
        assert_eq!(stats[MemoryTier::Cpu.index()].used, 0);
    }

    #[test]
    fn test_demote_direction_mismatch_is_invalid_transition() {
        let allocator = TieredMemoryAllocator::new(1024, 1024, 1024, EvictionPolicy::Lru);
        allocator.allocate(256, MemoryTier::Cpu, "a").unwrap();
        let err = allocator.demote("a", MemoryTier::Vram).unwrap_err();
        assert!(matches!(err, AllocatorError::InvalidTransition { .. }));
    }

    #[test]
    fn test_lru_eviction_selects_coldest_block() {
        let allocator = TieredMemoryAllocator::new(512, 1024, 1024, EvictionPolicy::Lru);
        allocator.allocate(256, MemoryTier::Vram, "old").unwrap();
        allocator.allocate(256, MemoryTier::Vram, "new").unwrap();
        allocator.touch("new").unwrap();

        let freed = allocator.evict(256, MemoryTier::Vram);
        assert_eq!(freed, 256);
        assert!(allocator.touch("old").is_err());
        assert!(allocator.touch("new").is_ok());
    }
}
