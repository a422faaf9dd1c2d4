//! Three-tier (VRAM/CPU/SSD) allocator that backs the tiered KV-cache
//! store: allocate, track ownership, promote/demote blocks, enforce
//! per-tier capacities with pluggable eviction policies.

pub mod allocator;
