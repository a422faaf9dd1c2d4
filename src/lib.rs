//! snap-tier: tiered tensor cache and model-switching core for multi-model
//! LLM serving.
//!
//! Quantized weights are dequantized once into a per-model memory-mapped
//! workspace ([`workspace`]), selectively promoted into a shared RAM cache
//! ([`cache::hot`]) and bound into GPU residency through the model registry
//! ([`model::registry`]). A second, related subsystem persists per-context
//! KV caches across GPU/CPU/SSD/NFS tiers with automatic promotion and
//! demotion ([`kv`], built on the tiered KV block cache in [`cache`] and
//! [`tiered`]).

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
