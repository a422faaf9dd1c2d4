//! The mmap'd per-model workspace: a bump-allocated, byte-addressable file
//! that holds every dequantized F32 tensor for one (model, quantization)
//! pair.
//!
//! - [`file`]: `Workspace`, the mmap-backed allocator and reader
//! - [`layer`]: layer-aware page eviction/prefetch (`blk.<N>.*` regions)
//! - [`platform`]: the unsafe `madvise`-equivalent primitive

pub mod file;
pub mod layer;
pub mod platform;
