//! Content-addressed KV-cache persistence, precomputed-context management,
//! and the background policy actor that keeps hot contexts promoted and
//! cold ones reclaimed.
//!
//! - [`store`]: content-addressed `.kvc`/`.meta` file store
//! - [`context_manager`]: per-(model, content) KV cache precompute/query
//! - [`auto_tiering`]: background promotion/demotion/eviction policy

pub mod auto_tiering;
pub mod context_manager;
pub mod store;
