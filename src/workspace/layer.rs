//! Layer-aware page eviction: tensors are named `blk.<N>.<...>` (the
//! convention used by GGUF-derived checkpoints), and transformer inference
//! touches one layer at a time. Grouping a workspace's allocations by layer
//! lets the registry evict or prefetch whole layers instead of guessing at
//! the tensor level.

use crate::workspace::file::{Workspace, WorkspaceError};

/// Parse the layer index out of a tensor name following the `blk.<N>.*`
/// convention. Tensors outside that convention (embeddings, output norm,
/// output projection) have no layer and return `None`.
pub fn layer_of_tensor(name: &str) -> Option<u32> {
    let rest = name.strip_prefix("blk.")?;
    let end = rest.find('.')?;
    rest[..end].parse().ok()
}

/// Registers `(offset, size)` under the tensor's parsed layer, if any.
/// Call this once per tensor immediately after
/// [`Workspace::allocate`]/[`Workspace::write`] during dequantization.
pub fn register_tensor(workspace: &Workspace, tensor_name: &str, offset: u64, size: usize) {
    if let Some(layer) = layer_of_tensor(tensor_name) {
        workspace.register_layer_region(layer, offset, size);
    }
}

/// Evict a contiguous range of layers `[start, end)`, lowest index first.
/// Used when GPU offload shrinks and the tail layers fall back to CPU/SSD
/// residency.
pub fn evict_layer_range(
    workspace: &Workspace,
    start: u32,
    end: u32,
) -> Result<(), WorkspaceError> {
    for layer in start..end {
        workspace.evict_layer(layer)?;
    }
    Ok(())
}

/// Prefetch a contiguous range of layers `[start, end)`. Used when GPU
/// offload grows and newly-resident layers need their pages warmed before
/// the first decode touches them.
pub fn prefetch_layer_range(
    workspace: &Workspace,
    start: u32,
    end: u32,
) -> Result<(), WorkspaceError> {
    for layer in start..end {
        workspace.prefetch_layer(layer)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_of_tensor_parses_blk_prefix() {
        assert_eq!(layer_of_tensor("blk.12.attn_q.weight"), Some(12));
        assert_eq!(layer_of_tensor("blk.0.ffn_down.weight"), Some(0));
    }

    #[test]
    fn test_layer_of_tensor_none_for_non_block_tensors() {
        assert_eq!(layer_of_tensor("token_embd.weight"), None);
        assert_eq!(layer_of_tensor("output_norm.weight"), None);
        assert_eq!(layer_of_tensor("output.weight"), None);
    }

    #[test]
    fn test_layer_of_tensor_rejects_malformed_names() {
        assert_eq!(layer_of_tensor("blk.not_a_number.weight"), None);
        assert_eq!(layer_of_tensor("blk."), None);
    }

    #[test]
    fn test_evict_and_prefetch_range_are_noops_without_registration() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ws = Workspace::create(tmp.path().join("ws.bin"), 4096).unwrap();
        assert!(evict_layer_range(&ws, 0, 4).is_ok());
        assert!(prefetch_layer_range(&ws, 0, 4).is_ok());
    }
}
