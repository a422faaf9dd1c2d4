//! End-to-end coverage of the dequantization pipeline: a synthetic GGUF
//! file goes in, a memory-mapped workspace and a fully-populated
//! `ModelDescriptor` come out, and the registry can drive that model
//! through its residency states using the descriptor's own layer count.

use std::path::Path;

use snap_tier::model::dequant_pipeline;
use snap_tier::model::registry::ModelRegistry;
use snap_tier::workspace::file::Workspace;

fn write_gguf_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

const VALUE_TYPE_UINT32: u32 = 4;
const VALUE_TYPE_STRING: u32 = 8;
const GGML_TYPE_F32: u32 = 0;

/// Builds a minimal single-tensor GGUF file at `path`: one `blk.0.*` F32
/// tensor plus `general.architecture` and a handful of llama-namespaced
/// dimension keys, so the dequantization pipeline has real metadata to
/// extract into a `ModelDescriptor`.
fn write_synthetic_gguf(path: &Path, values: &[f32]) {
    let mut buf = Vec::new();
    buf.extend_from_slice(&0x4655_4747u32.to_le_bytes()); // magic "GGUF"
    buf.extend_from_slice(&3u32.to_le_bytes()); // version
    buf.extend_from_slice(&1u64.to_le_bytes()); // tensor_count
    buf.extend_from_slice(&4u64.to_le_bytes()); // metadata_kv_count

    write_gguf_string(&mut buf, "general.architecture");
    buf.extend_from_slice(&VALUE_TYPE_STRING.to_le_bytes());
    write_gguf_string(&mut buf, "llama");

    write_gguf_string(&mut buf, "llama.context_length");
    buf.extend_from_slice(&VALUE_TYPE_UINT32.to_le_bytes());
    buf.extend_from_slice(&2048u32.to_le_bytes());

    write_gguf_string(&mut buf, "llama.embedding_length");
    buf.extend_from_slice(&VALUE_TYPE_UINT32.to_le_bytes());
    buf.extend_from_slice(&(values.len() as u32).to_le_bytes());

    write_gguf_string(&mut buf, "llama.vocab_size");
    buf.extend_from_slice(&VALUE_TYPE_UINT32.to_le_bytes());
    buf.extend_from_slice(&32000u32.to_le_bytes());

    write_gguf_string(&mut buf, "blk.0.attn_q.weight");
    buf.extend_from_slice(&1u32.to_le_bytes()); // n_dims
    buf.extend_from_slice(&(values.len() as u64).to_le_bytes()); // dims[0]
    buf.extend_from_slice(&GGML_TYPE_F32.to_le_bytes()); // ggml type
    buf.extend_from_slice(&0u64.to_le_bytes()); // relative_offset

    // Pad to the default 32-byte alignment before the data section.
    while buf.len() % 32 != 0 {
        buf.push(0);
    }
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    std::fs::write(path, &buf).unwrap();
}

#[test]
fn test_ingest_populates_descriptor_and_workspace() {
    let tmp = tempfile::TempDir::new().unwrap();
    let source_path = tmp.path().join("tinymodel.F32.gguf");
    let values = [1.0f32, -2.0, 3.5, 0.0];
    write_synthetic_gguf(&source_path, &values);

    let workspace_root = tmp.path().join("workspaces");
    let outcome = dequant_pipeline::run(&workspace_root, &source_path, false).unwrap();

    assert!(outcome.dequantized);
    let descriptor = &outcome.descriptor;
    assert_eq!(descriptor.architecture, "llama");
    assert_eq!(descriptor.context_length, 2048);
    assert_eq!(descriptor.embedding_length, values.len() as u32);
    assert_eq!(descriptor.vocab_size, 32000);
    assert_eq!(descriptor.num_layers, 1);
    assert_eq!(descriptor.tensor_count, 1);

    let tensor_idx = descriptor.tensor_index()["blk.0.attn_q.weight"];
    let tensor = &descriptor.tensors[tensor_idx];
    let workspace = Workspace::open_read_only(&descriptor.workspace_path).unwrap();
    let read_back = workspace
        .read_pointer(tensor.workspace_offset, tensor.element_count as usize)
        .unwrap();
    assert_eq!(read_back, &values);
}

#[test]
fn test_ingest_is_cached_on_second_run_without_force() {
    let tmp = tempfile::TempDir::new().unwrap();
    let source_path = tmp.path().join("tinymodel.F32.gguf");
    write_synthetic_gguf(&source_path, &[1.0, 2.0]);

    let workspace_root = tmp.path().join("workspaces");
    let first = dequant_pipeline::run(&workspace_root, &source_path, false).unwrap();
    assert!(first.dequantized);

    let second = dequant_pipeline::run(&workspace_root, &source_path, false).unwrap();
    assert!(!second.dequantized);
    assert_eq!(second.descriptor.workspace_path, first.descriptor.workspace_path);
}

#[test]
fn test_ingested_descriptor_drives_registry_residency() {
    let tmp = tempfile::TempDir::new().unwrap();
    let source_path = tmp.path().join("tinymodel.F32.gguf");
    write_synthetic_gguf(&source_path, &[1.0, 2.0, 3.0]);

    let workspace_root = tmp.path().join("workspaces");
    let outcome = dequant_pipeline::run(&workspace_root, &source_path, false).unwrap();
    let descriptor = outcome.descriptor;

    let registry = ModelRegistry::new(8192);
    registry.begin_ingest(&descriptor.name).unwrap();
    registry.mark_cached(&descriptor.name).unwrap();
    registry.begin_bind(&descriptor.name).unwrap();
    registry.reserve_vram(10).unwrap();
    registry
        .mark_resident(&descriptor.name, 10, descriptor.num_layers, descriptor.num_layers)
        .unwrap();

    let info = registry.model_info(&descriptor.name).unwrap();
    assert_eq!(info.num_layers, descriptor.num_layers);
    assert_eq!(registry.current_model().as_deref(), Some(descriptor.name.as_str()));
}
