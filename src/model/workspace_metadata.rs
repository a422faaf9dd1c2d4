//! Persistent index over dequantized model workspaces: which
//! `(model, quant)` pairs have already been ingested, and where their
//! tensors live.
//!
//! Layout on disk, under `root`:
//! ```text
//! root/index.json                     — { entries: [IndexEntry, ...] }
//! root/<model>/<quant>/metadata.json   — ModelDescriptor minus tensors
//! root/<model>/<quant>/tensors.json    — Vec<TensorDescriptor>
//! root/<model>/<quant>/workspace.bin   — the mmap'd tensor data
//! ```
//! Writes go to a `.tmp` sibling and are renamed into place, so a reader
//! never observes a half-written file; a directory missing either JSON
//! file is treated as if the model were never ingested.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkspaceMetadataError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed metadata JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorDescriptor {
    pub name: String,
    pub shape: Vec<u64>,
    pub workspace_offset: u64,
    pub element_count: u64,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub quant: String,
    pub source_weights_path: String,
    pub tensor_count: usize,
    pub total_size_bytes: u64,
    pub workspace_path: String,
    /// `general.architecture` GGUF key, e.g. `"llama"`. Empty if the source
    /// file didn't carry the key.
    pub architecture: String,
    pub vocab_size: u32,
    pub context_length: u32,
    pub embedding_length: u32,
    pub num_heads: u32,
    /// Highest `blk.<N>.*` index seen plus one; 0 if no layer tensors.
    pub num_layers: u32,
    pub tensors: Vec<TensorDescriptor>,
}

impl ModelDescriptor {
    /// Tensor name to its position in `tensors`, for callers that look up a
    /// tensor by name instead of scanning.
    pub fn tensor_index(&self) -> HashMap<&str, usize> {
        self.tensors
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.as_str(), i))
            .collect()
    }
}

/// Highest `blk.<N>.*` layer index among `tensors`, plus one; 0 if none.
pub fn compute_num_layers(tensors: &[TensorDescriptor]) -> u32 {
    tensors
        .iter()
        .filter_map(|t| crate::workspace::layer::layer_of_tensor(&t.name))
        .max()
        .map(|max_layer| max_layer + 1)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub name: String,
    pub quant: String,
    pub source_weights_path: String,
    pub tensor_count: usize,
    pub total_size_bytes: u64,
    pub timestamp: u64,
    pub metadata_file_path: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Index {
    entries: Vec<IndexEntry>,
}

fn model_dir(root: &Path, model: &str, quant: &str) -> PathBuf {
    root.join(model).join(quant)
}

/// `true` if a complete (metadata + tensor catalog) entry exists for
/// `(model, quant)`.
pub fn exists(root: &Path, model: &str, quant: &str) -> bool {
    let dir = model_dir(root, model, quant);
    dir.join("metadata.json").is_file() && dir.join("tensors.json").is_file()
}

/// Load a previously-saved descriptor, or `None` if absent/incomplete.
pub fn load(
    root: &Path,
    model: &str,
    quant: &str,
) -> Result<Option<ModelDescriptor>, WorkspaceMetadataError> {
    if !exists(root, model, quant) {
        return Ok(None);
    }
    let dir = model_dir(root, model, quant);
    let descriptor = read_descriptor(&dir)?;
    Ok(Some(descriptor))
}

fn read_descriptor(dir: &Path) -> Result<ModelDescriptor, WorkspaceMetadataError> {
    #[derive(Deserialize)]
    struct MetaOnly {
        name: String,
        quant: String,
        source_weights_path: String,
        tensor_count: usize,
        total_size_bytes: u64,
        workspace_path: String,
        #[serde(default)]
        architecture: String,
        #[serde(default)]
        vocab_size: u32,
        #[serde(default)]
        context_length: u32,
        #[serde(default)]
        embedding_length: u32,
        #[serde(default)]
        num_heads: u32,
        #[serde(default)]
        num_layers: u32,
    }

    let meta_bytes = fs::read(dir.join("metadata.json"))?;
    let meta: MetaOnly = serde_json::from_slice(&meta_bytes)?;
    let tensors_bytes = fs::read(dir.join("tensors.json"))?;
    let tensors: Vec<TensorDescriptor> = serde_json::from_slice(&tensors_bytes)?;

    Ok(ModelDescriptor {
        name: meta.name,
        quant: meta.quant,
        source_weights_path: meta.source_weights_path,
        tensor_count: meta.tensor_count,
        total_size_bytes: meta.total_size_bytes,
        workspace_path: meta.workspace_path,
        architecture: meta.architecture,
        vocab_size: meta.vocab_size,
        context_length: meta.context_length,
        embedding_length: meta.embedding_length,
        num_heads: meta.num_heads,
        num_layers: meta.num_layers,
        tensors,
    })
}

/// Persist `descriptor` and append/update its entry in the top-level index,
/// atomically (write to a `.tmp` path, then rename).
pub fn save(root: &Path, descriptor: &ModelDescriptor) -> Result<(), WorkspaceMetadataError> {
    let dir = model_dir(root, &descriptor.name, &descriptor.quant);
    fs::create_dir_all(&dir)?;

    #[derive(Serialize)]
    struct MetaOnly<'a> {
        name: &'a str,
        quant: &'a str,
        source_weights_path: &'a str,
        tensor_count: usize,
        total_size_bytes: u64,
        workspace_path: &'a str,
        architecture: &'a str,
        vocab_size: u32,
        context_length: u32,
        embedding_length: u32,
        num_heads: u32,
        num_layers: u32,
    }

    write_atomic(
        &dir.join("metadata.json"),
        &MetaOnly {
            name: &descriptor.name,
            quant: &descriptor.quant,
            source_weights_path: &descriptor.source_weights_path,
            tensor_count: descriptor.tensor_count,
            total_size_bytes: descriptor.total_size_bytes,
            workspace_path: &descriptor.workspace_path,
            architecture: &descriptor.architecture,
            vocab_size: descriptor.vocab_size,
            context_length: descriptor.context_length,
            embedding_length: descriptor.embedding_length,
            num_heads: descriptor.num_heads,
            num_layers: descriptor.num_layers,
        },
    )?;
    write_atomic(&dir.join("tensors.json"), &descriptor.tensors)?;

    update_index(root, descriptor)?;
    Ok(())
}

/// Remove a model/quant's on-disk metadata (not the workspace file itself;
/// callers that also want the bytes gone should delete `workspace_path`).
pub fn remove(root: &Path, model: &str, quant: &str) -> Result<(), WorkspaceMetadataError> {
    let dir = model_dir(root, model, quant);
    if dir.is_dir() {
        fs::remove_dir_all(&dir)?;
    }

    let index_path = root.join("index.json");
    if index_path.is_file() {
        let mut index = read_index(&index_path)?;
        index
            .entries
            .retain(|e| !(e.name == model && e.quant == quant));
        write_atomic(&index_path, &index)?;
    }
    Ok(())
}

pub fn list(root: &Path) -> Result<Vec<IndexEntry>, WorkspaceMetadataError> {
    let index_path = root.join("index.json");
    if !index_path.is_file() {
        return Ok(Vec::new());
    }
    Ok(read_index(&index_path)?.entries)
}

fn read_index(path: &Path) -> Result<Index, WorkspaceMetadataError> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn update_index(root: &Path, descriptor: &ModelDescriptor) -> Result<(), WorkspaceMetadataError> {
    let index_path = root.join("index.json");
    let mut index = if index_path.is_file() {
        read_index(&index_path)?
    } else {
        Index::default()
    };

    index
        .entries
        .retain(|e| !(e.name == descriptor.name && e.quant == descriptor.quant));
    index.entries.push(IndexEntry {
        name: descriptor.name.clone(),
        quant: descriptor.quant.clone(),
        source_weights_path: descriptor.source_weights_path.clone(),
        tensor_count: descriptor.tensor_count,
        total_size_bytes: descriptor.total_size_bytes,
        timestamp: now_unix(),
        metadata_file_path: model_dir(root, &descriptor.name, &descriptor.quant)
            .join("metadata.json")
            .to_string_lossy()
            .to_string(),
    });

    write_atomic(&index_path, &index)
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn write_atomic(path: &Path, value: &impl Serialize) -> Result<(), WorkspaceMetadataError> {
    let tmp_path = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp_path, bytes)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Known quantization tokens this catalog can detect in a source filename,
/// checked case-insensitively as a substring match. Order matters: longer,
/// more specific tokens (`Q5_K_M`) must be tried before their prefixes
/// (`Q5_K`).
pub const KNOWN_QUANT_TOKENS: &[&str] = &[
    "Q3_K_S", "Q3_K_M", "Q3_K_L", "Q4_K_S", "Q4_K_M", "Q5_K_S", "Q5_K_M", "Q2_K", "Q3_K", "Q4_K",
    "Q5_K", "Q6_K", "Q8_K", "Q4_0", "Q4_1", "Q5_0", "Q5_1", "Q8_0", "MXFP4", "F16", "BF16",
];

/// Extract the quantization tag from a source weights filename, falling
/// back to `F32` when no known token appears.
pub fn extract_quant_type(filename: &str) -> String {
    let upper = filename.to_uppercase();
    for token in KNOWN_QUANT_TOKENS {
        if upper.contains(token) {
            return token.to_string();
        }
    }
    "F32".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_descriptor(name: &str, quant: &str) -> ModelDescriptor {
        ModelDescriptor {
            name: name.to_string(),
            quant: quant.to_string(),
            source_weights_path: "/models/m.gguf".to_string(),
            tensor_count: 1,
            total_size_bytes: 1024,
            workspace_path: "/tmp/ws/m/Q8_0/workspace.bin".to_string(),
            architecture: "llama".to_string(),
            vocab_size: 32000,
            context_length: 4096,
            embedding_length: 4096,
            num_heads: 32,
            num_layers: 1,
            tensors: vec![TensorDescriptor {
                name: "token_embd.weight".to_string(),
                shape: vec![4096, 4096],
                workspace_offset: 0,
                element_count: 4096 * 4096,
                size_bytes: 4096 * 4096 * 4,
            }],
        }
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let tmp = TempDir::new().unwrap();
        let descriptor = sample_descriptor("m1", "Q8_0");
        save(tmp.path(), &descriptor).unwrap();

        assert!(exists(tmp.path(), "m1", "Q8_0"));
        let loaded = load(tmp.path(), "m1", "Q8_0").unwrap().unwrap();
        assert_eq!(loaded.tensor_count, 1);
        assert_eq!(loaded.tensors[0].name, "token_embd.weight");
    }

    #[test]
    fn test_load_absent_model_returns_none() {
        let tmp = TempDir::new().unwrap();
        assert!(load(tmp.path(), "missing", "Q8_0").unwrap().is_none());
    }

    #[test]
    fn test_remove_clears_directory_and_index() {
        let tmp = TempDir::new().unwrap();
        let descriptor = sample_descriptor("m1", "Q8_0");
        save(tmp.path(), &descriptor).unwrap();

        remove(tmp.path(), "m1", "Q8_0").unwrap();
        assert!(!exists(tmp.path(), "m1", "Q8_0"));
        assert!(list(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn test_extract_quant_type_prefers_longer_tokens() {
        assert_eq!(extract_quant_type("llama3.Q5_K_M.gguf"), "Q5_K_M");
        assert_eq!(extract_quant_type("llama3.q4_0.gguf"), "Q4_0");
        assert_eq!(extract_quant_type("llama3-custom.gguf"), "F32");
    }

    #[test]
    fn test_index_lists_all_saved_entries() {
        let tmp = TempDir::new().unwrap();
        save(tmp.path(), &sample_descriptor("m1", "Q8_0")).unwrap();
        save(tmp.path(), &sample_descriptor("m2", "Q4_K_M")).unwrap();

        let entries = list(tmp.path()).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_save_then_load_round_trip_preserves_architecture_fields() {
        let tmp = TempDir::new().unwrap();
        let descriptor = sample_descriptor("m1", "Q8_0");
        save(tmp.path(), &descriptor).unwrap();

        let loaded = load(tmp.path(), "m1", "Q8_0").unwrap().unwrap();
        assert_eq!(loaded.architecture, "llama");
        assert_eq!(loaded.vocab_size, 32000);
        assert_eq!(loaded.context_length, 4096);
        assert_eq!(loaded.embedding_length, 4096);
        assert_eq!(loaded.num_heads, 32);
    }

    #[test]
    fn test_tensor_index_maps_name_to_position() {
        let descriptor = sample_descriptor("m1", "Q8_0");
        let index = descriptor.tensor_index();
        assert_eq!(index.get("token_embd.weight"), Some(&0));
        assert_eq!(index.get("missing.tensor"), None);
    }

    #[test]
    fn test_compute_num_layers_counts_highest_block_plus_one() {
        let tensors = vec![
            TensorDescriptor {
                name: "blk.0.attn_q.weight".to_string(),
                shape: vec![],
                workspace_offset: 0,
                element_count: 0,
                size_bytes: 0,
            },
            TensorDescriptor {
                name: "blk.3.attn_q.weight".to_string(),
                shape: vec![],
                workspace_offset: 0,
                element_count: 0,
                size_bytes: 0,
            },
        ];
        assert_eq!(compute_num_layers(&tensors), 4);
    }
}
