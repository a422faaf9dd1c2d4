//! Dequantization: quantized tensor bytes in, flat F32 bytes out, written
//! once into a model's workspace.
//!
//! Tensors are independent once their source bytes are read, so the ingest
//! loop in [`run`] dequantizes them with `rayon`'s `par_iter` and writes
//! each result into its own allocated region — no shared mutable state
//! between tensors.

pub mod formats;

use std::path::Path;
use std::sync::Arc;

use rayon::prelude::*;
use thiserror::Error;

use crate::model::gguf::{GgufError, GgufFile, TensorInfo};
use crate::model::workspace_metadata::{
    self, ModelDescriptor, TensorDescriptor, WorkspaceMetadataError,
};
use crate::workspace::file::{Workspace, WorkspaceError};
use crate::workspace::layer;

#[derive(Error, Debug)]
pub enum DequantError {
    #[error("GGUF parse error: {0}")]
    Gguf(#[from] GgufError),

    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("metadata error: {0}")]
    Metadata(#[from] WorkspaceMetadataError),

    #[error("unsupported quantization format for tensor {tensor}")]
    UnsupportedFormat { tensor: String },

    #[error("model name could not be parsed from path {0}")]
    BadModelPath(String),
}

/// Parse `<model>.<QUANT>.gguf`-style filenames into `(model_name,
/// quant_tag)`, using [`workspace_metadata::extract_quant_type`] for the
/// quant token and stripping it back out of the stem for the model name.
pub fn parse_model_and_quant(source_path: &Path) -> (String, String) {
    let stem = source_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("model");

    let quant = workspace_metadata::extract_quant_type(stem);
    if quant == "F32" {
        return (stem.to_string(), quant);
    }

    let upper = stem.to_uppercase();
    let model_name = match upper.find(&quant) {
        Some(idx) => stem[..idx].trim_matches(|c| c == '.' || c == '-' || c == '_'),
        None => stem,
    };
    let model_name = if model_name.is_empty() { stem } else { model_name };
    (model_name.to_string(), quant)
}

pub struct IngestOutcome {
    pub descriptor: ModelDescriptor,
    pub dequantized: bool,
}

/// Run the dequantization pipeline for `source_path` into `<root>/<model>/<quant>/`.
/// If metadata already exists for `(model, quant)` and `force` is false, the
/// cached descriptor is returned without touching the workspace.
pub fn run(
    root: &Path,
    source_path: &Path,
    force: bool,
) -> Result<IngestOutcome, DequantError> {
    let (model_name, quant) = parse_model_and_quant(source_path);

    if !force {
        if let Some(descriptor) = workspace_metadata::load(root, &model_name, &quant)? {
            return Ok(IngestOutcome {
                descriptor,
                dequantized: false,
            });
        }
    }

    let gguf = GgufFile::open(source_path)?;
    let source_size = std::fs::metadata(source_path)?.len();
    let capacity = source_size.saturating_mul(2).max(1 << 20);

    let model_dir = root.join(&model_name).join(&quant);
    let workspace_path = model_dir.join("workspace.bin");
    let workspace = Arc::new(Workspace::create(&workspace_path, capacity)?);

    let results: Vec<Result<TensorDescriptor, DequantError>> = gguf
        .tensors
        .par_iter()
        .map(|info| dequantize_one(&gguf, &workspace, info))
        .collect();

    let mut tensors = Vec::with_capacity(results.len());
    for r in results {
        tensors.push(r?);
    }

    workspace.sync()?;

    let arch_meta = crate::model::gguf::read_string_metadata(source_path, &["general.architecture"])?;
    let architecture = arch_meta.get("general.architecture").cloned().unwrap_or_default();
    let arch_keys = [
        format!("{architecture}.context_length"),
        format!("{architecture}.embedding_length"),
        format!("{architecture}.attention.head_count"),
        format!("{architecture}.vocab_size"),
    ];
    let arch_key_refs: Vec<&str> = arch_keys.iter().map(String::as_str).collect();
    let dims = crate::model::gguf::read_string_metadata(source_path, &arch_key_refs)?;
    let parse_u32 = |key: &str| dims.get(key).and_then(|v| v.parse::<u32>().ok()).unwrap_or(0);

    let num_layers = workspace_metadata::compute_num_layers(&tensors);

    let descriptor = ModelDescriptor {
        name: model_name.clone(),
        quant: quant.clone(),
        source_weights_path: source_path.to_string_lossy().to_string(),
        tensor_count: tensors.len(),
        total_size_bytes: tensors.iter().map(|t| t.size_bytes).sum(),
        workspace_path: workspace_path.to_string_lossy().to_string(),
        architecture,
        vocab_size: parse_u32(&arch_keys[3]),
        context_length: parse_u32(&arch_keys[0]),
        embedding_length: parse_u32(&arch_keys[1]),
        num_heads: parse_u32(&arch_keys[2]),
        num_layers,
        tensors,
    };

    workspace_metadata::save(root, &descriptor)?;

    Ok(IngestOutcome {
        descriptor,
        dequantized: true,
    })
}

fn dequantize_one(
    gguf: &GgufFile,
    workspace: &Workspace,
    info: &TensorInfo,
) -> Result<TensorDescriptor, DequantError> {
    let raw = gguf.read_tensor_bytes(info)?;
    let element_count = info.element_count() as usize;

    let values = formats::dequantize(info.ggml_type, &raw, element_count).ok_or_else(|| {
        DequantError::UnsupportedFormat {
            tensor: info.name.clone(),
        }
    })?;

    let byte_len = values.len() * std::mem::size_of::<f32>();
    let offset = workspace.allocate(&info.name, byte_len)?;
    workspace.write(offset, bytemuck::cast_slice(&values))?;
    layer::register_tensor(workspace, &info.name, offset, byte_len);

    Ok(TensorDescriptor {
        name: info.name.clone(),
        shape: info.dims.clone(),
        workspace_offset: offset,
        element_count: element_count as u64,
        size_bytes: byte_len as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_model_and_quant_recognizes_known_tokens() {
        let (name, quant) = parse_model_and_quant(Path::new("/models/llama3-8b.Q4_K_M.gguf"));
        assert_eq!(quant, "Q4_K_M");
        assert!(name.to_lowercase().contains("llama3-8b"));
    }

    #[test]
    fn test_parse_model_and_quant_falls_back_to_f32() {
        let (_, quant) = parse_model_and_quant(Path::new("/models/custom-model.gguf"));
        assert_eq!(quant, "F32");
    }
}
