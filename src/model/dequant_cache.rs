//! Per-model tensor catalog: maps a tensor name to its location inside that
//! model's workspace, backing [`Workspace::read_pointer`] lookups for the
//! registry's bind step.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::model::workspace_metadata::ModelDescriptor;
use crate::workspace::file::{Workspace, WorkspaceError};

#[derive(Error, Debug)]
pub enum DequantCacheError {
    #[error("model {0} is not registered")]
    ModelNotRegistered(String),

    #[error("tensor {tensor} not found in model {model}")]
    TensorNotFound { model: String, tensor: String },

    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),
}

#[derive(Debug, Clone)]
pub struct TensorLocation {
    pub offset: u64,
    pub element_count: u64,
    pub shape: Vec<u64>,
}

struct ModelEntry {
    workspace: Arc<Workspace>,
    tensors: HashMap<String, TensorLocation>,
}

/// Catalog of every registered model's tensor locations, keyed by model
/// name. One workspace per model; the catalog never outlives the
/// workspaces it indexes because it holds `Arc` handles to them.
#[derive(Default)]
pub struct DequantCache {
    models: std::sync::RwLock<HashMap<String, ModelEntry>>,
}

impl DequantCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model's descriptor and the workspace backing it. Replaces
    /// any prior registration for the same model name.
    pub fn register_model(&self, descriptor: &ModelDescriptor, workspace: Arc<Workspace>) {
        let tensors = descriptor
            .tensors
            .iter()
            .map(|t| {
                (
                    t.name.clone(),
                    TensorLocation {
                        offset: t.workspace_offset,
                        element_count: t.element_count,
                        shape: t.shape.clone(),
                    },
                )
            })
            .collect();

        self.models
            .write()
            .unwrap()
            .insert(descriptor.name.clone(), ModelEntry { workspace, tensors });
    }

    pub fn unregister_model(&self, model: &str) {
        self.models.write().unwrap().remove(model);
    }

    /// Resolve a tensor to an F32 slice borrowed from the model's workspace
    /// mapping.
    pub fn get_tensor(&self, model: &str, tensor: &str) -> Result<Vec<f32>, DequantCacheError> {
        let models = self.models.read().unwrap();
        let entry = models
            .get(model)
            .ok_or_else(|| DequantCacheError::ModelNotRegistered(model.to_string()))?;
        let loc = entry
            .tensors
            .get(tensor)
            .ok_or_else(|| DequantCacheError::TensorNotFound {
                model: model.to_string(),
                tensor: tensor.to_string(),
            })?;
        let slice = entry
            .workspace
            .read_pointer(loc.offset, loc.element_count as usize)?;
        Ok(slice.to_vec())
    }

    pub fn get_tensor_info(
        &self,
        model: &str,
        tensor: &str,
    ) -> Result<TensorLocation, DequantCacheError> {
        let models = self.models.read().unwrap();
        let entry = models
            .get(model)
            .ok_or_else(|| DequantCacheError::ModelNotRegistered(model.to_string()))?;
        entry
            .tensors
            .get(tensor)
            .cloned()
            .ok_or_else(|| DequantCacheError::TensorNotFound {
                model: model.to_string(),
                tensor: tensor.to_string(),
            })
    }

    pub fn tensor_names(&self, model: &str) -> Vec<String> {
        self.models
            .read()
            .unwrap()
            .get(model)
            .map(|e| e.tensors.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::workspace_metadata::TensorDescriptor;
    use tempfile::TempDir;

    fn descriptor_with_one_tensor() -> ModelDescriptor {
        ModelDescriptor {
            name: "m1".to_string(),
            quant: "Q8_0".to_string(),
            source_weights_path: "x".to_string(),
            tensor_count: 1,
            total_size_bytes: 16,
            workspace_path: "x".to_string(),
            architecture: "llama".to_string(),
            vocab_size: 0,
            context_length: 0,
            embedding_length: 0,
            num_heads: 0,
            num_layers: 1,
            tensors: vec![TensorDescriptor {
                name: "token_embd.weight".to_string(),
                shape: vec![4],
                workspace_offset: 0,
                element_count: 4,
                size_bytes: 16,
            }],
        }
    }

    #[test]
    fn test_register_then_get_tensor() {
        let tmp = TempDir::new().unwrap();
        let ws = Arc::new(Workspace::create(tmp.path().join("ws.bin"), 4096).unwrap());
        let values: [f32; 4] = [1.0, 2.0, 3.0, 4.0];
        let offset = ws.allocate("token_embd.weight", 16).unwrap();
        ws.write(offset, bytemuck::cast_slice(&values)).unwrap();

        let mut descriptor = descriptor_with_one_tensor();
        descriptor.tensors[0].workspace_offset = offset;

        let cache = DequantCache::new();
        cache.register_model(&descriptor, ws);

        let tensor = cache.get_tensor("m1", "token_embd.weight").unwrap();
        assert_eq!(tensor, values);
    }

    #[test]
    fn test_unregistered_model_errors() {
        let cache = DequantCache::new();
        let err = cache.get_tensor("absent", "x").unwrap_err();
        assert!(matches!(err, DequantCacheError::ModelNotRegistered(_)));
    }

    #[test]
    fn test_unknown_tensor_errors() {
        let tmp = TempDir::new().unwrap();
        let ws = Arc::new(Workspace::create(tmp.path().join("ws.bin"), 4096).unwrap());
        let descriptor = descriptor_with_one_tensor();
        let cache = DequantCache::new();
        cache.register_model(&descriptor, ws);

        let err = cache.get_tensor("m1", "nonexistent").unwrap_err();
        assert!(matches!(err, DequantCacheError::TensorNotFound { .. }));
    }
}
