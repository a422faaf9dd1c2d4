//! `InferenceBackend`: the narrow seam between model residency/caching
//! (this crate) and the transformer forward pass, sampler chains, and
//! tokenizer (the embedded inference engine).
//!
//! Tensor data for a loaded model lives in a memory-mapped workspace owned
//! by this crate; a backend never allocates or owns weight storage itself.
//! It builds a model "skeleton" (architecture + empty tensor slots), then
//! this crate fills each slot with a pointer via
//! [`InferenceBackend::set_external_tensor`].

use thiserror::Error;

use crate::inference::llama_ffi::{LlamaContext, LlamaModel, ModelParams, TokenId};

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("failed to open model skeleton: {0}")]
    SkeletonFailed(String),

    #[error("failed to bind tensor {0}")]
    TensorBindFailed(String),

    #[error("context creation failed: {0}")]
    ContextFailed(String),

    #[error("decode failed: {0}")]
    DecodeFailed(String),

    #[error("tokenization failed: {0}")]
    TokenizeFailed(String),

    #[error("sequence state error: {0}")]
    SequenceState(String),
}

/// Opaque handle to a loaded model skeleton.
pub struct ModelHandle(pub usize);

/// Opaque handle to a decode context bound to a model.
pub struct ContextHandle(pub usize);

#[derive(Debug, Clone, Copy, Default)]
pub struct SamplerParams {
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub min_p: f32,
    pub repeat_penalty: f32,
}

/// A single decode step's input: tokens, their sequence positions, the
/// sequence each belongs to (for batched multi-sequence decode), and a
/// mask selecting which positions need logits computed.
pub struct DecodeBatch<'a> {
    pub tokens: &'a [TokenId],
    pub positions: &'a [u32],
    pub sequence_ids: &'a [u32],
    pub logits_mask: &'a [bool],
}

/// The seam this crate calls into for everything transformer-shaped. A
/// model's weight tensors are never owned by an implementation of this
/// trait — they are bound in by `set_external_tensor` and remain owned by
/// this crate's workspace mapping for as long as the handle lives.
pub trait InferenceBackend: Send + Sync {
    /// Build a model's architecture (layer count, head config, vocab) from
    /// `path` without allocating any weight storage.
    fn open_model_skeleton(
        &self,
        path: &str,
        gpu_layers: u32,
        flash_attn: bool,
    ) -> Result<ModelHandle, BackendError>;

    /// Bind an F32 tensor pointer into a previously declared, unfilled
    /// tensor slot. `ptr`/`len` describe a borrow into this crate's
    /// workspace mapping that remains valid until `release_model`.
    fn set_external_tensor(
        &self,
        handle: &ModelHandle,
        name: &str,
        ptr: *const f32,
        len: usize,
    ) -> Result<(), BackendError>;

    /// The tensor names the skeleton declared and expects to be bound via
    /// `set_external_tensor` before the model is usable.
    fn declared_tensor_names(&self, handle: &ModelHandle) -> Vec<String>;

    fn release_model(&self, handle: ModelHandle);

    fn new_context(
        &self,
        handle: &ModelHandle,
        n_ctx: u32,
        n_batch: u32,
        n_threads: u32,
        flash_attn: bool,
    ) -> Result<ContextHandle, BackendError>;

    fn decode_batch(&self, ctx: &ContextHandle, batch: DecodeBatch<'_>) -> Result<(), BackendError>;

    fn sample(&self, ctx: &ContextHandle, params: SamplerParams) -> Result<TokenId, BackendError>;

    fn tokenize(
        &self,
        handle: &ModelHandle,
        text: &str,
        add_bos: bool,
        parse_special: bool,
    ) -> Result<Vec<TokenId>, BackendError>;

    fn token_to_piece(&self, handle: &ModelHandle, token: TokenId) -> Result<String, BackendError>;

    /// Serialize sequence `seq_id`'s KV-cache state out of the context, for
    /// persistence via [`crate::kv::store`].
    fn state_seq_get(&self, ctx: &ContextHandle, seq_id: u32) -> Result<Vec<u8>, BackendError>;

    /// Restore sequence `seq_id`'s KV-cache state into the context.
    fn state_seq_set(&self, ctx: &ContextHandle, seq_id: u32, bytes: &[u8]) -> Result<(), BackendError>;
}

/// Default backend: wraps the stub llama.cpp FFI layer, swapped out for a
/// real `llama.cpp` binding behind a compile-time feature once one lands.
pub struct StubBackend {
    next_id: std::sync::atomic::AtomicUsize,
    models: std::sync::Mutex<std::collections::HashMap<usize, LlamaModel>>,
    contexts: std::sync::Mutex<std::collections::HashMap<usize, LlamaContext>>,
}

impl Default for StubBackend {
    fn default() -> Self {
        Self {
            next_id: std::sync::atomic::AtomicUsize::new(1),
            models: std::sync::Mutex::new(std::collections::HashMap::new()),
            contexts: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_id(&self) -> usize {
        self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }
}

impl InferenceBackend for StubBackend {
    fn open_model_skeleton(
        &self,
        path: &str,
        gpu_layers: u32,
        _flash_attn: bool,
    ) -> Result<ModelHandle, BackendError> {
        let model = LlamaModel::load(
            path,
            ModelParams {
                n_gpu_layers: gpu_layers as i32,
                ..Default::default()
            },
        )
        .map_err(|e| BackendError::SkeletonFailed(e.to_string()))?;

        let id = self.alloc_id();
        self.models.lock().unwrap().insert(id, model);
        Ok(ModelHandle(id))
    }

    fn set_external_tensor(
        &self,
        _handle: &ModelHandle,
        _name: &str,
        _ptr: *const f32,
        _len: usize,
    ) -> Result<(), BackendError> {
        // The stub model has no real tensor storage to bind into; a real
        // backend would record the pointer in its tensor table here.
        Ok(())
    }

    fn declared_tensor_names(&self, handle: &ModelHandle) -> Vec<String> {
        let models = self.models.lock().unwrap();
        match models.get(&handle.0) {
            Some(model) => (0..model.n_layers)
                .flat_map(|layer| {
                    [
                        format!("blk.{layer}.attn_q.weight"),
                        format!("blk.{layer}.attn_k.weight"),
                        format!("blk.{layer}.attn_v.weight"),
                        format!("blk.{layer}.ffn_down.weight"),
                    ]
                })
                .chain(["token_embd.weight".to_string(), "output.weight".to_string()])
                .collect(),
            None => Vec::new(),
        }
    }

    fn release_model(&self, handle: ModelHandle) {
        self.models.lock().unwrap().remove(&handle.0);
    }

    fn new_context(
        &self,
        handle: &ModelHandle,
        n_ctx: u32,
        n_batch: u32,
        n_threads: u32,
        flash_attn: bool,
    ) -> Result<ContextHandle, BackendError> {
        let models = self.models.lock().unwrap();
        let model = models
            .get(&handle.0)
            .ok_or_else(|| BackendError::ContextFailed("unknown model handle".to_string()))?;
        let ctx = model
            .new_context(crate::inference::llama_ffi::ContextParams {
                n_ctx,
                n_batch,
                n_threads,
                flash_attn,
            })
            .map_err(|e| BackendError::ContextFailed(e.to_string()))?;

        let id = self.alloc_id();
        self.contexts.lock().unwrap().insert(id, ctx);
        Ok(ContextHandle(id))
    }

    fn decode_batch(&self, ctx: &ContextHandle, batch: DecodeBatch<'_>) -> Result<(), BackendError> {
        let mut contexts = self.contexts.lock().unwrap();
        let context = contexts
            .get_mut(&ctx.0)
            .ok_or_else(|| BackendError::DecodeFailed("unknown context handle".to_string()))?;
        context
            .decode(batch.tokens)
            .map_err(|e| BackendError::DecodeFailed(e.to_string()))
    }

    fn sample(&self, ctx: &ContextHandle, _params: SamplerParams) -> Result<TokenId, BackendError> {
        let contexts = self.contexts.lock().unwrap();
        let context = contexts
            .get(&ctx.0)
            .ok_or_else(|| BackendError::DecodeFailed("unknown context handle".to_string()))?;
        context.sample().map_err(|e| BackendError::DecodeFailed(e.to_string()))
    }

    fn tokenize(
        &self,
        handle: &ModelHandle,
        text: &str,
        add_bos: bool,
        _parse_special: bool,
    ) -> Result<Vec<TokenId>, BackendError> {
        let models = self.models.lock().unwrap();
        let model = models
            .get(&handle.0)
            .ok_or_else(|| BackendError::TokenizeFailed("unknown model handle".to_string()))?;
        model
            .tokenize(text, add_bos)
            .map_err(|e| BackendError::TokenizeFailed(e.to_string()))
    }

    fn token_to_piece(&self, handle: &ModelHandle, token: TokenId) -> Result<String, BackendError> {
        let models = self.models.lock().unwrap();
        let model = models
            .get(&handle.0)
            .ok_or_else(|| BackendError::TokenizeFailed("unknown model handle".to_string()))?;
        model
            .detokenize(&[token])
            .map_err(|e| BackendError::TokenizeFailed(e.to_string()))
    }

    fn state_seq_get(&self, ctx: &ContextHandle, _seq_id: u32) -> Result<Vec<u8>, BackendError> {
        let contexts = self.contexts.lock().unwrap();
        let context = contexts
            .get(&ctx.0)
            .ok_or_else(|| BackendError::SequenceState("unknown context handle".to_string()))?;
        // Stub serialization: position counter only. A real backend
        // serializes the full KV tensor state.
        Ok(context.kv_cache_used().to_le_bytes().to_vec())
    }

    fn state_seq_set(&self, ctx: &ContextHandle, _seq_id: u32, bytes: &[u8]) -> Result<(), BackendError> {
        let mut contexts = self.contexts.lock().unwrap();
        let context = contexts
            .get_mut(&ctx.0)
            .ok_or_else(|| BackendError::SequenceState("unknown context handle".to_string()))?;
        if bytes.len() != 8 {
            return Err(BackendError::SequenceState("malformed state bytes".to_string()));
        }
        context.kv_cache_clear();
        context.decode(&vec![0; usize::from_le_bytes(bytes.try_into().unwrap())])
            .map_err(|e| BackendError::SequenceState(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_backend_open_tokenize_decode() {
        let backend = StubBackend::new();
        let handle = backend.open_model_skeleton("test.gguf", 32, true).unwrap();
        let names = backend.declared_tensor_names(&handle);
        assert!(names.iter().any(|n| n.starts_with("blk.0.")));

        let ctx = backend.new_context(&handle, 4096, 512, 4, true).unwrap();
        let tokens = backend.tokenize(&handle, "hello world", true, false).unwrap();
        backend
            .decode_batch(
                &ctx,
                DecodeBatch {
                    tokens: &tokens,
                    positions: &[],
                    sequence_ids: &[],
                    logits_mask: &[],
                },
            )
            .unwrap();

        let token = backend.sample(&ctx, SamplerParams::default()).unwrap();
        assert!(backend.token_to_piece(&handle, token).is_ok());
    }

    #[test]
    fn test_state_seq_round_trip() {
        let backend = StubBackend::new();
        let handle = backend.open_model_skeleton("test.gguf", 32, true).unwrap();
        let ctx = backend.new_context(&handle, 4096, 512, 4, true).unwrap();
        backend
            .decode_batch(
                &ctx,
                DecodeBatch {
                    tokens: &[1, 2, 3],
                    positions: &[],
                    sequence_ids: &[],
                    logits_mask: &[],
                },
            )
            .unwrap();

        let bytes = backend.state_seq_get(&ctx, 0).unwrap();
        backend.state_seq_set(&ctx, 0, &bytes).unwrap();
    }
}
