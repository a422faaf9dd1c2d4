//! OpenAI-compatible HTTP API.
//!
//! Implements the subset of the OpenAI API needed for LLM inference:
//! - POST /v1/chat/completions
//! - POST /v1/completions
//! - GET /v1/models
//! - GET /health

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio_stream::StreamExt;
use tracing::info;
use uuid::Uuid;

use crate::cache::pager::SharedPager;
use crate::config::Config;
use crate::inference::backend::{ContextHandle, InferenceBackend, ModelHandle};
use crate::inference::engine::{GenerationEvent, GenerationRequest, InferenceEngine};
use crate::kv::context_manager::ContextManager;
use crate::kv::store::CacheStore;
use crate::model::bridge::{GpuConfig, ModelBridge};
use crate::model::registry::ModelRegistry;
use crate::server::streaming::generation_to_sse_stream;
use crate::tiered::allocator::TieredMemoryAllocator;

/// Application state shared across handlers.
pub struct AppState {
    pub engine: RwLock<InferenceEngine>,
    pub config: Arc<Config>,
    pub pager: SharedPager,
    pub start_time: Instant,

    pub registry: Arc<ModelRegistry>,
    pub bridge: Arc<ModelBridge>,
    pub context_manager: Arc<ContextManager>,
    pub allocator: Arc<TieredMemoryAllocator>,
    pub cache_store: Arc<dyn CacheStore>,
    pub backend: Arc<dyn InferenceBackend>,

    /// Lazily-opened skeleton/context pair per model, used by `/v1/context`
    /// routes. Keyed by model name.
    pub backend_contexts: AsyncMutex<HashMap<String, (ModelHandle, ContextHandle)>>,
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/models", get(list_models))
        .route("/health", get(health))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/v1/models/load", post(load_model))
        .route("/v1/models/:name/switch", post(switch_model))
        .route("/v1/models/:name", delete(unload_model))
        .route("/v1/models/:name/info", get(model_info))
        .route("/v1/context", post(ingest_context))
        .route("/v1/context/:id", get(get_context_info))
        .route("/v1/context/:id", delete(remove_context))
        .route("/v1/context/:id/query", post(query_context))
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

/// Chat completion request (OpenAI-compatible).
#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

fn default_max_tokens() -> usize {
    2048
}
fn default_temperature() -> f64 {
    0.7
}
fn default_top_p() -> f64 {
    0.9
}

/// Chat completion response (non-streaming).
#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct ChatChoice {
    pub index: usize,
    pub message: ChatMessage,
    pub finish_reason: String,
}

/// Completion request (non-chat).
#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Serialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct CompletionChoice {
    pub index: usize,
    pub text: String,
    pub finish_reason: String,
}

#[derive(Debug, Serialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// Model listing response.
#[derive(Debug, Serialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub owned_by: String,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cache: CacheStatsResponse,
}

/// Cache statistics response.
#[derive(Debug, Serialize)]
pub struct CacheStatsResponse {
    pub total_blocks: usize,
    pub total_sequences: usize,
    pub tiers: Vec<TierStatsResponse>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tiered_allocator: Vec<AllocatorTierStatsResponse>,
}

#[derive(Debug, Serialize)]
pub struct TierStatsResponse {
    pub name: String,
    pub block_count: usize,
    pub bytes_used: usize,
    pub capacity: usize,
    pub utilization: f64,
}

/// Per-tier stats for the model/context-cache allocator ([`TieredMemoryAllocator`]),
/// separate from the KV pager's own [`TierStatsResponse`] tiers.
#[derive(Debug, Serialize)]
pub struct AllocatorTierStatsResponse {
    pub name: String,
    pub capacity: usize,
    pub used: usize,
    pub hits: u64,
    pub promotions: u64,
    pub demotions: u64,
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatCompletionRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let request_id = Uuid::new_v4().to_string();

    info!(
        request_id = request_id,
        model = req.model,
        messages = req.messages.len(),
        stream = req.stream,
        "Chat completion request"
    );

    // Concatenate messages into a prompt string for tokenization.
    let prompt = req
        .messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n");

    // Stub tokenization: ~1 token per 4 chars.
    let prompt_tokens: Vec<i32> = (0..(prompt.len() / 4).max(1) as i32).collect();
    let prompt_token_count = prompt_tokens.len();

    let gen_request = GenerationRequest {
        request_id: request_id.clone(),
        prompt_tokens,
        max_tokens: req.max_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        stop_tokens: vec![],
    };

    if req.stream {
        // Streaming response via SSE.
        let mut engine = state.engine.write().await;
        let rx = engine.generate(gen_request).await;
        let stream = generation_to_sse_stream(rx, request_id.clone(), req.model.clone());
        Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response())
    } else {
        // Non-streaming: collect all tokens.
        let mut engine = state.engine.write().await;
        let mut rx = engine.generate(gen_request).await;

        let mut text = String::new();
        let mut completion_tokens = 0;

        while let Some(event) = rx.recv().await {
            match event {
                GenerationEvent::Token { text: t, .. } => {
                    text.push_str(&t);
                    completion_tokens += 1;
                }
                GenerationEvent::Done { .. } => break,
                GenerationEvent::Error(e) => {
                    return Err(StatusCode::INTERNAL_SERVER_ERROR);
                }
            }
        }

        let response = ChatCompletionResponse {
            id: format!("chatcmpl-{request_id}"),
            object: "chat.completion".to_string(),
            created: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_secs(),
            model: req.model,
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage {
                    role: "assistant".to_string(),
                    content: text,
                },
                finish_reason: "stop".to_string(),
            }],
            usage: Usage {
                prompt_tokens: prompt_token_count,
                completion_tokens,
                total_tokens: prompt_token_count + completion_tokens,
            },
        };

        Ok(Json(response).into_response())
    }
}

async fn completions(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CompletionRequest>,
) -> Result<Json<CompletionResponse>, StatusCode> {
    let request_id = Uuid::new_v4().to_string();

    let prompt_tokens: Vec<i32> = (0..(req.prompt.len() / 4).max(1) as i32).collect();
    let prompt_token_count = prompt_tokens.len();

    let gen_request = GenerationRequest {
        request_id: request_id.clone(),
        prompt_tokens,
        max_tokens: req.max_tokens,
        temperature: req.temperature,
        top_p: 1.0,
        stop_tokens: vec![],
    };

    let mut engine = state.engine.write().await;
    let mut rx = engine.generate(gen_request).await;

    let mut text = String::new();
    let mut completion_tokens = 0;

    while let Some(event) = rx.recv().await {
        match event {
            GenerationEvent::Token { text: t, .. } => {
                text.push_str(&t);
                completion_tokens += 1;
            }
            GenerationEvent::Done { .. } => break,
            GenerationEvent::Error(_) => return Err(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    Ok(Json(CompletionResponse {
        id: format!("cmpl-{request_id}"),
        object: "text_completion".to_string(),
        created: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs(),
        model: req.model,
        choices: vec![CompletionChoice {
            index: 0,
            text,
            finish_reason: "stop".to_string(),
        }],
        usage: Usage {
            prompt_tokens: prompt_token_count,
            completion_tokens,
            total_tokens: prompt_token_count + completion_tokens,
        },
    }))
}

async fn list_models(
    State(state): State<Arc<AppState>>,
) -> Json<ModelList> {
    Json(ModelList {
        object: "list".to_string(),
        data: vec![ModelInfo {
            id: state.config.model.model_path.display().to_string(),
            object: "model".to_string(),
            created: 0,
            owned_by: "local".to_string(),
        }],
    })
}

async fn health(
    State(state): State<Arc<AppState>>,
) -> Json<HealthResponse> {
    let pager = state.pager.read().await;
    let tier_stats: Vec<TierStatsResponse> = pager
        .tier_stats()
        .iter()
        .map(|(tier, stats)| TierStatsResponse {
            name: tier.to_string(),
            block_count: stats.block_count,
            bytes_used: stats.bytes_used,
            capacity: stats.capacity,
            utilization: stats.usage_fraction(),
        })
        .collect();

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        cache: CacheStatsResponse {
            total_blocks: pager.total_blocks(),
            total_sequences: pager.total_sequences(),
            tiers: tier_stats,
            tiered_allocator: allocator_tier_stats(&state),
        },
    })
}

async fn cache_stats(
    State(state): State<Arc<AppState>>,
) -> Json<CacheStatsResponse> {
    let pager = state.pager.read().await;
    let tier_stats: Vec<TierStatsResponse> = pager
        .tier_stats()
        .iter()
        .map(|(tier, stats)| TierStatsResponse {
            name: tier.to_string(),
            block_count: stats.block_count,
            bytes_used: stats.bytes_used,
            capacity: stats.capacity,
            utilization: stats.usage_fraction(),
        })
        .collect();

    Json(CacheStatsResponse {
        total_blocks: pager.total_blocks(),
        total_sequences: pager.total_sequences(),
        tiers: tier_stats,
        tiered_allocator: allocator_tier_stats(&state),
    })
}

fn allocator_tier_stats(state: &Arc<AppState>) -> Vec<AllocatorTierStatsResponse> {
    const NAMES: [&str; 3] = ["vram", "cpu", "ssd"];
    state
        .allocator
        .stats()
        .iter()
        .zip(NAMES)
        .map(|(stats, name)| AllocatorTierStatsResponse {
            name: name.to_string(),
            capacity: stats.capacity,
            used: stats.used,
            hits: stats.hits,
            promotions: stats.promotions,
            demotions: stats.demotions,
        })
        .collect()
}

// ─── Model Lifecycle Types/Handlers ────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LoadModelRequest {
    pub name: String,
    pub source_path: PathBuf,
    #[serde(default)]
    pub gpu_layers: Option<u32>,
    #[serde(default)]
    pub force_reload: bool,
}

#[derive(Debug, Serialize)]
pub struct ModelInfoResponse {
    pub name: String,
    pub state: String,
    pub vram_used_mb: u64,
    pub gpu_layers: u32,
    pub num_layers: u32,
    pub is_active: bool,
}

async fn load_model(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoadModelRequest>,
) -> Result<StatusCode, StatusCode> {
    let gpu_config = GpuConfig {
        explicit_gpu_layers: req.gpu_layers,
        vram_budget_mb: state.config.registry.vram_budget_mb,
        flash_attn: state.config.registry.flash_attn,
    };

    state
        .bridge
        .load(&req.name, &req.source_path, gpu_config, req.force_reload)
        .map_err(|e| {
            tracing::warn!(model = req.name, error = %e, "model load failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(StatusCode::OK)
}

async fn switch_model(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Result<StatusCode, StatusCode> {
    state
        .bridge
        .switch_active(&name)
        .map_err(|_| StatusCode::NOT_FOUND)?;
    Ok(StatusCode::OK)
}

async fn unload_model(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Result<StatusCode, StatusCode> {
    state
        .bridge
        .unload(&name)
        .map_err(|_| StatusCode::NOT_FOUND)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn model_info(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Result<Json<ModelInfoResponse>, StatusCode> {
    let snapshot = state
        .registry
        .model_info(&name)
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(ModelInfoResponse {
        name,
        state: format!("{:?}", snapshot.state),
        vram_used_mb: snapshot.vram_used_mb,
        gpu_layers: snapshot.gpu_layers,
        num_layers: snapshot.num_layers,
        is_active: snapshot.is_active,
    }))
}

// ─── Context Manager Types/Handlers ────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct IngestContextRequest {
    pub model_id: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct ContextInfoResponse {
    pub id: String,
    pub model_id: String,
    pub tier: String,
    pub ttl_secs: u64,
    pub created_at: u64,
    pub last_accessed: u64,
    pub access_count: u64,
    pub byte_size: u64,
    pub num_tokens: usize,
}

impl From<crate::kv::context_manager::ContextInfo> for ContextInfoResponse {
    fn from(info: crate::kv::context_manager::ContextInfo) -> Self {
        Self {
            id: info.id,
            model_id: info.model_id,
            tier: format!("{:?}", info.tier),
            ttl_secs: info.ttl_secs,
            created_at: info.created_at,
            last_accessed: info.last_accessed,
            access_count: info.access_count,
            byte_size: info.byte_size,
            num_tokens: info.num_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct QueryContextRequest {
    pub query: String,
}

#[derive(Debug, Serialize)]
pub struct QueryContextResponse {
    pub tokens: Vec<String>,
}

/// Returns (or lazily opens) the model skeleton + decode context this
/// model's ingest/query calls run against.
async fn backend_context_for(
    state: &Arc<AppState>,
    model_id: &str,
) -> Result<(), StatusCode> {
    let mut contexts = state.backend_contexts.lock().await;
    if contexts.contains_key(model_id) {
        return Ok(());
    }
    let handle = state
        .backend
        .open_model_skeleton(model_id, 0, false)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let ctx = state
        .backend
        .new_context(&handle, state.config.model.context_size as u32, 512, 4, false)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    contexts.insert(model_id.to_string(), (handle, ctx));
    Ok(())
}

async fn ingest_context(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IngestContextRequest>,
) -> Result<Json<ContextInfoResponse>, StatusCode> {
    backend_context_for(&state, &req.model_id).await?;
    let contexts = state.backend_contexts.lock().await;
    let (handle, ctx) = contexts.get(&req.model_id).unwrap();

    let info = state
        .context_manager
        .ingest(&req.model_id, handle, ctx, &req.content)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(info.into()))
}

async fn get_context_info(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<ContextInfoResponse>, StatusCode> {
    state
        .context_manager
        .get_info(&id)
        .map(|info| Json(info.into()))
        .ok_or(StatusCode::NOT_FOUND)
}

async fn remove_context(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<StatusCode, StatusCode> {
    let removed = state
        .context_manager
        .remove(&id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn query_context(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Json(req): Json<QueryContextRequest>,
) -> Result<Json<QueryContextResponse>, StatusCode> {
    let model_id = state
        .context_manager
        .get_info(&id)
        .ok_or(StatusCode::NOT_FOUND)?
        .model_id;

    backend_context_for(&state, &model_id).await?;
    let contexts = state.backend_contexts.lock().await;
    let (handle, ctx) = contexts.get(&model_id).unwrap();

    let tokens = state
        .context_manager
        .query(&id, handle, ctx, &req.query)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(QueryContextResponse { tokens }))
}
