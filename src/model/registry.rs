//! Model lifecycle: tracks every known model's residency state, owns the
//! "current" model pointer for generation, and runs VRAM-budget eviction
//! when loading a new model would overflow the budget.
//!
//! Lock order here is always Registry first — callers that also touch
//! [`crate::cache::hot::HotCache`] or a [`crate::workspace::file::Workspace`]
//! must acquire those after releasing the registry's lock.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;
use tracing::{info, warn};

use crate::workspace::file::WorkspaceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Absent,
    Ingesting,
    Cached,
    Binding,
    Resident,
    Evicted,
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("model {0} not found")]
    NotFound(String),

    #[error("invalid state transition for {model}: {from:?} -> {to:?}")]
    InvalidState {
        model: String,
        from: ModelState,
        to: ModelState,
    },

    #[error("VRAM budget exceeded: {0}")]
    Vram(String),

    #[error("inference backend error: {0}")]
    Backend(String),

    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),
}

struct ModelRecord {
    state: ModelState,
    vram_used_mb: u64,
    /// Monotonic LRU touch counter; lower is colder.
    last_touch: u64,
    gpu_layers: u32,
    num_layers: u32,
}

struct RegistryInner {
    models: HashMap<String, ModelRecord>,
    current_model: Option<String>,
    vram_budget_mb: u64,
    vram_used_mb: u64,
    touch_clock: u64,
}

/// Tracks per-model residency and VRAM accounting. Does not itself own
/// workspaces, tensor catalogs, or backend handles — see
/// [`crate::model::bridge::ModelBridge`] for load/unload orchestration that
/// ties this state machine to those collaborators.
pub struct ModelRegistry {
    inner: Mutex<RegistryInner>,
}

impl ModelRegistry {
    pub fn new(vram_budget_mb: u64) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                models: HashMap::new(),
                current_model: None,
                vram_budget_mb,
                vram_used_mb: 0,
                touch_clock: 0,
            }),
        }
    }

    pub fn state(&self, model: &str) -> ModelState {
        self.inner
            .lock()
            .unwrap()
            .models
            .get(model)
            .map(|r| r.state)
            .unwrap_or(ModelState::Absent)
    }

    fn transition(
        &self,
        model: &str,
        to: ModelState,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        let from = inner
            .models
            .get(model)
            .map(|r| r.state)
            .unwrap_or(ModelState::Absent);

        let valid = matches!(
            (from, to),
            (ModelState::Absent, ModelState::Ingesting)
                | (ModelState::Ingesting, ModelState::Cached)
                | (ModelState::Cached, ModelState::Binding)
                | (ModelState::Binding, ModelState::Resident)
                | (ModelState::Resident, ModelState::Evicted)
                | (ModelState::Evicted, ModelState::Binding)
        );
        if !valid {
            return Err(RegistryError::InvalidState {
                model: model.to_string(),
                from,
                to,
            });
        }

        inner
            .models
            .entry(model.to_string())
            .or_insert_with(|| ModelRecord {
                state: ModelState::Absent,
                vram_used_mb: 0,
                last_touch: 0,
                gpu_layers: 0,
                num_layers: 0,
            })
            .state = to;
        Ok(())
    }

    pub fn begin_ingest(&self, model: &str) -> Result<(), RegistryError> {
        self.transition(model, ModelState::Ingesting)
    }

    pub fn mark_cached(&self, model: &str) -> Result<(), RegistryError> {
        self.transition(model, ModelState::Cached)
    }

    pub fn begin_bind(&self, model: &str) -> Result<(), RegistryError> {
        self.transition(model, ModelState::Binding)
    }

    /// Finish binding: record VRAM usage and touch LRU. Callers must have
    /// already run VRAM eviction via [`Self::reserve_vram`] before this.
    pub fn mark_resident(
        &self,
        model: &str,
        vram_used_mb: u64,
        gpu_layers: u32,
        num_layers: u32,
    ) -> Result<(), RegistryError> {
        self.transition(model, ModelState::Resident)?;
        let mut inner = self.inner.lock().unwrap();
        inner.touch_clock += 1;
        let touch = inner.touch_clock;
        if let Some(record) = inner.models.get_mut(model) {
            record.vram_used_mb = vram_used_mb;
            record.last_touch = touch;
            record.gpu_layers = gpu_layers;
            record.num_layers = num_layers;
        }
        if inner.current_model.is_none() {
            inner.current_model = Some(model.to_string());
        }
        Ok(())
    }

    pub fn mark_evicted(&self, model: &str) -> Result<(), RegistryError> {
        self.transition(model, ModelState::Evicted)?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.models.get_mut(model) {
            inner.vram_used_mb = inner.vram_used_mb.saturating_sub(record.vram_used_mb);
            record.vram_used_mb = 0;
        }
        Ok(())
    }

    /// Touch a resident model's LRU clock (called on every load/switch of
    /// an already-resident model).
    pub fn touch(&self, model: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.touch_clock += 1;
        let touch = inner.touch_clock;
        if let Some(record) = inner.models.get_mut(model) {
            record.last_touch = touch;
        }
    }

    /// O(1) swap of the active generation target. Does not touch tensors.
    pub fn switch_active(&self, model: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.models.get(model).map(|r| r.state) {
            Some(ModelState::Resident) => {
                inner.current_model = Some(model.to_string());
                Ok(())
            }
            Some(other) => Err(RegistryError::InvalidState {
                model: model.to_string(),
                from: other,
                to: ModelState::Resident,
            }),
            None => Err(RegistryError::NotFound(model.to_string())),
        }
    }

    pub fn current_model(&self) -> Option<String> {
        self.inner.lock().unwrap().current_model.clone()
    }

    /// Ensure `need_mb` additional VRAM is available, evicting
    /// least-recently-touched *non-active* resident models (repeatedly)
    /// until it fits. Returns the list of models evicted. The currently
    /// active model is never a candidate.
    pub fn reserve_vram(&self, need_mb: u64) -> Result<Vec<String>, RegistryError> {
        let mut evicted = Vec::new();
        loop {
            let mut inner = self.inner.lock().unwrap();
            if inner.vram_used_mb + need_mb <= inner.vram_budget_mb {
                inner.vram_used_mb += need_mb;
                return Ok(evicted);
            }

            let current = inner.current_model.clone();
            let victim = inner
                .models
                .iter()
                .filter(|(name, r)| r.state == ModelState::Resident && Some((*name).clone()) != current)
                .min_by_key(|(_, r)| r.last_touch)
                .map(|(name, _)| name.clone());

            match victim {
                Some(name) => {
                    if let Some(record) = inner.models.get_mut(&name) {
                        inner.vram_used_mb = inner.vram_used_mb.saturating_sub(record.vram_used_mb);
                        record.vram_used_mb = 0;
                        record.state = ModelState::Evicted;
                    }
                    drop(inner);
                    warn!(model = %name, "evicting model to free VRAM");
                    evicted.push(name);
                }
                None => {
                    drop(inner);
                    return Err(RegistryError::Vram(format!(
                        "need {need_mb}MB but no evictable model remains"
                    )));
                }
            }
        }
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.lock().unwrap();
        RegistryStats {
            vram_budget_mb: inner.vram_budget_mb,
            vram_used_mb: inner.vram_used_mb,
            resident_models: inner
                .models
                .iter()
                .filter(|(_, r)| r.state == ModelState::Resident)
                .count(),
        }
    }

    pub fn model_info(&self, model: &str) -> Option<ModelInfoSnapshot> {
        let inner = self.inner.lock().unwrap();
        inner.models.get(model).map(|r| ModelInfoSnapshot {
            state: r.state,
            vram_used_mb: r.vram_used_mb,
            gpu_layers: r.gpu_layers,
            num_layers: r.num_layers,
            is_active: inner.current_model.as_deref() == Some(model),
        })
    }

    pub fn list_models(&self) -> Vec<String> {
        self.inner.lock().unwrap().models.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ModelInfoSnapshot {
    pub state: ModelState,
    pub vram_used_mb: u64,
    pub gpu_layers: u32,
    pub num_layers: u32,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct RegistryStats {
    pub vram_budget_mb: u64,
    pub vram_used_mb: u64,
    pub resident_models: usize,
}

/// GPU offload layer count for a model of estimated size `model_size_mb`
/// against `vram_budget_mb`, given `num_layers` total transformer blocks.
/// `explicit_layers` (from user config) takes precedence over the formula.
pub fn gpu_offload_layers(
    vram_budget_mb: u64,
    model_size_mb: u64,
    num_layers: u32,
    explicit_layers: Option<u32>,
) -> u32 {
    if let Some(explicit) = explicit_layers {
        return explicit.min(num_layers);
    }

    let budget = vram_budget_mb as f64;
    let size = model_size_mb.max(1) as f64;

    if size < 0.8 * budget {
        return num_layers;
    }

    let raw = (32.0 * (0.85 * budget / size)).max(8.0);
    let lower = (0.3 * num_layers as f64).ceil() as u32;
    let upper = num_layers;
    (raw as u32).clamp(lower.min(upper), upper)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_happy_path() {
        let registry = ModelRegistry::new(8192);
        assert_eq!(registry.state("m1"), ModelState::Absent);

        registry.begin_ingest("m1").unwrap();
        registry.mark_cached("m1").unwrap();
        registry.begin_bind("m1").unwrap();
        registry.reserve_vram(100).unwrap();
        registry.mark_resident("m1", 100, 32, 32).unwrap();

        assert_eq!(registry.state("m1"), ModelState::Resident);
        assert_eq!(registry.current_model().as_deref(), Some("m1"));
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let registry = ModelRegistry::new(8192);
        let err = registry.mark_resident("m1", 10, 1, 1).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidState { .. }));
    }

    #[test]
    fn test_switch_active_requires_resident() {
        let registry = ModelRegistry::new(8192);
        registry.begin_ingest("m1").unwrap();
        let err = registry.switch_active("m1").unwrap_err();
        assert!(matches!(err, RegistryError::InvalidState { .. }));
    }

    #[test]
    fn test_reserve_vram_evicts_lru_not_active() {
        let registry = ModelRegistry::new(150);

        for name in ["a", "b"] {
            registry.begin_ingest(name).unwrap();
            registry.mark_cached(name).unwrap();
            registry.begin_bind(name).unwrap();
            registry.reserve_vram(100).unwrap();
            registry.mark_resident(name, 100, 32, 32).unwrap();
        }
        // "a" loaded first and never re-touched; "b" is current (active).
        registry.switch_active("b").unwrap();

        registry.begin_ingest("c").unwrap();
        registry.mark_cached("c").unwrap();
        registry.begin_bind("c").unwrap();
        let evicted = registry.reserve_vram(100).unwrap();

        assert_eq!(evicted, vec!["a".to_string()]);
        assert_eq!(registry.state("b"), ModelState::Resident);
    }

    #[test]
    fn test_gpu_offload_all_layers_when_model_small() {
        let layers = gpu_offload_layers(16_000, 5_000, 32, None);
        assert_eq!(layers, 32);
    }

    #[test]
    fn test_gpu_offload_explicit_overrides_formula() {
        let layers = gpu_offload_layers(16_000, 20_000, 32, Some(10));
        assert_eq!(layers, 10);
    }

    #[test]
    fn test_gpu_offload_formula_clamped_to_range() {
        let layers = gpu_offload_layers(8_000, 40_000, 32, None);
        assert!(layers >= (0.3 * 32.0).ceil() as u32);
        assert!(layers <= 32);
    }
}
