//! ResourceTracker — accelerator memory budget and loaded-model registry
//!
//! The tracker is the single owner of what the control plane believes is
//! resident on the local accelerator. It answers admission and eviction
//! queries and records state transitions reported by the worker loop. It
//! never unloads anything itself: callers act on the candidates it returns
//! and then report back through [`ResourceTracker::mark_unloaded`].
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ ResourceTracker                          │
//! │   Mutex<Inner>                           │
//! │     budget_mb = total_mb × pct / 100     │
//! │     used_mb   = Σ loaded vram            │
//! │     models    = { id → ModelRecord }     │
//! └──────────────────────────────────────────┘
//! ```
//!
//! All state lives behind one mutex so `mark_loaded`, `mark_unloaded` and
//! `can_accommodate` are linearizable and no query observes a torn update.

use crate::config::validate_budget_percentage;
use crate::error::{ControlPlaneError, ControlPlaneResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Load status of a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Loaded,
    Unloaded,
}

/// A model resident on the accelerator
#[derive(Debug, Clone)]
pub struct ModelRecord {
    pub model_id: String,
    pub vram_usage_mb: f64,
    pub last_used_at: Instant,
    /// Wall-clock load time, for reporting only
    pub loaded_at: DateTime<Utc>,
    pub status: ModelStatus,
}

/// Outcome of an eviction query
#[derive(Debug, Clone, PartialEq)]
pub enum EvictionPlan {
    /// The request already fits in free budget
    NotNeeded,
    /// Unload these models, least recently used first
    Evict(Vec<String>),
    /// Evicting every loaded model would still not free enough
    Insufficient { shortfall_mb: f64, reclaimable_mb: f64 },
}

impl EvictionPlan {
    /// Models to unload; empty for both `NotNeeded` and `Insufficient`
    pub fn candidates(&self) -> Vec<String> {
        match self {
            Self::Evict(ids) => ids.clone(),
            _ => Vec::new(),
        }
    }
}

/// Serializable view of one loaded model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadedModel {
    pub model_id: String,
    pub vram_mb: f64,
    pub idle_secs: u64,
    pub loaded_at: DateTime<Utc>,
}

/// Point-in-time view of the tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub total_mb: f64,
    pub budget_percentage: f64,
    pub budget_mb: f64,
    pub used_mb: f64,
    /// Least recently used first
    pub loaded: Vec<LoadedModel>,
}

impl ResourceSnapshot {
    pub fn free_mb(&self) -> f64 {
        self.budget_mb - self.used_mb
    }
}

#[derive(Debug)]
struct Inner {
    models: HashMap<String, ModelRecord>,
    used_mb: f64,
    total_mb: f64,
    budget_percentage: f64,
    budget_mb: f64,
}

impl Inner {
    fn recompute_budget(&mut self) {
        self.budget_mb = self.total_mb * self.budget_percentage / 100.0;
    }

    fn free_mb(&self) -> f64 {
        self.budget_mb - self.used_mb
    }

    /// Loaded models, least recently used first; ties by id
    fn lru_order(&self) -> Vec<&ModelRecord> {
        let mut records: Vec<&ModelRecord> = self.models.values().collect();
        records.sort_by(|a, b| {
            a.last_used_at
                .cmp(&b.last_used_at)
                .then_with(|| a.model_id.cmp(&b.model_id))
        });
        records
    }
}

/// Thread-safe accelerator memory tracker
#[derive(Debug)]
pub struct ResourceTracker {
    inner: Mutex<Inner>,
}

impl ResourceTracker {
    /// Create a tracker over `total_mb` of accelerator memory, of which
    /// `budget_percentage` may be used for model residency.
    pub fn new(total_mb: f64, budget_percentage: f64) -> ControlPlaneResult<Self> {
        validate_budget_percentage(budget_percentage)?;
        validate_mb("total_mb", total_mb)?;
        let mut inner = Inner {
            models: HashMap::new(),
            used_mb: 0.0,
            total_mb,
            budget_percentage,
            budget_mb: 0.0,
        };
        inner.recompute_budget();
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State is updated with single assignments; a panicked holder cannot
        // leave it half-written.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a model as resident.
    ///
    /// Re-registering an already-loaded model replaces its footprint rather
    /// than adding to it.
    pub fn mark_loaded(&self, model_id: &str, vram_mb: f64) -> ControlPlaneResult<()> {
        self.mark_loaded_at(model_id, vram_mb, Instant::now())
    }

    pub fn mark_loaded_at(
        &self,
        model_id: &str,
        vram_mb: f64,
        now: Instant,
    ) -> ControlPlaneResult<()> {
        validate_mb("vram_mb", vram_mb)?;
        let mut inner = self.lock();
        let previous = inner.models.insert(
            model_id.to_string(),
            ModelRecord {
                model_id: model_id.to_string(),
                vram_usage_mb: vram_mb,
                last_used_at: now,
                loaded_at: Utc::now(),
                status: ModelStatus::Loaded,
            },
        );
        let previous_mb = previous.map(|r| r.vram_usage_mb).unwrap_or(0.0);
        inner.used_mb += vram_mb - previous_mb;

        tracing::info!(
            model = model_id,
            vram_mb,
            used_mb = inner.used_mb,
            budget_mb = inner.budget_mb,
            "Model marked loaded"
        );
        Ok(())
    }

    /// Remove a model and free its memory. Returns the freed amount, or
    /// `None` if the model was not loaded.
    pub fn mark_unloaded(&self, model_id: &str) -> Option<f64> {
        let mut inner = self.lock();
        let record = inner.models.remove(model_id)?;
        inner.used_mb -= record.vram_usage_mb;
        if inner.models.is_empty() {
            // Drop accumulated float error once nothing is resident
            inner.used_mb = 0.0;
        }
        tracing::info!(
            model = model_id,
            freed_mb = record.vram_usage_mb,
            used_mb = inner.used_mb,
            "Model marked unloaded"
        );
        Some(record.vram_usage_mb)
    }

    /// Whether `required_mb` fits in the remaining budget
    pub fn can_accommodate(&self, required_mb: f64) -> bool {
        self.lock().free_mb() >= required_mb
    }

    /// Plan the minimal LRU-ordered eviction that makes `required_mb` fit.
    pub fn plan_eviction(&self, required_mb: f64) -> EvictionPlan {
        let inner = self.lock();
        let shortfall = required_mb - inner.free_mb();
        if required_mb <= 0.0 || shortfall <= 0.0 {
            return EvictionPlan::NotNeeded;
        }

        let mut freed = 0.0;
        let mut chosen = Vec::new();
        for record in inner.lru_order() {
            freed += record.vram_usage_mb;
            chosen.push(record.model_id.clone());
            if freed >= shortfall {
                tracing::debug!(
                    required_mb,
                    shortfall_mb = shortfall,
                    candidates = ?chosen,
                    "Eviction plan selected"
                );
                return EvictionPlan::Evict(chosen);
            }
        }

        EvictionPlan::Insufficient {
            shortfall_mb: shortfall,
            reclaimable_mb: freed,
        }
    }

    /// Models to unload so that `required_mb` fits, least recently used
    /// first. Empty when nothing needs evicting or when evicting everything
    /// would not be enough.
    pub fn select_eviction_candidates(&self, required_mb: f64) -> Vec<String> {
        self.plan_eviction(required_mb).candidates()
    }

    /// Like [`plan_eviction`](Self::plan_eviction), but as an error when no
    /// eviction set suffices.
    pub fn require_eviction_plan(&self, required_mb: f64) -> ControlPlaneResult<Vec<String>> {
        match self.plan_eviction(required_mb) {
            EvictionPlan::NotNeeded => Ok(Vec::new()),
            EvictionPlan::Evict(ids) => Ok(ids),
            EvictionPlan::Insufficient {
                shortfall_mb,
                reclaimable_mb,
            } => {
                let free_mb = (required_mb - shortfall_mb).max(0.0);
                Err(ControlPlaneError::ResourceExhausted {
                    required_mb,
                    reclaimable_mb: reclaimable_mb + free_mb,
                })
            }
        }
    }

    /// Recompute the absolute budget from a percentage of total memory
    pub fn set_budget(&self, percentage: f64) -> ControlPlaneResult<()> {
        validate_budget_percentage(percentage)?;
        let mut inner = self.lock();
        inner.budget_percentage = percentage;
        inner.recompute_budget();
        tracing::info!(
            percentage,
            budget_mb = inner.budget_mb,
            "VRAM budget updated"
        );
        Ok(())
    }

    /// Update physical memory size (from a GPU probe) keeping the percentage
    pub fn set_total_vram(&self, total_mb: f64) -> ControlPlaneResult<()> {
        validate_mb("total_mb", total_mb)?;
        let mut inner = self.lock();
        if (inner.total_mb - total_mb).abs() < f64::EPSILON {
            return Ok(());
        }
        inner.total_mb = total_mb;
        inner.recompute_budget();
        tracing::info!(total_mb, budget_mb = inner.budget_mb, "Total VRAM updated");
        Ok(())
    }

    /// Refresh last-used time. Returns false if the model is not loaded.
    pub fn touch(&self, model_id: &str) -> bool {
        self.touch_at(model_id, Instant::now())
    }

    pub fn touch_at(&self, model_id: &str, now: Instant) -> bool {
        match self.lock().models.get_mut(model_id) {
            Some(record) => {
                record.last_used_at = now;
                true
            }
            None => false,
        }
    }

    /// Models unused for longer than `idle_timeout`, least recently used first
    pub fn idle_models(&self, idle_timeout: Duration) -> Vec<String> {
        self.idle_models_at(idle_timeout, Instant::now())
    }

    pub fn idle_models_at(&self, idle_timeout: Duration, now: Instant) -> Vec<String> {
        self.lock()
            .lru_order()
            .into_iter()
            .filter(|r| now.saturating_duration_since(r.last_used_at) > idle_timeout)
            .map(|r| r.model_id.clone())
            .collect()
    }

    pub fn status(&self, model_id: &str) -> ModelStatus {
        if self.lock().models.contains_key(model_id) {
            ModelStatus::Loaded
        } else {
            ModelStatus::Unloaded
        }
    }

    pub fn is_loaded(&self, model_id: &str) -> bool {
        self.status(model_id) == ModelStatus::Loaded
    }

    pub fn used_mb(&self) -> f64 {
        self.lock().used_mb
    }

    pub fn budget_mb(&self) -> f64 {
        self.lock().budget_mb
    }

    pub fn free_mb(&self) -> f64 {
        self.lock().free_mb()
    }

    pub fn loaded_count(&self) -> usize {
        self.lock().models.len()
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        let inner = self.lock();
        let now = Instant::now();
        ResourceSnapshot {
            total_mb: inner.total_mb,
            budget_percentage: inner.budget_percentage,
            budget_mb: inner.budget_mb,
            used_mb: inner.used_mb,
            loaded: inner
                .lru_order()
                .into_iter()
                .map(|r| LoadedModel {
                    model_id: r.model_id.clone(),
                    vram_mb: r.vram_usage_mb,
                    idle_secs: now.saturating_duration_since(r.last_used_at).as_secs(),
                    loaded_at: r.loaded_at,
                })
                .collect(),
        }
    }
}

fn validate_mb(name: &str, value: f64) -> ControlPlaneResult<()> {
    if !(value.is_finite() && value >= 0.0) {
        return Err(ControlPlaneError::validation(format!(
            "{} must be a non-negative number, got {}",
            name, value
        )));
    }
    Ok(())
}
