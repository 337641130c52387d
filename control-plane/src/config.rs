//! Control plane configuration
//!
//! Loaded from TOML or YAML (by file extension), overridden by `PLANE_*`
//! environment variables, and validated before anything is built from it.
//! An invalid config is fatal: the process must not start with a bad budget
//! or a malformed rule set.

use crate::error::{ControlPlaneError, ControlPlaneResult};
use crate::resilience::circuit_breaker::BreakerSettings;
use crate::resilience::retry::RetryPolicy;
use crate::router::rules::{default_rules, RoutingRule, RuleSet};
use crate::router::task::Backend;
use crate::supervisor::SupervisorSettings;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// A model the local worker can host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: String,
    /// Resident accelerator memory in MB
    pub vram_mb: f64,
}

impl ModelSpec {
    pub fn new(id: impl Into<String>, vram_mb: f64) -> Self {
        Self {
            id: id.into(),
            vram_mb,
        }
    }
}

/// Top-level control plane configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaneConfig {
    // Routing
    pub complexity_threshold: f64,
    /// Scores this far below the threshold defer to the rule's preferred backend
    pub tie_epsilon: f64,
    /// Rule component for tasks no rule matches
    pub default_complexity: f64,
    /// Context length (tokens) at which size alone reaches 0.5 complexity
    pub context_high_water: u32,
    /// Output length (tokens) at which size alone reaches 0.5 complexity
    pub output_high_water: u32,
    pub routing_rules: Vec<RoutingRule>,

    // Models
    pub local_models: Vec<ModelSpec>,
    pub local_default_model: String,
    pub cloud_default_model: String,

    // Resources
    /// Physical accelerator memory; replaced by the GPU probe when available
    pub total_vram_mb: f64,
    /// Only validated at load; not hot-reloadable
    pub vram_budget_percentage: f64,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,

    // Resilience
    pub circuit_failure_threshold: u32,
    pub circuit_recovery_timeout_secs: u64,
    pub retry_max_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_exponential_base: f64,
    pub retry_jitter: bool,
    /// Per-attempt deadline for backend calls
    pub call_timeout_ms: u64,
    /// Fall back to the alternate backend when the chosen one fails
    pub fallback_enabled: bool,

    // Supervision
    pub max_restart_attempts: u32,
    pub restart_delay_secs: u64,
    pub recent_error_capacity: usize,
}

impl Default for PlaneConfig {
    fn default() -> Self {
        Self {
            complexity_threshold: 0.7,
            tie_epsilon: 0.05,
            default_complexity: 0.5,
            context_high_water: 4096,
            output_high_water: 2048,
            routing_rules: default_rules(),
            local_models: vec![
                ModelSpec::new("phi-3-mini-q4", 2_600.0),
                ModelSpec::new("llama-3.1-8b-instruct-q4", 5_400.0),
                ModelSpec::new("whisper-small", 1_000.0),
            ],
            local_default_model: "llama-3.1-8b-instruct-q4".to_string(),
            cloud_default_model: "gpt-4o".to_string(),
            total_vram_mb: 24_576.0,
            vram_budget_percentage: 90.0,
            idle_timeout_secs: 300,
            sweep_interval_secs: 60,
            circuit_failure_threshold: 5,
            circuit_recovery_timeout_secs: 60,
            retry_max_attempts: 3,
            retry_initial_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            retry_exponential_base: 2.0,
            retry_jitter: true,
            call_timeout_ms: 30_000,
            fallback_enabled: true,
            max_restart_attempts: 3,
            restart_delay_secs: 30,
            recent_error_capacity: 10,
        }
    }
}

impl PlaneConfig {
    /// Load, apply env overrides and validate
    pub fn load(path: &Path) -> ControlPlaneResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ControlPlaneError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(path, &raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating. YAML for `.yaml`/`.yml`, TOML otherwise.
    pub fn parse(path: &Path, raw: &str) -> ControlPlaneResult<Self> {
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let parsed = if is_yaml {
            serde_yaml::from_str(raw).map_err(|e| e.to_string())
        } else {
            toml::from_str(raw).map_err(|e| e.to_string())
        };
        parsed.map_err(|message| ControlPlaneError::ConfigParse {
            path: path.to_path_buf(),
            message,
        })
    }

    /// Override single scalars from `PLANE_*` variables
    pub fn apply_env_overrides(&mut self) {
        fn env<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|s| s.parse().ok())
        }

        if let Some(v) = env("PLANE_COMPLEXITY_THRESHOLD") {
            self.complexity_threshold = v;
        }
        if let Some(v) = env("PLANE_VRAM_BUDGET_PERCENTAGE") {
            self.vram_budget_percentage = v;
        }
        if let Some(v) = env("PLANE_IDLE_TIMEOUT_SECS") {
            self.idle_timeout_secs = v;
        }
        if let Some(v) = env("PLANE_RETRY_MAX_ATTEMPTS") {
            self.retry_max_attempts = v;
        }
        if let Some(v) = env("PLANE_TOTAL_VRAM_MB") {
            self.total_vram_mb = v;
        }
    }

    /// Check every option; the first problem found is reported.
    pub fn validate(&self) -> ControlPlaneResult<()> {
        let unit = 0.0..=1.0;
        if !unit.contains(&self.complexity_threshold) {
            return Err(ControlPlaneError::validation(format!(
                "complexity_threshold {} outside [0, 1]",
                self.complexity_threshold
            )));
        }
        if !unit.contains(&self.default_complexity) {
            return Err(ControlPlaneError::validation(format!(
                "default_complexity {} outside [0, 1]",
                self.default_complexity
            )));
        }
        if !(0.0..0.5).contains(&self.tie_epsilon) {
            return Err(ControlPlaneError::validation(format!(
                "tie_epsilon {} outside [0, 0.5)",
                self.tie_epsilon
            )));
        }
        validate_budget_percentage(self.vram_budget_percentage)?;
        if !(self.total_vram_mb.is_finite() && self.total_vram_mb >= 0.0) {
            return Err(ControlPlaneError::validation(format!(
                "total_vram_mb {} must be a non-negative number",
                self.total_vram_mb
            )));
        }
        if self.context_high_water == 0 || self.output_high_water == 0 {
            return Err(ControlPlaneError::validation(
                "context_high_water and output_high_water must be positive",
            ));
        }
        RuleSet::compile(&self.routing_rules)?;

        let mut seen = std::collections::HashSet::new();
        for model in &self.local_models {
            if !seen.insert(model.id.as_str()) {
                return Err(ControlPlaneError::validation(format!(
                    "local model '{}' declared twice",
                    model.id
                )));
            }
            if !(model.vram_mb.is_finite() && model.vram_mb >= 0.0) {
                return Err(ControlPlaneError::validation(format!(
                    "local model '{}': vram_mb {} must be non-negative",
                    model.id, model.vram_mb
                )));
            }
        }
        for rule in &self.routing_rules {
            if let (Some(model), Backend::Local) = (&rule.model, rule.preferred_backend) {
                if !seen.contains(model.as_str()) {
                    return Err(ControlPlaneError::validation(format!(
                        "rule '{}' names unknown local model '{}'",
                        rule.pattern, model
                    )));
                }
            }
        }
        if !self.local_models.is_empty() && !seen.contains(self.local_default_model.as_str()) {
            return Err(ControlPlaneError::validation(format!(
                "local_default_model '{}' is not in local_models",
                self.local_default_model
            )));
        }
        if self.cloud_default_model.trim().is_empty() {
            return Err(ControlPlaneError::validation(
                "cloud_default_model must not be empty",
            ));
        }

        if self.circuit_failure_threshold == 0 {
            return Err(ControlPlaneError::validation(
                "circuit_failure_threshold must be at least 1",
            ));
        }
        if self.retry_max_attempts == 0 {
            return Err(ControlPlaneError::validation(
                "retry_max_attempts must be at least 1",
            ));
        }
        if self.retry_exponential_base < 1.0 {
            return Err(ControlPlaneError::validation(format!(
                "retry_exponential_base {} must be >= 1",
                self.retry_exponential_base
            )));
        }
        if self.retry_initial_delay_ms > self.retry_max_delay_ms {
            return Err(ControlPlaneError::validation(format!(
                "retry_initial_delay_ms ({}) exceeds retry_max_delay_ms ({})",
                self.retry_initial_delay_ms, self.retry_max_delay_ms
            )));
        }
        if self.call_timeout_ms == 0 {
            return Err(ControlPlaneError::validation("call_timeout_ms must be positive"));
        }
        if self.recent_error_capacity == 0 {
            return Err(ControlPlaneError::validation(
                "recent_error_capacity must be at least 1",
            ));
        }
        Ok(())
    }

    /// Catalog footprint of a local model
    pub fn model_vram_mb(&self, model_id: &str) -> Option<f64> {
        self.local_models
            .iter()
            .find(|m| m.id == model_id)
            .map(|m| m.vram_mb)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            exponential_base: self.retry_exponential_base,
            jitter: self.retry_jitter,
        }
    }

    pub fn breaker_settings(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.circuit_failure_threshold,
            recovery_timeout: Duration::from_secs(self.circuit_recovery_timeout_secs),
        }
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            max_restart_attempts: self.max_restart_attempts,
            restart_delay: Duration::from_secs(self.restart_delay_secs),
            recent_error_capacity: self.recent_error_capacity,
        }
    }
}

/// Budget percentages must lie in [0, 100]
pub fn validate_budget_percentage(percentage: f64) -> ControlPlaneResult<()> {
    if !(0.0..=100.0).contains(&percentage) {
        return Err(ControlPlaneError::validation(format!(
            "vram_budget_percentage {} outside [0, 100]",
            percentage
        )));
    }
    Ok(())
}
