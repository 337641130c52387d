//! Routing engine
//!
//! Scores each task and picks a backend:
//!
//! 1. A user preference wins outright (the score is still computed).
//! 2. The first matching rule supplies a complexity; size signals can only
//!    raise it.
//! 3. `score >= threshold` goes to cloud. Just below the threshold (within
//!    `tie_epsilon`) the rule's preferred backend decides.
//! 4. A local decision must fit the VRAM budget, possibly after evicting
//!    idle models. If nothing can make it fit, the task degrades to cloud.
//!
//! Routing never fails and never blocks on I/O. Reasons are built only from
//! the task and the configuration so identical inputs give identical text.

use crate::config::{ModelSpec, PlaneConfig};
use crate::error::ControlPlaneResult;
use crate::resources::tracker::{EvictionPlan, ResourceTracker};
use crate::router::rules::{RoutingRule, RuleSet};
use crate::router::task::{Backend, Priority, RoutingDecision, TaskDescriptor};
use std::sync::{Arc, PoisonError, RwLock};

pub const INSUFFICIENT_LOCAL_RESOURCES: &str = "insufficient local resources";
pub const USER_OVERRIDE: &str = "user override";

/// Everything the engine reads from config, compiled
#[derive(Debug, Clone)]
struct EngineSettings {
    rules: RuleSet,
    complexity_threshold: f64,
    tie_epsilon: f64,
    default_complexity: f64,
    context_high_water: u32,
    output_high_water: u32,
    local_models: Vec<ModelSpec>,
    local_default_model: String,
    cloud_default_model: String,
}

impl EngineSettings {
    fn from_config(config: &PlaneConfig) -> ControlPlaneResult<Self> {
        Ok(Self {
            rules: RuleSet::compile(&config.routing_rules)?,
            complexity_threshold: config.complexity_threshold,
            tie_epsilon: config.tie_epsilon,
            default_complexity: config.default_complexity,
            context_high_water: config.context_high_water.max(1),
            output_high_water: config.output_high_water.max(1),
            local_models: config.local_models.clone(),
            local_default_model: config.local_default_model.clone(),
            cloud_default_model: config.cloud_default_model.clone(),
        })
    }

    /// Size-derived complexity.
    ///
    /// `r` is the larger of the two length ratios against their high-water
    /// marks. Up to the mark the score grows to 0.5; past it, it keeps
    /// growing at the same rate and saturates at 1.0 at twice the mark.
    fn size_complexity(&self, task: &TaskDescriptor) -> f64 {
        let ctx = task.context_length as f64 / self.context_high_water as f64;
        let out = task.estimated_tokens as f64 / self.output_high_water as f64;
        let r = ctx.max(out);
        if r <= 1.0 {
            0.5 * r
        } else {
            (0.5 + 0.5 * (r - 1.0)).min(1.0)
        }
    }

    fn model_for(&self, backend: Backend, rule: Option<&RoutingRule>) -> String {
        let from_rule = rule
            .filter(|r| r.preferred_backend == backend)
            .and_then(|r| r.model.clone());
        from_rule.unwrap_or_else(|| match backend {
            Backend::Local => self.local_default_model.clone(),
            Backend::Cloud => self.cloud_default_model.clone(),
        })
    }

    fn footprint_mb(&self, model: &str) -> Option<f64> {
        self.local_models
            .iter()
            .find(|m| m.id == model)
            .map(|m| m.vram_mb)
    }
}

/// Intermediate result of scoring, before the resource check
struct Scored<'a> {
    score: f64,
    rule: Option<&'a RoutingRule>,
    backend: Backend,
    reason: String,
}

/// Local feasibility of a model
enum Admission {
    Fits,
    Evict {
        ids: Vec<String>,
        required_mb: f64,
    },
    Insufficient {
        required_mb: f64,
        shortfall_mb: f64,
        reclaimable_mb: f64,
    },
}

/// Complexity-based router backed by the resource tracker
#[derive(Debug)]
pub struct RoutingEngine {
    settings: RwLock<EngineSettings>,
    tracker: Arc<ResourceTracker>,
}

impl RoutingEngine {
    pub fn new(config: &PlaneConfig, tracker: Arc<ResourceTracker>) -> ControlPlaneResult<Self> {
        Ok(Self {
            settings: RwLock::new(EngineSettings::from_config(config)?),
            tracker,
        })
    }

    /// Swap in rules, threshold and model catalog from a reloaded config.
    pub fn update(&self, config: &PlaneConfig) -> ControlPlaneResult<()> {
        let settings = EngineSettings::from_config(config)?;
        let rules = settings.rules.len();
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
        tracing::info!(
            rules,
            threshold = config.complexity_threshold,
            "Routing configuration updated"
        );
        Ok(())
    }

    pub fn threshold(&self) -> f64 {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .complexity_threshold
    }

    /// Complexity score alone, for observability
    pub fn score(&self, task: &TaskDescriptor) -> f64 {
        let settings = self.settings.read().unwrap_or_else(PoisonError::into_inner);
        Self::score_with(&settings, task).score
    }

    fn score_with<'a>(settings: &'a EngineSettings, task: &TaskDescriptor) -> Scored<'a> {
        let rule = settings.rules.first_match(&task.task_type);
        let rule_complexity = rule.map_or(settings.default_complexity, |r| r.complexity);
        let size = settings.size_complexity(task);
        let score = rule_complexity.max(size).clamp(0.0, 1.0);
        let threshold = settings.complexity_threshold;

        if let Some(preferred) = task.user_preference {
            return Scored {
                score,
                rule,
                backend: preferred,
                reason: USER_OVERRIDE.to_string(),
            };
        }

        let origin = match rule {
            Some(r) => format!("rule '{}' complexity {:.2}", r.pattern, r.complexity),
            None => format!("no rule matched, default {:.2}", settings.default_complexity),
        };
        let sized = if size > rule_complexity {
            format!(", size raised score to {:.2}", size)
        } else {
            String::new()
        };

        let (backend, reason) = if score >= threshold {
            (
                Backend::Cloud,
                format!("{}{}: score {:.2} >= threshold {:.2}", origin, sized, score, threshold),
            )
        } else if let Some(r) = rule.filter(|_| threshold - score <= settings.tie_epsilon) {
            (
                r.preferred_backend,
                format!(
                    "{}{}: score {:.2} within {:.2} of threshold {:.2}, rule prefers {}",
                    origin, sized, score, settings.tie_epsilon, threshold, r.preferred_backend
                ),
            )
        } else {
            (
                Backend::Local,
                format!("{}{}: score {:.2} < threshold {:.2}", origin, sized, score, threshold),
            )
        };

        Scored {
            score,
            rule,
            backend,
            reason,
        }
    }

    /// Route a task. Always returns a decision.
    pub fn route(&self, task: &TaskDescriptor) -> RoutingDecision {
        let settings = self.settings.read().unwrap_or_else(PoisonError::into_inner);
        let Scored {
            score,
            rule,
            backend,
            mut reason,
        } = Self::score_with(&settings, task);

        let mut decision = RoutingDecision {
            backend,
            model: settings.model_for(backend, rule),
            complexity_score: score,
            reason: String::new(),
            matched_rule: rule.map(|r| r.pattern.clone()),
            evict: Vec::new(),
        };

        if backend == Backend::Local {
            match self.admit_local(&settings, &decision.model) {
                Admission::Fits => {}
                Admission::Evict { ids, required_mb } => {
                    reason.push_str(&format!(
                        "; evicting {} to free {:.0} MB",
                        ids.join(", "),
                        required_mb
                    ));
                    decision.evict = ids;
                }
                Admission::Insufficient {
                    required_mb,
                    shortfall_mb,
                    reclaimable_mb,
                } => {
                    if task.priority == Priority::High {
                        tracing::warn!(
                            task_type = %task.task_type,
                            model = %decision.model,
                            required_mb,
                            shortfall_mb,
                            reclaimable_mb,
                            "High-priority task downgraded to cloud"
                        );
                    } else {
                        tracing::info!(
                            task_type = %task.task_type,
                            model = %decision.model,
                            required_mb,
                            shortfall_mb,
                            reclaimable_mb,
                            "Task downgraded to cloud"
                        );
                    }
                    reason.push_str("; ");
                    reason.push_str(INSUFFICIENT_LOCAL_RESOURCES);
                    decision.backend = Backend::Cloud;
                    decision.model = settings.model_for(Backend::Cloud, rule);
                }
            }
        }

        decision.reason = reason;
        tracing::info!(
            task_type = %task.task_type,
            priority = %task.priority,
            backend = %decision.backend,
            model = %decision.model,
            score = decision.complexity_score,
            threshold = settings.complexity_threshold,
            rule = decision.matched_rule.as_deref().unwrap_or("-"),
            evict = decision.evict.len(),
            "Routing decision"
        );
        decision
    }

    /// Whether `model` can be hosted locally right now.
    ///
    /// A model already loaded needs no room; otherwise its catalog
    /// footprint must fit, possibly after evicting idle models.
    fn admit_local(&self, settings: &EngineSettings, model: &str) -> Admission {
        let required_mb = if self.tracker.is_loaded(model) {
            0.0
        } else {
            settings.footprint_mb(model).unwrap_or(0.0)
        };
        if self.tracker.can_accommodate(required_mb) {
            return Admission::Fits;
        }
        match self.tracker.plan_eviction(required_mb) {
            EvictionPlan::NotNeeded => Admission::Fits,
            EvictionPlan::Evict(ids) => Admission::Evict { ids, required_mb },
            EvictionPlan::Insufficient {
                shortfall_mb,
                reclaimable_mb,
            } => Admission::Insufficient {
                required_mb,
                shortfall_mb,
                reclaimable_mb,
            },
        }
    }

    /// Re-point a decision at `to`, appending `note` to its reason.
    ///
    /// Returns `None` when `to` is local and the local model cannot be
    /// admitted even with eviction.
    pub fn redirect(
        &self,
        task: &TaskDescriptor,
        decision: &RoutingDecision,
        to: Backend,
        note: &str,
    ) -> Option<RoutingDecision> {
        let settings = self.settings.read().unwrap_or_else(PoisonError::into_inner);
        let rule = settings.rules.first_match(&task.task_type);
        let mut redirected = RoutingDecision {
            backend: to,
            model: settings.model_for(to, rule),
            complexity_score: decision.complexity_score,
            reason: format!("{}; {}", decision.reason, note),
            matched_rule: decision.matched_rule.clone(),
            evict: Vec::new(),
        };
        if to == Backend::Local {
            match self.admit_local(&settings, &redirected.model) {
                Admission::Fits => {}
                Admission::Evict { ids, .. } => redirected.evict = ids,
                Admission::Insufficient { .. } => return None,
            }
        }
        tracing::info!(
            task_type = %task.task_type,
            from = %decision.backend,
            to = %to,
            model = %redirected.model,
            note,
            "Routing decision redirected"
        );
        Some(redirected)
    }

    pub fn tracker(&self) -> &Arc<ResourceTracker> {
        &self.tracker
    }
}
