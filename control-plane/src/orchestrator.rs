//! Control plane orchestration
//!
//! Wires the four components together for one process:
//!
//! ```text
//! task ─▶ route ─▶ breaker(backend) ─▶ retry ─▶ BackendClient::call
//!                        │ RetriesExhausted ─▶ supervisor.register_failure(client)
//!                        │ CircuitOpen / RetriesExhausted
//!                        ▼
//!              one fallback to the alternate backend
//! ```
//!
//! There is no global state: each [`ControlPlane`] owns its tracker,
//! engine, breakers, retry executor and supervisor.

use crate::config::PlaneConfig;
use crate::error::{CallError, ControlPlaneError, ControlPlaneResult};
use crate::resilience::circuit_breaker::BreakerRegistry;
use crate::resilience::retry::{guarded_call, RetryExecutor};
use crate::resources::tracker::ResourceTracker;
use crate::router::engine::RoutingEngine;
use crate::router::task::{Backend, RoutingDecision, TaskDescriptor};
use crate::supervisor::SelfHealingSupervisor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub const LOCAL_CIRCUIT_OPEN: &str = "local circuit open";

/// Output of a backend call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendResponse {
    pub model: String,
    pub body: serde_json::Value,
}

/// An inference endpoint the control plane dispatches to.
///
/// Implementations perform one raw attempt; retries, deadlines and circuit
/// breaking are applied around them.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Agent id used for supervisor failure records
    fn name(&self) -> &str;

    async fn call(&self, model: &str, task: &TaskDescriptor) -> Result<BackendResponse, CallError>;
}

/// The pair of clients a task can be dispatched to
#[derive(Clone)]
pub struct Backends {
    pub local: Arc<dyn BackendClient>,
    pub cloud: Arc<dyn BackendClient>,
}

impl Backends {
    pub fn new(local: Arc<dyn BackendClient>, cloud: Arc<dyn BackendClient>) -> Self {
        Self { local, cloud }
    }

    pub fn get(&self, backend: Backend) -> &Arc<dyn BackendClient> {
        match backend {
            Backend::Local => &self.local,
            Backend::Cloud => &self.cloud,
        }
    }
}

/// Result of [`ControlPlane::execute`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// The decision that produced `response`
    pub decision: RoutingDecision,
    pub response: BackendResponse,
    /// Whether `decision` is a fallback from the original route
    pub fell_back: bool,
}

pub struct ControlPlane {
    config: RwLock<PlaneConfig>,
    tracker: Arc<ResourceTracker>,
    engine: RoutingEngine,
    breakers: BreakerRegistry,
    executor: RwLock<RetryExecutor>,
    supervisor: Arc<SelfHealingSupervisor>,
    idle_timeout: watch::Sender<Duration>,
}

impl ControlPlane {
    /// Validate `config` and build every component from it.
    pub fn from_config(config: PlaneConfig) -> ControlPlaneResult<Self> {
        config.validate()?;
        let tracker = Arc::new(ResourceTracker::new(
            config.total_vram_mb,
            config.vram_budget_percentage,
        )?);
        let engine = RoutingEngine::new(&config, Arc::clone(&tracker))?;
        let breakers = BreakerRegistry::new(config.breaker_settings());
        let executor = RetryExecutor::new(config.retry_policy(), config.call_timeout());
        let supervisor = Arc::new(SelfHealingSupervisor::new(config.supervisor_settings()));
        let (idle_timeout, _) = watch::channel(config.idle_timeout());

        tracing::info!(
            rules = config.routing_rules.len(),
            threshold = config.complexity_threshold,
            budget_mb = tracker.budget_mb(),
            "Control plane initialized"
        );

        Ok(Self {
            config: RwLock::new(config),
            tracker,
            engine,
            breakers,
            executor: RwLock::new(executor),
            supervisor,
            idle_timeout,
        })
    }

    pub fn config(&self) -> PlaneConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn tracker(&self) -> &Arc<ResourceTracker> {
        &self.tracker
    }

    pub fn engine(&self) -> &RoutingEngine {
        &self.engine
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn supervisor(&self) -> &Arc<SelfHealingSupervisor> {
        &self.supervisor
    }

    /// Idle timeout that follows config reloads, for the sweeper
    pub fn idle_timeout(&self) -> watch::Receiver<Duration> {
        self.idle_timeout.subscribe()
    }

    /// Apply a reloaded config to every component.
    ///
    /// The VRAM budget percentage is fixed at startup; a changed value is
    /// ignored with a warning.
    pub fn reload(&self, mut config: PlaneConfig) -> ControlPlaneResult<()> {
        config.validate()?;
        let current = self.config();
        if (config.vram_budget_percentage - current.vram_budget_percentage).abs() > f64::EPSILON {
            tracing::warn!(
                requested = config.vram_budget_percentage,
                active = current.vram_budget_percentage,
                "vram_budget_percentage is not hot-reloadable; keeping active value"
            );
            config.vram_budget_percentage = current.vram_budget_percentage;
        }

        self.engine.update(&config)?;
        if (config.total_vram_mb - current.total_vram_mb).abs() > f64::EPSILON {
            self.tracker.set_total_vram(config.total_vram_mb)?;
        }
        self.breakers.update_settings(config.breaker_settings());
        *self.executor.write().unwrap_or_else(PoisonError::into_inner) =
            RetryExecutor::new(config.retry_policy(), config.call_timeout());
        self.supervisor.update_settings(config.supervisor_settings());
        self.idle_timeout.send_replace(config.idle_timeout());
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;

        tracing::info!("Configuration reloaded");
        Ok(())
    }

    /// Route a task.
    ///
    /// Fails only for a malformed descriptor. While the local breaker is
    /// open, local decisions are redirected to cloud unless the task asked
    /// for local explicitly.
    pub fn route(&self, task: &TaskDescriptor) -> ControlPlaneResult<RoutingDecision> {
        task.validate()?;
        let decision = self.engine.route(task);
        if decision.backend == Backend::Local
            && task.user_preference != Some(Backend::Local)
            && self.breakers.is_rejecting(Backend::Local.target_name())
        {
            if let Some(redirected) =
                self.engine
                    .redirect(task, &decision, Backend::Cloud, LOCAL_CIRCUIT_OPEN)
            {
                return Ok(redirected);
            }
        }
        Ok(decision)
    }

    /// Route and dispatch a task, falling back once to the alternate backend.
    ///
    /// Exhausted-retry failures are registered with the supervisor under the
    /// failing client's name. A cancelled call is returned as-is.
    pub async fn execute(
        &self,
        task: &TaskDescriptor,
        backends: &Backends,
        cancel: &CancellationToken,
    ) -> ControlPlaneResult<Execution> {
        let decision = self.route(task)?;
        let error = match self.dispatch(&decision, task, backends, cancel).await {
            Ok(response) => {
                return Ok(Execution {
                    decision,
                    response,
                    fell_back: false,
                })
            }
            Err(e) => e,
        };

        if !error.should_fall_back() {
            return Err(error);
        }
        self.report_failure(backends.get(decision.backend).name(), &error);
        if !self.config().fallback_enabled {
            return Err(error);
        }

        let alternate = decision.backend.alternate();
        let note = format!("fallback from {}: {}", decision.backend, error.code());
        let Some(fallback) = self.engine.redirect(task, &decision, alternate, &note) else {
            tracing::warn!(
                task_type = %task.task_type,
                from = %decision.backend,
                "No fallback available"
            );
            return Err(error);
        };

        match self.dispatch(&fallback, task, backends, cancel).await {
            Ok(response) => Ok(Execution {
                decision: fallback,
                response,
                fell_back: true,
            }),
            Err(e) => {
                self.report_failure(backends.get(alternate).name(), &e);
                Err(e)
            }
        }
    }

    async fn dispatch(
        &self,
        decision: &RoutingDecision,
        task: &TaskDescriptor,
        backends: &Backends,
        cancel: &CancellationToken,
    ) -> ControlPlaneResult<BackendResponse> {
        let breaker = self.breakers.get(decision.backend.target_name());
        let executor = *self.executor.read().unwrap_or_else(PoisonError::into_inner);
        let client = Arc::clone(backends.get(decision.backend));

        let response = guarded_call(&breaker, &executor, cancel, |_attempt| {
            let client = Arc::clone(&client);
            let model = decision.model.clone();
            let task = task.clone();
            async move { client.call(&model, &task).await }
        })
        .await?;

        if decision.backend == Backend::Local {
            self.tracker.touch(&decision.model);
        }
        Ok(response)
    }

    /// Register a backend failure with the supervisor.
    ///
    /// Only calls that actually reached the backend count. A rejection by an
    /// already-open breaker is the same outage and would otherwise keep
    /// pushing the restart cool-down back.
    fn report_failure(&self, agent_id: &str, error: &ControlPlaneError) {
        if !matches!(error, ControlPlaneError::RetriesExhausted { .. }) {
            return;
        }
        self.supervisor.register_failure(agent_id, &error.to_string());
        if let Err(e) = self.supervisor.check_limit(agent_id) {
            tracing::error!(agent = agent_id, error = %e, "Backend agent beyond restart limit");
        }
    }
}
