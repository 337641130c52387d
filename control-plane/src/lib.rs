//! Model-serving control plane
//!
//! Decides, for every unit of work, whether it runs on the local
//! accelerator worker or on a cloud backend, keeps the local VRAM budget
//! honest, and survives partial failure of backends and workers.
//!
//! # Components
//!
//! - [`router`]: complexity scoring over ordered regex rules, with
//!   size-derived signals and VRAM-aware admission
//! - [`resources`]: thread-safe VRAM budget tracker with LRU eviction
//!   planning and an idle sweeper
//! - [`resilience`]: per-target circuit breakers and a cancellable
//!   retry executor with exponential backoff
//! - [`supervisor`]: failure records, restart cool-down and restart budget
//!   for externally managed workers, plus a health monitor
//! - [`orchestrator`]: [`ControlPlane`], composing all of the above
//!
//! # Usage
//!
//! ```no_run
//! use control_plane::{ControlPlane, PlaneConfig, TaskDescriptor};
//!
//! let plane = ControlPlane::from_config(PlaneConfig::default())?;
//! let decision = plane.route(&TaskDescriptor::new("simple_chat", 200, 80))?;
//! println!("{} via {}", decision.backend, decision.model);
//! # Ok::<(), control_plane::ControlPlaneError>(())
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod resilience;
pub mod resources;
pub mod router;
pub mod supervisor;

pub use config::{ModelSpec, PlaneConfig};
pub use error::{CallError, ControlPlaneError, ControlPlaneResult};
pub use orchestrator::{BackendClient, BackendResponse, Backends, ControlPlane, Execution};
pub use resilience::{
    guarded_call, BreakerRegistry, BreakerSettings, CircuitBreaker, CircuitState, RetryExecutor,
    RetryPolicy,
};
pub use resources::{EvictionPlan, IdleSweeper, ResourceSnapshot, ResourceTracker, UnloadRequest};
pub use router::{Backend, Priority, RoutingDecision, RoutingEngine, RoutingRule, TaskDescriptor};
pub use supervisor::health::{
    AgentEndpoint, HealthMonitor, HealthProbe, HttpHealthProbe, SupervisorEvent,
};
pub use supervisor::{RestartDecision, SelfHealingSupervisor, SupervisorSettings};
