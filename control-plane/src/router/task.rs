//! Task descriptors and routing decisions

use crate::error::{ControlPlaneError, ControlPlaneResult};
use serde::{Deserialize, Serialize};

/// Execution target for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// On-box accelerator worker
    Local,
    /// Remote inference service
    Cloud,
}

impl Backend {
    /// The other backend
    pub fn alternate(&self) -> Self {
        match self {
            Self::Local => Self::Cloud,
            Self::Cloud => Self::Local,
        }
    }

    /// Breaker / supervisor target name for this backend
    pub fn target_name(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Cloud => "cloud",
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.target_name())
    }
}

impl std::str::FromStr for Backend {
    type Err = ControlPlaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "cloud" | "remote" => Ok(Self::Cloud),
            other => Err(ControlPlaneError::validation(format!(
                "unknown backend '{}' (expected local or cloud)",
                other
            ))),
        }
    }
}

/// Task priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = ControlPlaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(ControlPlaneError::validation(format!(
                "unknown priority '{}' (expected normal or high)",
                other
            ))),
        }
    }
}

/// Immutable input to routing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Free-form category, e.g. "code_generation"
    pub task_type: String,
    /// Input size in tokens
    pub context_length: u32,
    /// Expected output size in tokens
    pub estimated_tokens: u32,
    #[serde(default)]
    pub priority: Priority,
    /// Explicit backend override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_preference: Option<Backend>,
}

impl TaskDescriptor {
    /// Create a normal-priority task with no override
    pub fn new(task_type: impl Into<String>, context_length: u32, estimated_tokens: u32) -> Self {
        Self {
            task_type: task_type.into(),
            context_length,
            estimated_tokens,
            priority: Priority::Normal,
            user_preference: None,
        }
    }

    /// With priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// With an explicit backend preference
    pub fn prefer(mut self, backend: Backend) -> Self {
        self.user_preference = Some(backend);
        self
    }

    /// Reject descriptors that cannot be routed
    pub fn validate(&self) -> ControlPlaneResult<()> {
        if self.task_type.trim().is_empty() {
            return Err(ControlPlaneError::validation("task_type must not be empty"));
        }
        Ok(())
    }
}

/// Output of the routing engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub backend: Backend,
    /// Model identifier for the chosen backend
    pub model: String,
    /// Normalized complexity in [0, 1]
    pub complexity_score: f64,
    /// Deterministic justification
    pub reason: String,
    /// Pattern of the first matching rule, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_rule: Option<String>,
    /// Models the local worker must unload before loading `model`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evict: Vec<String>,
}

impl RoutingDecision {
    /// Whether the decision requires freeing local memory first
    pub fn requires_eviction(&self) -> bool {
        !self.evict.is_empty()
    }
}
