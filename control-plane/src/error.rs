//! Control plane error types
//!
//! One taxonomy for the whole crate. Validation errors are fatal at config
//! load time; resource exhaustion is recovered inside routing; circuit and
//! retry errors surface to the caller of a guarded operation; restart limit
//! errors go to an operator channel.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for control plane operations
pub type ControlPlaneResult<T> = Result<T, ControlPlaneError>;

/// Failure of a single raw backend call.
///
/// Both variants count as failures for circuit breaker accounting, but stay
/// distinct so callers can tell "backend said no" from "backend took too long".
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    /// Application-level error reported by the backend
    #[error("backend error: {0}")]
    Backend(String),

    /// The call exceeded its per-attempt deadline
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
}

impl CallError {
    /// Create a backend error
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    /// Whether this failure was a deadline expiry
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Errors that can occur in the control plane
#[derive(Error, Debug)]
pub enum ControlPlaneError {
    /// Malformed task descriptor or out-of-range configuration
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// No eviction set can free enough accelerator memory
    #[error("Resource exhausted: need {required_mb:.0}MB, at most {reclaimable_mb:.0}MB reclaimable")]
    ResourceExhausted {
        required_mb: f64,
        reclaimable_mb: f64,
    },

    /// Target is temporarily shunned by its circuit breaker
    #[error("Circuit open for '{target}'")]
    CircuitOpen { target: String },

    /// All attempts failed; wraps the last underlying error
    #[error("Retries exhausted after {attempts} attempt(s): {last_error}")]
    RetriesExhausted { attempts: u32, last_error: CallError },

    /// The caller's cancellation signal fired while retrying
    #[error("Cancelled after {attempts} attempt(s){}", .last_error.as_ref().map(|e| format!(": {}", e)).unwrap_or_default())]
    Cancelled {
        attempts: u32,
        last_error: Option<CallError>,
    },

    /// The supervisor has given up restarting an agent
    #[error("Restart limit exceeded for agent '{agent_id}' ({attempts}/{max} attempts)")]
    RestartLimitExceeded {
        agent_id: String,
        attempts: u32,
        max: u32,
    },

    /// Configuration file could not be read
    #[error("Failed to read config {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed
    #[error("Failed to parse config {path}: {message}")]
    ConfigParse { path: PathBuf, message: String },
}

impl ControlPlaneError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a circuit open error
    pub fn circuit_open(target: impl Into<String>) -> Self {
        Self::CircuitOpen {
            target: target.into(),
        }
    }

    /// Machine-readable error code for logs and CLI output
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION",
            Self::ResourceExhausted { .. } => "RESOURCE_EXHAUSTED",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            Self::Cancelled { .. } => "CANCELLED",
            Self::RestartLimitExceeded { .. } => "RESTART_LIMIT_EXCEEDED",
            Self::ConfigIo { .. } => "CONFIG_IO",
            Self::ConfigParse { .. } => "CONFIG_PARSE",
        }
    }

    /// Whether the caller should fall back to the alternate backend.
    ///
    /// Cancellation is the caller's own decision and never triggers fallback.
    pub fn should_fall_back(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::RetriesExhausted { .. }
        )
    }

    /// Whether the last underlying failure was a timeout
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::RetriesExhausted { last_error, .. } => last_error.is_timeout(),
            Self::Cancelled {
                last_error: Some(e),
                ..
            } => e.is_timeout(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ControlPlaneError::validation("x").code(), "VALIDATION");
        assert_eq!(ControlPlaneError::circuit_open("cloud").code(), "CIRCUIT_OPEN");
    }

    #[test]
    fn test_fallback_classification() {
        assert!(ControlPlaneError::circuit_open("local").should_fall_back());
        let exhausted = ControlPlaneError::RetriesExhausted {
            attempts: 3,
            last_error: CallError::backend("503"),
        };
        assert!(exhausted.should_fall_back());
        let cancelled = ControlPlaneError::Cancelled {
            attempts: 1,
            last_error: None,
        };
        assert!(!cancelled.should_fall_back());
        assert!(!ControlPlaneError::validation("bad").should_fall_back());
    }

    #[test]
    fn test_timeout_is_distinguishable() {
        let timed_out = ControlPlaneError::RetriesExhausted {
            attempts: 2,
            last_error: CallError::Timeout(Duration::from_secs(5)),
        };
        assert!(timed_out.is_timeout());

        let refused = ControlPlaneError::RetriesExhausted {
            attempts: 2,
            last_error: CallError::backend("refused"),
        };
        assert!(!refused.is_timeout());
    }

    #[test]
    fn test_display_messages() {
        let err = ControlPlaneError::RestartLimitExceeded {
            agent_id: "tts-agent".to_string(),
            attempts: 3,
            max: 3,
        };
        assert_eq!(
            err.to_string(),
            "Restart limit exceeded for agent 'tts-agent' (3/3 attempts)"
        );

        let cancelled = ControlPlaneError::Cancelled {
            attempts: 2,
            last_error: Some(CallError::backend("busy")),
        };
        assert_eq!(cancelled.to_string(), "Cancelled after 2 attempt(s): backend error: busy");
    }
}
