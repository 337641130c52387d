//! Daemon error types

use control_plane::ControlPlaneError;
use std::path::PathBuf;
use thiserror::Error;

pub type DaemonResult<T> = Result<T, DaemonError>;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse daemon section of {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid daemon config: {0}")]
    Invalid(String),

    #[error("Invalid agent spec '{0}' (expected id=url)")]
    AgentSpec(String),

    #[error("GPU probe failed: {0}")]
    GpuProbe(String),

    #[error("Unparseable nvidia-smi output: {0:?}")]
    GpuParse(String),

    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),
}
