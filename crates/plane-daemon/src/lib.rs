//! Process host for the model-serving control plane.
//!
//! Loads configuration, builds a [`control_plane::ControlPlane`] and runs
//! its background tasks. Unload requests and supervisor events are written
//! as JSON lines on stdout for the external worker loop and process
//! manager; logs go to stderr.

pub mod config;
pub mod error;
pub mod gpu;
pub mod tasks;

pub use config::{load_all, parse_agents, DaemonConfig};
pub use error::{DaemonError, DaemonResult};
pub use tasks::{ConfigWatcher, Daemon, DaemonChannels};
