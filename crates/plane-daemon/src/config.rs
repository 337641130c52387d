//! Daemon settings
//!
//! Lives in the same file as the control plane config, under a `daemon`
//! table (TOML) or key (YAML). `PLANE_AGENTS` (`id=url,id=url`),
//! `PLANE_HEALTH_INTERVAL_SECS` and `PLANE_GPU_PROBE` override it.

use crate::error::{DaemonError, DaemonResult};
use control_plane::{AgentEndpoint, PlaneConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Workers supervised by the health monitor
    pub agents: Vec<AgentEndpoint>,
    pub health_interval_secs: u64,
    pub health_timeout_secs: u64,
    /// Poll `nvidia-smi` for total VRAM
    pub gpu_probe: bool,
    pub gpu_index: usize,
    pub gpu_poll_interval_secs: u64,
    /// How often the config file is checked for changes
    pub config_poll_interval_secs: u64,
    /// Capacity of the unload and supervisor event channels
    pub channel_capacity: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            agents: Vec::new(),
            health_interval_secs: 10,
            health_timeout_secs: 5,
            gpu_probe: false,
            gpu_index: 0,
            gpu_poll_interval_secs: 60,
            config_poll_interval_secs: 5,
            channel_capacity: 64,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct DaemonSection {
    #[serde(default)]
    daemon: DaemonConfig,
}

impl DaemonConfig {
    /// Read the `daemon` section of `path`, apply env overrides, validate.
    pub fn load(path: &Path) -> DaemonResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| DaemonError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(path, &raw)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(path: &Path, raw: &str) -> DaemonResult<Self> {
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let section: Result<DaemonSection, String> = if is_yaml {
            serde_yaml::from_str(raw).map_err(|e| e.to_string())
        } else {
            toml::from_str(raw).map_err(|e| e.to_string())
        };
        section
            .map(|s| s.daemon)
            .map_err(|message| DaemonError::Parse {
                path: path.to_path_buf(),
                message,
            })
    }

    pub fn apply_env_overrides(&mut self) -> DaemonResult<()> {
        if let Ok(spec) = std::env::var("PLANE_AGENTS") {
            self.agents = parse_agents(&spec)?;
        }
        if let Some(v) = std::env::var("PLANE_HEALTH_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.health_interval_secs = v;
        }
        if let Ok(v) = std::env::var("PLANE_GPU_PROBE") {
            self.gpu_probe = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        Ok(())
    }

    pub fn validate(&self) -> DaemonResult<()> {
        let mut ids = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() || agent.health_url.trim().is_empty() {
                return Err(DaemonError::Invalid(
                    "agents need a non-empty id and health_url".into(),
                ));
            }
            if !ids.insert(agent.id.as_str()) {
                return Err(DaemonError::Invalid(format!(
                    "agent '{}' declared twice",
                    agent.id
                )));
            }
        }
        if self.health_interval_secs == 0
            || self.gpu_poll_interval_secs == 0
            || self.config_poll_interval_secs == 0
        {
            return Err(DaemonError::Invalid("poll intervals must be positive".into()));
        }
        if self.channel_capacity == 0 {
            return Err(DaemonError::Invalid("channel_capacity must be positive".into()));
        }
        Ok(())
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn gpu_poll_interval(&self) -> Duration {
        Duration::from_secs(self.gpu_poll_interval_secs)
    }

    pub fn config_poll_interval(&self) -> Duration {
        Duration::from_secs(self.config_poll_interval_secs)
    }
}

/// Parse `id=url,id=url`
pub fn parse_agents(spec: &str) -> DaemonResult<Vec<AgentEndpoint>> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((id, url)) if !id.trim().is_empty() && !url.trim().is_empty() => {
                Ok(AgentEndpoint::new(id.trim(), url.trim()))
            }
            _ => Err(DaemonError::AgentSpec(entry.to_string())),
        })
        .collect()
}

/// Load both halves of a config file.
pub fn load_all(path: &Path) -> DaemonResult<(PlaneConfig, DaemonConfig)> {
    let plane = PlaneConfig::load(path)?;
    let daemon = DaemonConfig::load(path)?;
    Ok((plane, daemon))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_agents() {
        let agents = parse_agents("stt=http://a:9000/health, vision=http://b:9001/health").unwrap();
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[1].id, "vision");
        assert_eq!(agents[1].health_url, "http://b:9001/health");

        assert!(parse_agents("").unwrap().is_empty());
        assert!(matches!(
            parse_agents("stt"),
            Err(DaemonError::AgentSpec(_))
        ));
    }

    #[test]
    fn test_duplicate_agents_rejected() {
        let config = DaemonConfig {
            agents: vec![
                AgentEndpoint::new("stt", "http://a/health"),
                AgentEndpoint::new("stt", "http://b/health"),
            ],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_section_uses_defaults() {
        let config = DaemonConfig::parse(Path::new("plane.toml"), "complexity_threshold = 0.6").unwrap();
        assert_eq!(config, DaemonConfig::default());
    }

    #[test]
    fn test_yaml_section() {
        let raw = "daemon:\n  health_interval_secs: 3\n  agents:\n    - id: stt\n      health_url: http://127.0.0.1:9000/health\n";
        let config = DaemonConfig::parse(Path::new("plane.yaml"), raw).unwrap();
        assert_eq!(config.health_interval_secs, 3);
        assert_eq!(config.agents[0].id, "stt");
    }
}
