//! Supervised background tasks
//!
//! Each task owns one responsibility and talks to the control plane only
//! through its public API:
//!
//! - idle sweeper: unload requests for models past the idle timeout
//! - health monitor: probes agents, drives the supervisor
//! - GPU poller: keeps total VRAM in line with the device
//! - config watcher: hot-reloads the config file on change
//!
//! All tasks stop on one [`CancellationToken`] and are joined through a
//! [`JoinSet`] on shutdown.

use crate::config::DaemonConfig;
use crate::error::{DaemonError, DaemonResult};
use crate::gpu::run_gpu_poller;
use control_plane::{
    ControlPlane, HealthMonitor, HealthProbe, HttpHealthProbe, IdleSweeper, PlaneConfig,
    SupervisorEvent, UnloadRequest,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Receiving ends for the external worker loop and process manager
pub struct DaemonChannels {
    pub unloads: mpsc::Receiver<UnloadRequest>,
    pub events: mpsc::Receiver<SupervisorEvent>,
}

pub struct Daemon {
    plane: Arc<ControlPlane>,
    config: DaemonConfig,
    config_path: Option<PathBuf>,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl Daemon {
    pub fn new(plane: Arc<ControlPlane>, config: DaemonConfig, config_path: Option<PathBuf>) -> Self {
        Self {
            plane,
            config,
            config_path,
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
        }
    }

    pub fn plane(&self) -> &Arc<ControlPlane> {
        &self.plane
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn every task with HTTP health probes.
    pub fn start(&mut self) -> DaemonChannels {
        let probe = Arc::new(HttpHealthProbe::new(self.config.health_timeout()));
        self.start_with_probe(probe)
    }

    pub fn start_with_probe(&mut self, probe: Arc<dyn HealthProbe>) -> DaemonChannels {
        let capacity = self.config.channel_capacity;
        let (unload_tx, unloads) = mpsc::channel(capacity);
        let (event_tx, events) = mpsc::channel(capacity);
        let plane_config = self.plane.config();

        let sweeper = IdleSweeper::new(
            Arc::clone(self.plane.tracker()),
            self.plane.idle_timeout(),
            plane_config.sweep_interval(),
            unload_tx,
        );
        self.tasks.spawn(sweeper.run(self.cancel.clone()));

        if self.config.agents.is_empty() {
            tracing::info!("No agents configured; health monitor not started");
        } else {
            let monitor = HealthMonitor::new(
                Arc::clone(self.plane.supervisor()),
                probe,
                self.config.agents.clone(),
                self.config.health_interval(),
                event_tx,
            );
            self.tasks.spawn(monitor.run(self.cancel.clone()));
        }

        if self.config.gpu_probe {
            self.tasks.spawn(run_gpu_poller(
                Arc::clone(self.plane.tracker()),
                self.config.gpu_index,
                self.config.gpu_poll_interval(),
                self.cancel.clone(),
            ));
        }

        if let Some(path) = &self.config_path {
            let watcher = ConfigWatcher::new(
                Arc::clone(&self.plane),
                path.clone(),
                self.config.config_poll_interval(),
            );
            self.tasks.spawn(watcher.run(self.cancel.clone()));
        }

        tracing::info!(
            agents = self.config.agents.len(),
            gpu_probe = self.config.gpu_probe,
            watch_config = self.config_path.is_some(),
            "Background tasks started"
        );
        DaemonChannels { unloads, events }
    }

    /// Cancel every task and wait for them to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!("Background tasks stopped");
    }
}

/// Reloads the control plane when the config file content changes
pub struct ConfigWatcher {
    plane: Arc<ControlPlane>,
    path: PathBuf,
    interval: Duration,
    last: Option<String>,
}

impl ConfigWatcher {
    pub fn new(plane: Arc<ControlPlane>, path: PathBuf, interval: Duration) -> Self {
        Self {
            plane,
            path,
            interval,
            last: None,
        }
    }

    /// Read the file once; reload if it changed since the last look.
    ///
    /// The first call only records the content. Returns whether a reload
    /// was applied. A bad file leaves the running config untouched.
    pub async fn check_once(&mut self) -> DaemonResult<bool> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| DaemonError::Io {
                path: self.path.clone(),
                source,
            })?;
        let Some(last) = &self.last else {
            self.last = Some(raw);
            return Ok(false);
        };
        if *last == raw {
            return Ok(false);
        }
        self.last = Some(raw.clone());

        let mut config = PlaneConfig::parse(&self.path, &raw)?;
        config.apply_env_overrides();
        self.plane.reload(config)?;
        tracing::info!(path = %self.path.display(), "Config file change applied");
        Ok(true)
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.check_once().await {
                        tracing::warn!(error = %e, "Config reload rejected; keeping active config");
                    }
                }
            }
        }
        tracing::info!("Config watcher stopped");
    }
}
