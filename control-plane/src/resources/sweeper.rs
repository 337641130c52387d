//! Idle model sweeper
//!
//! Periodically asks the tracker which models have sat unused past the idle
//! timeout and hands them to the worker loop as [`UnloadRequest`]s. The
//! sweeper never unloads anything itself: the worker unloads the model and
//! then reports it with `mark_unloaded`, so the tracker only ever reflects
//! what the accelerator actually holds.

use crate::resources::tracker::ResourceTracker;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Ask the worker to unload a model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnloadRequest {
    pub model_id: String,
    /// Time since the model was last used
    pub idle_secs: u64,
}

pub struct IdleSweeper {
    tracker: Arc<ResourceTracker>,
    /// Follows config reloads
    idle_timeout: watch::Receiver<Duration>,
    interval: Duration,
    requests: mpsc::Sender<UnloadRequest>,
    /// Requested but not yet reported unloaded
    pending: HashSet<String>,
}

impl IdleSweeper {
    pub fn new(
        tracker: Arc<ResourceTracker>,
        idle_timeout: watch::Receiver<Duration>,
        interval: Duration,
        requests: mpsc::Sender<UnloadRequest>,
    ) -> Self {
        Self {
            tracker,
            idle_timeout,
            interval,
            requests,
            pending: HashSet::new(),
        }
    }

    /// One sweep. Returns the number of new unload requests sent.
    ///
    /// A model is requested once; it is requested again only if it is
    /// still loaded and idle after being used in between.
    pub async fn sweep_once(&mut self) -> usize {
        let idle_timeout = *self.idle_timeout.borrow();
        let idle = self.tracker.idle_models(idle_timeout);
        if idle.is_empty() {
            self.pending.clear();
            return 0;
        }
        let idle_for: HashMap<String, u64> = self
            .tracker
            .snapshot()
            .loaded
            .into_iter()
            .map(|m| (m.model_id, m.idle_secs))
            .collect();
        let idle_set: HashSet<&String> = idle.iter().collect();
        self.pending.retain(|id| idle_set.contains(id));

        let mut sent = 0;
        for model_id in idle {
            if self.pending.contains(&model_id) {
                continue;
            }
            let idle_secs = idle_for
                .get(&model_id)
                .copied()
                .unwrap_or_else(|| idle_timeout.as_secs());
            let request = UnloadRequest {
                model_id: model_id.clone(),
                idle_secs,
            };
            if self.requests.send(request).await.is_err() {
                tracing::warn!("Unload request receiver dropped");
                break;
            }
            tracing::info!(model = %model_id, idle_secs, "Idle model unload requested");
            self.pending.insert(model_id);
            sent += 1;
        }
        sent
    }

    /// Run until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; nothing can be idle yet
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
            }
        }
        tracing::info!("Idle sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        sweeper: IdleSweeper,
        tracker: Arc<ResourceTracker>,
        timeout: watch::Sender<Duration>,
        rx: mpsc::Receiver<UnloadRequest>,
    }

    fn setup() -> Fixture {
        let tracker = Arc::new(ResourceTracker::new(16_000.0, 100.0).unwrap());
        let (tx, rx) = mpsc::channel(16);
        let (timeout, timeout_rx) = watch::channel(Duration::from_secs(300));
        let sweeper = IdleSweeper::new(tracker.clone(), timeout_rx, Duration::from_secs(60), tx);
        Fixture {
            sweeper,
            tracker,
            timeout,
            rx,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_requests_idle_once() {
        let Fixture {
            mut sweeper,
            tracker,
            timeout: _timeout,
            mut rx,
        } = setup();
        tracker.mark_loaded("phi-3-mini-q4", 2_600.0).unwrap();
        tracker.mark_loaded("whisper-small", 1_000.0).unwrap();

        tokio::time::advance(Duration::from_secs(200)).await;
        tracker.touch("whisper-small");
        tokio::time::advance(Duration::from_secs(101)).await;

        assert_eq!(sweeper.sweep_once().await, 1);
        let request = rx.try_recv().unwrap();
        assert_eq!(request.model_id, "phi-3-mini-q4");
        assert_eq!(request.idle_secs, 301);

        // Not repeated while the worker is still unloading
        assert_eq!(sweeper.sweep_once().await, 0);

        tracker.mark_unloaded("phi-3-mini-q4");
        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(sweeper.sweep_once().await, 1);
        assert_eq!(rx.try_recv().unwrap().model_id, "whisper-small");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sweeps_on_interval_until_cancelled() {
        let Fixture {
            sweeper,
            tracker,
            timeout: _timeout,
            mut rx,
        } = setup();
        tracker.mark_loaded("phi-3-mini-q4", 2_600.0).unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sweeper.run(cancel.clone()));

        let request = rx.recv().await.unwrap();
        assert_eq!(request.model_id, "phi-3-mini-q4");
        assert!(request.idle_secs >= 300);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_follows_reload() {
        let Fixture {
            mut sweeper,
            tracker,
            timeout,
            mut rx,
        } = setup();
        tracker.mark_loaded("whisper-small", 1_000.0).unwrap();
        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(sweeper.sweep_once().await, 0);

        timeout.send(Duration::from_secs(60)).unwrap();
        assert_eq!(sweeper.sweep_once().await, 1);
        // Actual idle time, not the timeout that triggered the request
        assert_eq!(rx.try_recv().unwrap().idle_secs, 120);
    }
}
