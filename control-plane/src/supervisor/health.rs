//! Health monitoring loop feeding the supervisor.
//!
//! Each tick probes every agent. A failing agent is registered once per
//! outage (and again if it is still failing after a restart), so the
//! cool-down runs from the start of the outage rather than being pushed
//! back by every failed probe. Restart requests and the terminal
//! "given up" notice leave through an mpsc channel to the process manager.

use super::{RestartDecision, SelfHealingSupervisor};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// A supervised worker and where to probe it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEndpoint {
    pub id: String,
    pub health_url: String,
}

impl AgentEndpoint {
    pub fn new(id: impl Into<String>, health_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            health_url: health_url.into(),
        }
    }
}

/// Liveness check for one agent
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `Ok` when healthy, otherwise a short description of the failure
    async fn probe(&self, agent: &AgentEndpoint) -> Result<(), String>;
}

/// Probe by HTTP GET; any 2xx is healthy
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

impl Default for HttpHealthProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, agent: &AgentEndpoint) -> Result<(), String> {
        let resp = self
            .client
            .get(&agent.health_url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    format!("health probe timed out after {:?}", self.timeout)
                } else {
                    format!("health probe failed: {}", e)
                }
            })?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("health probe returned {}", resp.status()))
        }
    }
}

/// Notifications for the external process manager and operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SupervisorEvent {
    AgentFailed { agent_id: String, error: String },
    RestartRequested { agent_id: String, attempt: u32 },
    AgentRecovered { agent_id: String },
    /// Terminal; sent once per outage
    RestartLimitExceeded { agent_id: String, attempts: u32 },
}

/// Periodic prober that drives [`SelfHealingSupervisor`]
pub struct HealthMonitor {
    supervisor: Arc<SelfHealingSupervisor>,
    probe: Arc<dyn HealthProbe>,
    agents: Vec<AgentEndpoint>,
    interval: Duration,
    events: mpsc::Sender<SupervisorEvent>,
    /// Agents whose current outage is already registered
    down: HashSet<String>,
    escalated: HashSet<String>,
}

impl HealthMonitor {
    pub fn new(
        supervisor: Arc<SelfHealingSupervisor>,
        probe: Arc<dyn HealthProbe>,
        agents: Vec<AgentEndpoint>,
        interval: Duration,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> Self {
        Self {
            supervisor,
            probe,
            agents,
            interval,
            events,
            down: HashSet::new(),
            escalated: HashSet::new(),
        }
    }

    async fn emit(&self, event: SupervisorEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("Supervisor event receiver dropped");
        }
    }

    /// Probe every agent once, concurrently, and act on the results.
    pub async fn check_once(&mut self) {
        let agents = self.agents.clone();
        let outcomes = join_all(agents.iter().map(|a| self.probe.probe(a))).await;
        for (agent, outcome) in agents.iter().zip(outcomes) {
            self.handle(agent, outcome).await;
        }
    }

    async fn handle(&mut self, agent: &AgentEndpoint, outcome: Result<(), String>) {
        let id = agent.id.as_str();
        match outcome {
            Ok(()) => {
                self.down.remove(id);
                self.escalated.remove(id);
                if self.supervisor.reset_status(id) {
                    self.emit(SupervisorEvent::AgentRecovered {
                        agent_id: id.to_string(),
                    })
                    .await;
                }
                return;
            }
            Err(error) => {
                if self.down.insert(id.to_string()) {
                    self.supervisor.register_failure(id, &error);
                    self.emit(SupervisorEvent::AgentFailed {
                        agent_id: id.to_string(),
                        error,
                    })
                    .await;
                } else {
                    tracing::debug!(agent = id, error = %error, "Agent still failing");
                }
            }
        }

        match self.supervisor.decide(id) {
            RestartDecision::Restart => match self.supervisor.record_restart(id) {
                Ok(attempt) => {
                    // A failure after this restart is a new outage
                    self.down.remove(id);
                    self.emit(SupervisorEvent::RestartRequested {
                        agent_id: id.to_string(),
                        attempt,
                    })
                    .await;
                }
                Err(e) => tracing::error!(agent = id, error = %e, "Restart not recorded"),
            },
            RestartDecision::GiveUp => {
                if self.escalated.insert(id.to_string()) {
                    let attempts = self
                        .supervisor
                        .summary(id)
                        .map(|s| s.restart_attempts)
                        .unwrap_or_default();
                    tracing::error!(agent = id, attempts, "Restart limit exceeded");
                    self.emit(SupervisorEvent::RestartLimitExceeded {
                        agent_id: id.to_string(),
                        attempts,
                    })
                    .await;
                }
            }
            RestartDecision::CoolingDown { remaining_ms } => {
                tracing::debug!(agent = id, remaining_ms, "Restart cool-down running");
            }
            RestartDecision::Healthy => {}
        }
    }

    /// Run until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            agents = self.agents.len(),
            interval_secs = self.interval.as_secs(),
            "Health monitor started"
        );
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.check_once().await,
            }
        }
        tracing::info!("Health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::SupervisorSettings;
    use std::sync::Mutex;

    /// Returns scripted results per call, then repeats the last one
    struct ScriptedProbe {
        script: Mutex<Vec<Result<(), String>>>,
    }

    impl ScriptedProbe {
        fn new(script: Vec<Result<(), String>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
            })
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, _agent: &AgentEndpoint) -> Result<(), String> {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.remove(0)
            } else {
                script[0].clone()
            }
        }
    }

    fn monitor(
        probe: Arc<dyn HealthProbe>,
    ) -> (
        HealthMonitor,
        Arc<SelfHealingSupervisor>,
        mpsc::Receiver<SupervisorEvent>,
    ) {
        let supervisor = Arc::new(SelfHealingSupervisor::new(SupervisorSettings {
            max_restart_attempts: 2,
            restart_delay: Duration::from_secs(30),
            recent_error_capacity: 5,
        }));
        let (tx, rx) = mpsc::channel(32);
        let m = HealthMonitor::new(
            supervisor.clone(),
            probe,
            vec![AgentEndpoint::new("stt", "http://127.0.0.1:1/health")],
            Duration::from_secs(10),
            tx,
        );
        (m, supervisor, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<SupervisorEvent>) -> Vec<SupervisorEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_restart_then_give_up() {
        let (mut m, supervisor, mut rx) = monitor(ScriptedProbe::new(vec![Err("down".into())]));

        m.check_once().await;
        assert_eq!(
            drain(&mut rx),
            vec![SupervisorEvent::AgentFailed {
                agent_id: "stt".into(),
                error: "down".into()
            }]
        );

        // Still cooling down; repeated failures do not extend the cool-down
        tokio::time::advance(Duration::from_secs(20)).await;
        m.check_once().await;
        assert!(drain(&mut rx).is_empty());
        assert_eq!(supervisor.summary("stt").unwrap().failure_count, 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        m.check_once().await;
        assert_eq!(
            drain(&mut rx),
            vec![SupervisorEvent::RestartRequested {
                agent_id: "stt".into(),
                attempt: 1
            }]
        );

        // Restarted process fails again: new outage, second restart
        m.check_once().await;
        tokio::time::advance(Duration::from_secs(31)).await;
        m.check_once().await;
        let events = drain(&mut rx);
        assert!(events.contains(&SupervisorEvent::RestartRequested {
            agent_id: "stt".into(),
            attempt: 2
        }));

        // Budget spent: escalate exactly once
        m.check_once().await;
        tokio::time::advance(Duration::from_secs(31)).await;
        m.check_once().await;
        m.check_once().await;
        let limit: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, SupervisorEvent::RestartLimitExceeded { .. }))
            .collect();
        assert_eq!(
            limit,
            vec![SupervisorEvent::RestartLimitExceeded {
                agent_id: "stt".into(),
                attempts: 2
            }]
        );
        assert!(!supervisor.should_restart("stt"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_resets_record() {
        let probe = ScriptedProbe::new(vec![Err("down".into()), Ok(())]);
        let (mut m, supervisor, mut rx) = monitor(probe);

        m.check_once().await;
        assert!(supervisor.has_failures("stt"));
        m.check_once().await;
        assert!(!supervisor.has_failures("stt"));
        let events = drain(&mut rx);
        assert_eq!(
            events.last(),
            Some(&SupervisorEvent::AgentRecovered {
                agent_id: "stt".into()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let (m, _supervisor, _rx) = monitor(ScriptedProbe::new(vec![Ok(())]));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(m.run(cancel.clone()));
        tokio::time::advance(Duration::from_secs(25)).await;
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_http_probe_unreachable() {
        let probe = HttpHealthProbe::new(Duration::from_millis(500));
        let agent = AgentEndpoint::new("nobody", "http://127.0.0.1:1/health");
        assert!(probe.probe(&agent).await.is_err());
    }
}
