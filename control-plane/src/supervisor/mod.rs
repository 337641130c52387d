//! Self-healing supervisor
//!
//! Tracks failures of externally managed worker processes and decides when
//! a restart should be requested. The supervisor never restarts anything
//! itself; the process manager asks [`SelfHealingSupervisor::should_restart`],
//! performs the restart, then reports it with
//! [`SelfHealingSupervisor::record_restart`].
//!
//! # Lifecycle per agent
//!
//! ```text
//! register_failure ─▶ record created / appended
//!        │
//!        ▼  cool-down (restart_delay) elapsed?
//! should_restart ── no ──▶ wait
//!        │ yes
//!        ▼
//! record_restart ─▶ restart_attempts += 1
//!        │
//!        ├─ healthy probe ─▶ reset_status (record cleared)
//!        └─ attempts == max ─▶ terminal: surfaced to operator
//! ```

pub mod health;

use crate::error::{ControlPlaneError, ControlPlaneResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;

/// Restart policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorSettings {
    pub max_restart_attempts: u32,
    /// Cool-down after the latest failure before a restart is recommended
    pub restart_delay: Duration,
    /// How many recent error messages each record keeps
    pub recent_error_capacity: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_restart_attempts: 3,
            restart_delay: Duration::from_secs(30),
            recent_error_capacity: 10,
        }
    }
}

/// Failure history for one agent
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub first_failure_at: Instant,
    pub last_failure_at: Instant,
    /// Wall-clock time of the first failure, for reporting
    pub first_failure_utc: DateTime<Utc>,
    pub failure_count: u32,
    pub restart_attempts: u32,
    /// Most recent last
    pub recent_errors: VecDeque<String>,
}

impl FailureRecord {
    fn new(now: Instant) -> Self {
        Self {
            first_failure_at: now,
            last_failure_at: now,
            first_failure_utc: Utc::now(),
            failure_count: 0,
            restart_attempts: 0,
            recent_errors: VecDeque::new(),
        }
    }

    fn push_error(&mut self, error: &str, capacity: usize) {
        self.recent_errors.push_back(error.to_string());
        while self.recent_errors.len() > capacity.max(1) {
            self.recent_errors.pop_front();
        }
    }
}

/// Serializable view of a failure record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub agent_id: String,
    pub failure_count: u32,
    pub restart_attempts: u32,
    pub first_failure_at: DateTime<Utc>,
    pub secs_since_last_failure: u64,
    pub recent_errors: Vec<String>,
    pub given_up: bool,
}

/// What the process manager should do for an agent right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum RestartDecision {
    /// No failure on record
    Healthy,
    /// Failed recently; wait out the cool-down
    CoolingDown { remaining_ms: u64 },
    /// Cool-down elapsed; restart now
    Restart,
    /// Restart budget spent; escalate to an operator
    GiveUp,
}

type SharedRecord = Arc<Mutex<FailureRecord>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-agent failure tracking and restart gating.
///
/// Each agent's record has its own lock; the table lock is only held to
/// find, insert or remove a record. Lock order is table, then record.
#[derive(Debug, Default)]
pub struct SelfHealingSupervisor {
    settings: RwLock<SupervisorSettings>,
    records: Mutex<HashMap<String, SharedRecord>>,
}

impl SelfHealingSupervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> SupervisorSettings {
        *self.settings.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn update_settings(&self, settings: SupervisorSettings) {
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    fn record(&self, agent_id: &str) -> Option<SharedRecord> {
        lock(&self.records).get(agent_id).cloned()
    }

    /// Append a failure, creating the record on first failure.
    pub fn register_failure(&self, agent_id: &str, error: &str) {
        self.register_failure_at(agent_id, error, Instant::now())
    }

    pub fn register_failure_at(&self, agent_id: &str, error: &str, now: Instant) {
        let settings = self.settings();
        let mut records = lock(&self.records);
        let shared = Arc::clone(
            records
                .entry(agent_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(FailureRecord::new(now)))),
        );
        // Take the record before releasing the table so a concurrent reset
        // cannot detach it mid-update
        let mut record = lock(&shared);
        drop(records);
        record.failure_count = record.failure_count.saturating_add(1);
        record.last_failure_at = now;
        record.push_error(error, settings.recent_error_capacity);

        tracing::warn!(
            agent = agent_id,
            failures = record.failure_count,
            restart_attempts = record.restart_attempts,
            error,
            "Agent failure registered"
        );
    }

    /// Current recommendation for `agent_id`.
    pub fn decide_at(&self, agent_id: &str, now: Instant) -> RestartDecision {
        let Some(record) = self.record(agent_id) else {
            return RestartDecision::Healthy;
        };
        let settings = self.settings();
        let record = lock(&record);
        if record.restart_attempts >= settings.max_restart_attempts {
            return RestartDecision::GiveUp;
        }
        let since = now.saturating_duration_since(record.last_failure_at);
        if since > settings.restart_delay {
            RestartDecision::Restart
        } else {
            let remaining = settings.restart_delay - since;
            RestartDecision::CoolingDown {
                remaining_ms: remaining.as_millis().max(1) as u64,
            }
        }
    }

    pub fn decide(&self, agent_id: &str) -> RestartDecision {
        self.decide_at(agent_id, Instant::now())
    }

    /// Whether a restart should be requested now.
    ///
    /// False with no failure on record, once the restart budget is spent,
    /// or while the cool-down since the last failure is still running.
    pub fn should_restart_at(&self, agent_id: &str, now: Instant) -> bool {
        self.decide_at(agent_id, now) == RestartDecision::Restart
    }

    pub fn should_restart(&self, agent_id: &str) -> bool {
        self.should_restart_at(agent_id, Instant::now())
    }

    /// Count a restart. The failure record stays until recovery is confirmed.
    ///
    /// Returns the new attempt count, or `RestartLimitExceeded` if the budget
    /// was already spent (or no failure is on record to restart for).
    pub fn record_restart(&self, agent_id: &str) -> ControlPlaneResult<u32> {
        let settings = self.settings();
        let record = self.record(agent_id).ok_or_else(|| {
            ControlPlaneError::validation(format!(
                "no failure on record for agent '{}'",
                agent_id
            ))
        })?;
        let mut record = lock(&record);
        if record.restart_attempts >= settings.max_restart_attempts {
            return Err(ControlPlaneError::RestartLimitExceeded {
                agent_id: agent_id.to_string(),
                attempts: record.restart_attempts,
                max: settings.max_restart_attempts,
            });
        }
        record.restart_attempts += 1;
        tracing::info!(
            agent = agent_id,
            attempt = record.restart_attempts,
            max = settings.max_restart_attempts,
            "Agent restart recorded"
        );
        if record.restart_attempts >= settings.max_restart_attempts {
            tracing::error!(
                agent = agent_id,
                attempts = record.restart_attempts,
                "Restart budget spent; further failures need an operator"
            );
        }
        Ok(record.restart_attempts)
    }

    /// Error for an agent the supervisor has given up on, if it has.
    pub fn check_limit(&self, agent_id: &str) -> ControlPlaneResult<()> {
        let settings = self.settings();
        match self.record(agent_id) {
            Some(record) => {
                let record = lock(&record);
                if record.restart_attempts >= settings.max_restart_attempts {
                    Err(ControlPlaneError::RestartLimitExceeded {
                        agent_id: agent_id.to_string(),
                        attempts: record.restart_attempts,
                        max: settings.max_restart_attempts,
                    })
                } else {
                    Ok(())
                }
            }
            None => Ok(()),
        }
    }

    /// Clear the failure record after a confirmed recovery.
    /// Returns whether a record existed.
    pub fn reset_status(&self, agent_id: &str) -> bool {
        let removed = lock(&self.records).remove(agent_id).is_some();
        if removed {
            tracing::info!(agent = agent_id, "Agent recovered, failure record cleared");
        }
        removed
    }

    pub fn has_failures(&self, agent_id: &str) -> bool {
        self.record(agent_id).is_some()
    }

    pub fn summary(&self, agent_id: &str) -> Option<FailureSummary> {
        let settings = self.settings();
        let record = self.record(agent_id)?;
        let record = lock(&record);
        Some(FailureSummary {
            agent_id: agent_id.to_string(),
            failure_count: record.failure_count,
            restart_attempts: record.restart_attempts,
            first_failure_at: record.first_failure_utc,
            secs_since_last_failure: record.last_failure_at.elapsed().as_secs(),
            recent_errors: record.recent_errors.iter().cloned().collect(),
            given_up: record.restart_attempts >= settings.max_restart_attempts,
        })
    }

    /// Summaries for every agent with a failure on record, sorted by id.
    pub fn summaries(&self) -> Vec<FailureSummary> {
        let mut ids: Vec<String> = lock(&self.records).keys().cloned().collect();
        ids.sort();
        ids.iter().filter_map(|id| self.summary(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor() -> SelfHealingSupervisor {
        SelfHealingSupervisor::new(SupervisorSettings {
            max_restart_attempts: 3,
            restart_delay: Duration::from_secs(30),
            recent_error_capacity: 3,
        })
    }

    #[test]
    fn test_no_record_no_restart() {
        let s = supervisor();
        assert!(!s.should_restart("stt-agent"));
        assert_eq!(s.decide("stt-agent"), RestartDecision::Healthy);
    }

    #[test]
    fn test_cooldown_before_restart() {
        let s = supervisor();
        let t0 = Instant::now();
        s.register_failure_at("stt-agent", "health probe failed", t0);
        assert!(!s.should_restart_at("stt-agent", t0 + Duration::from_secs(10)));
        assert!(matches!(
            s.decide_at("stt-agent", t0 + Duration::from_secs(10)),
            RestartDecision::CoolingDown { remaining_ms: 20_000 }
        ));
        assert!(!s.should_restart_at("stt-agent", t0 + Duration::from_secs(30)));
        assert!(s.should_restart_at("stt-agent", t0 + Duration::from_secs(31)));
    }

    #[test]
    fn test_new_failure_restarts_cooldown() {
        let s = supervisor();
        let t0 = Instant::now();
        s.register_failure_at("a", "e1", t0);
        s.register_failure_at("a", "e2", t0 + Duration::from_secs(25));
        assert!(!s.should_restart_at("a", t0 + Duration::from_secs(40)));
        assert!(s.should_restart_at("a", t0 + Duration::from_secs(56)));
    }

    #[test]
    fn test_restart_does_not_clear_record() {
        let s = supervisor();
        s.register_failure("a", "boom");
        assert_eq!(s.record_restart("a").unwrap(), 1);
        assert!(s.has_failures("a"));
        assert_eq!(s.summary("a").unwrap().restart_attempts, 1);
    }

    #[test]
    fn test_restart_limit_is_terminal() {
        let s = supervisor();
        let t0 = Instant::now();
        for i in 0..3u64 {
            let at = t0 + Duration::from_secs(i * 100);
            s.register_failure_at("x", "crash", at);
            assert!(s.should_restart_at("x", at + Duration::from_secs(31)));
            s.record_restart("x").unwrap();
        }

        // Fourth failure: still no restart, however long we wait
        let t4 = t0 + Duration::from_secs(400);
        s.register_failure_at("x", "crash", t4);
        assert!(!s.should_restart_at("x", t4 + Duration::from_secs(3_600)));
        assert_eq!(s.decide_at("x", t4), RestartDecision::GiveUp);

        let err = s.record_restart("x").unwrap_err();
        assert!(matches!(
            err,
            ControlPlaneError::RestartLimitExceeded { attempts: 3, max: 3, .. }
        ));
        assert!(s.check_limit("x").is_err());
        assert!(s.summary("x").unwrap().given_up);
    }

    #[test]
    fn test_reset_clears_everything() {
        let s = supervisor();
        s.register_failure("a", "boom");
        s.record_restart("a").unwrap();
        assert!(s.reset_status("a"));
        assert!(!s.has_failures("a"));
        assert!(!s.reset_status("a"));

        // A fresh failure starts a fresh budget
        s.register_failure("a", "boom again");
        let summary = s.summary("a").unwrap();
        assert_eq!(summary.failure_count, 1);
        assert_eq!(summary.restart_attempts, 0);
    }

    #[test]
    fn test_recent_errors_bounded_most_recent_last() {
        let s = supervisor();
        for i in 0..5 {
            s.register_failure("a", &format!("err {}", i));
        }
        let summary = s.summary("a").unwrap();
        assert_eq!(summary.failure_count, 5);
        assert_eq!(summary.recent_errors, vec!["err 2", "err 3", "err 4"]);
    }

    #[test]
    fn test_record_restart_without_failure() {
        let s = supervisor();
        assert_eq!(s.record_restart("ghost").unwrap_err().code(), "VALIDATION");
    }

    #[test]
    fn test_agents_independent() {
        let s = supervisor();
        s.register_failure("a", "x");
        assert!(s.has_failures("a"));
        assert!(!s.has_failures("b"));
        let ids: Vec<_> = s.summaries().into_iter().map(|f| f.agent_id).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[test]
    fn test_concurrent_reset_loses_no_failures() {
        const FAILURES: u32 = 5_000;
        let s = Arc::new(supervisor());
        let writer = {
            let s = Arc::clone(&s);
            std::thread::spawn(move || {
                for _ in 0..FAILURES {
                    s.register_failure("a", "boom");
                }
            })
        };

        // Every registered failure ends up either in a cleared record or in
        // the one still on the table
        let mut cleared = 0;
        while !writer.is_finished() {
            let removed = lock(&s.records).remove("a");
            if let Some(record) = removed {
                cleared += lock(&record).failure_count;
            }
        }
        writer.join().unwrap();
        let remaining = s.summary("a").map(|f| f.failure_count).unwrap_or(0);
        assert_eq!(cleared + remaining, FAILURES);
    }
}
