//! Circuit breakers for backend and agent targets.
//!
//! Each named target gets its own [`CircuitBreaker`] with its own lock, so
//! traffic to unrelated targets never contends. The [`BreakerRegistry`]
//! holds its map lock only long enough to look a breaker up or create it.
//!
//! ```text
//!            failures >= threshold
//!   Closed ─────────────────────────▶ Open
//!     ▲                               │  ▲
//!     │ 3 successes                   │  │ any failure
//!     │                 cooldown      ▼  │
//!     └────────────── HalfOpen ◀──────┘──┘
//! ```
//!
//! The Open → HalfOpen transition is lazy: it happens on the first call
//! attempt after the recovery timeout, not on a timer.

use crate::error::{ControlPlaneError, ControlPlaneResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;

/// Consecutive half-open successes required to close the circuit.
pub const HALF_OPEN_SUCCESS_QUOTA: u32 = 3;

/// Circuit breaker state for a single target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Healthy — requests allowed.
    Closed,
    /// Tripped — requests rejected until the recovery timeout elapses.
    Open,
    /// Probing recovery — requests allowed, one failure reopens.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Thresholds shared by every breaker in a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Time after the last failure before Open → HalfOpen.
    pub recovery_timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Serializable view of a breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub target: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub secs_since_last_failure: Option<u64>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_at: Option<Instant>,
    settings: BreakerSettings,
}

/// Failure/success state machine shielding callers from one target.
#[derive(Debug)]
pub struct CircuitBreaker {
    target: String,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker for `target`.
    pub fn new(target: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            target: target.into(),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_failure_at: None,
                settings,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Stored state; does not apply the lazy Open → HalfOpen transition.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.lock().consecutive_successes
    }

    pub fn update_settings(&self, settings: BreakerSettings) {
        self.lock().settings = settings;
    }

    /// Whether a call attempted at `now` would be rejected.
    pub fn is_rejecting_at(&self, now: Instant) -> bool {
        let inner = self.lock();
        inner.state == CircuitState::Open && !cooldown_elapsed(&inner, now)
    }

    pub fn is_rejecting(&self) -> bool {
        self.is_rejecting_at(Instant::now())
    }

    /// Admit or reject a call attempt.
    ///
    /// An open breaker whose recovery timeout has elapsed moves to HalfOpen
    /// here, before the call executes.
    pub fn try_acquire_at(&self, now: Instant) -> ControlPlaneResult<CircuitState> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(inner.state),
            CircuitState::Open if cooldown_elapsed(&inner, now) => {
                inner.state = CircuitState::HalfOpen;
                inner.consecutive_successes = 0;
                tracing::info!(
                    breaker = %self.target,
                    from = %CircuitState::Open,
                    to = %CircuitState::HalfOpen,
                    "Circuit recovery timeout elapsed, probing"
                );
                Ok(CircuitState::HalfOpen)
            }
            CircuitState::Open => {
                tracing::debug!(breaker = %self.target, "Circuit open, call rejected");
                Err(ControlPlaneError::circuit_open(&self.target))
            }
        }
    }

    pub fn try_acquire(&self) -> ControlPlaneResult<CircuitState> {
        self.try_acquire_at(Instant::now())
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= HALF_OPEN_SUCCESS_QUOTA {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    tracing::info!(
                        breaker = %self.target,
                        from = %CircuitState::HalfOpen,
                        to = %CircuitState::Closed,
                        "Circuit closed after recovery"
                    );
                }
            }
            // A call admitted before the circuit opened finished late; the
            // open window stands.
            CircuitState::Open => {}
        }
    }

    /// Record a failed call at `now`.
    pub fn record_failure_at(&self, now: Instant) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure_at = Some(now);
        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= inner.settings.failure_threshold {
                    inner.state = CircuitState::Open;
                    tracing::warn!(
                        breaker = %self.target,
                        from = %CircuitState::Closed,
                        to = %CircuitState::Open,
                        failures = inner.consecutive_failures,
                        threshold = inner.settings.failure_threshold,
                        "Circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.consecutive_successes = 0;
                tracing::warn!(
                    breaker = %self.target,
                    from = %CircuitState::HalfOpen,
                    to = %CircuitState::Open,
                    "Probe failed, circuit reopened"
                );
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now())
    }

    /// Force the breaker closed (operator action).
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.last_failure_at = None;
        tracing::info!(breaker = %self.target, "Circuit manually reset");
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        let now = Instant::now();
        BreakerSnapshot {
            target: self.target.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            secs_since_last_failure: inner
                .last_failure_at
                .map(|t| now.saturating_duration_since(t).as_secs()),
        }
    }

    /// Run `op` through the breaker.
    ///
    /// Rejected immediately with [`ControlPlaneError::CircuitOpen`] while
    /// open. Cancellation is not counted as a failure.
    pub async fn call<T, F, Fut>(&self, op: F) -> ControlPlaneResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ControlPlaneResult<T>>,
    {
        self.try_acquire()?;
        let result = op().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(ControlPlaneError::Cancelled { .. }) => {}
            Err(_) => self.record_failure(),
        }
        result
    }
}

fn cooldown_elapsed(inner: &BreakerInner, now: Instant) -> bool {
    match inner.last_failure_at {
        Some(at) => now.saturating_duration_since(at) > inner.settings.recovery_timeout,
        None => true,
    }
}

/// Lazily-populated set of breakers keyed by target name.
#[derive(Debug)]
pub struct BreakerRegistry {
    settings: RwLock<BreakerSettings>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn breakers(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> BreakerSettings {
        *self.settings.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Breaker for `target`, created closed on first use.
    pub fn get(&self, target: &str) -> Arc<CircuitBreaker> {
        let settings = self.settings();
        Arc::clone(
            self.breakers()
                .entry(target.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(target, settings))),
        )
    }

    /// Breaker for `target` if one has been created.
    pub fn existing(&self, target: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers().get(target).cloned()
    }

    /// Whether `target` currently rejects calls. Unknown targets never do.
    pub fn is_rejecting(&self, target: &str) -> bool {
        self.existing(target)
            .map(|b| b.is_rejecting())
            .unwrap_or(false)
    }

    /// Apply new thresholds to existing and future breakers.
    pub fn update_settings(&self, settings: BreakerSettings) {
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
        let breakers: Vec<_> = self.breakers().values().cloned().collect();
        for breaker in breakers {
            breaker.update_settings(settings);
        }
    }

    /// Snapshots sorted by target name.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<_> = self.breakers().values().cloned().collect();
        let mut snaps: Vec<_> = breakers.iter().map(|b| b.snapshot()).collect();
        snaps.sort_by(|a, b| a.target.cmp(&b.target));
        snaps
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, timeout_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "cloud",
            BreakerSettings {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_secs(timeout_secs),
            },
        )
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = breaker(3, 60);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_circuit_opens_after_threshold() {
        let cb = breaker(2, 60);
        let now = Instant::now();
        cb.record_failure_at(now);
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure_at(now);
        assert_eq!(cb.state(), CircuitState::Open);

        let err = cb.try_acquire_at(now + Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ControlPlaneError::CircuitOpen { .. }));
    }

    #[test]
    fn test_success_in_closed_resets_failures() {
        let cb = breaker(3, 60);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.consecutive_failures(), 0);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_lazy_half_open_after_timeout() {
        let cb = breaker(1, 30);
        let t0 = Instant::now();
        cb.record_failure_at(t0);
        assert_eq!(cb.state(), CircuitState::Open);

        // Exactly at the timeout still rejects: the elapsed time must exceed it
        assert!(cb.try_acquire_at(t0 + Duration::from_secs(30)).is_err());
        // No timer: state stays open until a call is attempted
        assert_eq!(cb.state(), CircuitState::Open);

        let state = cb.try_acquire_at(t0 + Duration::from_secs(31)).unwrap();
        assert_eq!(state, CircuitState::HalfOpen);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_closes_after_quota() {
        let cb = breaker(1, 0);
        let t0 = Instant::now();
        cb.record_failure_at(t0);
        cb.try_acquire_at(t0 + Duration::from_millis(1)).unwrap();

        cb.record_success();
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.consecutive_successes(), 2);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_successes(), 0);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = breaker(1, 10);
        let t0 = Instant::now();
        cb.record_failure_at(t0);
        cb.try_acquire_at(t0 + Duration::from_secs(11)).unwrap();
        cb.record_success();
        let t1 = t0 + Duration::from_secs(12);
        cb.record_failure_at(t1);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.consecutive_successes(), 0);
        // The new failure restarts the cooldown
        assert!(cb.try_acquire_at(t1 + Duration::from_secs(5)).is_err());
        assert!(cb.try_acquire_at(t1 + Duration::from_secs(11)).is_ok());
    }

    #[test]
    fn test_reset() {
        let cb = breaker(1, 600);
        cb.record_failure();
        assert!(cb.is_rejecting());
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(!cb.is_rejecting());
    }

    #[tokio::test]
    async fn test_call_records_outcomes() {
        let cb = breaker(2, 600);
        let ok: ControlPlaneResult<u32> = cb.call(|| async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        for _ in 0..2 {
            let _ = cb
                .call(|| async { Err::<(), _>(ControlPlaneError::validation("boom")) })
                .await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let rejected = cb.call(|| async { Ok(1) }).await.unwrap_err();
        assert_eq!(rejected.code(), "CIRCUIT_OPEN");
    }

    #[tokio::test]
    async fn test_call_ignores_cancellation() {
        let cb = breaker(1, 600);
        let _ = cb
            .call(|| async {
                Err::<(), _>(ControlPlaneError::Cancelled {
                    attempts: 1,
                    last_error: None,
                })
            })
            .await;
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[test]
    fn test_registry_isolates_targets() {
        let registry = BreakerRegistry::new(BreakerSettings {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(600),
        });
        registry.get("local").record_failure();
        assert!(registry.is_rejecting("local"));
        assert!(!registry.is_rejecting("cloud"));
        assert!(!registry.is_rejecting("never-seen"));
        assert!(Arc::ptr_eq(&registry.get("local"), &registry.get("local")));
    }

    #[test]
    fn test_registry_settings_propagate() {
        let registry = BreakerRegistry::default();
        let cb = registry.get("cloud");
        registry.update_settings(BreakerSettings {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(5),
        });
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        let snaps = registry.snapshots();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].state, CircuitState::Open);
        assert_eq!(snaps[0].consecutive_failures, 1);
    }
}
