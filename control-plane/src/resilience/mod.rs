//! Resilience layer: circuit breaking and bounded retry.
//!
//! Composition order is fixed: breaker → retry → raw call. See
//! [`retry::guarded_call`].

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    BreakerRegistry, BreakerSettings, BreakerSnapshot, CircuitBreaker, CircuitState,
    HALF_OPEN_SUCCESS_QUOTA,
};
pub use retry::{guarded_call, RetryExecutor, RetryPolicy};
