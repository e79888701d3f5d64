//! # Resilience Module
//!
//! Fault tolerance primitives that protect the host's main thread from
//! overload, cascading failure, and unresponsive clients.
//!
//! ## Architecture
//!
//! - **Rate limiting**: global and per-client token buckets
//! - **Circuit breaker**: three-state failure isolation with lazy transitions
//! - **Watchdog**: main-thread freeze detection
//! - **Backpressure**: load level derived from queue depth, latency, and circuit state
//! - **Port failover**: primary/backup port health and selection
//! - **Health**: one aggregated verdict over all of the above
//!
//! Every component owns its state behind its own lock; no two components
//! share a lock. Callbacks are always invoked after the owning lock is
//! released.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use host_bridge::config::CircuitBreakerConfig;
//! use host_bridge::resilience::{CircuitBreaker, CircuitState};
//!
//! let breaker = CircuitBreaker::new("host_execution", CircuitBreakerConfig::default());
//!
//! if breaker.can_execute().is_ok() {
//!     // run the command, then report the outcome
//!     breaker.record_success();
//! }
//! assert_eq!(breaker.state(), CircuitState::Closed);
//! ```

pub mod backpressure;
pub mod circuit_breaker;
pub mod health;
pub mod port_manager;
pub mod rate_limiter;
pub mod watchdog;

pub use backpressure::{BackpressureController, BackpressureLevel, BackpressureStats};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerStats, CircuitPermit, CircuitRejection, CircuitState,
    StateTransition,
};
pub use health::{HealthAggregator, HealthIssue, HealthLevel, HealthReport};
pub use port_manager::{PortFailoverManager, PortHealth, PortManagerStatus};
pub use rate_limiter::{RateDecision, RateLimitScope, RateLimiterStats, TokenBucketRateLimiter};
pub use watchdog::{Watchdog, WatchdogStats};

use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::error;

/// Run an observer callback, containing any panic it raises
pub(crate) fn invoke_callback<F: FnOnce()>(component: &str, callback: &str, f: F) {
    if let Err(panic_info) = catch_unwind(AssertUnwindSafe(f)) {
        let message = panic_message(panic_info.as_ref());
        error!(
            component = %component,
            callback = %callback,
            error = %message,
            "❌ Callback panicked"
        );
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(panic_info: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "Unknown panic".to_string()
    }
}
