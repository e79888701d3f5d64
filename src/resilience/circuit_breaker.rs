//! # Circuit Breaker Implementation
//!
//! Fault isolation for the host execution path. Classic three-state machine:
//! Closed (normal operation), Open (failing fast), and HalfOpen (probing
//! recovery). Time-based transitions are lazy: Open becomes HalfOpen the
//! first time the state is observed after the timeout, never via a timer.
//!
//! Only service failures are recorded as failures. A handler that rejects a
//! request for a domain reason still counts as a success here, so one
//! client's mistakes never degrade availability for the others.

use crate::config::CircuitBreakerConfig;
use crate::resilience::invoke_callback;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Transitions included in stats snapshots
const RECENT_TRANSITIONS: usize = 10;

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed,
    /// Failure mode - all calls fail fast without executing
    Open,
    /// Testing recovery - limited calls allowed to test system health
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Admission granted by `can_execute`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitPermit {
    pub state: CircuitState,
    /// True when this admission consumed a half-open probe slot
    pub probe: bool,
}

/// Admission refused by `can_execute`
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CircuitRejection {
    #[error("Circuit is open, retry after {retry_after:?}")]
    Open { retry_after: Duration },

    #[error("Circuit is half-open and all probe slots are taken")]
    HalfOpenLimitReached,
}

/// Diagnostic record of one state change
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_calls: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub seconds_since_last_failure: Option<f64>,
    pub recent_transitions: Vec<StateTransition>,
}

/// Observer for state changes, invoked as `(from, to)`
pub type StateChangeCallback = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_calls: u32,
    last_failure: Option<Instant>,
    history: VecDeque<StateTransition>,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
}

/// Three-state circuit breaker guarding host execution
pub struct CircuitBreaker {
    /// Component name for logging and stats
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    on_state_change: RwLock<Option<StateChangeCallback>>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state.lock().state)
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            success_threshold = config.success_threshold,
            timeout_seconds = config.timeout_seconds,
            half_open_max_calls = config.half_open_max_calls,
            "🛡️ Circuit breaker initialized"
        );

        Self {
            name,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_calls: 0,
                last_failure: None,
                history: VecDeque::with_capacity(config.history_size),
                total_successes: 0,
                total_failures: 0,
                total_rejections: 0,
            }),
            config,
            on_state_change: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register the state-change observer, replacing any previous one
    pub fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    {
        *self.on_state_change.write() = Some(Arc::new(callback));
    }

    /// Current state, applying the lazy Open to HalfOpen transition
    pub fn state(&self) -> CircuitState {
        self.state_at(Instant::now())
    }

    pub(crate) fn state_at(&self, now: Instant) -> CircuitState {
        let (state, transition) = {
            let mut inner = self.state.lock();
            let transition = self.evaluate_timeout(&mut inner, now);
            (inner.state, transition)
        };
        self.notify(transition);
        state
    }

    /// Admission check that spends a probe slot when half-open
    pub fn can_execute(&self) -> Result<CircuitPermit, CircuitRejection> {
        self.can_execute_at(Instant::now())
    }

    pub(crate) fn can_execute_at(
        &self,
        now: Instant,
    ) -> Result<CircuitPermit, CircuitRejection> {
        let (result, transition) = {
            let mut inner = self.state.lock();
            let transition = self.evaluate_timeout(&mut inner, now);

            let current = inner.state;
            let result = match current {
                CircuitState::Closed => Ok(CircuitPermit {
                    state: CircuitState::Closed,
                    probe: false,
                }),
                CircuitState::Open => {
                    inner.total_rejections += 1;
                    let elapsed = inner
                        .last_failure
                        .map(|at| now.saturating_duration_since(at))
                        .unwrap_or_default();
                    Err(CircuitRejection::Open {
                        retry_after: self.config.timeout().saturating_sub(elapsed),
                    })
                }
                CircuitState::HalfOpen => {
                    if inner.half_open_calls >= self.config.half_open_max_calls {
                        inner.total_rejections += 1;
                        Err(CircuitRejection::HalfOpenLimitReached)
                    } else {
                        inner.half_open_calls += 1;
                        debug!(
                            component = %self.name,
                            half_open_calls = inner.half_open_calls,
                            "🟡 Probe admitted"
                        );
                        Ok(CircuitPermit {
                            state: CircuitState::HalfOpen,
                            probe: true,
                        })
                    }
                }
            };
            (result, transition)
        };
        self.notify(transition);
        result
    }

    /// Whether execution may proceed at all, without spending a probe slot
    pub fn permits_execution(&self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Record a successful (or domain-rejected) execution
    pub fn record_success(&self) {
        let transition = {
            let mut inner = self.state.lock();
            inner.total_successes += 1;

            let current = inner.state;
            match current {
                CircuitState::HalfOpen => {
                    inner.success_count += 1;
                    if inner.success_count >= self.config.success_threshold {
                        let reason = format!(
                            "{} consecutive successful probes",
                            inner.success_count
                        );
                        Some(self.transition(&mut inner, CircuitState::Closed, reason))
                    } else {
                        None
                    }
                }
                CircuitState::Closed => {
                    inner.failure_count = inner.failure_count.saturating_sub(1);
                    None
                }
                CircuitState::Open => {
                    warn!(component = %self.name, "Success recorded while circuit is open");
                    None
                }
            }
        };
        self.notify(transition);
    }

    /// Record a service failure
    pub fn record_failure(&self) {
        let now = Instant::now();
        let transition = {
            let mut inner = self.state.lock();
            inner.total_failures += 1;
            inner.failure_count += 1;
            inner.last_failure = Some(now);

            let current = inner.state;
            match current {
                CircuitState::HalfOpen => Some(self.transition(
                    &mut inner,
                    CircuitState::Open,
                    "failure while half-open".to_string(),
                )),
                CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                    let reason = format!("{} failures reached threshold", inner.failure_count);
                    Some(self.transition(&mut inner, CircuitState::Open, reason))
                }
                _ => None,
            }
        };
        self.notify(transition);
    }

    /// Trip the circuit immediately; recovery still passes through HalfOpen
    pub fn force_open(&self, reason: &str) {
        let transition = {
            let mut inner = self.state.lock();
            inner.last_failure = Some(Instant::now());
            if inner.state == CircuitState::Open {
                None
            } else {
                warn!(component = %self.name, reason = %reason, "🚨 Circuit breaker forced open");
                Some(self.transition(
                    &mut inner,
                    CircuitState::Open,
                    format!("forced open: {reason}"),
                ))
            }
        };
        self.notify(transition);
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let now = Instant::now();
        let (stats, transition) = {
            let mut inner = self.state.lock();
            let transition = self.evaluate_timeout(&mut inner, now);
            let skip = inner.history.len().saturating_sub(RECENT_TRANSITIONS);
            let stats = CircuitBreakerStats {
                name: self.name.clone(),
                state: inner.state,
                failure_count: inner.failure_count,
                success_count: inner.success_count,
                half_open_calls: inner.half_open_calls,
                total_successes: inner.total_successes,
                total_failures: inner.total_failures,
                total_rejections: inner.total_rejections,
                seconds_since_last_failure: inner
                    .last_failure
                    .map(|at| now.saturating_duration_since(at).as_secs_f64()),
                recent_transitions: inner.history.iter().skip(skip).cloned().collect(),
            };
            (stats, transition)
        };
        self.notify(transition);
        stats
    }

    fn evaluate_timeout(
        &self,
        inner: &mut BreakerState,
        now: Instant,
    ) -> Option<(CircuitState, CircuitState)> {
        if inner.state != CircuitState::Open {
            return None;
        }
        let elapsed = inner
            .last_failure
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(Duration::MAX);
        if elapsed >= self.config.timeout() {
            Some(self.transition(
                inner,
                CircuitState::HalfOpen,
                "open timeout elapsed".to_string(),
            ))
        } else {
            None
        }
    }

    /// Apply a transition under the lock; the caller notifies afterwards
    fn transition(
        &self,
        inner: &mut BreakerState,
        to: CircuitState,
        reason: String,
    ) -> (CircuitState, CircuitState) {
        let from = inner.state;
        inner.state = to;

        match to {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count = 0;
                inner.half_open_calls = 0;
                info!(component = %self.name, reason = %reason, "🟢 Circuit breaker closed (recovered)");
            }
            CircuitState::Open => {
                inner.success_count = 0;
                inner.half_open_calls = 0;
                error!(
                    component = %self.name,
                    from = %from,
                    reason = %reason,
                    failure_count = inner.failure_count,
                    timeout_seconds = self.config.timeout_seconds,
                    "🔴 Circuit breaker opened (failing fast)"
                );
            }
            CircuitState::HalfOpen => {
                inner.success_count = 0;
                inner.half_open_calls = 0;
                info!(
                    component = %self.name,
                    success_threshold = self.config.success_threshold,
                    "🟡 Circuit breaker half-open (testing recovery)"
                );
            }
        }

        if self.config.history_size > 0 {
            while inner.history.len() >= self.config.history_size {
                inner.history.pop_front();
            }
            inner.history.push_back(StateTransition {
                from,
                to,
                reason,
                timestamp: Utc::now(),
            });
        }

        (from, to)
    }

    fn notify(&self, transition: Option<(CircuitState, CircuitState)>) {
        let Some((from, to)) = transition else {
            return;
        };
        let callback = self.on_state_change.read().clone();
        if let Some(callback) = callback {
            invoke_callback(&self.name, "on_state_change", || callback(from, to));
        }
    }
}
