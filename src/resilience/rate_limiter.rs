//! # Token Bucket Rate Limiter
//!
//! One global bucket plus one smaller bucket per connected client. Tokens are
//! a continuous quantity refilled lazily on access, so there is no timer
//! thread; an idle bucket simply catches up on its next `acquire`.

use crate::config::RateLimiterConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// A single token bucket
#[derive(Debug, Clone)]
pub struct RateBucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateBucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, rate: f64, capacity: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }

    /// Time until `n` tokens are available at `rate`
    fn wait_for(&self, n: f64, rate: f64) -> Duration {
        let deficit = (n - self.tokens).max(0.0);
        Duration::from_secs_f64(deficit / rate)
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}

/// Which bucket refused the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    Global,
    Client,
}

impl fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitScope::Global => write!(f, "global"),
            RateLimitScope::Client => write!(f, "client"),
        }
    }
}

/// Outcome of an `acquire` call
#[derive(Debug, Clone, PartialEq)]
pub enum RateDecision {
    Allowed {
        remaining_global: f64,
        remaining_client: f64,
    },
    Limited {
        scope: RateLimitScope,
        retry_after: Duration,
    },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RateDecision::Allowed { .. } => None,
            RateDecision::Limited { retry_after, .. } => Some(*retry_after),
        }
    }
}

/// Point-in-time limiter statistics
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub rejected_requests: u64,
    pub rejection_rate: f64,
    pub global_tokens: f64,
    pub active_clients: usize,
}

#[derive(Debug)]
struct LimiterState {
    global: RateBucket,
    clients: HashMap<String, RateBucket>,
    total_requests: u64,
    rejected_requests: u64,
}

/// Global plus per-client token bucket admission control
#[derive(Debug)]
pub struct TokenBucketRateLimiter {
    config: RateLimiterConfig,
    state: Mutex<LimiterState>,
}

impl TokenBucketRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        info!(
            tokens_per_second = config.tokens_per_second,
            bucket_size = config.bucket_size,
            client_tokens_per_second = config.client_tokens_per_second,
            client_bucket_size = config.client_bucket_size,
            "🚦 Rate limiter initialized"
        );

        let now = Instant::now();
        Self {
            state: Mutex::new(LimiterState {
                global: RateBucket::full(config.bucket_size, now),
                clients: HashMap::new(),
                total_requests: 0,
                rejected_requests: 0,
            }),
            config,
        }
    }

    /// Try to take `n` tokens from both the global and the client bucket
    ///
    /// The global bucket is checked first. Nothing is debited unless both
    /// buckets can pay.
    pub fn acquire(&self, client_id: &str, n: f64) -> RateDecision {
        self.acquire_at(client_id, n, Instant::now())
    }

    pub(crate) fn acquire_at(&self, client_id: &str, n: f64, now: Instant) -> RateDecision {
        let config = &self.config;
        let mut state = self.state.lock();
        let state = &mut *state;
        state.total_requests += 1;

        state
            .global
            .refill(config.tokens_per_second, config.bucket_size, now);

        let client = state
            .clients
            .entry(client_id.to_string())
            .or_insert_with(|| RateBucket::full(config.client_bucket_size, now));
        client.refill(
            config.client_tokens_per_second,
            config.client_bucket_size,
            now,
        );

        if state.global.tokens < n {
            state.rejected_requests += 1;
            let retry_after = state.global.wait_for(n, config.tokens_per_second);
            debug!(client_id = %client_id, retry_after_ms = retry_after.as_millis(), "Global rate limit exceeded");
            return RateDecision::Limited {
                scope: RateLimitScope::Global,
                retry_after,
            };
        }

        if client.tokens < n {
            state.rejected_requests += 1;
            let retry_after = client.wait_for(n, config.client_tokens_per_second);
            debug!(client_id = %client_id, retry_after_ms = retry_after.as_millis(), "Client rate limit exceeded");
            return RateDecision::Limited {
                scope: RateLimitScope::Client,
                retry_after,
            };
        }

        state.global.tokens -= n;
        client.tokens -= n;

        RateDecision::Allowed {
            remaining_global: state.global.tokens,
            remaining_client: client.tokens,
        }
    }

    /// Drop a disconnected client's bucket
    pub fn remove_client(&self, client_id: &str) -> bool {
        self.state.lock().clients.remove(client_id).is_some()
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().clients.len()
    }

    pub fn stats(&self) -> RateLimiterStats {
        let state = self.state.lock();
        let rejection_rate = if state.total_requests == 0 {
            0.0
        } else {
            state.rejected_requests as f64 / state.total_requests as f64
        };
        RateLimiterStats {
            total_requests: state.total_requests,
            rejected_requests: state.rejected_requests,
            rejection_rate,
            global_tokens: state.global.tokens,
            active_clients: state.clients.len(),
        }
    }
}
