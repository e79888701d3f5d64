//! Admission rejections
//!
//! Every reason a command can be turned away before it consumes host work.
//! Rejections are answered with `success: false` and a `data` document of
//! type `backpressure`, so clients can tell "retry later" apart from "your
//! request was wrong".

use serde_json::{json, Value};
use std::time::Duration;

use crate::constants::{rejection_reasons, BACKPRESSURE_RESPONSE_TYPE};
use crate::resilience::{BackpressureLevel, CircuitRejection, RateLimitScope};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdmissionRejection {
    #[error("Rate limit exceeded")]
    RateLimited {
        scope: RateLimitScope,
        retry_after: Duration,
    },

    #[error("Service temporarily unavailable (circuit open)")]
    CircuitOpen { retry_after: Duration },

    #[error("Service recovering, probe capacity exhausted")]
    HalfOpenLimitReached { retry_after: Duration },

    #[error("Server under heavy load, try again later")]
    Backpressure {
        level: BackpressureLevel,
        retry_after: Duration,
    },

    #[error("Command evicted from a full queue")]
    QueueOverflow { retry_after: Duration },

    #[error("Too many connections")]
    ConnectionLimit { limit: usize },

    #[error("Bridge is shutting down")]
    ShuttingDown,
}

impl AdmissionRejection {
    /// Map a circuit breaker refusal; `probe_retry` is the hint for a full
    /// half-open window
    pub fn from_circuit(rejection: CircuitRejection, probe_retry: Duration) -> Self {
        match rejection {
            CircuitRejection::Open { retry_after } => AdmissionRejection::CircuitOpen { retry_after },
            CircuitRejection::HalfOpenLimitReached => AdmissionRejection::HalfOpenLimitReached {
                retry_after: probe_retry,
            },
        }
    }

    /// Machine-readable reason carried in `data.reason`
    pub fn reason(&self) -> &'static str {
        match self {
            AdmissionRejection::RateLimited {
                scope: RateLimitScope::Global,
                ..
            } => rejection_reasons::GLOBAL_RATE_LIMIT,
            AdmissionRejection::RateLimited {
                scope: RateLimitScope::Client,
                ..
            } => rejection_reasons::CLIENT_RATE_LIMIT,
            AdmissionRejection::CircuitOpen { .. } => rejection_reasons::CIRCUIT_OPEN,
            AdmissionRejection::HalfOpenLimitReached { .. } => {
                rejection_reasons::HALF_OPEN_LIMIT_REACHED
            }
            AdmissionRejection::Backpressure { .. } => rejection_reasons::BACKPRESSURE,
            AdmissionRejection::QueueOverflow { .. } => rejection_reasons::QUEUE_OVERFLOW,
            AdmissionRejection::ConnectionLimit { .. } => rejection_reasons::CONNECTION_LIMIT,
            AdmissionRejection::ShuttingDown => rejection_reasons::SHUTTING_DOWN,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AdmissionRejection::RateLimited { retry_after, .. }
            | AdmissionRejection::CircuitOpen { retry_after }
            | AdmissionRejection::HalfOpenLimitReached { retry_after }
            | AdmissionRejection::Backpressure { retry_after, .. }
            | AdmissionRejection::QueueOverflow { retry_after } => Some(*retry_after),
            AdmissionRejection::ConnectionLimit { .. } | AdmissionRejection::ShuttingDown => None,
        }
    }

    /// `data` document of the rejection response
    pub fn to_data(&self) -> Value {
        let mut data = json!({
            "type": BACKPRESSURE_RESPONSE_TYPE,
            "reason": self.reason(),
        });

        if let Some(retry_after) = self.retry_after() {
            data["retryAfter"] = json!(retry_after.as_secs_f64());
        }
        if let AdmissionRejection::Backpressure { level, .. } = self {
            data["level"] = json!(level);
        }
        if let AdmissionRejection::ConnectionLimit { limit } = self {
            data["limit"] = json!(limit);
        }

        data
    }
}
