//! # Backpressure Controller
//!
//! Derives a load level from queue depth, average host latency, and circuit
//! state. The level is recomputed every tick and consulted by admission.

use crate::config::BackpressureConfig;
use crate::resilience::CircuitState;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Load level, ordered from least to most loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureLevel {
    Normal,
    Elevated,
    High,
    Critical,
}

impl fmt::Display for BackpressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackpressureLevel::Normal => write!(f, "normal"),
            BackpressureLevel::Elevated => write!(f, "elevated"),
            BackpressureLevel::High => write!(f, "high"),
            BackpressureLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Point-in-time controller statistics
#[derive(Debug, Clone, Serialize)]
pub struct BackpressureStats {
    pub level: BackpressureLevel,
    pub reason: Option<String>,
    pub queue_size: usize,
    pub average_latency_seconds: f64,
}

#[derive(Debug)]
struct Evaluation {
    level: BackpressureLevel,
    reason: Option<&'static str>,
    queue_size: usize,
    latency: Duration,
}

#[derive(Debug)]
pub struct BackpressureController {
    config: BackpressureConfig,
    current: Mutex<Evaluation>,
}

impl BackpressureController {
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            current: Mutex::new(Evaluation {
                level: BackpressureLevel::Normal,
                reason: None,
                queue_size: 0,
                latency: Duration::ZERO,
            }),
        }
    }

    /// Classify the inputs without touching the stored level
    pub fn classify(
        &self,
        queue_size: usize,
        latency: Duration,
        circuit: CircuitState,
    ) -> (BackpressureLevel, Option<&'static str>) {
        let config = &self.config;

        if circuit == CircuitState::Open {
            return (BackpressureLevel::Critical, Some("circuit_open"));
        }
        if queue_size >= config.queue_critical {
            return (BackpressureLevel::Critical, Some("queue_critical"));
        }
        if latency >= config.latency_critical() {
            return (BackpressureLevel::Critical, Some("latency_critical"));
        }
        if queue_size >= config.queue_high {
            return (BackpressureLevel::High, Some("queue_high"));
        }
        if latency >= config.latency_high() {
            return (BackpressureLevel::High, Some("latency_high"));
        }
        if queue_size >= config.queue_elevated {
            return (BackpressureLevel::Elevated, Some("queue_elevated"));
        }
        if latency >= config.latency_elevated() {
            return (BackpressureLevel::Elevated, Some("latency_elevated"));
        }
        (BackpressureLevel::Normal, None)
    }

    /// Recompute and store the level; called once per tick
    pub fn evaluate(
        &self,
        queue_size: usize,
        latency: Duration,
        circuit: CircuitState,
    ) -> BackpressureLevel {
        let (level, reason) = self.classify(queue_size, latency, circuit);

        let previous = {
            let mut current = self.current.lock();
            let previous = current.level;
            *current = Evaluation {
                level,
                reason,
                queue_size,
                latency,
            };
            previous
        };

        if level != previous {
            if level > previous && level >= BackpressureLevel::High {
                warn!(
                    from = %previous,
                    to = %level,
                    reason = reason.unwrap_or("none"),
                    queue_size = queue_size,
                    latency_ms = latency.as_millis(),
                    "⚠️ Backpressure increased"
                );
            } else if level < previous && previous >= BackpressureLevel::High {
                info!(from = %previous, to = %level, "Backpressure eased");
            } else {
                debug!(from = %previous, to = %level, "Backpressure level changed");
            }
        }

        level
    }

    pub fn level(&self) -> BackpressureLevel {
        self.current.lock().level
    }

    /// Admission decision at the current level
    pub fn should_accept(&self, is_critical: bool) -> bool {
        match self.level() {
            BackpressureLevel::Normal | BackpressureLevel::Elevated => true,
            BackpressureLevel::High => is_critical,
            BackpressureLevel::Critical => false,
        }
    }

    /// Retry hint for rejected clients
    pub fn retry_after(&self) -> Duration {
        self.config.retry_after()
    }

    pub fn stats(&self) -> BackpressureStats {
        let current = self.current.lock();
        BackpressureStats {
            level: current.level,
            reason: current.reason.map(str::to_string),
            queue_size: current.queue_size,
            average_latency_seconds: current.latency.as_secs_f64(),
        }
    }
}
