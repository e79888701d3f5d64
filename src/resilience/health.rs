//! # Health Aggregator
//!
//! Combines the resilience components into one verdict for external polling.

use crate::resilience::{
    BackpressureController, BackpressureLevel, BackpressureStats, CircuitBreaker,
    CircuitBreakerStats, CircuitState, PortFailoverManager, PortManagerStatus,
    RateLimiterStats, TokenBucketRateLimiter, Watchdog, WatchdogStats,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Rejection rate above which the limiter counts as an issue
const REJECTION_RATE_THRESHOLD: f64 = 0.5;

/// More issues than this make the bridge unhealthy
const DEGRADED_ISSUE_LIMIT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Normal,
    Degraded,
    Unhealthy,
    Critical,
}

/// One finding of a health check
#[derive(Debug, Clone, PartialEq)]
pub enum HealthIssue {
    HighRejectionRate(f64),
    CircuitOpen,
    CircuitRecovering,
    UnhealthyPorts(usize),
    MainThreadFrozen,
    Backpressure(BackpressureLevel),
}

impl HealthIssue {
    /// Critical issues make the whole bridge critical
    pub fn is_critical(&self) -> bool {
        matches!(self, HealthIssue::CircuitOpen | HealthIssue::MainThreadFrozen)
    }
}

impl fmt::Display for HealthIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthIssue::HighRejectionRate(rate) => {
                write!(f, "High rate limit rejection ({:.0}%)", rate * 100.0)
            }
            HealthIssue::CircuitOpen => write!(f, "Circuit breaker OPEN"),
            HealthIssue::CircuitRecovering => write!(f, "Circuit breaker recovering"),
            HealthIssue::UnhealthyPorts(n) => write!(f, "{n} ports unhealthy"),
            HealthIssue::MainThreadFrozen => write!(f, "Main thread FROZEN"),
            HealthIssue::Backpressure(level) => write!(f, "Backpressure {level}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthComponents {
    pub rate_limiter: RateLimiterStats,
    pub circuit_breaker: CircuitBreakerStats,
    pub port_manager: PortManagerStatus,
    pub watchdog: WatchdogStats,
    pub backpressure: BackpressureStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub level: HealthLevel,
    pub message: String,
    pub components: HealthComponents,
    #[serde(skip)]
    pub issues: Vec<HealthIssue>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct HealthAggregator {
    rate_limiter: Arc<TokenBucketRateLimiter>,
    circuit_breaker: Arc<CircuitBreaker>,
    port_manager: Arc<PortFailoverManager>,
    watchdog: Arc<Watchdog>,
    backpressure: Arc<BackpressureController>,
}

impl HealthAggregator {
    pub fn new(
        rate_limiter: Arc<TokenBucketRateLimiter>,
        circuit_breaker: Arc<CircuitBreaker>,
        port_manager: Arc<PortFailoverManager>,
        watchdog: Arc<Watchdog>,
        backpressure: Arc<BackpressureController>,
    ) -> Self {
        Self {
            rate_limiter,
            circuit_breaker,
            port_manager,
            watchdog,
            backpressure,
        }
    }

    /// Snapshot every component and derive the overall verdict
    pub fn check(&self) -> HealthReport {
        let components = HealthComponents {
            rate_limiter: self.rate_limiter.stats(),
            circuit_breaker: self.circuit_breaker.stats(),
            port_manager: self.port_manager.status(),
            watchdog: self.watchdog.stats(),
            backpressure: self.backpressure.stats(),
        };

        let issues = collect_issues(&components);
        let (healthy, level) = classify(&issues);
        let message = if issues.is_empty() {
            "All systems operational".to_string()
        } else {
            issues
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        };

        HealthReport {
            healthy,
            level,
            message,
            components,
            issues,
            timestamp: Utc::now(),
        }
    }
}

fn collect_issues(components: &HealthComponents) -> Vec<HealthIssue> {
    let mut issues = Vec::new();

    if components.rate_limiter.rejection_rate > REJECTION_RATE_THRESHOLD {
        issues.push(HealthIssue::HighRejectionRate(
            components.rate_limiter.rejection_rate,
        ));
    }

    match components.circuit_breaker.state {
        CircuitState::Open => issues.push(HealthIssue::CircuitOpen),
        CircuitState::HalfOpen => issues.push(HealthIssue::CircuitRecovering),
        CircuitState::Closed => {}
    }

    let unhealthy_ports = components.port_manager.unhealthy_ports().len();
    if unhealthy_ports > 0 {
        issues.push(HealthIssue::UnhealthyPorts(unhealthy_ports));
    }

    if components.watchdog.is_frozen {
        issues.push(HealthIssue::MainThreadFrozen);
    }

    if components.backpressure.level >= BackpressureLevel::High {
        issues.push(HealthIssue::Backpressure(components.backpressure.level));
    }

    issues
}

fn classify(issues: &[HealthIssue]) -> (bool, HealthLevel) {
    if issues.is_empty() {
        (true, HealthLevel::Normal)
    } else if issues.iter().any(HealthIssue::is_critical) {
        (false, HealthLevel::Critical)
    } else if issues.len() > DEGRADED_ISSUE_LIMIT {
        (false, HealthLevel::Unhealthy)
    } else {
        (true, HealthLevel::Degraded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use std::time::{Duration, Instant};

    struct Fixture {
        limiter: Arc<TokenBucketRateLimiter>,
        breaker: Arc<CircuitBreaker>,
        ports: Arc<PortFailoverManager>,
        watchdog: Arc<Watchdog>,
        backpressure: Arc<BackpressureController>,
        health: HealthAggregator,
    }

    fn fixture() -> Fixture {
        let config = BridgeConfig::default();
        let limiter = Arc::new(TokenBucketRateLimiter::new(config.rate_limiter.clone()));
        let breaker = Arc::new(CircuitBreaker::new(
            "health_test",
            config.circuit_breaker.clone(),
        ));
        let ports = Arc::new(PortFailoverManager::from_config(&config.server));
        let watchdog = Arc::new(Watchdog::new(config.watchdog.clone()));
        let backpressure = Arc::new(BackpressureController::new(config.backpressure.clone()));
        let health = HealthAggregator::new(
            limiter.clone(),
            breaker.clone(),
            ports.clone(),
            watchdog.clone(),
            backpressure.clone(),
        );
        Fixture {
            limiter,
            breaker,
            ports,
            watchdog,
            backpressure,
            health,
        }
    }

    #[test]
    fn test_all_clear() {
        let f = fixture();
        let report = f.health.check();
        assert!(report.healthy);
        assert_eq!(report.level, HealthLevel::Normal);
        assert_eq!(report.message, "All systems operational");
        assert!(f.limiter.stats().total_requests == 0);
    }

    #[test]
    fn test_single_issue_is_degraded() {
        let f = fixture();
        f.ports.mark_unhealthy(9999, "address in use");

        let report = f.health.check();
        assert!(report.healthy);
        assert_eq!(report.level, HealthLevel::Degraded);
        assert_eq!(report.message, "1 ports unhealthy");
    }

    #[test]
    fn test_open_circuit_is_critical() {
        let f = fixture();
        f.breaker.force_open("test");

        let report = f.health.check();
        assert!(!report.healthy);
        assert_eq!(report.level, HealthLevel::Critical);
        assert!(report.message.contains("Circuit breaker OPEN"));
    }

    #[test]
    fn test_frozen_watchdog_is_critical() {
        let f = fixture();
        assert!(f.watchdog.check_at(Instant::now() + Duration::from_secs(30)));

        let report = f.health.check();
        assert_eq!(report.level, HealthLevel::Critical);
        assert!(report.issues.contains(&HealthIssue::MainThreadFrozen));
    }

    #[test]
    fn test_many_issues_are_unhealthy() {
        let f = fixture();
        f.ports.mark_unhealthy(9999, "down");
        f.backpressure
            .evaluate(60, Duration::ZERO, CircuitState::Closed);
        for _ in 0..200 {
            f.limiter.acquire("flood", 1.0);
        }

        let report = f.health.check();
        assert_eq!(report.issues.len(), 3, "issues: {}", report.message);
        assert!(!report.healthy);
        assert_eq!(report.level, HealthLevel::Unhealthy);
        assert_eq!(report.message.matches("; ").count(), 2);
    }

    #[test]
    fn test_report_serializes_component_keys() {
        let f = fixture();
        let value = serde_json::to_value(f.health.check()).unwrap();
        let components = value["components"].as_object().unwrap();
        for key in [
            "rateLimiter",
            "circuitBreaker",
            "portManager",
            "watchdog",
            "backpressure",
        ] {
            assert!(components.contains_key(key), "missing {key}");
        }
        assert_eq!(value["level"], "normal");
    }
}
