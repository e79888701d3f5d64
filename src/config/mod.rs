//! # Bridge Configuration System
//!
//! Typed configuration for every part of the bridge. All sections carry
//! defaults, so a configuration file only needs the values it changes.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use host_bridge::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Defaults <- config/bridge.toml (or BRIDGE_CONFIG_PATH) <- BRIDGE__* env vars
//! let manager = ConfigManager::load()?;
//!
//! let port = manager.config().server.primary_port;
//! let timeout = manager.config().server.command_timeout();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::constants::defaults;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure mirroring `config/bridge.toml`
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Listener, connection, and tick settings
    pub server: ServerConfig,

    /// Token bucket admission limits
    pub rate_limiter: RateLimiterConfig,

    /// Failure isolation thresholds
    pub circuit_breaker: CircuitBreakerConfig,

    /// Main-thread freeze detection
    pub watchdog: WatchdogConfig,

    /// Load level thresholds
    pub backpressure: BackpressureConfig,
}

impl BridgeConfig {
    /// Validate every section
    pub fn validate(&self) -> ConfigResult<()> {
        self.server.validate()?;
        self.rate_limiter.validate()?;
        self.circuit_breaker.validate()?;
        self.watchdog.validate()?;
        self.backpressure.validate()?;
        Ok(())
    }
}

/// Server, connection, and tick configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub primary_port: u16,
    /// Failover candidates in priority order
    pub backup_ports: Vec<u16>,
    /// How long a connection waits for its command's response
    pub command_timeout_seconds: f64,
    /// Queue bound; the oldest entry is evicted beyond it
    pub max_pending_commands: usize,
    pub max_connections: usize,
    /// Silent connections are closed after this long (0 disables)
    pub client_heartbeat_timeout_seconds: f64,
    pub port_recovery_interval_seconds: f64,
    pub graceful_shutdown_timeout_seconds: f64,
    /// Upper bound of commands executed per tick (0 = drain fully)
    pub max_commands_per_tick: usize,
    pub dequeue_timeout_ms: u64,
    pub io_threads: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: defaults::HOST.to_string(),
            primary_port: defaults::PRIMARY_PORT,
            backup_ports: defaults::BACKUP_PORTS.to_vec(),
            command_timeout_seconds: defaults::COMMAND_TIMEOUT_SECONDS,
            max_pending_commands: defaults::MAX_PENDING_COMMANDS,
            max_connections: defaults::MAX_CONNECTIONS,
            client_heartbeat_timeout_seconds: defaults::CLIENT_HEARTBEAT_TIMEOUT_SECONDS,
            port_recovery_interval_seconds: defaults::PORT_RECOVERY_INTERVAL_SECONDS,
            graceful_shutdown_timeout_seconds: defaults::GRACEFUL_SHUTDOWN_TIMEOUT_SECONDS,
            max_commands_per_tick: 0,
            dequeue_timeout_ms: defaults::DEQUEUE_TIMEOUT_MS,
            io_threads: defaults::IO_THREADS,
        }
    }
}

impl ServerConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.command_timeout_seconds)
    }

    pub fn client_heartbeat_timeout(&self) -> Option<Duration> {
        if self.client_heartbeat_timeout_seconds > 0.0 {
            Some(Duration::from_secs_f64(self.client_heartbeat_timeout_seconds))
        } else {
            None
        }
    }

    pub fn port_recovery_interval(&self) -> Duration {
        Duration::from_secs_f64(self.port_recovery_interval_seconds)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.graceful_shutdown_timeout_seconds)
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }

    /// Primary followed by backups, in priority order
    pub fn candidate_ports(&self) -> Vec<u16> {
        std::iter::once(self.primary_port)
            .chain(self.backup_ports.iter().copied())
            .collect()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.host.trim().is_empty() {
            return Err(ConfigurationError::invalid_value(
                "server.host",
                &self.host,
                "host must not be empty",
            ));
        }

        if self.backup_ports.contains(&self.primary_port) && self.primary_port != 0 {
            return Err(ConfigurationError::invalid_value(
                "server.backup_ports",
                format!("{:?}", self.backup_ports),
                "primary port must not be listed as a backup",
            ));
        }

        let mut seen = HashSet::new();
        for port in &self.backup_ports {
            if *port != 0 && !seen.insert(*port) {
                return Err(ConfigurationError::invalid_value(
                    "server.backup_ports",
                    port,
                    "backup ports must be unique",
                ));
            }
        }

        positive("server.command_timeout_seconds", self.command_timeout_seconds)?;
        positive(
            "server.port_recovery_interval_seconds",
            self.port_recovery_interval_seconds,
        )?;
        positive(
            "server.graceful_shutdown_timeout_seconds",
            self.graceful_shutdown_timeout_seconds,
        )?;

        if self.client_heartbeat_timeout_seconds < 0.0 {
            return Err(ConfigurationError::invalid_value(
                "server.client_heartbeat_timeout_seconds",
                self.client_heartbeat_timeout_seconds,
                "must be zero (disabled) or positive",
            ));
        }

        non_zero("server.max_pending_commands", self.max_pending_commands)?;
        non_zero("server.max_connections", self.max_connections)?;
        non_zero("server.io_threads", self.io_threads)?;

        Ok(())
    }
}

/// Token bucket configuration: one global bucket plus one per client
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    pub tokens_per_second: f64,
    pub bucket_size: f64,
    pub client_tokens_per_second: f64,
    pub client_bucket_size: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            tokens_per_second: defaults::GLOBAL_TOKENS_PER_SECOND,
            bucket_size: defaults::GLOBAL_BUCKET_SIZE,
            client_tokens_per_second: defaults::CLIENT_TOKENS_PER_SECOND,
            client_bucket_size: defaults::CLIENT_BUCKET_SIZE,
        }
    }
}

impl RateLimiterConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        positive("rate_limiter.tokens_per_second", self.tokens_per_second)?;
        positive("rate_limiter.bucket_size", self.bucket_size)?;
        positive(
            "rate_limiter.client_tokens_per_second",
            self.client_tokens_per_second,
        )?;
        positive("rate_limiter.client_bucket_size", self.client_bucket_size)?;
        Ok(())
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures (net of success decay) before opening
    pub failure_threshold: u32,
    /// Consecutive half-open successes needed to close
    pub success_threshold: u32,
    /// Time to stay open before probing
    pub timeout_seconds: f64,
    /// Probe admissions allowed while half-open
    pub half_open_max_calls: u32,
    /// Transitions kept for diagnostics
    pub history_size: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: defaults::FAILURE_THRESHOLD,
            success_threshold: defaults::SUCCESS_THRESHOLD,
            timeout_seconds: defaults::OPEN_TIMEOUT_SECONDS,
            half_open_max_calls: defaults::HALF_OPEN_MAX_CALLS,
            history_size: defaults::TRANSITION_HISTORY_SIZE,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_seconds)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        non_zero(
            "circuit_breaker.failure_threshold",
            self.failure_threshold as usize,
        )?;
        non_zero(
            "circuit_breaker.success_threshold",
            self.success_threshold as usize,
        )?;
        non_zero(
            "circuit_breaker.half_open_max_calls",
            self.half_open_max_calls as usize,
        )?;
        positive("circuit_breaker.timeout_seconds", self.timeout_seconds)?;

        if self.success_threshold > self.half_open_max_calls {
            return Err(ConfigurationError::invalid_value(
                "circuit_breaker.success_threshold",
                self.success_threshold,
                "cannot exceed half_open_max_calls or the circuit could never close",
            ));
        }

        Ok(())
    }
}

/// Watchdog configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    /// Poll period of the monitor thread
    pub heartbeat_interval_seconds: f64,
    /// Heartbeat gap that counts as a freeze
    pub freeze_threshold_seconds: f64,
    /// Heartbeat gaps kept for the average latency
    pub latency_window: usize,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            heartbeat_interval_seconds: defaults::HEARTBEAT_INTERVAL_SECONDS,
            freeze_threshold_seconds: defaults::FREEZE_THRESHOLD_SECONDS,
            latency_window: defaults::LATENCY_WINDOW,
        }
    }
}

impl WatchdogConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_interval_seconds)
    }

    pub fn freeze_threshold(&self) -> Duration {
        Duration::from_secs_f64(self.freeze_threshold_seconds)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        positive(
            "watchdog.heartbeat_interval_seconds",
            self.heartbeat_interval_seconds,
        )?;
        positive(
            "watchdog.freeze_threshold_seconds",
            self.freeze_threshold_seconds,
        )?;
        non_zero("watchdog.latency_window", self.latency_window)?;
        Ok(())
    }
}

/// Backpressure thresholds; each tier must be at least the one below it
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BackpressureConfig {
    pub queue_elevated: usize,
    pub queue_high: usize,
    pub queue_critical: usize,
    pub latency_elevated_seconds: f64,
    pub latency_high_seconds: f64,
    pub latency_critical_seconds: f64,
    /// Retry hint attached to backpressure rejections
    pub retry_after_seconds: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            queue_elevated: defaults::QUEUE_ELEVATED,
            queue_high: defaults::QUEUE_HIGH,
            queue_critical: defaults::QUEUE_CRITICAL,
            latency_elevated_seconds: defaults::LATENCY_ELEVATED_SECONDS,
            latency_high_seconds: defaults::LATENCY_HIGH_SECONDS,
            latency_critical_seconds: defaults::LATENCY_CRITICAL_SECONDS,
            retry_after_seconds: defaults::BACKPRESSURE_RETRY_AFTER_SECONDS,
        }
    }
}

impl BackpressureConfig {
    pub fn latency_elevated(&self) -> Duration {
        Duration::from_secs_f64(self.latency_elevated_seconds)
    }

    pub fn latency_high(&self) -> Duration {
        Duration::from_secs_f64(self.latency_high_seconds)
    }

    pub fn latency_critical(&self) -> Duration {
        Duration::from_secs_f64(self.latency_critical_seconds)
    }

    pub fn retry_after(&self) -> Duration {
        Duration::from_secs_f64(self.retry_after_seconds)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if !(self.queue_elevated <= self.queue_high && self.queue_high <= self.queue_critical) {
            return Err(ConfigurationError::invalid_value(
                "backpressure.queue_*",
                format!(
                    "{}/{}/{}",
                    self.queue_elevated, self.queue_high, self.queue_critical
                ),
                "queue thresholds must be non-decreasing (elevated <= high <= critical)",
            ));
        }

        positive(
            "backpressure.latency_elevated_seconds",
            self.latency_elevated_seconds,
        )?;
        if !(self.latency_elevated_seconds <= self.latency_high_seconds
            && self.latency_high_seconds <= self.latency_critical_seconds)
        {
            return Err(ConfigurationError::invalid_value(
                "backpressure.latency_*",
                format!(
                    "{}/{}/{}",
                    self.latency_elevated_seconds,
                    self.latency_high_seconds,
                    self.latency_critical_seconds
                ),
                "latency thresholds must be non-decreasing (elevated <= high <= critical)",
            ));
        }

        if self.retry_after_seconds < 0.0 {
            return Err(ConfigurationError::invalid_value(
                "backpressure.retry_after_seconds",
                self.retry_after_seconds,
                "must not be negative",
            ));
        }

        Ok(())
    }
}

fn positive(field: &str, value: f64) -> ConfigResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigurationError::invalid_value(
            field,
            value,
            "must be a positive number",
        ))
    }
}

fn non_zero(field: &str, value: usize) -> ConfigResult<()> {
    if value == 0 {
        Err(ConfigurationError::invalid_value(
            field,
            value,
            "must be greater than 0",
        ))
    } else {
        Ok(())
    }
}
