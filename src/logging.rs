//! # Structured Logging Module
//!
//! Environment-aware structured logging that writes human-readable output to
//! the console and JSON lines to a per-process file under `log/`.

use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::loader::ConfigManager;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
///
/// Safe to call more than once and safe to call when the host already
/// installed a global subscriber. If the `log/` directory cannot be created
/// the bridge logs to the console only.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = ConfigManager::detect_environment();
        let log_level = get_log_level(&environment);
        let pid = process::id();

        let log_dir = PathBuf::from("log");
        let file_ready = log_dir.exists() || fs::create_dir_all(&log_dir).is_ok();

        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(true)
            .with_filter(build_filter(log_level));

        if file_ready {
            let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
            let log_filename = format!("{environment}.{pid}.{timestamp}.log");
            let log_path = log_dir.join(&log_filename);

            let file_appender = tracing_appender::rolling::never(&log_dir, log_filename);
            let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

            let file_layer = fmt::layer()
                .with_writer(file_writer)
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false)
                .json()
                .with_filter(build_filter(log_level));

            if tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer)
                .try_init()
                .is_err()
            {
                tracing::debug!(
                    "Global tracing subscriber already initialized - continuing with existing subscriber"
                );
            }

            tracing::info!(
                pid = pid,
                environment = %environment,
                log_file = %log_path.display(),
                "🔧 STRUCTURED LOGGING: Initialized with file output"
            );

            // The writer must outlive every log call
            std::mem::forget(guard);
        } else {
            if tracing_subscriber::registry()
                .with(console_layer)
                .try_init()
                .is_err()
            {
                tracing::debug!(
                    "Global tracing subscriber already initialized - continuing with existing subscriber"
                );
            }

            tracing::warn!(
                pid = pid,
                environment = %environment,
                "🔧 STRUCTURED LOGGING: log directory unavailable, console output only"
            );
        }
    });
}

/// `RUST_LOG` wins over the environment default
fn build_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

/// Log structured data for bridge lifecycle and connection operations
pub fn log_bridge_operation(
    operation: &str,
    component: &str,
    status: &str,
    port: Option<u16>,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        component = %component,
        status = %status,
        port = port,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🌉 BRIDGE_OPERATION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}
