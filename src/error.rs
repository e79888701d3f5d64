use crate::config::ConfigurationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("Failed to bind {host}:{port}: {source}")]
    Bind {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("No candidate port could be bound (tried {attempted:?})")]
    NoBindablePort { attempted: Vec<u16> },
    #[error("Failed to build I/O runtime: {0}")]
    Runtime(#[source] std::io::Error),
    #[error("Failed to start watchdog thread: {0}")]
    Watchdog(#[source] std::io::Error),
    #[error("Bridge server is already running")]
    AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, BridgeError>;
