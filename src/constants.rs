//! # Bridge Constants
//!
//! Protocol identifiers, reserved command names, and the default operating
//! limits of the bridge. Configuration files override the defaults; the
//! protocol constants are fixed.

/// Wire protocol version stamped on every outbound message
pub const PROTOCOL_VERSION: &str = "2.1.0";

/// Version assumed for inbound messages that do not declare one
pub const LEGACY_PROTOCOL_VERSION: &str = "1.0.0";

/// Product name reported by the liveness ping
pub const PRODUCT_NAME: &str = "Host Command Bridge";

/// Id used for responses to messages that could not be parsed
pub const UNKNOWN_COMMAND_ID: &str = "unknown";

/// Prefix that marks service errors (as opposed to user errors) on the wire
pub const SERVICE_ERROR_PREFIX: &str = "Service error";

/// Reserved command types answered inline, bypassing admission and the queue
pub mod reserved {
    pub const PING: &str = "ping";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const GET_HEALTH: &str = "get_health";
}

/// Machine-readable rejection reasons carried in `data.reason`
pub mod rejection_reasons {
    pub const GLOBAL_RATE_LIMIT: &str = "global_rate_limit";
    pub const CLIENT_RATE_LIMIT: &str = "client_rate_limit";
    pub const CIRCUIT_OPEN: &str = "circuit_open";
    pub const HALF_OPEN_LIMIT_REACHED: &str = "half_open_limit_reached";
    pub const BACKPRESSURE: &str = "backpressure";
    pub const QUEUE_OVERFLOW: &str = "queue_overflow";
    pub const CONNECTION_LIMIT: &str = "connection_limit";
    pub const SHUTTING_DOWN: &str = "shutting_down";
}

/// `data.type` marker for every admission rejection
pub const BACKPRESSURE_RESPONSE_TYPE: &str = "backpressure";

/// Default operating limits
pub mod defaults {
    pub const HOST: &str = "127.0.0.1";
    pub const PRIMARY_PORT: u16 = 9999;
    pub const BACKUP_PORTS: [u16; 3] = [9998, 9997, 9996];

    pub const COMMAND_TIMEOUT_SECONDS: f64 = 60.0;
    pub const MAX_PENDING_COMMANDS: usize = 100;
    pub const MAX_CONNECTIONS: usize = 100;
    pub const CLIENT_HEARTBEAT_TIMEOUT_SECONDS: f64 = 60.0;
    pub const PORT_RECOVERY_INTERVAL_SECONDS: f64 = 5.0;
    pub const GRACEFUL_SHUTDOWN_TIMEOUT_SECONDS: f64 = 2.0;
    pub const DEQUEUE_TIMEOUT_MS: u64 = 1;
    pub const IO_THREADS: usize = 2;

    pub const GLOBAL_TOKENS_PER_SECOND: f64 = 100.0;
    pub const GLOBAL_BUCKET_SIZE: f64 = 200.0;
    pub const CLIENT_TOKENS_PER_SECOND: f64 = 20.0;
    pub const CLIENT_BUCKET_SIZE: f64 = 50.0;

    pub const FAILURE_THRESHOLD: u32 = 20;
    pub const SUCCESS_THRESHOLD: u32 = 2;
    pub const OPEN_TIMEOUT_SECONDS: f64 = 10.0;
    pub const HALF_OPEN_MAX_CALLS: u32 = 10;
    pub const TRANSITION_HISTORY_SIZE: usize = 50;

    pub const HEARTBEAT_INTERVAL_SECONDS: f64 = 1.0;
    pub const FREEZE_THRESHOLD_SECONDS: f64 = 5.0;
    pub const LATENCY_WINDOW: usize = 100;

    pub const QUEUE_ELEVATED: usize = 25;
    pub const QUEUE_HIGH: usize = 50;
    pub const QUEUE_CRITICAL: usize = 80;
    pub const LATENCY_ELEVATED_SECONDS: f64 = 0.1;
    pub const LATENCY_HIGH_SECONDS: f64 = 0.5;
    pub const LATENCY_CRITICAL_SECONDS: f64 = 2.0;
    pub const BACKPRESSURE_RETRY_AFTER_SECONDS: f64 = 1.0;

    pub const DISPATCH_HISTORY_SIZE: usize = 100;
}
