#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

//! # Host Bridge
//!
//! Resilient command bridge that lets network agents drive an application
//! whose API may only be touched from its own main thread.
//!
//! ## Overview
//!
//! Clients send line-delimited JSON commands over TCP. The bridge admits or
//! rejects each one, queues the admitted ones in strict arrival order, and
//! executes them when the host calls [`BridgeServer::process_tick`] from its
//! main thread. Responses travel back to the connection that sent the
//! command.
//!
//! ## Module Organization
//!
//! - [`config`] - Typed configuration, file and environment loading
//! - [`constants`] - Protocol identifiers and default limits
//! - [`error`] - Crate-level error type
//! - [`logging`] - Structured logging bootstrap
//! - [`resilience`] - Rate limiting, circuit breaker, watchdog, backpressure, port failover, health
//! - [`execution`] - Wire protocol, queueing, dispatch, and the server
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use host_bridge::config::ConfigManager;
//! use host_bridge::execution::{BridgeServer, CommandDispatcher, HandlerError, Payload};
//! use serde_json::{json, Value};
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! host_bridge::logging::init_structured_logging();
//!
//! let manager = ConfigManager::load()?;
//! let mut dispatcher = CommandDispatcher::new();
//! dispatcher.register("echo", |payload: &Payload| -> Result<Value, HandlerError> {
//!     Ok(json!(payload))
//! });
//!
//! let mut server = BridgeServer::new(manager.config().clone(), dispatcher)?;
//! server.start()?;
//!
//! // host event loop
//! loop {
//!     server.process_tick();
//!     std::thread::sleep(Duration::from_millis(50));
//!     # break;
//! }
//!
//! server.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Classes
//!
//! - **Admission rejections** never reach a handler and always carry a retry hint
//! - **User errors** are reported to the client but count as circuit successes
//! - **Service errors** carry the `Service error:` prefix and are the only
//!   outcome that can open the circuit

pub mod config;
pub mod constants;
pub mod error;
pub mod execution;
pub mod logging;
pub mod resilience;

pub use config::{BridgeConfig, ConfigManager};
pub use error::{BridgeError, Result};
pub use execution::{BridgeServer, BridgeStats, Command, CommandDispatcher, HandlerError, Response};
pub use resilience::{CircuitState, HealthReport};
