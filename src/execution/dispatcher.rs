//! Command dispatch for the host main thread
//!
//! The dispatcher routes a dequeued command to its registered handler,
//! classifies the outcome, and builds the response. It runs only on the host
//! thread, so handlers need not be `Send`; they may hold host-side handles.
//!
//! Outcome classes drive the circuit breaker:
//!
//! - **Success** and **UserError** both count as service successes
//! - **ServiceError** (timeouts, host failures, panics) counts as a failure

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::constants::defaults;
use crate::execution::command::{Command, Payload, Response};
use crate::resilience::panic_message;

/// Failure reported by a handler or executor
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HandlerError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Domain-level refusal (the request was valid but cannot be honored)
    #[error("{0}")]
    Rejected(String),

    #[error("Unknown command type: {0}")]
    UnknownCommand(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Host unavailable: {0}")]
    HostUnavailable(String),

    #[error("{0}")]
    Service(String),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::InvalidArguments(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn service(message: impl Into<String>) -> Self {
        Self::Service(message.into())
    }

    /// Service errors trip the circuit breaker; user errors never do
    pub fn is_service_error(&self) -> bool {
        matches!(
            self,
            HandlerError::Timeout(_)
                | HandlerError::HostUnavailable(_)
                | HandlerError::Service(_)
                | HandlerError::Panicked(_)
        )
    }
}

/// A handler for one command type
pub trait CommandHandler {
    fn handle(&self, payload: &Payload) -> Result<Value, HandlerError>;

    /// Checked before `handle`; a failure is a user error
    fn validate(&self, _payload: &Payload) -> Result<(), HandlerError> {
        Ok(())
    }
}

impl<F> CommandHandler for F
where
    F: Fn(&Payload) -> Result<Value, HandlerError>,
{
    fn handle(&self, payload: &Payload) -> Result<Value, HandlerError> {
        self(payload)
    }
}

/// Handler that receives its payload as a typed structure
pub struct TypedHandler<P, F> {
    handler: F,
    _payload: PhantomData<fn() -> P>,
}

impl<P, F> TypedHandler<P, F>
where
    P: DeserializeOwned,
{
    fn parse(payload: &Payload) -> Result<P, HandlerError> {
        serde_json::from_value(Value::Object(payload.clone()))
            .map_err(|e| HandlerError::InvalidArguments(e.to_string()))
    }
}

impl<P, F> CommandHandler for TypedHandler<P, F>
where
    P: DeserializeOwned,
    F: Fn(P) -> Result<Value, HandlerError>,
{
    fn handle(&self, payload: &Payload) -> Result<Value, HandlerError> {
        (self.handler)(Self::parse(payload)?)
    }

    fn validate(&self, payload: &Payload) -> Result<(), HandlerError> {
        Self::parse(payload).map(|_| ())
    }
}

/// Wrap `f` so it receives the payload deserialized into `P`
///
/// ```rust
/// use host_bridge::execution::dispatcher::{typed_handler, CommandDispatcher};
/// use serde::Deserialize;
/// use serde_json::json;
///
/// #[derive(Deserialize)]
/// struct CreateNode {
///     parent: String,
///     node_type: String,
/// }
///
/// let mut dispatcher = CommandDispatcher::new();
/// dispatcher.register(
///     "create_node",
///     typed_handler(|args: CreateNode| Ok(json!({ "path": format!("{}/{}", args.parent, args.node_type) }))),
/// );
/// ```
pub fn typed_handler<P, F>(handler: F) -> TypedHandler<P, F>
where
    P: DeserializeOwned,
    F: Fn(P) -> Result<Value, HandlerError>,
{
    TypedHandler {
        handler,
        _payload: PhantomData,
    }
}

/// Catch-all boundary toward the host's domain command catalog
pub trait CommandExecutor {
    fn execute(&self, command_type: &str, payload: &Payload) -> Result<Value, HandlerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeClass {
    Success,
    UserError,
    ServiceError,
}

impl OutcomeClass {
    pub fn is_service_failure(&self) -> bool {
        matches!(self, OutcomeClass::ServiceError)
    }
}

/// Result of dispatching one command
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub response: Response,
    pub class: OutcomeClass,
    pub duration: Duration,
}

/// Diagnostic record of one dispatch
#[derive(Debug, Clone, Serialize)]
pub struct DispatchRecord {
    pub command_type: String,
    pub command_id: String,
    pub sequence: u64,
    pub class: OutcomeClass,
    pub duration_ms: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchCounters {
    pub success: u64,
    pub user_error: u64,
    pub service_error: u64,
}

/// Routes commands to handlers on the host main thread
pub struct CommandDispatcher {
    handlers: HashMap<String, Box<dyn CommandHandler>>,
    fallback: Option<Box<dyn CommandExecutor>>,
    history: VecDeque<DispatchRecord>,
    history_size: usize,
    counters: DispatchCounters,
}

impl fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("handlers", &self.registered_types())
            .field("has_fallback", &self.fallback.is_some())
            .field("counters", &self.counters)
            .finish()
    }
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self::with_history_size(defaults::DISPATCH_HISTORY_SIZE)
    }

    pub fn with_history_size(history_size: usize) -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: None,
            history: VecDeque::with_capacity(history_size),
            history_size,
            counters: DispatchCounters::default(),
        }
    }

    /// Register a handler for `command_type`, replacing any existing one
    pub fn register<H>(&mut self, command_type: impl Into<String>, handler: H) -> &mut Self
    where
        H: CommandHandler + 'static,
    {
        let command_type = command_type.into();
        if self
            .handlers
            .insert(command_type.clone(), Box::new(handler))
            .is_some()
        {
            warn!(command_type = %command_type, "Replacing existing command handler");
        } else {
            info!(command_type = %command_type, "Registered command handler");
        }
        self
    }

    pub fn unregister(&mut self, command_type: &str) -> bool {
        self.handlers.remove(command_type).is_some()
    }

    /// Executor for command types without a registered handler
    pub fn set_fallback<E>(&mut self, executor: E) -> &mut Self
    where
        E: CommandExecutor + 'static,
    {
        self.fallback = Some(Box::new(executor));
        self
    }

    pub fn has_handler(&self, command_type: &str) -> bool {
        self.handlers.contains_key(command_type)
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Execute `command` synchronously and classify the outcome
    pub fn dispatch(&mut self, command: &Command) -> DispatchOutcome {
        let start = Instant::now();
        let result = self.execute(command);
        let duration = start.elapsed();

        let (response, class) = match result {
            Ok(data) => {
                debug!(
                    command_type = %command.command_type,
                    command_id = %command.id,
                    sequence = command.sequence,
                    duration_ms = duration.as_millis(),
                    "🟢 Command succeeded"
                );
                (Response::ok(command, data), OutcomeClass::Success)
            }
            Err(err) if err.is_service_error() => {
                error!(
                    command_type = %command.command_type,
                    command_id = %command.id,
                    sequence = command.sequence,
                    error = %err,
                    "🔴 Service error"
                );
                (Response::service_error(command, &err), OutcomeClass::ServiceError)
            }
            Err(err) => {
                warn!(
                    command_type = %command.command_type,
                    command_id = %command.id,
                    sequence = command.sequence,
                    error = %err,
                    "User error"
                );
                (Response::user_error(command, &err), OutcomeClass::UserError)
            }
        };

        self.record(command, class, duration);

        DispatchOutcome {
            response,
            class,
            duration,
        }
    }

    fn execute(&self, command: &Command) -> Result<Value, HandlerError> {
        let payload = &command.payload;

        let outcome = if let Some(handler) = self.handlers.get(&command.command_type) {
            catch_unwind(AssertUnwindSafe(|| {
                handler.validate(payload)?;
                handler.handle(payload)
            }))
        } else if let Some(fallback) = &self.fallback {
            catch_unwind(AssertUnwindSafe(|| {
                fallback.execute(&command.command_type, payload)
            }))
        } else {
            return Err(HandlerError::UnknownCommand(command.command_type.clone()));
        };

        outcome.unwrap_or_else(|panic_info| {
            Err(HandlerError::Panicked(panic_message(panic_info.as_ref())))
        })
    }

    fn record(&mut self, command: &Command, class: OutcomeClass, duration: Duration) {
        match class {
            OutcomeClass::Success => self.counters.success += 1,
            OutcomeClass::UserError => self.counters.user_error += 1,
            OutcomeClass::ServiceError => self.counters.service_error += 1,
        }

        if self.history_size == 0 {
            return;
        }
        while self.history.len() >= self.history_size {
            self.history.pop_front();
        }
        self.history.push_back(DispatchRecord {
            command_type: command.command_type.clone(),
            command_id: command.id.clone(),
            sequence: command.sequence,
            class,
            duration_ms: duration.as_secs_f64() * 1000.0,
            timestamp: Utc::now(),
        });
    }

    /// Most recent dispatches, oldest first
    pub fn history(&self) -> Vec<DispatchRecord> {
        self.history.iter().cloned().collect()
    }

    pub fn counters(&self) -> &DispatchCounters {
        &self.counters
    }
}
