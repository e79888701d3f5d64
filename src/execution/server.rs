//! # Bridge Server
//!
//! Owns every resilience component, the command queue, and the I/O runtime,
//! and exposes the one entry point the host calls from its main thread:
//! [`BridgeServer::process_tick`].
//!
//! ## Threading
//!
//! - Socket I/O runs on a bridge-owned tokio runtime, one task per connection
//! - The watchdog runs on its own OS thread
//! - Handlers run only inside `process_tick`, on the thread that calls it
//!
//! `BridgeServer` is deliberately not `Send` once handlers that hold host
//! handles are registered; construct it on the host thread and keep it there.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use host_bridge::config::BridgeConfig;
//! use host_bridge::execution::{BridgeServer, CommandDispatcher, HandlerError};
//! use host_bridge::execution::command::Payload;
//! use serde_json::{json, Value};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut dispatcher = CommandDispatcher::new();
//! dispatcher.register("echo", |payload: &Payload| -> Result<Value, HandlerError> {
//!     Ok(json!(payload))
//! });
//!
//! let mut server = BridgeServer::new(BridgeConfig::default(), dispatcher)?;
//! let addr = server.start()?;
//! println!("listening on {addr}");
//!
//! loop {
//!     server.process_tick();
//!     # break;
//! }
//! server.shutdown();
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::execution::admission::AdmissionRejection;
use crate::execution::command::{ClientId, Command, Response};
use crate::execution::connection::{self, ShutdownSignals};
use crate::execution::dispatcher::{CommandDispatcher, OutcomeClass};
use crate::execution::queue::{DeterministicCommandQueue, QueueEntry};
use crate::execution::response_queue::ResponseDeliveryQueue;
use crate::logging::log_bridge_operation;
use crate::resilience::{
    BackpressureController, CircuitBreaker, HealthAggregator, HealthReport, PortFailoverManager,
    RateDecision, TokenBucketRateLimiter, Watchdog,
};

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(10);
const MIN_RUNTIME_SHUTDOWN: Duration = Duration::from_millis(100);

/// Server counters, also embedded in the health query response
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BridgeStats {
    pub running: bool,
    pub uptime_seconds: u64,
    pub local_addr: Option<SocketAddr>,
    pub active_port: Option<u16>,
    pub clients: usize,
    pub total_connections: u64,
    pub queue_size: usize,
    pub commands_succeeded: u64,
    /// User and service failures together
    pub commands_failed: u64,
    pub commands_failed_user: u64,
    pub commands_failed_service: u64,
    pub commands_rejected: u64,
    pub commands_evicted: u64,
    pub commands_timed_out: u64,
}

#[derive(Debug, Default)]
struct BridgeCounters {
    succeeded: AtomicU64,
    failed_user: AtomicU64,
    failed_service: AtomicU64,
    rejected: AtomicU64,
    evicted: AtomicU64,
    timed_out: AtomicU64,
    total_connections: AtomicU64,
}

impl BridgeCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ClientInfo {
    pub peer: SocketAddr,
    pub port: u16,
    pub connected_at: DateTime<Utc>,
}

/// State shared between the host thread and the connection tasks
pub(crate) struct BridgeShared {
    pub(crate) config: BridgeConfig,
    pub(crate) queue: DeterministicCommandQueue,
    pub(crate) responses: ResponseDeliveryQueue,
    pub(crate) rate_limiter: Arc<TokenBucketRateLimiter>,
    pub(crate) circuit_breaker: Arc<CircuitBreaker>,
    pub(crate) backpressure: Arc<BackpressureController>,
    pub(crate) port_manager: Arc<PortFailoverManager>,
    pub(crate) watchdog: Arc<Watchdog>,
    health: HealthAggregator,
    clients: DashMap<ClientId, ClientInfo>,
    counters: BridgeCounters,
    running: AtomicBool,
    admitting: AtomicBool,
    local_addr: RwLock<Option<SocketAddr>>,
    started_at: RwLock<Option<DateTime<Utc>>>,
}

impl BridgeShared {
    fn new(config: BridgeConfig) -> Self {
        let rate_limiter = Arc::new(TokenBucketRateLimiter::new(config.rate_limiter.clone()));
        let circuit_breaker = Arc::new(CircuitBreaker::new(
            "host_execution",
            config.circuit_breaker.clone(),
        ));
        let backpressure = Arc::new(BackpressureController::new(config.backpressure.clone()));
        let port_manager = Arc::new(PortFailoverManager::from_config(&config.server));
        let watchdog = Arc::new(Watchdog::new(config.watchdog.clone()));

        let health = HealthAggregator::new(
            Arc::clone(&rate_limiter),
            Arc::clone(&circuit_breaker),
            Arc::clone(&port_manager),
            Arc::clone(&watchdog),
            Arc::clone(&backpressure),
        );

        Self {
            queue: DeterministicCommandQueue::new(config.server.max_pending_commands),
            responses: ResponseDeliveryQueue::new(),
            rate_limiter,
            circuit_breaker,
            backpressure,
            port_manager,
            watchdog,
            health,
            clients: DashMap::new(),
            counters: BridgeCounters::default(),
            running: AtomicBool::new(false),
            admitting: AtomicBool::new(false),
            local_addr: RwLock::new(None),
            started_at: RwLock::new(None),
            config,
        }
    }

    /// Admission gate for domain commands: rate limiter, circuit breaker,
    /// then backpressure. The first refusal wins.
    pub(crate) fn admit(
        &self,
        client: ClientId,
        command: &Command,
    ) -> std::result::Result<(), AdmissionRejection> {
        let verdict = self.check_admission(client);
        if let Err(rejection) = &verdict {
            BridgeCounters::bump(&self.counters.rejected);
            debug!(
                client = %client,
                command_type = %command.command_type,
                command_id = %command.id,
                reason = rejection.reason(),
                "Command rejected at admission"
            );
        }
        verdict
    }

    fn check_admission(&self, client: ClientId) -> std::result::Result<(), AdmissionRejection> {
        if !self.admitting.load(Ordering::Acquire) {
            return Err(AdmissionRejection::ShuttingDown);
        }

        if let RateDecision::Limited { scope, retry_after } =
            self.rate_limiter.acquire(&client.to_string(), 1.0)
        {
            return Err(AdmissionRejection::RateLimited { scope, retry_after });
        }

        self.circuit_breaker
            .can_execute()
            .map_err(|r| AdmissionRejection::from_circuit(r, self.backpressure.retry_after()))?;

        if !self.backpressure.should_accept(false) {
            return Err(AdmissionRejection::Backpressure {
                level: self.backpressure.level(),
                retry_after: self.backpressure.retry_after(),
            });
        }

        Ok(())
    }

    /// Tell the owner of an evicted command that it will never run
    pub(crate) fn notify_evicted(&self, entry: QueueEntry) {
        BridgeCounters::bump(&self.counters.evicted);
        let rejection = AdmissionRejection::QueueOverflow {
            retry_after: self.backpressure.retry_after(),
        };
        let response = Response::rejected(&entry.command.id, entry.command.sequence, &rejection);
        if !self.responses.enqueue(entry.client, response) {
            debug!(
                client = %entry.client,
                command_id = %entry.command.id,
                "Evicted command's client already disconnected"
            );
        }
    }

    pub(crate) fn record_timeout(&self, command: &Command) {
        BridgeCounters::bump(&self.counters.timed_out);
        warn!(
            command_type = %command.command_type,
            command_id = %command.id,
            sequence = command.sequence,
            timeout_seconds = self.config.server.command_timeout_seconds,
            "⏱️ Gave up waiting for host response"
        );
    }

    /// Track a new connection; refused while shutting down or at the cap
    pub(crate) fn register_client(
        &self,
        client: ClientId,
        peer: SocketAddr,
        port: u16,
    ) -> std::result::Result<(), AdmissionRejection> {
        if !self.admitting.load(Ordering::Acquire) {
            return Err(AdmissionRejection::ShuttingDown);
        }

        self.clients.insert(
            client,
            ClientInfo {
                peer,
                port,
                connected_at: Utc::now(),
            },
        );

        let limit = self.config.server.max_connections;
        if self.clients.len() > limit {
            self.clients.remove(&client);
            return Err(AdmissionRejection::ConnectionLimit { limit });
        }

        self.responses.register(client);
        BridgeCounters::bump(&self.counters.total_connections);
        self.refresh_port_connections(port);
        Ok(())
    }

    /// Drop everything held for a departed connection
    pub(crate) fn release_client(&self, client: ClientId) {
        let Some((_, info)) = self.clients.remove(&client) else {
            return;
        };

        let discarded = self.responses.unregister(client);
        if discarded > 0 {
            debug!(client = %client, discarded, "Discarded undelivered responses");
        }
        self.rate_limiter.remove_client(&client.to_string());
        self.refresh_port_connections(info.port);

        debug!(
            client = %client,
            peer = %info.peer,
            connected_seconds = (Utc::now() - info.connected_at).num_seconds(),
            "Client released"
        );
    }

    fn refresh_port_connections(&self, port: u16) {
        let connections = self
            .clients
            .iter()
            .filter(|entry| entry.value().port == port)
            .count();
        self.port_manager.update_connections(port, connections);
    }

    pub(crate) fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub(crate) fn set_local_addr(&self, addr: SocketAddr) {
        *self.local_addr.write() = Some(addr);
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    pub(crate) fn stats(&self) -> BridgeStats {
        let counters = &self.counters;
        let failed_user = counters.failed_user.load(Ordering::Relaxed);
        let failed_service = counters.failed_service.load(Ordering::Relaxed);

        BridgeStats {
            running: self.running.load(Ordering::Acquire),
            uptime_seconds: self
                .started_at
                .read()
                .map(|start| (Utc::now() - start).num_seconds().max(0) as u64)
                .unwrap_or(0),
            local_addr: self.local_addr(),
            active_port: self.port_manager.bound_port(),
            clients: self.clients.len(),
            total_connections: counters.total_connections.load(Ordering::Relaxed),
            queue_size: self.queue.len(),
            commands_succeeded: counters.succeeded.load(Ordering::Relaxed),
            commands_failed: failed_user + failed_service,
            commands_failed_user: failed_user,
            commands_failed_service: failed_service,
            commands_rejected: counters.rejected.load(Ordering::Relaxed),
            commands_evicted: counters.evicted.load(Ordering::Relaxed),
            commands_timed_out: counters.timed_out.load(Ordering::Relaxed),
        }
    }

    /// `get_health` answer: the aggregated report plus server counters
    pub(crate) fn health_document(&self) -> Value {
        let report = self.health.check();
        let mut document = match serde_json::to_value(&report) {
            Ok(document) => document,
            Err(e) => {
                error!(error = %e, "Failed to serialize health report");
                json!({
                    "healthy": report.healthy,
                    "level": report.level,
                    "message": report.message,
                })
            }
        };
        document["stats"] = json!(self.stats());
        document
    }
}

/// Everything that exists only between `start` and `shutdown`
struct IoRuntime {
    runtime: Runtime,
    accept_task: JoinHandle<()>,
    stop_accepting: watch::Sender<bool>,
    close_connections: watch::Sender<bool>,
}

/// Resilient command bridge between network clients and the host main thread
pub struct BridgeServer {
    shared: Arc<BridgeShared>,
    dispatcher: CommandDispatcher,
    io: Option<IoRuntime>,
}

impl std::fmt::Debug for BridgeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeServer").finish_non_exhaustive()
    }
}

impl BridgeServer {
    /// Validate `config` and wire the components together. Nothing is bound
    /// until [`start`](Self::start).
    pub fn new(config: BridgeConfig, dispatcher: CommandDispatcher) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(BridgeShared::new(config));

        let breaker = Arc::clone(&shared.circuit_breaker);
        shared.watchdog.on_freeze(move |frozen_for| {
            breaker.force_open(&format!(
                "host main thread frozen for {:.1}s",
                frozen_for.as_secs_f64()
            ));
        });

        shared.circuit_breaker.on_state_change(|from, to| {
            log_bridge_operation(
                "state_change",
                "circuit_breaker",
                &to.to_string(),
                None,
                Some(&format!("from {from}")),
            );
        });

        shared.port_manager.on_port_change(|previous, port| {
            let details = previous.map(|p| format!("from port {p}"));
            log_bridge_operation("port_change", "port_manager", "active", Some(port), details.as_deref());
        });

        Ok(Self {
            shared,
            dispatcher,
            io: None,
        })
    }

    /// Bind the first healthy candidate port, start the I/O runtime and the
    /// watchdog, and begin accepting connections
    pub fn start(&mut self) -> Result<SocketAddr> {
        if self.io.is_some() {
            return Err(BridgeError::AlreadyRunning);
        }

        let server_config = &self.shared.config.server;
        info!(
            host = %server_config.host,
            primary_port = server_config.primary_port,
            backup_ports = ?server_config.backup_ports,
            "🚀 Starting bridge server"
        );

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(server_config.io_threads.max(1))
            .thread_name("bridge-io")
            .enable_all()
            .build()
            .map_err(BridgeError::Runtime)?;

        let candidates = self.shared.port_manager.candidate_ports();
        let bound = runtime.block_on(connection::bind_first_available(&self.shared, &candidates));
        let Some((listener, port)) = bound else {
            error!(attempted = ?candidates, "❌ No candidate port could be bound");
            return Err(BridgeError::NoBindablePort {
                attempted: candidates,
            });
        };

        let local_addr = listener.local_addr().map_err(|source| BridgeError::Bind {
            host: server_config.host.clone(),
            port,
            source,
        })?;

        if self.shared.config.watchdog.enabled {
            self.shared.watchdog.start().map_err(BridgeError::Watchdog)?;
        }

        self.shared.port_manager.mark_active(port);
        self.shared.set_local_addr(local_addr);
        *self.shared.started_at.write() = Some(Utc::now());
        self.shared.running.store(true, Ordering::Release);
        self.shared.admitting.store(true, Ordering::Release);

        let (stop_accepting, stop_rx) = watch::channel(false);
        let (close_connections, close_rx) = watch::channel(false);
        let accept_task = runtime.spawn(connection::accept_loop(
            Arc::clone(&self.shared),
            listener,
            port,
            ShutdownSignals {
                stop_accepting: stop_rx,
                close_connections: close_rx,
            },
        ));

        self.io = Some(IoRuntime {
            runtime,
            accept_task,
            stop_accepting,
            close_connections,
        });

        log_bridge_operation(
            "start",
            "bridge_server",
            "listening",
            Some(local_addr.port()),
            Some(&local_addr.to_string()),
        );
        Ok(local_addr)
    }

    /// One cooperative slice of host work; call periodically from the host
    /// main thread. Returns the number of commands executed.
    ///
    /// Sends the watchdog heartbeat, re-evaluates backpressure, and, if the
    /// circuit permits execution, drains the queue in sequence order.
    pub fn process_tick(&mut self) -> usize {
        let shared = Arc::clone(&self.shared);

        shared.watchdog.heartbeat();
        shared.backpressure.evaluate(
            shared.queue.len(),
            shared.watchdog.average_latency(),
            shared.circuit_breaker.state(),
        );

        if !shared.circuit_breaker.permits_execution() {
            return 0;
        }

        let limit = shared.config.server.max_commands_per_tick;
        let wait = shared.config.server.dequeue_timeout();
        let mut processed = 0;

        while limit == 0 || processed < limit {
            let Some(entry) = shared.queue.dequeue(wait) else {
                break;
            };
            self.execute(entry);
            processed += 1;

            if !shared.circuit_breaker.permits_execution() {
                debug!(processed, "Circuit opened mid-tick, leaving the rest queued");
                break;
            }
        }

        processed
    }

    fn execute(&mut self, entry: QueueEntry) {
        let QueueEntry { command, client } = entry;
        let outcome = self.dispatcher.dispatch(&command);

        let shared = &self.shared;
        match outcome.class {
            OutcomeClass::Success => {
                shared.circuit_breaker.record_success();
                BridgeCounters::bump(&shared.counters.succeeded);
            }
            OutcomeClass::UserError => {
                shared.circuit_breaker.record_success();
                BridgeCounters::bump(&shared.counters.failed_user);
            }
            OutcomeClass::ServiceError => {
                shared.circuit_breaker.record_failure();
                BridgeCounters::bump(&shared.counters.failed_service);
            }
        }

        if !shared.responses.enqueue(client, outcome.response) {
            debug!(
                client = %client,
                command_id = %command.id,
                sequence = command.sequence,
                "Client gone, response discarded"
            );
        }
    }

    /// Stop admitting, stop accepting, drain the queue on this thread, close
    /// connections after flushing their responses, then stop the watchdog
    /// and the I/O runtime. Does nothing if the server is not running.
    pub fn shutdown(&mut self) {
        let Some(io) = self.io.take() else {
            return;
        };

        let grace = self.shared.config.server.graceful_shutdown_timeout();
        let deadline = Instant::now() + grace;
        info!(grace_seconds = grace.as_secs_f64(), "🛑 Shutting down bridge server");

        self.shared.admitting.store(false, Ordering::Release);

        let _ = io.stop_accepting.send(true);
        let accept_task = io.accept_task;
        let stopped = io
            .runtime
            .block_on(async move { tokio::time::timeout(grace, accept_task).await });
        match stopped {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Accept loop task failed"),
            Err(_) => warn!("Accept loop did not stop within the shutdown timeout"),
        }

        let (executed, refused) = self.drain_queue();
        if executed + refused > 0 {
            info!(executed, refused, "Drained command queue");
        }

        let _ = io.close_connections.send(true);
        while self.shared.client_count() > 0 && Instant::now() < deadline {
            thread::sleep(SHUTDOWN_POLL_INTERVAL);
        }

        self.shared.watchdog.stop();

        let remaining = deadline
            .saturating_duration_since(Instant::now())
            .max(MIN_RUNTIME_SHUTDOWN);
        io.runtime.shutdown_timeout(remaining);

        let lingering: Vec<ClientId> = self
            .shared
            .clients
            .iter()
            .map(|entry| *entry.key())
            .collect();
        if !lingering.is_empty() {
            warn!(clients = lingering.len(), "Connections still open at shutdown deadline");
        }
        for client in lingering {
            self.shared.release_client(client);
        }

        let orphaned = self.shared.queue.clear();
        if orphaned > 0 {
            warn!(orphaned, "Commands enqueued during shutdown were dropped");
        }

        self.shared.running.store(false, Ordering::Release);
        *self.shared.local_addr.write() = None;
        log_bridge_operation("shutdown", "bridge_server", "stopped", None, None);
    }

    /// Execute what is queued while the circuit allows it; refuse the rest
    fn drain_queue(&mut self) -> (usize, usize) {
        let mut executed = 0;
        let mut refused = 0;

        for entry in self.shared.queue.drain_all() {
            if self.shared.circuit_breaker.permits_execution() {
                self.execute(entry);
                executed += 1;
            } else {
                let response = Response::rejected(
                    &entry.command.id,
                    entry.command.sequence,
                    &AdmissionRejection::ShuttingDown,
                );
                self.shared.responses.enqueue(entry.client, response);
                refused += 1;
            }
        }

        (executed, refused)
    }

    pub fn is_running(&self) -> bool {
        self.io.is_some()
    }

    /// Address actually bound, if running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    /// Register or replace handlers after construction
    pub fn dispatcher_mut(&mut self) -> &mut CommandDispatcher {
        &mut self.dispatcher
    }

    pub fn health(&self) -> HealthReport {
        self.shared.health.check()
    }

    pub fn stats(&self) -> BridgeStats {
        self.shared.stats()
    }

    pub fn client_count(&self) -> usize {
        self.shared.client_count()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn rate_limiter(&self) -> &Arc<TokenBucketRateLimiter> {
        &self.shared.rate_limiter
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.shared.circuit_breaker
    }

    pub fn backpressure(&self) -> &Arc<BackpressureController> {
        &self.shared.backpressure
    }

    pub fn port_manager(&self) -> &Arc<PortFailoverManager> {
        &self.shared.port_manager
    }

    pub fn watchdog(&self) -> &Arc<Watchdog> {
        &self.shared.watchdog
    }
}

impl Drop for BridgeServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::command::Payload;
    use crate::execution::dispatcher::HandlerError;
    use crate::resilience::{BackpressureLevel, CircuitState};

    fn test_config() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.server.primary_port = 0;
        config.server.backup_ports = Vec::new();
        config.watchdog.enabled = false;
        config.circuit_breaker.failure_threshold = 5;
        config.circuit_breaker.timeout_seconds = 60.0;
        config.backpressure.latency_elevated_seconds = 30.0;
        config.backpressure.latency_high_seconds = 60.0;
        config.backpressure.latency_critical_seconds = 120.0;
        config
    }

    fn dispatcher() -> CommandDispatcher {
        let mut dispatcher = CommandDispatcher::new();
        dispatcher
            .register("echo", |payload: &Payload| -> std::result::Result<Value, HandlerError> {
                Ok(json!(payload))
            })
            .register("missing", |_: &Payload| -> std::result::Result<Value, HandlerError> {
                Err(HandlerError::not_found("node /obj/geo1"))
            })
            .register("hang", |_: &Payload| -> std::result::Result<Value, HandlerError> {
                Err(HandlerError::Timeout("host did not answer".to_string()))
            });
        dispatcher
    }

    fn server() -> BridgeServer {
        BridgeServer::new(test_config(), dispatcher()).unwrap()
    }

    fn queue_for(server: &BridgeServer, client: ClientId, command_type: &str, id: &str) -> u64 {
        server
            .shared
            .queue
            .enqueue(Command::new(command_type, id, Payload::new()), client)
            .sequence
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = test_config();
        config.server.max_connections = 0;
        assert!(matches!(
            BridgeServer::new(config, CommandDispatcher::new()),
            Err(BridgeError::Configuration(_))
        ));
    }

    #[test]
    fn test_tick_executes_in_order_and_routes_responses() {
        let mut server = server();
        let alice = ClientId::new();
        let bob = ClientId::new();
        server.shared.responses.register(alice);
        server.shared.responses.register(bob);

        let first = queue_for(&server, alice, "echo", "a-1");
        let second = queue_for(&server, bob, "echo", "b-1");
        let third = queue_for(&server, alice, "missing", "a-2");

        assert_eq!(server.process_tick(), 3);
        assert_eq!(server.queue_len(), 0);

        let alice_responses = server.shared.responses.take_responses(alice);
        let sequences: Vec<u64> = alice_responses.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![first, third]);
        assert!(alice_responses[0].success);
        assert!(!alice_responses[1].success);
        assert!(!alice_responses[1].is_service_error());

        let bob_responses = server.shared.responses.take_responses(bob);
        assert_eq!(bob_responses.len(), 1);
        assert_eq!(bob_responses[0].sequence, second);

        let stats = server.stats();
        assert_eq!(stats.commands_succeeded, 2);
        assert_eq!(stats.commands_failed_user, 1);
        assert_eq!(stats.commands_failed, 1);
    }

    #[test]
    fn test_user_errors_never_open_the_circuit() {
        let mut server = server();
        let client = ClientId::new();
        server.shared.responses.register(client);

        for i in 0..100 {
            queue_for(&server, client, "missing", &format!("m-{i}"));
            server.process_tick();
        }

        assert_eq!(server.circuit_breaker().state(), CircuitState::Closed);
        assert_eq!(server.stats().commands_failed_user, 100);
    }

    #[test]
    fn test_service_errors_open_the_circuit_and_stop_the_tick() {
        let mut server = server();
        let client = ClientId::new();
        server.shared.responses.register(client);

        for i in 0..7 {
            queue_for(&server, client, "hang", &format!("h-{i}"));
        }

        assert_eq!(server.process_tick(), 5);
        assert_eq!(server.circuit_breaker().state(), CircuitState::Open);
        assert_eq!(server.queue_len(), 2);

        assert_eq!(server.process_tick(), 0);
        assert_eq!(server.queue_len(), 2);
        assert_eq!(server.backpressure().level(), BackpressureLevel::Critical);

        let responses = server.shared.responses.take_responses(client);
        assert_eq!(responses.len(), 5);
        assert!(responses.iter().all(Response::is_service_error));
    }

    #[test]
    fn test_admission_refused_before_start() {
        let server = server();
        let command = Command::new("echo", "early", Payload::new());
        let rejection = server.shared.admit(ClientId::new(), &command).unwrap_err();
        assert_eq!(rejection, AdmissionRejection::ShuttingDown);
        assert_eq!(server.stats().commands_rejected, 1);
    }

    #[test]
    fn test_admission_order_rate_limit_then_circuit() {
        let mut config = test_config();
        config.rate_limiter.client_bucket_size = 2.0;
        config.rate_limiter.client_tokens_per_second = 0.01;
        let server = BridgeServer::new(config, dispatcher()).unwrap();
        server.shared.admitting.store(true, Ordering::Release);

        let client = ClientId::new();
        let command = Command::new("echo", "c", Payload::new());
        assert!(server.shared.admit(client, &command).is_ok());
        assert!(server.shared.admit(client, &command).is_ok());
        let limited = server.shared.admit(client, &command).unwrap_err();
        assert_eq!(limited.reason(), "client_rate_limit");

        server.circuit_breaker().force_open("test");
        let other = ClientId::new();
        let open = server.shared.admit(other, &command).unwrap_err();
        assert_eq!(open.reason(), "circuit_open");
    }

    #[test]
    fn test_eviction_notifies_owner() {
        let mut config = test_config();
        config.server.max_pending_commands = 1;
        let server = BridgeServer::new(config, dispatcher()).unwrap();
        let owner = ClientId::new();
        server.shared.responses.register(owner);

        let evicted_sequence = queue_for(&server, owner, "echo", "old");
        let receipt = server
            .shared
            .queue
            .enqueue(Command::new("echo", "new", Payload::new()), ClientId::new());
        server.shared.notify_evicted(receipt.evicted.unwrap());

        let responses = server.shared.responses.take_responses(owner);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].id, "old");
        assert_eq!(responses[0].sequence, evicted_sequence);
        assert_eq!(responses[0].data["reason"], "queue_overflow");
        assert_eq!(server.stats().commands_evicted, 1);
    }

    #[test]
    fn test_connection_cap() {
        let mut config = test_config();
        config.server.max_connections = 1;
        let server = BridgeServer::new(config, dispatcher()).unwrap();
        server.shared.admitting.store(true, Ordering::Release);
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        let first = ClientId::new();
        assert!(server.shared.register_client(first, peer, 0).is_ok());
        let refused = server.shared.register_client(ClientId::new(), peer, 0);
        assert_eq!(refused, Err(AdmissionRejection::ConnectionLimit { limit: 1 }));
        assert_eq!(server.client_count(), 1);

        server.shared.release_client(first);
        assert_eq!(server.client_count(), 0);
        assert!(!server.shared.responses.is_registered(first));
    }

    #[test]
    fn test_health_document_embeds_stats() {
        let server = server();
        let document = server.shared.health_document();
        assert_eq!(document["healthy"], true);
        assert_eq!(document["level"], "normal");
        assert!(document["components"]["circuitBreaker"].is_object());
        assert_eq!(document["stats"]["queue_size"], 0);
    }

    #[test]
    fn test_shutdown_without_start_is_noop() {
        let mut server = server();
        server.shutdown();
        assert!(!server.is_running());
    }

    #[test]
    fn test_start_and_shutdown_on_ephemeral_port() {
        let mut server = server();
        let addr = server.start().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(server.is_running());
        assert!(matches!(server.start(), Err(BridgeError::AlreadyRunning)));
        assert_eq!(server.stats().local_addr, Some(addr));

        server.shutdown();
        assert!(!server.is_running());
        assert_eq!(server.local_addr(), None);
    }
}
