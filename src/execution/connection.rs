//! Connection layer
//!
//! Runs on the bridge's I/O runtime. The accept loop owns the listener and
//! moves it between candidate ports; every accepted socket gets its own task
//! that reads line-delimited commands, answers reserved commands inline,
//! gates domain commands through admission, and waits for the host thread
//! to answer.

use serde_json::{json, Value};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::constants::{PRODUCT_NAME, PROTOCOL_VERSION, UNKNOWN_COMMAND_ID};
use crate::execution::command::{now_timestamp, ClientId, Command, CommandKind, Response};
use crate::execution::server::BridgeShared;
use crate::logging::{log_bridge_operation, log_error};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Shutdown stages observed by the I/O tasks
#[derive(Debug, Clone)]
pub(crate) struct ShutdownSignals {
    pub stop_accepting: watch::Receiver<bool>,
    pub close_connections: watch::Receiver<bool>,
}

/// Resolves once the flag is raised or its sender is gone
async fn signalled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Bind the first of `ports` that accepts a listener, recording port health
pub(crate) async fn bind_first_available(
    shared: &BridgeShared,
    ports: &[u16],
) -> Option<(TcpListener, u16)> {
    let host = shared.config.server.host.as_str();
    for &port in ports {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => {
                shared.port_manager.mark_healthy(port);
                return Some((listener, port));
            }
            Err(e) => {
                shared.port_manager.mark_unhealthy(port, &e.to_string());
            }
        }
    }
    None
}

enum AcceptEvent {
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    RecoveryDue,
    Stop,
}

/// Accept connections until told to stop, failing over between ports
pub(crate) async fn accept_loop(
    shared: Arc<BridgeShared>,
    mut listener: TcpListener,
    mut port: u16,
    mut signals: ShutdownSignals,
) {
    let interval = shared.config.server.port_recovery_interval();
    let mut recovery = tokio::time::interval_at(Instant::now() + interval, interval);
    recovery.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let event = tokio::select! {
            accepted = listener.accept() => AcceptEvent::Accepted(accepted),
            _ = recovery.tick() => AcceptEvent::RecoveryDue,
            _ = signalled(&mut signals.stop_accepting) => AcceptEvent::Stop,
        };

        match event {
            AcceptEvent::Accepted(Ok((stream, peer))) => {
                debug!(peer = %peer, port, "New connection");
                tokio::spawn(handle_connection(
                    Arc::clone(&shared),
                    stream,
                    peer,
                    port,
                    signals.close_connections.clone(),
                ));
            }
            AcceptEvent::Accepted(Err(e)) => {
                log_error("accept_loop", "accept", &e.to_string(), Some(&format!("port {port}")));
                shared.port_manager.mark_unhealthy(port, &e.to_string());
                match fail_over(&shared, port).await {
                    Some((next, next_port)) => {
                        listener = next;
                        port = next_port;
                    }
                    None => tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await,
                }
            }
            AcceptEvent::RecoveryDue => {
                if let Some((next, next_port)) = recover_preferred(&shared, port).await {
                    listener = next;
                    port = next_port;
                }
            }
            AcceptEvent::Stop => {
                info!(port, "Accept loop shutting down");
                break;
            }
        }
    }
}

/// Move to the best healthy port other than `current`
async fn fail_over(shared: &BridgeShared, current: u16) -> Option<(TcpListener, u16)> {
    let candidates: Vec<u16> = shared
        .port_manager
        .status()
        .ports
        .iter()
        .filter(|health| health.is_healthy && health.port != current)
        .map(|health| health.port)
        .collect();

    let (listener, port) = bind_first_available(shared, &candidates).await?;
    activate(shared, &listener, port);
    Some((listener, port))
}

/// Try to move back to a port that outranks `current`
async fn recover_preferred(shared: &BridgeShared, current: u16) -> Option<(TcpListener, u16)> {
    let host = shared.config.server.host.as_str();
    let preferred = shared.port_manager.preferred_ports_before(current);

    for port in preferred.into_iter().filter(|p| *p != 0) {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => {
                shared.port_manager.mark_healthy(port);
                activate(shared, &listener, port);
                return Some((listener, port));
            }
            Err(e) => {
                debug!(port, error = %e, "Preferred port still unavailable");
            }
        }
    }
    None
}

fn activate(shared: &BridgeShared, listener: &TcpListener, port: u16) {
    shared.port_manager.mark_active(port);
    match listener.local_addr() {
        Ok(addr) => shared.set_local_addr(addr),
        Err(e) => warn!(port, error = %e, "Could not read local address of new listener"),
    }
}

/// Why a connection task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disconnect {
    ClientClosed,
    IdleTimeout,
    ReadFailed,
    WriteFailed,
    Shutdown,
}

impl Disconnect {
    fn as_str(&self) -> &'static str {
        match self {
            Disconnect::ClientClosed => "client_closed",
            Disconnect::IdleTimeout => "idle_timeout",
            Disconnect::ReadFailed => "read_failed",
            Disconnect::WriteFailed => "write_failed",
            Disconnect::Shutdown => "shutdown",
        }
    }
}

enum Inbound {
    Line(String),
    Closed,
    Idle,
    Failed(io::Error),
    Shutdown,
}

async fn next_line(
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    idle_limit: Option<Duration>,
) -> Inbound {
    let read = match idle_limit {
        Some(limit) => match tokio::time::timeout(limit, lines.next_line()).await {
            Ok(read) => read,
            Err(_) => return Inbound::Idle,
        },
        None => lines.next_line().await,
    };

    match read {
        Ok(Some(line)) => Inbound::Line(line),
        Ok(None) => Inbound::Closed,
        Err(e) => Inbound::Failed(e),
    }
}

fn ping_document() -> Value {
    json!({
        "pong": true,
        "product": PRODUCT_NAME,
        "protocol_version": PROTOCOL_VERSION,
        "timestamp": now_timestamp(),
    })
}

/// Serve one client from accept to cleanup
pub(crate) async fn handle_connection(
    shared: Arc<BridgeShared>,
    stream: TcpStream,
    peer: SocketAddr,
    port: u16,
    close: watch::Receiver<bool>,
) {
    let client = ClientId::new();
    let (reader, writer) = stream.into_split();
    let mut session = Session {
        shared,
        client,
        writer,
        close,
    };

    if let Err(rejection) = session.shared.register_client(client, peer, port) {
        warn!(peer = %peer, reason = rejection.reason(), "Connection refused");
        let _ = session
            .send(&Response::rejected(UNKNOWN_COMMAND_ID, 0, &rejection))
            .await;
        return;
    }

    let peer_text = peer.to_string();
    log_bridge_operation("connect", "connection", "accepted", Some(port), Some(&peer_text));

    let reason = session.run(BufReader::new(reader).lines()).await;

    session.shared.release_client(client);
    log_bridge_operation("disconnect", "connection", reason.as_str(), Some(port), Some(&peer_text));
}

struct Session {
    shared: Arc<BridgeShared>,
    client: ClientId,
    writer: OwnedWriteHalf,
    close: watch::Receiver<bool>,
}

impl Session {
    async fn run(&mut self, mut lines: Lines<BufReader<OwnedReadHalf>>) -> Disconnect {
        let idle_limit = self.shared.config.server.client_heartbeat_timeout();

        loop {
            let inbound = tokio::select! {
                inbound = next_line(&mut lines, idle_limit) => inbound,
                _ = signalled(&mut self.close) => Inbound::Shutdown,
            };

            let line = match inbound {
                Inbound::Line(line) => line,
                Inbound::Closed => return Disconnect::ClientClosed,
                Inbound::Idle => {
                    warn!(client = %self.client, "Client heartbeat timeout, closing connection");
                    return Disconnect::IdleTimeout;
                }
                Inbound::Failed(e) => {
                    debug!(client = %self.client, error = %e, "Read failed");
                    return Disconnect::ReadFailed;
                }
                Inbound::Shutdown => {
                    let _ = self.flush_pending().await;
                    return Disconnect::Shutdown;
                }
            };

            if let Err(reason) = self.handle_line(&line).await {
                return reason;
            }
        }
    }

    async fn handle_line(&mut self, line: &str) -> Result<(), Disconnect> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }

        // late answers to commands that timed out
        self.flush_pending().await?;

        let command = match Command::from_json(line) {
            Ok(command) => command,
            Err(e) => {
                debug!(client = %self.client, error = %e, "Malformed command");
                return self.send(&Response::malformed(&e)).await;
            }
        };

        match command.kind() {
            CommandKind::Heartbeat => {
                self.send(&Response::ok(&command, json!({ "heartbeat": "ack" })))
                    .await
            }
            CommandKind::Ping => self.send(&Response::ok(&command, ping_document())).await,
            CommandKind::HealthQuery => {
                let document = self.shared.health_document();
                self.send(&Response::ok(&command, document)).await
            }
            CommandKind::Domain => self.submit(command).await,
        }
    }

    async fn submit(&mut self, command: Command) -> Result<(), Disconnect> {
        if let Err(rejection) = self.shared.admit(self.client, &command) {
            return self
                .send(&Response::rejected(&command.id, 0, &rejection))
                .await;
        }

        let mut queued = command.clone();
        let receipt = self.shared.queue.enqueue(command, self.client);
        queued.sequence = receipt.sequence;
        if let Some(evicted) = receipt.evicted {
            self.shared.notify_evicted(evicted);
        }

        self.await_response(&queued).await
    }

    /// Forward responses until the one for `command` arrives or the command
    /// timeout passes
    async fn await_response(&mut self, command: &Command) -> Result<(), Disconnect> {
        let timeout = self.shared.config.server.command_timeout();
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.shared.record_timeout(command);
                return self.send(&Response::timed_out(command, timeout)).await;
            }

            let waited = tokio::select! {
                responses = self.shared.responses.wait_for_responses(self.client, remaining) => {
                    Some(responses)
                }
                _ = signalled(&mut self.close) => None,
            };
            let Some(responses) = waited else {
                let _ = self.flush_pending().await;
                return Err(Disconnect::Shutdown);
            };

            let mut answered = false;
            for response in responses {
                answered |= response.sequence == command.sequence && response.id == command.id;
                self.send(&response).await?;
            }
            if answered {
                return Ok(());
            }
        }
    }

    async fn flush_pending(&mut self) -> Result<(), Disconnect> {
        for response in self.shared.responses.take_responses(self.client) {
            self.send(&response).await?;
        }
        Ok(())
    }

    async fn send(&mut self, response: &Response) -> Result<(), Disconnect> {
        let mut line = match response.to_json() {
            Ok(line) => line,
            Err(e) => {
                error!(command_id = %response.id, error = %e, "Failed to serialize response");
                return Ok(());
            }
        };
        line.push('\n');

        if let Err(e) = self.writer.write_all(line.as_bytes()).await {
            debug!(client = %self.client, error = %e, "Write failed");
            return Err(Disconnect::WriteFailed);
        }
        Ok(())
    }
}
