//! Shared harness for bridge integration tests
//!
//! The test thread plays the host: it owns the `BridgeServer` and calls
//! `process_tick`. Clients are plain blocking `std::net` sockets running on
//! their own threads.

#![allow(dead_code)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use host_bridge::config::BridgeConfig;
use host_bridge::execution::{BridgeServer, CommandDispatcher};

pub const TICK_INTERVAL: Duration = Duration::from_millis(5);
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("host_bridge=debug")
        .with_test_writer()
        .try_init();
}

/// Loopback config on an ephemeral port with limits loose enough that only
/// the behavior under test can trigger
pub fn test_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.primary_port = 0;
    config.server.backup_ports = Vec::new();
    config.server.command_timeout_seconds = 5.0;
    config.server.graceful_shutdown_timeout_seconds = 2.0;

    config.rate_limiter.tokens_per_second = 10_000.0;
    config.rate_limiter.bucket_size = 10_000.0;
    config.rate_limiter.client_tokens_per_second = 1_000.0;
    config.rate_limiter.client_bucket_size = 1_000.0;

    config.watchdog.enabled = false;

    config.backpressure.latency_elevated_seconds = 30.0;
    config.backpressure.latency_high_seconds = 60.0;
    config.backpressure.latency_critical_seconds = 120.0;
    config
}

pub fn start_server(config: BridgeConfig, dispatcher: CommandDispatcher) -> (BridgeServer, SocketAddr) {
    init_test_logging();
    let mut server = BridgeServer::new(config, dispatcher).expect("valid test config");
    let addr = server.start().expect("server starts");
    (server, addr)
}

/// Run `scenario` on a client thread while this thread ticks the bridge
pub fn run_with_host<T, F>(server: &mut BridgeServer, addr: SocketAddr, scenario: F) -> T
where
    T: Send + 'static,
    F: FnOnce(SocketAddr) -> T + Send + 'static,
{
    let handle = thread::spawn(move || scenario(addr));
    tick_until_finished(server, &handle);
    handle.join().expect("client scenario panicked")
}

pub fn tick_until_finished<T>(server: &mut BridgeServer, handle: &JoinHandle<T>) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !handle.is_finished() {
        assert!(Instant::now() < deadline, "client scenario did not finish");
        server.process_tick();
        thread::sleep(TICK_INTERVAL);
    }
}

/// Poll `condition` for up to `timeout`
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// A port nothing is listening on right now
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .expect("ephemeral port")
}

/// Blocking line-protocol client
pub struct TestClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    next_id: u64,
}

impl TestClient {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect to bridge");
        stream.set_read_timeout(Some(READ_TIMEOUT)).expect("read timeout");
        let writer = stream.try_clone().expect("clone stream");
        Self {
            reader: BufReader::new(stream),
            writer,
            next_id: 0,
        }
    }

    pub fn send_raw(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .expect("write command");
    }

    /// Send a command and return its id
    pub fn send(&mut self, command_type: &str, payload: Value) -> String {
        self.next_id += 1;
        let id = format!("{command_type}-{}", self.next_id);
        let line = json!({ "type": command_type, "id": id, "payload": payload }).to_string();
        self.send_raw(&line);
        id
    }

    /// Next response line, or `None` once the server closed the connection
    pub fn read_response(&mut self) -> Option<Value> {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => Some(serde_json::from_str(&line).expect("response is JSON")),
            Err(e) => panic!("read failed: {e}"),
        }
    }

    /// Send a command and wait for the response carrying its id
    pub fn request(&mut self, command_type: &str, payload: Value) -> Value {
        let id = self.send(command_type, payload);
        loop {
            let response = self.read_response().expect("connection closed early");
            if response["id"] == id.as_str() {
                return response;
            }
        }
    }
}
