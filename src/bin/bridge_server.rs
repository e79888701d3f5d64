//! Bridge Server Binary
//!
//! Standalone demo host for the command bridge. The main thread plays the
//! role of the host application: it owns the handlers and ticks the bridge
//! every 50 ms until a `shutdown` command arrives or Ctrl-C is pressed.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use host_bridge::config::ConfigManager;
use host_bridge::execution::{typed_handler, BridgeServer, CommandDispatcher, HandlerError, Payload};
use host_bridge::logging::init_structured_logging;

const TICK_INTERVAL: Duration = Duration::from_millis(50);
const MAX_SLEEP_SECONDS: f64 = 30.0;

#[derive(Debug, Deserialize)]
struct SleepArgs {
    seconds: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FailureKind {
    User,
    Service,
    Timeout,
    Panic,
}

#[derive(Debug, Deserialize)]
struct FailArgs {
    kind: FailureKind,
    #[serde(default)]
    message: Option<String>,
}

fn demo_dispatcher(shutdown_requested: Rc<Cell<bool>>) -> CommandDispatcher {
    let mut dispatcher = CommandDispatcher::new();

    dispatcher.register("echo", |payload: &Payload| -> Result<Value, HandlerError> {
        Ok(json!({ "echo": payload }))
    });

    dispatcher.register(
        "sleep",
        typed_handler(|args: SleepArgs| {
            if !(0.0..=MAX_SLEEP_SECONDS).contains(&args.seconds) {
                return Err(HandlerError::invalid_arguments(format!(
                    "seconds must be between 0 and {MAX_SLEEP_SECONDS}"
                )));
            }
            thread::sleep(Duration::from_secs_f64(args.seconds));
            Ok(json!({ "slept": args.seconds }))
        }),
    );

    dispatcher.register(
        "fail",
        typed_handler(|args: FailArgs| {
            let message = args.message.unwrap_or_else(|| "requested failure".to_string());
            match args.kind {
                FailureKind::User => Err(HandlerError::Rejected(message)),
                FailureKind::Service => Err(HandlerError::service(message)),
                FailureKind::Timeout => Err(HandlerError::Timeout(message)),
                FailureKind::Panic => panic!("{message}"),
            }
        }),
    );

    dispatcher.register("shutdown", move |_: &Payload| -> Result<Value, HandlerError> {
        shutdown_requested.set(true);
        Ok(json!({ "shutting_down": true }))
    });

    dispatcher
}

/// Ctrl-C watcher on its own small runtime; the host thread stays sync
fn spawn_interrupt_watcher(interrupted: Arc<AtomicBool>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;

    thread::Builder::new()
        .name("bridge-signals".to_string())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    interrupted.store(true, Ordering::Release);
                }
            });
        })
        .context("failed to spawn signal thread")?;
    Ok(())
}

fn main() -> Result<()> {
    init_structured_logging();

    let manager = ConfigManager::load().context("failed to load bridge configuration")?;
    info!(
        environment = %manager.environment(),
        source = ?manager.source_path(),
        "Configuration loaded"
    );

    let shutdown_requested = Rc::new(Cell::new(false));
    let interrupted = Arc::new(AtomicBool::new(false));
    spawn_interrupt_watcher(Arc::clone(&interrupted))?;

    let dispatcher = demo_dispatcher(Rc::clone(&shutdown_requested));
    let mut server = BridgeServer::new(manager.config().clone(), dispatcher)?;
    let addr = server.start().context("failed to start bridge server")?;
    info!(addr = %addr, handlers = ?server.dispatcher().registered_types(), "Bridge ready");

    while !shutdown_requested.get() && !interrupted.load(Ordering::Acquire) {
        server.process_tick();
        thread::sleep(TICK_INTERVAL);
    }

    if interrupted.load(Ordering::Acquire) {
        warn!("Interrupt received");
    }

    server.shutdown();
    let stats = server.stats();
    info!(
        succeeded = stats.commands_succeeded,
        failed = stats.commands_failed,
        rejected = stats.commands_rejected,
        "Bridge stopped"
    );
    Ok(())
}
