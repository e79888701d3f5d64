//! # Main Thread Watchdog
//!
//! A background thread that notices when the host's main thread stops
//! ticking. The host calls [`Watchdog::heartbeat`] once per tick; the monitor
//! thread wakes every `heartbeat_interval` and compares the gap since the last
//! heartbeat against `freeze_threshold`.
//!
//! `on_freeze` fires once per freeze episode and `on_recover` fires once on
//! the first heartbeat after it, no matter how many polls happened between.

use crate::config::WatchdogConfig;
use crate::resilience::invoke_callback;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub type FreezeCallback = Arc<dyn Fn(Duration) + Send + Sync>;
pub type RecoverCallback = Arc<dyn Fn() + Send + Sync>;

/// Point-in-time watchdog statistics
#[derive(Debug, Clone, Serialize)]
pub struct WatchdogStats {
    pub running: bool,
    pub is_frozen: bool,
    pub freeze_count: u64,
    pub total_heartbeats: u64,
    pub max_latency_seconds: f64,
    pub average_latency_seconds: f64,
    pub seconds_since_heartbeat: f64,
}

#[derive(Debug)]
struct WatchdogState {
    last_heartbeat: Instant,
    is_frozen: bool,
    freeze_count: u64,
    total_heartbeats: u64,
    max_latency: Duration,
    latencies: VecDeque<Duration>,
}

#[derive(Default)]
struct WatchdogCallbacks {
    on_freeze: Option<FreezeCallback>,
    on_recover: Option<RecoverCallback>,
}

/// Freeze detector for the host main thread
pub struct Watchdog {
    config: WatchdogConfig,
    state: Mutex<WatchdogState>,
    callbacks: RwLock<WatchdogCallbacks>,
    stop_requested: Mutex<bool>,
    stop_signal: Condvar,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watchdog")
            .field("config", &self.config)
            .field("is_frozen", &self.is_frozen())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Watchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            state: Mutex::new(WatchdogState {
                last_heartbeat: Instant::now(),
                is_frozen: false,
                freeze_count: 0,
                total_heartbeats: 0,
                max_latency: Duration::ZERO,
                latencies: VecDeque::with_capacity(config.latency_window),
            }),
            config,
            callbacks: RwLock::new(WatchdogCallbacks::default()),
            stop_requested: Mutex::new(false),
            stop_signal: Condvar::new(),
            monitor: Mutex::new(None),
        }
    }

    pub fn on_freeze<F>(&self, callback: F)
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.callbacks.write().on_freeze = Some(Arc::new(callback));
    }

    pub fn on_recover<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks.write().on_recover = Some(Arc::new(callback));
    }

    /// Start the monitor thread. Returns false if it is already running.
    pub fn start(self: &Arc<Self>) -> std::io::Result<bool> {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return Ok(false);
        }

        *self.stop_requested.lock() = false;
        self.state.lock().last_heartbeat = Instant::now();

        let watchdog = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("bridge-watchdog".to_string())
            .spawn(move || watchdog.monitor_loop())?;
        *monitor = Some(handle);

        info!(
            heartbeat_interval_seconds = self.config.heartbeat_interval_seconds,
            freeze_threshold_seconds = self.config.freeze_threshold_seconds,
            "🐕 Watchdog started monitoring main thread"
        );
        Ok(true)
    }

    /// Stop and join the monitor thread
    pub fn stop(&self) {
        let handle = self.monitor.lock().take();
        let Some(handle) = handle else {
            return;
        };

        *self.stop_requested.lock() = true;
        self.stop_signal.notify_all();

        if handle.join().is_err() {
            error!("Watchdog monitor thread panicked");
        }
        info!("🐕 Watchdog stopped");
    }

    pub fn is_running(&self) -> bool {
        self.monitor.lock().is_some()
    }

    fn monitor_loop(&self) {
        let interval = self.config.heartbeat_interval();
        loop {
            {
                let mut stopped = self.stop_requested.lock();
                if !*stopped {
                    self.stop_signal.wait_for(&mut stopped, interval);
                }
                if *stopped {
                    break;
                }
            }
            self.check();
        }
        debug!("Watchdog monitor loop exited");
    }

    /// Called by the host main thread once per tick
    pub fn heartbeat(&self) {
        self.heartbeat_at(Instant::now());
    }

    pub(crate) fn heartbeat_at(&self, now: Instant) {
        let recovered_after = {
            let mut state = self.state.lock();
            let latency = now.saturating_duration_since(state.last_heartbeat);

            while state.latencies.len() >= self.config.latency_window.max(1) {
                state.latencies.pop_front();
            }
            state.latencies.push_back(latency);
            state.max_latency = state.max_latency.max(latency);
            state.last_heartbeat = now;
            state.total_heartbeats += 1;

            if state.is_frozen {
                state.is_frozen = false;
                Some(latency)
            } else {
                None
            }
        };

        if let Some(frozen_for) = recovered_after {
            info!(
                frozen_seconds = frozen_for.as_secs_f64(),
                "🟢 Main thread recovered"
            );
            let callback = self.callbacks.read().on_recover.clone();
            if let Some(callback) = callback {
                invoke_callback("watchdog", "on_recover", || callback());
            }
        }
    }

    /// One monitor poll; returns true if this poll detected a new freeze
    pub fn check(&self) -> bool {
        self.check_at(Instant::now())
    }

    pub(crate) fn check_at(&self, now: Instant) -> bool {
        let frozen_for = {
            let mut state = self.state.lock();
            let elapsed = now.saturating_duration_since(state.last_heartbeat);
            if elapsed > self.config.freeze_threshold() && !state.is_frozen {
                state.is_frozen = true;
                state.freeze_count += 1;
                Some(elapsed)
            } else {
                None
            }
        };

        match frozen_for {
            Some(elapsed) => {
                warn!(
                    elapsed_seconds = elapsed.as_secs_f64(),
                    freeze_threshold_seconds = self.config.freeze_threshold_seconds,
                    "🥶 Main thread frozen"
                );
                let callback = self.callbacks.read().on_freeze.clone();
                if let Some(callback) = callback {
                    invoke_callback("watchdog", "on_freeze", || callback(elapsed));
                }
                true
            }
            None => false,
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.state.lock().is_frozen
    }

    /// Mean heartbeat gap over the latency window
    pub fn average_latency(&self) -> Duration {
        let state = self.state.lock();
        if state.latencies.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = state.latencies.iter().sum();
        total / state.latencies.len() as u32
    }

    pub fn stats(&self) -> WatchdogStats {
        let average = self.average_latency();
        let running = self.is_running();
        let state = self.state.lock();
        WatchdogStats {
            running,
            is_frozen: state.is_frozen,
            freeze_count: state.freeze_count,
            total_heartbeats: state.total_heartbeats,
            max_latency_seconds: state.max_latency.as_secs_f64(),
            average_latency_seconds: average.as_secs_f64(),
            seconds_since_heartbeat: state.last_heartbeat.elapsed().as_secs_f64(),
        }
    }
}
