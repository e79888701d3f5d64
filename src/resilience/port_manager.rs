//! # Port Failover Manager
//!
//! Tracks the health of the primary port and its backups and answers one
//! question: which port should the server be listening on right now. It
//! never binds sockets itself; rebinding is the server's job.

use crate::config::ServerConfig;
use crate::resilience::invoke_callback;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Health record for one candidate port
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortHealth {
    pub port: u16,
    pub is_active: bool,
    pub is_healthy: bool,
    pub error_count: u64,
    pub connections: usize,
    pub last_error: Option<String>,
    pub last_check: Option<DateTime<Utc>>,
}

impl PortHealth {
    fn new(port: u16) -> Self {
        Self {
            port,
            is_active: false,
            is_healthy: true,
            error_count: 0,
            connections: 0,
            last_error: None,
            last_check: None,
        }
    }
}

/// Snapshot of every port's health
#[derive(Debug, Clone, Serialize)]
pub struct PortManagerStatus {
    pub active_port: Option<u16>,
    pub primary_port: u16,
    pub ports: Vec<PortHealth>,
}

impl PortManagerStatus {
    pub fn unhealthy_ports(&self) -> Vec<u16> {
        self.ports
            .iter()
            .filter(|p| !p.is_healthy)
            .map(|p| p.port)
            .collect()
    }
}

/// Invoked as `(previous_active, new_active)`
pub type PortChangeCallback = Arc<dyn Fn(Option<u16>, u16) + Send + Sync>;
/// Invoked as `(port, is_healthy, error)`
pub type HealthChangeCallback = Arc<dyn Fn(u16, bool, Option<&str>) + Send + Sync>;

#[derive(Default)]
struct PortCallbacks {
    on_port_change: Option<PortChangeCallback>,
    on_health_change: Option<HealthChangeCallback>,
}

#[derive(Debug)]
struct PortTable {
    /// Primary first, then backups in priority order
    ports: Vec<PortHealth>,
    active: Option<u16>,
}

impl PortTable {
    fn get_mut(&mut self, port: u16) -> Option<&mut PortHealth> {
        self.ports.iter_mut().find(|p| p.port == port)
    }

    fn preferred(&self) -> u16 {
        self.ports
            .iter()
            .find(|p| p.is_healthy)
            .or_else(|| self.ports.first())
            .map(|p| p.port)
            .unwrap_or_default()
    }
}

pub struct PortFailoverManager {
    primary_port: u16,
    table: Mutex<PortTable>,
    callbacks: RwLock<PortCallbacks>,
}

impl fmt::Debug for PortFailoverManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortFailoverManager")
            .field("primary_port", &self.primary_port)
            .field("table", &*self.table.lock())
            .finish()
    }
}

impl PortFailoverManager {
    pub fn new(primary_port: u16, backup_ports: &[u16]) -> Self {
        let ports = std::iter::once(primary_port)
            .chain(backup_ports.iter().copied())
            .map(PortHealth::new)
            .collect();

        Self {
            primary_port,
            table: Mutex::new(PortTable {
                ports,
                active: None,
            }),
            callbacks: RwLock::new(PortCallbacks::default()),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.primary_port, &config.backup_ports)
    }

    pub fn on_port_change<F>(&self, callback: F)
    where
        F: Fn(Option<u16>, u16) + Send + Sync + 'static,
    {
        self.callbacks.write().on_port_change = Some(Arc::new(callback));
    }

    pub fn on_health_change<F>(&self, callback: F)
    where
        F: Fn(u16, bool, Option<&str>) + Send + Sync + 'static,
    {
        self.callbacks.write().on_health_change = Some(Arc::new(callback));
    }

    pub fn primary_port(&self) -> u16 {
        self.primary_port
    }

    /// The port to listen on: primary if healthy, else the first healthy
    /// backup, else the primary anyway
    pub fn get_active_port(&self) -> u16 {
        self.table.lock().preferred()
    }

    /// Port currently marked as bound, if any
    pub fn bound_port(&self) -> Option<u16> {
        self.table.lock().active
    }

    /// All candidate ports in priority order
    pub fn candidate_ports(&self) -> Vec<u16> {
        self.table.lock().ports.iter().map(|p| p.port).collect()
    }

    /// Ports that outrank `port` in priority order
    pub fn preferred_ports_before(&self, port: u16) -> Vec<u16> {
        self.table
            .lock()
            .ports
            .iter()
            .map(|p| p.port)
            .take_while(|p| *p != port)
            .collect()
    }

    /// Record the port the server is now listening on
    pub fn mark_active(&self, port: u16) {
        let previous = {
            let mut table = self.table.lock();
            let previous = table.active;
            table.active = Some(port);
            for health in table.ports.iter_mut() {
                health.is_active = health.port == port;
                if health.port == port {
                    health.last_check = Some(Utc::now());
                }
            }
            previous
        };

        if previous != Some(port) {
            info!(
                previous_port = ?previous,
                port = port,
                "🔌 Active port changed"
            );
            let callback = self.callbacks.read().on_port_change.clone();
            if let Some(callback) = callback {
                invoke_callback("port_manager", "on_port_change", || callback(previous, port));
            }
        }
    }

    /// Record a bind or accept failure; returns false for unknown ports
    pub fn mark_unhealthy(&self, port: u16, error: &str) -> bool {
        let found = {
            let mut table = self.table.lock();
            match table.get_mut(port) {
                Some(health) => {
                    health.is_healthy = false;
                    health.error_count += 1;
                    health.last_error = Some(error.to_string());
                    health.last_check = Some(Utc::now());
                    true
                }
                None => false,
            }
        };

        if found {
            warn!(port = port, error = %error, "Port marked unhealthy");
            let callback = self.callbacks.read().on_health_change.clone();
            if let Some(callback) = callback {
                invoke_callback("port_manager", "on_health_change", || {
                    callback(port, false, Some(error))
                });
            }
        }
        found
    }

    /// Record a successful bind; returns true if the port was unhealthy
    pub fn mark_healthy(&self, port: u16) -> bool {
        let recovered = {
            let mut table = self.table.lock();
            match table.get_mut(port) {
                Some(health) => {
                    let was_unhealthy = !health.is_healthy;
                    health.is_healthy = true;
                    health.last_error = None;
                    health.last_check = Some(Utc::now());
                    was_unhealthy
                }
                None => false,
            }
        };

        if recovered {
            info!(port = port, "🟢 Port recovered");
            let callback = self.callbacks.read().on_health_change.clone();
            if let Some(callback) = callback {
                invoke_callback("port_manager", "on_health_change", || {
                    callback(port, true, None)
                });
            }
        }
        recovered
    }

    /// The port to move to, if it differs from the bound one
    pub fn should_failover(&self) -> Option<u16> {
        let table = self.table.lock();
        let preferred = table.preferred();
        match table.active {
            Some(active) if active == preferred => None,
            _ => Some(preferred),
        }
    }

    pub fn update_connections(&self, port: u16, connections: usize) {
        if let Some(health) = self.table.lock().get_mut(port) {
            health.connections = connections;
        }
    }

    pub fn status(&self) -> PortManagerStatus {
        let table = self.table.lock();
        PortManagerStatus {
            active_port: table.active,
            primary_port: self.primary_port,
            ports: table.ports.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn manager() -> PortFailoverManager {
        PortFailoverManager::new(9999, &[9998, 9997, 9996])
    }

    #[test]
    fn test_primary_preferred_when_healthy() {
        let ports = manager();
        assert_eq!(ports.get_active_port(), 9999);
        assert_eq!(ports.candidate_ports(), vec![9999, 9998, 9997, 9996]);
    }

    #[test]
    fn test_failover_and_failback() {
        let ports = manager();
        ports.mark_active(9999);

        ports.mark_unhealthy(9999, "address in use");
        assert_eq!(ports.get_active_port(), 9998);
        assert_eq!(ports.should_failover(), Some(9998));

        ports.mark_unhealthy(9998, "address in use");
        assert_eq!(ports.get_active_port(), 9997);

        ports.mark_active(9997);
        assert_eq!(ports.should_failover(), None);

        // Primary coming back is the answer again
        assert!(ports.mark_healthy(9999));
        assert_eq!(ports.get_active_port(), 9999);
        assert_eq!(ports.should_failover(), Some(9999));
        assert_eq!(ports.preferred_ports_before(9997), vec![9999, 9998]);
    }

    #[test]
    fn test_all_unhealthy_falls_back_to_primary() {
        let ports = manager();
        for port in ports.candidate_ports() {
            ports.mark_unhealthy(port, "down");
        }
        assert_eq!(ports.get_active_port(), 9999);
        assert_eq!(ports.status().unhealthy_ports().len(), 4);
    }

    #[test]
    fn test_unknown_port_is_ignored() {
        let ports = manager();
        assert!(!ports.mark_unhealthy(1234, "nope"));
        assert!(!ports.mark_healthy(1234));
    }

    #[test]
    fn test_callbacks_fire_on_changes() {
        let ports = manager();
        let port_changes = Arc::new(StdMutex::new(Vec::new()));
        let health_changes = Arc::new(StdMutex::new(Vec::new()));

        let sink = port_changes.clone();
        ports.on_port_change(move |old, new| sink.lock().unwrap().push((old, new)));
        let sink = health_changes.clone();
        ports.on_health_change(move |port, healthy, error| {
            sink.lock()
                .unwrap()
                .push((port, healthy, error.map(str::to_string)))
        });

        ports.mark_active(9999);
        ports.mark_active(9999);
        ports.mark_unhealthy(9999, "accept failed");
        ports.mark_active(9998);
        ports.mark_healthy(9999);
        ports.mark_healthy(9999);

        assert_eq!(
            *port_changes.lock().unwrap(),
            vec![(None, 9999), (Some(9999), 9998)]
        );
        assert_eq!(
            *health_changes.lock().unwrap(),
            vec![
                (9999, false, Some("accept failed".to_string())),
                (9999, true, None),
            ]
        );

        let status = ports.status();
        assert_eq!(status.active_port, Some(9998));
        assert!(status.ports.iter().find(|p| p.port == 9998).unwrap().is_active);
        assert_eq!(
            status.ports.iter().find(|p| p.port == 9999).unwrap().error_count,
            1
        );
    }
}
