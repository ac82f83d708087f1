//! Server configuration.

use std::net::{Ipv4Addr, SocketAddr};

use serde::Deserialize;

/// Default MQTT port.
pub const DEFAULT_PORT: u16 = 1883;

/// Default interval between expired-session sweeps in seconds.
pub const DEFAULT_SESSION_EXPIRY_CHECK: u64 = 60;

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Number of runtime worker threads (0 = auto based on CPU count).
    #[serde(default)]
    pub workers: usize,
    /// Seconds between expired-session sweeps (0 = disabled).
    #[serde(default = "default_session_expiry_check")]
    pub session_expiry_check: u64,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT))
}

fn default_session_expiry_check() -> u64 {
    DEFAULT_SESSION_EXPIRY_CHECK
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            workers: 0,
            session_expiry_check: DEFAULT_SESSION_EXPIRY_CHECK,
        }
    }
}

impl ServerConfig {
    /// Worker threads to start, resolving 0 to the CPU count.
    pub fn worker_threads(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }
}
