//! Session configuration.

use std::time::Duration;

use serde::Deserialize;

/// Default maximum keep alive in seconds.
pub const DEFAULT_MAX_KEEP_ALIVE: u16 = 65535;

/// Default persistent session expiry in seconds (0 = never).
pub const DEFAULT_SESSION_EXPIRY: u64 = 0;

/// Default CONNECT timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT: u64 = 10;

/// Session configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum keep alive in seconds (client value capped to this, 0 = no cap).
    ///
    /// MQTT 3.1.1 has no way to tell a client its keep-alive was lowered, so
    /// a client asking for more than this is disconnected after 1.5x the cap
    /// even when it pings on its own schedule. Keep the default (65535, the
    /// protocol maximum) unless every client is known to stay below it.
    #[serde(default = "default_max_keep_alive")]
    pub max_keep_alive: u16,

    /// Seconds a disconnected persistent session is kept (0 = forever).
    #[serde(default = "default_session_expiry")]
    pub session_expiry: u64,

    /// Seconds a new connection has to complete CONNECT.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

fn default_max_keep_alive() -> u16 {
    DEFAULT_MAX_KEEP_ALIVE
}
fn default_session_expiry() -> u64 {
    DEFAULT_SESSION_EXPIRY
}
fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_keep_alive: DEFAULT_MAX_KEEP_ALIVE,
            session_expiry: DEFAULT_SESSION_EXPIRY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl SessionConfig {
    /// Keep-alive granted to a client that asked for `requested` seconds.
    ///
    /// 0 stays 0 (disabled); anything else is capped at `max_keep_alive`.
    pub fn effective_keep_alive(&self, requested: u16) -> u16 {
        if requested == 0 || self.max_keep_alive == 0 {
            requested
        } else {
            requested.min(self.max_keep_alive)
        }
    }

    /// Session expiry as a duration, `None` when sessions never expire.
    pub fn expiry(&self) -> Option<Duration> {
        (self.session_expiry > 0).then(|| Duration::from_secs(self.session_expiry))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Validate the session configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.connect_timeout == 0 {
            return Err("connect_timeout must be at least 1 second".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_alive_capping() {
        let config = SessionConfig {
            max_keep_alive: 120,
            ..Default::default()
        };
        assert_eq!(config.effective_keep_alive(0), 0);
        assert_eq!(config.effective_keep_alive(30), 30);
        assert_eq!(config.effective_keep_alive(600), 120);
    }

    #[test]
    fn test_default_keeps_client_keep_alive() {
        let config = SessionConfig::default();
        assert_eq!(config.effective_keep_alive(u16::MAX), u16::MAX);
        assert_eq!(config.effective_keep_alive(600), 600);
    }

    #[test]
    fn test_expiry() {
        assert_eq!(SessionConfig::default().expiry(), None);
        let config = SessionConfig {
            session_expiry: 90,
            ..Default::default()
        };
        assert_eq!(config.expiry(), Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_zero_connect_timeout_rejected() {
        let config = SessionConfig {
            connect_timeout: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
