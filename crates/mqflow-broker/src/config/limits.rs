//! Limits configuration.

use serde::Deserialize;

/// Default maximum packet size (1MB).
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 1024 * 1024;

/// Default maximum topic length in bytes.
pub const DEFAULT_MAX_TOPIC_LENGTH: usize = 4096;

/// Default maximum topic levels (depth).
pub const DEFAULT_MAX_TOPIC_LEVELS: usize = 32;

/// Default max inflight messages per client (broker -> client).
pub const DEFAULT_MAX_INFLIGHT: u16 = 32;

/// Default max messages held per client beyond the inflight window.
pub const DEFAULT_MAX_QUEUED: usize = 1000;

/// Default maximum connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 100_000;

/// Limits configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum MQTT packet size in bytes (0 = protocol maximum).
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,

    /// Maximum topic name length in bytes (0 = unlimited).
    #[serde(default = "default_max_topic_length")]
    pub max_topic_length: usize,

    /// Maximum topic levels (segments separated by '/', 0 = unlimited).
    /// Prevents subscription trie explosion from deeply nested filters.
    #[serde(default = "default_max_topic_levels")]
    pub max_topic_levels: usize,

    /// Maximum inflight QoS 1/2 messages per client (broker -> client).
    /// Further messages wait in the client's queue.
    #[serde(default = "default_max_inflight")]
    pub max_inflight: u16,

    /// Messages queued per client while offline or past the inflight window.
    /// The oldest message is dropped when full.
    #[serde(default = "default_max_queued")]
    pub max_queued: usize,

    /// Maximum concurrent connections (0 = unlimited).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_max_packet_size() -> u32 {
    DEFAULT_MAX_PACKET_SIZE
}
fn default_max_topic_length() -> usize {
    DEFAULT_MAX_TOPIC_LENGTH
}
fn default_max_topic_levels() -> usize {
    DEFAULT_MAX_TOPIC_LEVELS
}
fn default_max_inflight() -> u16 {
    DEFAULT_MAX_INFLIGHT
}
fn default_max_queued() -> usize {
    DEFAULT_MAX_QUEUED
}
fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_topic_length: DEFAULT_MAX_TOPIC_LENGTH,
            max_topic_levels: DEFAULT_MAX_TOPIC_LEVELS,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            max_queued: DEFAULT_MAX_QUEUED,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl LimitsConfig {
    /// Validate the limits configuration.
    pub fn validate(&self) -> Result<(), String> {
        // MQTT protocol maximum is 268,435,455 bytes
        if self.max_packet_size > 268_435_455 {
            return Err("max_packet_size cannot exceed MQTT protocol maximum (268,435,455)".into());
        }

        if self.max_topic_length > 65535 {
            return Err("max_topic_length cannot exceed 65535".into());
        }

        if self.max_inflight == 0 {
            return Err("max_inflight must be at least 1".into());
        }

        Ok(())
    }
}
