//! Client configuration types.

use std::time::Duration;

use mqflow_core::{Connect, ConnectionConfig, Will};

/// Default request channel capacity.
const DEFAULT_REQUEST_CAPACITY: usize = 16;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Remote broker address (host:port), used by `connect_tcp`.
    pub address: String,
    /// Client identifier (empty asks the broker to assign one).
    pub client_id: String,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password for authentication.
    pub password: Option<Vec<u8>>,
    /// Keep-alive interval in seconds (0 = disabled).
    pub keep_alive: u16,
    /// Clean session flag.
    pub clean_session: bool,
    /// Will message published by the broker on abnormal disconnect.
    pub will: Option<Will>,
    /// Bound on TCP connect plus the CONNECT/CONNACK exchange.
    pub connect_timeout: Duration,
    /// How long to wait for PINGRESP.
    pub ping_grace: Duration,
    /// Bound on any unacknowledged publish/subscribe/unsubscribe.
    pub operation_timeout: Option<Duration>,
    /// Largest accepted inbound packet (0 = unlimited).
    pub max_packet_size: usize,
    /// Capacity of the request channel between `AsyncClient` and `EventLoop`.
    pub request_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "localhost:1883".to_string(),
            client_id: String::new(),
            username: None,
            password: None,
            keep_alive: 60,
            clean_session: true,
            will: None,
            connect_timeout: Duration::from_secs(10),
            ping_grace: Duration::from_secs(10),
            operation_timeout: None,
            max_packet_size: 0,
            request_capacity: DEFAULT_REQUEST_CAPACITY,
        }
    }
}

impl ClientConfig {
    /// Create a new config with the given address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Set the client ID.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    /// Set username and password.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set keep-alive interval in seconds.
    pub fn keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set clean session flag.
    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    /// Set the will message.
    pub fn will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    /// Set connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set how long to wait for PINGRESP.
    pub fn ping_grace(mut self, grace: Duration) -> Self {
        self.ping_grace = grace;
        self
    }

    /// Fail the connection when an acknowledgment takes longer than `timeout`.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Set the largest accepted inbound packet.
    pub fn max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Set the request channel capacity.
    pub fn request_capacity(mut self, capacity: usize) -> Self {
        self.request_capacity = capacity.max(1);
        self
    }

    pub(crate) fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: self.connect_timeout,
            ping_grace: self.ping_grace,
            operation_timeout: self.operation_timeout,
            max_packet_size: self.max_packet_size,
        }
    }

    pub(crate) fn connect_packet(&self) -> Connect {
        Connect {
            will: self.will.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            ..Connect::new(self.client_id.clone(), self.keep_alive, self.clean_session)
        }
    }
}
