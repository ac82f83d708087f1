//! Error types for mqflow.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::packet::{ConnackCode, PacketType};

/// Connection-level error.
///
/// Every variant except [`Error::IdentifierExhausted`], [`Error::NotConnected`]
/// and [`Error::InvalidRequest`] ends the connection it was raised on.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed packet: {0}")]
    MalformedPacket(ProtocolError),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("No free packet identifier")]
    IdentifierExhausted,

    #[error("Transport failure: {0}")]
    TransportFailure(#[from] io::Error),

    #[error("Timeout: {0}")]
    Timeout(TimeoutKind),

    #[error("Session {0} was taken over by a new connection")]
    DuplicateSession(String),

    #[error("Connection refused: {0:?}")]
    ConnectionRefused(ConnackCode),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed")]
    ConnectionClosed,
}

impl Error {
    /// Whether the error forces the owning connection to close.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::IdentifierExhausted | Error::NotConnected | Error::InvalidRequest(_)
        )
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Violation(msg) => Error::ProtocolViolation(msg),
            other => Error::MalformedPacket(other),
        }
    }
}

/// Which timer expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// CONNECT/CONNACK exchange did not finish in time.
    Handshake,
    /// Peer sent nothing for 1.5x the keep-alive interval.
    KeepAlive,
    /// No PINGRESP within the grace period.
    PingResponse,
    /// An in-flight exchange was not acknowledged in time.
    Operation,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeoutKind::Handshake => "connect handshake",
            TimeoutKind::KeepAlive => "keep-alive",
            TimeoutKind::PingResponse => "ping response",
            TimeoutKind::Operation => "operation",
        };
        f.write_str(s)
    }
}

/// Codec-level errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed remaining length")]
    MalformedLength,

    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Invalid fixed header flags for {packet_type:?}: {flags:#04x}")]
    InvalidFlags { packet_type: PacketType, flags: u8 },

    #[error("Invalid QoS: {0}")]
    InvalidQos(u8),

    #[error("Invalid UTF-8 string")]
    InvalidUtf8,

    #[error("Invalid protocol name: '{0}'")]
    InvalidProtocolName(String),

    #[error("Unsupported protocol level: {0}")]
    UnsupportedProtocolLevel(u8),

    #[error("Invalid connect flags: {0:#04x}")]
    InvalidConnectFlags(u8),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("{0}")]
    Violation(String),

    #[error("Packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Topic too long: {len} bytes (max {max})")]
    TopicTooLong { len: usize, max: usize },

    #[error("Topic too deep: {levels} levels (max {max})")]
    TopicTooDeep { levels: usize, max: usize },

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),
}

pub type Result<T> = std::result::Result<T, Error>;
