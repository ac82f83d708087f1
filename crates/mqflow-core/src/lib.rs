//! mqflow-core - MQTT 3.1.1 protocol engine.
//!
//! This crate holds everything that is shared between the client and the
//! broker and does not touch a socket:
//! - [`packet`]: streaming codec for the fourteen MQTT control packets
//! - [`topic`]: topic name/filter validation and wildcard matching
//! - [`tracker`]: packet identifier allocation and QoS handshake tracking
//! - [`connection`]: the per-connection state machine (sans-IO)

pub mod connection;
pub mod error;
pub mod packet;
pub mod topic;
pub mod tracker;
pub mod varint;

pub use connection::{Connection, ConnectionConfig, Event, InFlightState, Role, State};
pub use error::{Error, ProtocolError, Result, TimeoutKind};
pub use packet::*;
pub use tracker::{AckKind, Advance, InFlight, PacketIdTracker, Stage, TrackError};
