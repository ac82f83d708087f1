//! mqflow-broker - MQTT 3.1.1 broker.
//!
//! Protocol handling lives in [`mqflow_core::Connection`]; this crate adds
//! what only a broker needs:
//! - [`subscription`]: topic trie matching publishes to sessions
//! - [`retained`]: last retained message per topic
//! - [`session`]: offline persistent sessions behind [`SessionStore`]
//! - [`shared`]: the [`Broker`] state every connection task shares
//! - [`worker`]: the per-connection task
//! - [`server`]: TCP accept loop
//! - [`config`]: TOML + environment configuration

pub mod config;
pub mod retained;
pub mod server;
pub mod session;
pub mod shared;
pub mod subscription;
pub mod will;
pub mod worker;

pub use config::{Config, ConfigError};
pub use server::Server;
pub use session::{MemorySessionStore, Resolved, SessionRecord, SessionStore};
pub use shared::{Broker, ConnectOutcome, Departure};
pub use subscription::SubscriptionRegistry;
pub use worker::serve_connection;
