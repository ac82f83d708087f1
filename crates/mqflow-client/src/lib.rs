//! mqflow-client - Async MQTT 3.1.1 client.
//!
//! The protocol lives in [`mqflow_core::Connection`]; this crate drives it
//! over any `AsyncRead + AsyncWrite` transport with tokio.
//!
//! # Example
//!
//! ```ignore
//! use mqflow_client::{connect_tcp, ClientConfig, Event, QoS};
//!
//! let config = ClientConfig::new("localhost:1883").client_id("my-client");
//! let (client, mut eventloop) = connect_tcp(config).await?;
//!
//! client.subscribe(&[("sensors/#", QoS::AtLeastOnce)]).await?;
//! client.publish("sensors/temp", "25.5", QoS::AtMostOnce, false).await?;
//!
//! while let Ok(event) = eventloop.poll().await {
//!     if let Event::Message(publish) = event {
//!         println!("{}: {:?}", publish.topic, publish.payload);
//!     }
//! }
//! ```

mod client;
mod config;
mod handler;

pub use client::{connect_tcp, AsyncClient, EventLoop};
pub use config::ClientConfig;
pub use handler::MqttHandler;

// Re-export useful types from core
pub use mqflow_core::{Error, Event, Publish, QoS, Result, SubscribeReturnCode, TimeoutKind, Will};
