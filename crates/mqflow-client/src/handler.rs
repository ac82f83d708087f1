//! Callback-style event handling.
//!
//! Implement [`MqttHandler`] and pass it to [`EventLoop::run`](crate::EventLoop::run).

use std::ops::ControlFlow;

use mqflow_core::{Error, Publish, SubscribeReturnCode};

/// Handler trait for MQTT events.
///
/// All methods have default implementations that do nothing. Returning
/// `ControlFlow::Break(())` tears the connection down once the current
/// packet has been answered.
pub trait MqttHandler {
    /// Called when the broker accepted the connection.
    ///
    /// # Arguments
    /// * `session_present` - Whether a previous session was restored
    #[allow(unused_variables)]
    fn on_connect(&mut self, session_present: bool) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    /// Called when a message is received.
    #[allow(unused_variables)]
    fn on_message(&mut self, publish: &Publish) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    /// Called when a QoS 1/2 publish has completed its handshake.
    #[allow(unused_variables)]
    fn on_published(&mut self, packet_id: u16) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    /// Called when a subscribe request has been acknowledged.
    ///
    /// # Arguments
    /// * `packet_id` - The packet identifier of the subscribe request
    /// * `return_codes` - One result per requested filter, in request order
    #[allow(unused_variables)]
    fn on_subscribed(&mut self, packet_id: u16, return_codes: &[SubscribeReturnCode]) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    /// Called when an unsubscribe request has been acknowledged.
    #[allow(unused_variables)]
    fn on_unsubscribed(&mut self, packet_id: u16) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    /// Called once when the connection ends.
    ///
    /// # Arguments
    /// * `error` - The cause, or `None` for a local disconnect or stop
    #[allow(unused_variables)]
    fn on_disconnect(&mut self, error: Option<&Error>) {}

    /// Called when an error ends the connection, before `on_disconnect`.
    #[allow(unused_variables)]
    fn on_error(&mut self, error: &Error) {}
}
