//! Per-connection task.
//!
//! Each accepted transport gets one task that owns a broker-side
//! [`Connection`]. The task reads from the transport, turns connection
//! events into broker calls, writes deliveries that arrive on its channel,
//! and runs the connection's timers. It holds only a `Weak<Broker>` so a
//! stopped broker does not outlive its connections.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Weak};
use std::time::Instant as StdInstant;

use mqflow_core::topic::validate_topic_limits;
use mqflow_core::{
    Connect, Connection, ConnectionConfig, Error, Event, Publish, QoS, Result, State, Will,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::shared::{Broker, ConnectOutcome, ConnectionHandle, Delivery, Departure};
use crate::will::validate_will;

/// Read chunk size.
const READ_BUFFER_SIZE: usize = 4096;

/// The client this connection serves, once CONNECT was accepted.
struct Session {
    client_id: String,
    clean_session: bool,
    will: Option<Will>,
}

/// Why the connection loop stopped.
enum Exit {
    /// DISCONNECT received, or the CONNECT was refused.
    Graceful,
    /// Another connection took over the client id.
    TakenOver(oneshot::Sender<()>),
    /// The broker gave up waiting for a takeover hand-over.
    Aborted,
    Failed(Error),
}

/// Outcome of one wait in the connection loop.
enum Action {
    Read(io::Result<usize>),
    Delivery(Option<Delivery>),
    Timeout,
}

/// Serve one client connection until it closes.
///
/// Returns what closed the connection: `None` after DISCONNECT or a refused
/// CONNECT, [`Error::DuplicateSession`] when another connection took over
/// the client id, otherwise the transport, protocol or timeout error.
pub async fn serve_connection<T>(broker: Weak<Broker>, transport: T, peer: String) -> Option<Error>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let Some(shared) = broker.upgrade() else {
        return Some(Error::ConnectionClosed);
    };
    let (handle, rx) = shared.register();
    let config = shared.config();
    let conn_config = ConnectionConfig {
        connect_timeout: config.session.connect_timeout(),
        max_packet_size: config.limits.max_packet_size as usize,
        ..Default::default()
    };
    let conn = Connection::broker(conn_config, now());
    drop(shared);

    let mut worker = Worker {
        broker,
        transport,
        conn,
        handle,
        rx,
        session: None,
        overflow: VecDeque::new(),
        peer,
    };
    let abort = worker.handle.clone();
    let exit = tokio::select! {
        exit = worker.run() => exit,
        _ = abort.aborted() => Exit::Aborted,
    };
    worker.finish(exit).await
}

fn now() -> StdInstant {
    Instant::now().into_std()
}

struct Worker<T> {
    broker: Weak<Broker>,
    transport: T,
    conn: Connection,
    handle: ConnectionHandle,
    rx: mpsc::UnboundedReceiver<Delivery>,
    session: Option<Session>,
    /// QoS 1/2 deliveries waiting for a free in-flight slot, oldest first.
    overflow: VecDeque<Publish>,
    peer: String,
}

impl<T> Worker<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn broker(&self) -> Result<Arc<Broker>> {
        self.broker.upgrade().ok_or(Error::ConnectionClosed)
    }

    fn client_id(&self) -> &str {
        self.session
            .as_ref()
            .map_or(self.peer.as_str(), |s| s.client_id.as_str())
    }

    async fn run(&mut self) -> Exit {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            if let Err(e) = self.process_events().await {
                return Exit::Failed(e);
            }
            if let Err(e) = self.flush().await {
                return Exit::Failed(e);
            }
            // Refused CONNECT or received DISCONNECT
            if matches!(self.conn.state(), State::Closing | State::Closed) {
                return Exit::Graceful;
            }

            let deadline = self.conn.next_deadline();
            let accept_deliveries = self.conn.is_established();

            let action = tokio::select! {
                result = self.transport.read(&mut buf) => Action::Read(result),
                delivery = self.rx.recv(), if accept_deliveries => Action::Delivery(delivery),
                _ = sleep_until(deadline) => Action::Timeout,
            };

            let result = match action {
                Action::Read(Ok(0)) => Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "client closed the connection",
                )
                .into()),
                Action::Read(Ok(n)) => {
                    self.conn.feed(&buf[..n]);
                    Ok(())
                }
                Action::Read(Err(e)) => Err(e.into()),
                Action::Delivery(Some(Delivery::Publish(publish))) => self.deliver(publish),
                Action::Delivery(Some(Delivery::Takeover(ack))) => return Exit::TakenOver(ack),
                Action::Delivery(None) => Err(Error::ConnectionClosed),
                Action::Timeout => self.conn.handle_timeout(now()),
            };
            if let Err(e) = result {
                return Exit::Failed(e);
            }
        }
    }

    /// Handle every complete packet buffered in the connection.
    async fn process_events(&mut self) -> Result<()> {
        while let Some(event) = self.conn.next_event(now())? {
            self.handle_event(event).await?;
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::ConnectReceived(connect) => self.handle_connect(connect).await,
            Event::Message(publish) => {
                let broker = self.broker()?;
                let limits = &broker.config().limits;
                validate_topic_limits(&publish.topic, limits.max_topic_length, limits.max_topic_levels)?;
                broker.publish(publish, self.client_id());
                Ok(())
            }
            Event::Published { .. } => self.drain_overflow(),
            Event::SubscribeRequest(subscribe) => {
                let broker = self.broker()?;
                let (codes, retained) = broker.subscribe(self.client_id(), &subscribe.filters);
                log::debug!(
                    "Client {} subscribed to {:?}",
                    self.client_id(),
                    subscribe.filters
                );
                self.conn.suback(subscribe.packet_id, codes, now())?;
                for publish in retained {
                    self.deliver(publish)?;
                }
                Ok(())
            }
            Event::UnsubscribeRequest(unsubscribe) => {
                self.broker()?
                    .unsubscribe(self.client_id(), &unsubscribe.filters);
                self.conn.unsuback(unsubscribe.packet_id, now())
            }
            Event::Disconnected => {
                log::debug!("Client {} sent DISCONNECT", self.client_id());
                if let Some(session) = self.session.as_mut() {
                    // MQTT-3.14.4-3: a clean DISCONNECT discards the will
                    session.will = None;
                }
                Ok(())
            }
            other => {
                log::debug!("Ignoring client-side event {:?}", other);
                Ok(())
            }
        }
    }

    async fn handle_connect(&mut self, connect: Connect) -> Result<()> {
        let broker = self.broker()?;
        let config = broker.config();

        if let Some(will) = &connect.will {
            validate_will(will, config.limits.max_topic_length, config.limits.max_topic_levels)?;
        }

        match broker.connect(&connect, &self.handle).await {
            ConnectOutcome::Accepted {
                client_id,
                session_present,
                inflight,
                queued,
            } => {
                let keep_alive = config.session.effective_keep_alive(connect.keep_alive);
                log::info!(
                    "Client {} connected from {} (keep_alive={}s)",
                    client_id,
                    self.peer,
                    keep_alive
                );
                self.session = Some(Session {
                    client_id,
                    clean_session: connect.clean_session,
                    will: connect.will,
                });
                self.conn.accept(session_present, keep_alive, inflight, now())?;
                self.overflow.extend(queued);
                self.drain_overflow()
            }
            ConnectOutcome::Rejected(code) => {
                log::info!(
                    "Refused connection '{}' from {}: {:?}",
                    connect.client_id,
                    self.peer,
                    code
                );
                self.conn.reject(code, now())
            }
        }
    }

    /// Send a message to the client, or hold it while the in-flight window
    /// is full or identifiers are exhausted.
    fn deliver(&mut self, publish: Publish) -> Result<()> {
        if publish.qos == QoS::AtMostOnce && self.overflow.is_empty() {
            self.conn.deliver(publish, now())?;
            return Ok(());
        }
        self.hold(publish);
        self.drain_overflow()
    }

    fn hold(&mut self, publish: Publish) {
        let max_queued = self
            .broker
            .upgrade()
            .map_or(0, |b| b.config().limits.max_queued);
        while !self.overflow.is_empty() && self.overflow.len() >= max_queued {
            if let Some(dropped) = self.overflow.pop_front() {
                log::warn!(
                    "Client {} queue full, dropping message on {}",
                    self.client_id(),
                    dropped.topic
                );
            }
        }
        self.overflow.push_back(publish);
    }

    /// Move held messages into the in-flight window while it has room.
    fn drain_overflow(&mut self) -> Result<()> {
        let max_inflight = self
            .broker
            .upgrade()
            .map_or(1, |b| usize::from(b.config().limits.max_inflight));

        while let Some(publish) = self.overflow.pop_front() {
            if publish.qos != QoS::AtMostOnce && self.conn.inflight_len() >= max_inflight {
                self.overflow.push_front(publish);
                break;
            }
            match self.conn.deliver(publish.clone(), now()) {
                Ok(_) => {}
                Err(Error::IdentifierExhausted) => {
                    self.overflow.push_front(publish);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if !self.conn.has_outgoing() {
            return Ok(());
        }
        let bytes = self.conn.take_outgoing();
        self.transport.write_all(&bytes).await?;
        self.transport.flush().await?;
        Ok(())
    }

    fn taken_over(&self) -> Error {
        let err = Error::DuplicateSession(self.client_id().to_string());
        log::info!("Closing connection from {}: {}", self.peer, err);
        err
    }

    /// Close the transport and hand the session back to the broker.
    async fn finish(mut self, exit: Exit) -> Option<Error> {
        // An aborted task may be stuck on a write; the transport is dropped
        // without touching it again
        let aborted = matches!(exit, Exit::Aborted);
        let (graceful, ack, cause) = match exit {
            Exit::Graceful => (true, None, None),
            // The will is not published on takeover
            Exit::TakenOver(ack) => (true, Some(ack), Some(self.taken_over())),
            Exit::Aborted => (true, None, Some(self.taken_over())),
            Exit::Failed(e) => {
                match &e {
                    Error::TransportFailure(io) if io.kind() == io::ErrorKind::UnexpectedEof => {
                        log::debug!("Client {} closed the connection", self.client_id())
                    }
                    _ => log::warn!("Client {} connection failed: {}", self.client_id(), e),
                }
                (false, None, Some(e))
            }
        };

        if !aborted {
            // Anything already encoded, such as a refusal CONNACK, still goes out
            let _ = self.flush().await;
            let _ = self.transport.shutdown().await;
        }
        self.conn.mark_closed();

        if let Some(session) = self.session.take() {
            let mut queued: Vec<Publish> = self.overflow.drain(..).collect();
            let mut late_acks = Vec::new();
            // Deliveries routed here before the broker saw us leave
            while let Ok(delivery) = self.rx.try_recv() {
                match delivery {
                    Delivery::Publish(publish) => queued.push(publish),
                    Delivery::Takeover(ack) => late_acks.push(ack),
                }
            }

            if let Some(broker) = self.broker.upgrade() {
                broker.disconnect(Departure {
                    client_id: session.client_id,
                    connection_id: self.handle.connection_id,
                    clean_session: session.clean_session,
                    graceful,
                    will: session.will,
                    inflight: self.conn.take_inflight(),
                    queued,
                });
            }
            for ack in late_acks {
                let _ = ack.send(());
            }
        }

        if let Some(ack) = ack {
            let _ = ack.send(());
        }
        cause
    }
}

async fn sleep_until(deadline: Option<StdInstant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}
