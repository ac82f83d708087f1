//! Async MQTT client.
//!
//! [`AsyncClient`] is a cloneable handle that sends requests over a channel.
//! [`EventLoop`] owns the transport and the protocol state and must be
//! polled for anything to happen:
//!
//! ```ignore
//! let (client, mut eventloop) = connect_tcp(ClientConfig::new("localhost:1883")).await?;
//!
//! tokio::spawn(async move {
//!     client.subscribe(&[("sensors/#", QoS::AtLeastOnce)]).await?;
//!     client.publish("sensors/temp", "25.5", QoS::AtMostOnce, false).await
//! });
//!
//! loop {
//!     match eventloop.poll().await? {
//!         Event::Message(publish) => println!("{}: {:?}", publish.topic, publish.payload),
//!         Event::Disconnected => break,
//!         _ => {}
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::io;
use std::ops::ControlFlow;
use std::time::Instant as StdInstant;

use bytes::Bytes;
use mqflow_core::{
    Connection, Error, Event, QoS, Result, State, SubscribeReturnCode, TimeoutKind,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::config::ClientConfig;
use crate::handler::MqttHandler;

/// Read chunk size.
const READ_BUFFER_SIZE: usize = 4096;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Requests sent from AsyncClient to EventLoop.
enum Command {
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        resp: Reply<Option<u16>>,
        done: Option<Reply<()>>,
    },
    Subscribe {
        filters: Vec<(String, QoS)>,
        resp: Reply<u16>,
        done: Option<Reply<Vec<SubscribeReturnCode>>>,
    },
    Unsubscribe {
        filters: Vec<String>,
        resp: Reply<u16>,
        done: Option<Reply<()>>,
    },
    Disconnect {
        resp: Reply<()>,
    },
    Close,
}

/// Caller waiting for the acknowledgment of a packet identifier.
enum Waiter {
    Published(Reply<()>),
    Subscribed(Reply<Vec<SubscribeReturnCode>>),
    Unsubscribed(Reply<()>),
}

/// Async MQTT client handle.
///
/// `Clone` and shareable across tasks. Requests are queued to the
/// [`EventLoop`] and only processed once the connection is established.
#[derive(Clone)]
pub struct AsyncClient {
    tx: mpsc::Sender<Command>,
}

impl AsyncClient {
    /// Create a client and event loop pair over an already open transport.
    pub fn new<T>(config: ClientConfig, transport: T) -> (Self, EventLoop<T>)
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let (tx, rx) = mpsc::channel(config.request_capacity.max(1));
        (Self { tx }, EventLoop::new(config, transport, rx))
    }

    async fn request<R>(&self, build: impl FnOnce(Reply<R>) -> Command) -> Result<R> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(build(resp_tx))
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        resp_rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Publish a message.
    ///
    /// Returns the packet ID for QoS > 0, or None for QoS 0, once the
    /// packet is queued for sending.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<Option<u16>> {
        let payload = payload.into();
        self.request(|resp| Command::Publish {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
            resp,
            done: None,
        })
        .await
    }

    /// Publish a message and wait until its handshake completes.
    ///
    /// QoS 0 completes as soon as the packet is queued.
    pub async fn publish_wait(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        let payload = payload.into();
        let (done_tx, done_rx) = oneshot::channel();
        self.request(|resp| Command::Publish {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
            resp,
            done: Some(done_tx),
        })
        .await?;
        done_rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Subscribe to topics in one SUBSCRIBE. Returns the packet ID.
    pub async fn subscribe(&self, topics: &[(&str, QoS)]) -> Result<u16> {
        let filters = to_filters(topics);
        self.request(|resp| Command::Subscribe {
            filters,
            resp,
            done: None,
        })
        .await
    }

    /// Subscribe and wait for SUBACK; returns one result per filter.
    pub async fn subscribe_wait(&self, topics: &[(&str, QoS)]) -> Result<Vec<SubscribeReturnCode>> {
        let filters = to_filters(topics);
        let (done_tx, done_rx) = oneshot::channel();
        self.request(|resp| Command::Subscribe {
            filters,
            resp,
            done: Some(done_tx),
        })
        .await?;
        done_rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Unsubscribe from topics in one UNSUBSCRIBE. Returns the packet ID.
    pub async fn unsubscribe(&self, topics: &[&str]) -> Result<u16> {
        let filters = topics.iter().map(|t| t.to_string()).collect();
        self.request(|resp| Command::Unsubscribe {
            filters,
            resp,
            done: None,
        })
        .await
    }

    /// Unsubscribe and wait for UNSUBACK.
    pub async fn unsubscribe_wait(&self, topics: &[&str]) -> Result<()> {
        let filters = topics.iter().map(|t| t.to_string()).collect();
        let (done_tx, done_rx) = oneshot::channel();
        self.request(|resp| Command::Unsubscribe {
            filters,
            resp,
            done: Some(done_tx),
        })
        .await?;
        done_rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Send DISCONNECT and close the transport.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|resp| Command::Disconnect { resp }).await
    }

    /// Drop the connection immediately, discarding unsent packets.
    pub async fn close(&self) {
        let _ = self.tx.send(Command::Close).await;
    }
}

fn to_filters(topics: &[(&str, QoS)]) -> Vec<(String, QoS)> {
    topics.iter().map(|(t, q)| (t.to_string(), *q)).collect()
}

/// Open a TCP connection to `config.address` and build a client pair.
pub async fn connect_tcp(config: ClientConfig) -> Result<(AsyncClient, EventLoop<TcpStream>)> {
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&config.address))
        .await
        .map_err(|_| Error::Timeout(TimeoutKind::Handshake))??;
    stream.set_nodelay(true)?;
    Ok(AsyncClient::new(config, stream))
}

/// Outcome of one wait in the poll loop.
enum Action {
    Read(io::Result<usize>),
    Command(Option<Command>),
    Timeout,
}

/// The event loop that drives MQTT I/O for one client.
///
/// Call [`poll`](Self::poll) repeatedly, or hand it a handler with
/// [`run`](Self::run). The first poll performs the CONNECT/CONNACK exchange.
pub struct EventLoop<T> {
    config: ClientConfig,
    transport: Option<T>,
    conn: Connection,
    rx: mpsc::Receiver<Command>,
    waiters: HashMap<u16, Waiter>,
}

impl<T> EventLoop<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn new(config: ClientConfig, transport: T, rx: mpsc::Receiver<Command>) -> Self {
        let conn = Connection::client(config.connection_config());
        Self {
            config,
            transport: Some(transport),
            conn,
            rx,
            waiters: HashMap::new(),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> State {
        self.conn.state()
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_established()
    }

    /// Continue the session over a new transport after the previous one
    /// closed.
    ///
    /// With clean session off, unacknowledged packets are resent with dup
    /// set once the broker accepts the new connection, and callers waiting
    /// on them keep waiting.
    pub fn reconnect(&mut self, transport: T) -> Result<()> {
        if self.conn.state() != State::Closed {
            return Err(Error::InvalidRequest(
                "reconnect requires a closed connection".into(),
            ));
        }
        let inflight = self.conn.take_inflight();
        let mut conn = Connection::client(self.config.connection_config());
        if !self.config.clean_session {
            conn.restore_inflight(inflight)?;
        } else {
            self.waiters.clear();
        }
        self.conn = conn;
        self.transport = Some(transport);
        Ok(())
    }

    /// Poll for the next event.
    ///
    /// Returns `Event::Disconnected` after a local `disconnect`; any error
    /// means the connection is gone. Polling a closed loop yields
    /// `Error::ConnectionClosed`.
    pub async fn poll(&mut self) -> Result<Event> {
        let now = Instant::now().into_std();
        match self.conn.state() {
            State::Closed => return Err(Error::ConnectionClosed),
            State::Idle => {
                log::debug!("Connecting as '{}'", self.config.client_id);
                let connect = self.config.connect_packet();
                if let Err(e) = self.conn.connect(connect, now) {
                    return Err(self.fail(e));
                }
            }
            _ => {}
        }

        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            if let Err(e) = self.flush().await {
                return Err(self.fail(e));
            }

            match self.conn.next_event(Instant::now().into_std()) {
                Ok(Some(event)) => {
                    self.resolve_waiter(&event);
                    return Ok(event);
                }
                Ok(None) => {}
                Err(e) => return Err(self.fail(e)),
            }

            let deadline = self.conn.next_deadline();
            let accept_commands = self.conn.is_established();
            let Some(transport) = self.transport.as_mut() else {
                return Err(self.fail(Error::ConnectionClosed));
            };

            let action = tokio::select! {
                result = transport.read(&mut buf) => Action::Read(result),
                cmd = self.rx.recv(), if accept_commands => Action::Command(cmd),
                _ = sleep_until(deadline) => Action::Timeout,
            };

            match action {
                Action::Read(Ok(0)) => {
                    let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "broker closed the connection");
                    return Err(self.fail(eof.into()));
                }
                Action::Read(Ok(n)) => self.conn.feed(&buf[..n]),
                Action::Read(Err(e)) => return Err(self.fail(e.into())),
                Action::Command(Some(cmd)) => {
                    if let Some(result) = self.handle_command(cmd).await {
                        return result;
                    }
                }
                Action::Command(None) => {
                    // Every AsyncClient is gone
                    return self.shutdown_gracefully().await;
                }
                Action::Timeout => {
                    if let Err(e) = self.conn.handle_timeout(Instant::now().into_std()) {
                        return Err(self.fail(e));
                    }
                }
            }
        }
    }

    /// Drive the connection, dispatching events to `handler` until it
    /// closes or a handler returns `Break`.
    pub async fn run<H: MqttHandler>(&mut self, handler: &mut H) -> Result<()> {
        loop {
            let event = match self.poll().await {
                Ok(event) => event,
                Err(e) => {
                    handler.on_error(&e);
                    handler.on_disconnect(Some(&e));
                    return Err(e);
                }
            };

            let flow = match &event {
                Event::Connected { session_present } => handler.on_connect(*session_present),
                Event::Message(publish) => handler.on_message(publish),
                Event::Published { packet_id } => handler.on_published(*packet_id),
                Event::Subscribed {
                    packet_id,
                    return_codes,
                } => handler.on_subscribed(*packet_id, return_codes),
                Event::Unsubscribed { packet_id } => handler.on_unsubscribed(*packet_id),
                Event::Disconnected => {
                    handler.on_disconnect(None);
                    return Ok(());
                }
                other => {
                    log::debug!("Ignoring broker-side event {:?}", other);
                    ControlFlow::Continue(())
                }
            };

            if flow.is_break() {
                log::debug!("Handler requested stop");
                // Acks for the current packet still go out
                if let Err(e) = self.flush().await {
                    log::debug!("Flush before stop failed: {}", e);
                }
                self.close_transport().await;
                handler.on_disconnect(None);
                return Ok(());
            }
        }
    }

    /// Returns `Some` when the command ended the connection.
    async fn handle_command(&mut self, cmd: Command) -> Option<Result<Event>> {
        let now = Instant::now().into_std();
        match cmd {
            Command::Publish {
                topic,
                payload,
                qos,
                retain,
                resp,
                done,
            } => match self.conn.publish(&topic, payload, qos, retain, now) {
                Ok(Some(packet_id)) => {
                    if let Some(done) = done {
                        self.waiters.insert(packet_id, Waiter::Published(done));
                    }
                    let _ = resp.send(Ok(Some(packet_id)));
                }
                Ok(None) => {
                    if let Some(done) = done {
                        let _ = done.send(Ok(()));
                    }
                    let _ = resp.send(Ok(None));
                }
                Err(e) => {
                    let _ = resp.send(Err(e));
                }
            },
            Command::Subscribe {
                filters,
                resp,
                done,
            } => match self.conn.subscribe(filters, now) {
                Ok(packet_id) => {
                    if let Some(done) = done {
                        self.waiters.insert(packet_id, Waiter::Subscribed(done));
                    }
                    let _ = resp.send(Ok(packet_id));
                }
                Err(e) => {
                    let _ = resp.send(Err(e));
                }
            },
            Command::Unsubscribe {
                filters,
                resp,
                done,
            } => match self.conn.unsubscribe(filters, now) {
                Ok(packet_id) => {
                    if let Some(done) = done {
                        self.waiters.insert(packet_id, Waiter::Unsubscribed(done));
                    }
                    let _ = resp.send(Ok(packet_id));
                }
                Err(e) => {
                    let _ = resp.send(Err(e));
                }
            },
            Command::Disconnect { resp } => {
                let result = self.shutdown_gracefully().await;
                let _ = resp.send(Ok(()));
                return Some(result);
            }
            Command::Close => {
                log::debug!("Connection closed by request");
                self.conn.abort();
                self.transport = None;
                self.waiters.clear();
                return Some(Err(Error::ConnectionClosed));
            }
        }
        None
    }

    async fn shutdown_gracefully(&mut self) -> Result<Event> {
        if let Err(e) = self.conn.disconnect(Instant::now().into_std()) {
            return Err(self.fail(e));
        }
        if let Err(e) = self.flush().await {
            return Err(self.fail(e));
        }
        self.close_transport().await;
        log::debug!("Disconnected from broker");
        Ok(Event::Disconnected)
    }

    async fn flush(&mut self) -> Result<()> {
        if !self.conn.has_outgoing() {
            return Ok(());
        }
        let bytes = self.conn.take_outgoing();
        let transport = self.transport.as_mut().ok_or(Error::ConnectionClosed)?;
        transport.write_all(&bytes).await?;
        transport.flush().await?;
        Ok(())
    }

    async fn close_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            let _ = transport.shutdown().await;
        }
        self.conn.mark_closed();
        if self.config.clean_session {
            self.waiters.clear();
        }
    }

    /// Close after a fatal error, keeping the error for the caller.
    fn fail(&mut self, err: Error) -> Error {
        if !err.is_fatal() {
            return err;
        }
        log::warn!("Connection '{}' failed: {}", self.config.client_id, err);
        self.conn.abort();
        self.transport = None;
        if self.config.clean_session {
            self.waiters.clear();
        }
        err
    }

    fn resolve_waiter(&mut self, event: &Event) {
        match event {
            Event::Published { packet_id } => {
                if let Some(Waiter::Published(tx)) = self.waiters.remove(packet_id) {
                    let _ = tx.send(Ok(()));
                }
            }
            Event::Subscribed {
                packet_id,
                return_codes,
            } => {
                if let Some(Waiter::Subscribed(tx)) = self.waiters.remove(packet_id) {
                    let _ = tx.send(Ok(return_codes.clone()));
                }
            }
            Event::Unsubscribed { packet_id } => {
                if let Some(Waiter::Unsubscribed(tx)) = self.waiters.remove(packet_id) {
                    let _ = tx.send(Ok(()));
                }
            }
            _ => {}
        }
    }
}

async fn sleep_until(deadline: Option<StdInstant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}
