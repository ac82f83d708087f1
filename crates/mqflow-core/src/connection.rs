//! Sans-IO MQTT connection state machine.
//!
//! A [`Connection`] never touches a socket or a clock. The driver feeds it
//! bytes read from the transport with [`Connection::feed`], pulls protocol
//! events with [`Connection::next_event`], writes whatever
//! [`Connection::take_outgoing`] returns, and calls
//! [`Connection::handle_timeout`] once [`Connection::next_deadline`] passes.
//!
//! States: `Idle -> AwaitingConnack (client) / AwaitingConnect (broker) ->
//! Established -> Closing -> Closed`. Every fatal error moves the machine to
//! `Closing`; nothing leaves `Closed`.

use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, ProtocolError, Result, TimeoutKind};
use crate::packet::{
    decode_packet, encode_packet, Connack, ConnackCode, Connect, Packet, Publish, QoS, Suback,
    Subscribe, SubscribeReturnCode, Unsubscribe,
};
use crate::topic::{validate_topic_filter, validate_topic_name};
use crate::tracker::{AckKind, Advance, InFlight, PacketIdTracker, Stage};

/// Which end of the connection this machine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Broker,
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    AwaitingConnack,
    AwaitingConnect,
    Established,
    Closing,
    Closed,
}

/// Timing and size limits for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bound on the CONNECT/CONNACK exchange.
    pub connect_timeout: Duration,
    /// How long a client waits for PINGRESP.
    pub ping_grace: Duration,
    /// Bound on the age of any outbound in-flight entry.
    pub operation_timeout: Option<Duration>,
    /// Largest accepted inbound packet in bytes (0 = unlimited).
    pub max_packet_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            ping_grace: Duration::from_secs(10),
            operation_timeout: None,
            max_packet_size: 0,
        }
    }
}

/// Something the application or broker must act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Broker: a CONNECT arrived; answer with `accept` or `reject`.
    ConnectReceived(Connect),
    /// Client: the broker accepted the connection.
    Connected { session_present: bool },
    /// An application message arrived.
    Message(Publish),
    /// An outbound QoS 1/2 publish finished its handshake.
    Published { packet_id: u16 },
    /// Client: a SUBSCRIBE was acknowledged.
    Subscribed {
        packet_id: u16,
        return_codes: Vec<SubscribeReturnCode>,
    },
    /// Client: an UNSUBSCRIBE was acknowledged.
    Unsubscribed { packet_id: u16 },
    /// Broker: the client asks to subscribe; answer with `suback`.
    SubscribeRequest(Subscribe),
    /// Broker: the client asks to unsubscribe; answer with `unsuback`.
    UnsubscribeRequest(Unsubscribe),
    /// Broker: the client sent DISCONNECT.
    Disconnected,
}

/// In-flight tables carried across a reconnect of a persistent session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InFlightState {
    /// Exchanges this side started, in send order.
    pub outbound: Vec<InFlight>,
    /// Peer QoS 2 publishes waiting for PUBREL.
    pub inbound: Vec<InFlight>,
}

impl InFlightState {
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.inbound.is_empty()
    }
}

/// One MQTT session over one transport.
#[derive(Debug)]
pub struct Connection {
    role: Role,
    state: State,
    config: ConnectionConfig,
    read_buf: BytesMut,
    outgoing: Vec<u8>,
    /// Exchanges this side started.
    outbound: PacketIdTracker,
    /// Exchanges the peer started that need more than one reply.
    inbound: PacketIdTracker,
    keep_alive: Option<Duration>,
    /// Client only: resend in-flight work once CONNACK arrives.
    resume_session: bool,
    last_sent: Instant,
    last_received: Instant,
    ping_sent: Option<Instant>,
    handshake_deadline: Option<Instant>,
}

impl Connection {
    /// A client connection in `Idle`; call [`connect`](Self::connect) next.
    pub fn client(config: ConnectionConfig) -> Self {
        Self::new(Role::Client, config, Instant::now())
    }

    /// A broker connection for a freshly accepted transport.
    ///
    /// The handshake timer starts at `now`.
    pub fn broker(config: ConnectionConfig, now: Instant) -> Self {
        let mut conn = Self::new(Role::Broker, config, now);
        conn.handshake_deadline = Some(now + conn.config.connect_timeout);
        conn
    }

    fn new(role: Role, config: ConnectionConfig, now: Instant) -> Self {
        Self {
            role,
            state: State::Idle,
            config,
            read_buf: BytesMut::with_capacity(4096),
            outgoing: Vec::new(),
            outbound: PacketIdTracker::new(),
            inbound: PacketIdTracker::new(),
            keep_alive: None,
            resume_session: false,
            last_sent: now,
            last_received: now,
            ping_sent: None,
            handshake_deadline: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == State::Established
    }

    /// Negotiated keep-alive, `None` when disabled.
    pub fn keep_alive(&self) -> Option<Duration> {
        self.keep_alive
    }

    /// Number of outbound exchanges waiting for acknowledgment.
    pub fn inflight_len(&self) -> usize {
        self.outbound.len()
    }

    // === I/O surface ===

    /// Append bytes read from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        if matches!(self.state, State::Closing | State::Closed) {
            return;
        }
        self.read_buf.extend_from_slice(data);
    }

    /// Bytes waiting to be written to the transport.
    pub fn take_outgoing(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outgoing)
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Process at most one buffered packet.
    ///
    /// Returns `Ok(None)` when no complete packet is buffered, when the
    /// machine is closing, or while a broker waits for `accept`/`reject`.
    /// Errors are fatal unless [`Error::is_fatal`] says otherwise.
    pub fn next_event(&mut self, now: Instant) -> Result<Option<Event>> {
        loop {
            match self.state {
                State::Closing | State::Closed => return Ok(None),
                State::AwaitingConnect => return Ok(None),
                _ => {}
            }

            let (packet, consumed) = match decode_packet(&self.read_buf, self.config.max_packet_size) {
                Ok(Some(decoded)) => decoded,
                Ok(None) => return Ok(None),
                Err(e) => return Err(self.decode_failed(e, now)),
            };
            self.read_buf.advance(consumed);
            self.last_received = now;

            log::trace!("{:?} received {:?}", self.role, packet.packet_type());

            match self.handle_packet(packet, now) {
                Ok(Some(event)) => return Ok(Some(event)),
                Ok(None) => continue,
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    /// Earliest instant at which [`handle_timeout`](Self::handle_timeout)
    /// has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        if matches!(self.state, State::Closing | State::Closed) {
            return None;
        }

        let mut deadline = self.handshake_deadline;
        let mut consider = |at: Instant| {
            deadline = Some(deadline.map_or(at, |d| d.min(at)));
        };

        if self.state == State::Established {
            if let Some(ka) = self.keep_alive {
                match (self.role, self.ping_sent) {
                    (Role::Client, Some(sent)) => consider(sent + self.config.ping_grace),
                    (Role::Client, None) => consider(self.last_sent + ka),
                    (Role::Broker, _) => consider(self.last_received + ka * 3 / 2),
                }
            }
            if let (Some(limit), Some(oldest)) =
                (self.config.operation_timeout, self.outbound.oldest_sent_at())
            {
                consider(oldest + limit);
            }
        }

        deadline
    }

    /// Run timers due at `now`: ping, keep-alive, handshake and operation
    /// timeouts.
    pub fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        if matches!(self.state, State::Closing | State::Closed) {
            return Ok(());
        }

        if let Some(deadline) = self.handshake_deadline {
            if now >= deadline {
                return Err(self.fail(Error::Timeout(TimeoutKind::Handshake)));
            }
        }

        if self.state != State::Established {
            return Ok(());
        }

        if let Some(ka) = self.keep_alive {
            match self.role {
                Role::Client => match self.ping_sent {
                    Some(sent) if now >= sent + self.config.ping_grace => {
                        return Err(self.fail(Error::Timeout(TimeoutKind::PingResponse)));
                    }
                    Some(_) => {}
                    None if now >= self.last_sent + ka => {
                        self.send(&Packet::Pingreq, now)?;
                        self.ping_sent = Some(now);
                    }
                    None => {}
                },
                Role::Broker => {
                    if now >= self.last_received + ka * 3 / 2 {
                        return Err(self.fail(Error::Timeout(TimeoutKind::KeepAlive)));
                    }
                }
            }
        }

        if let (Some(limit), Some(oldest)) =
            (self.config.operation_timeout, self.outbound.oldest_sent_at())
        {
            if now >= oldest + limit {
                return Err(self.fail(Error::Timeout(TimeoutKind::Operation)));
            }
        }

        Ok(())
    }

    /// Drop unsent output and close immediately.
    pub fn abort(&mut self) {
        self.outgoing.clear();
        self.read_buf.clear();
        self.state = State::Closed;
    }

    /// The driver flushed the final bytes and closed the transport.
    pub fn mark_closed(&mut self) {
        self.state = State::Closed;
    }

    /// Remove both in-flight tables, in send order, for a later reconnect.
    pub fn take_inflight(&mut self) -> InFlightState {
        InFlightState {
            outbound: self.outbound.drain_pending(),
            inbound: self.inbound.drain_pending(),
        }
    }

    /// Load in-flight tables from an earlier connection of the same session.
    ///
    /// Client only, before [`connect`](Self::connect).
    pub fn restore_inflight(&mut self, state: InFlightState) -> Result<()> {
        if self.role != Role::Client || self.state != State::Idle {
            return Err(Error::InvalidRequest(
                "in-flight state can only be restored before connecting".into(),
            ));
        }
        self.restore(state)
    }

    fn restore(&mut self, state: InFlightState) -> Result<()> {
        self.outbound.restore(state.outbound)?;
        self.inbound.restore(state.inbound)?;
        Ok(())
    }

    // === Client requests ===

    /// Send CONNECT and wait for CONNACK.
    pub fn connect(&mut self, connect: Connect, now: Instant) -> Result<()> {
        if self.role != Role::Client {
            return Err(Error::InvalidRequest("only clients send CONNECT".into()));
        }
        if self.state != State::Idle {
            return Err(Error::InvalidRequest(format!(
                "cannot connect in state {:?}",
                self.state
            )));
        }

        if connect.clean_session {
            self.outbound.clear();
            self.inbound.clear();
        }
        self.resume_session = !connect.clean_session;
        self.keep_alive = keep_alive_duration(connect.keep_alive);

        self.send(&Packet::Connect(connect), now)?;
        self.state = State::AwaitingConnack;
        self.handshake_deadline = Some(now + self.config.connect_timeout);
        Ok(())
    }

    /// Publish an application message. Returns the packet identifier for
    /// QoS 1 and 2.
    pub fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        now: Instant,
    ) -> Result<Option<u16>> {
        self.send_publish(Publish::new(topic, payload, qos, retain), now)
    }

    /// Broker: forward a message to this subscriber.
    ///
    /// Any packet identifier on `publish` is replaced by one from this
    /// connection's own identifier space.
    pub fn deliver(&mut self, publish: Publish, now: Instant) -> Result<Option<u16>> {
        self.send_publish(publish, now)
    }

    fn send_publish(&mut self, mut publish: Publish, now: Instant) -> Result<Option<u16>> {
        self.require_established()?;
        validate_topic_name(&publish.topic).map_err(|e| Error::InvalidRequest(e.to_string()))?;

        publish.dup = false;
        if publish.qos == QoS::AtMostOnce {
            publish.packet_id = None;
            self.send(&Packet::Publish(publish), now)?;
            return Ok(None);
        }

        let packet_id = self.outbound.allocate()?;
        publish.packet_id = Some(packet_id);
        let packet = Packet::Publish(publish);
        if let Err(e) = self.send(&packet, now) {
            self.outbound.release(packet_id);
            return Err(e);
        }
        self.outbound.register(packet_id, packet, now)?;
        Ok(Some(packet_id))
    }

    /// Subscribe to one or more filters in a single SUBSCRIBE.
    pub fn subscribe(&mut self, filters: Vec<(String, QoS)>, now: Instant) -> Result<u16> {
        self.require_client_request()?;
        if filters.is_empty() {
            return Err(Error::InvalidRequest("no topic filters".into()));
        }
        for (filter, _) in &filters {
            validate_topic_filter(filter).map_err(|e| Error::InvalidRequest(e.to_string()))?;
        }

        let packet_id = self.outbound.allocate()?;
        let packet = Packet::Subscribe(Subscribe { packet_id, filters });
        self.send_tracked(packet_id, packet, now)?;
        Ok(packet_id)
    }

    /// Unsubscribe from one or more filters in a single UNSUBSCRIBE.
    pub fn unsubscribe(&mut self, filters: Vec<String>, now: Instant) -> Result<u16> {
        self.require_client_request()?;
        if filters.is_empty() {
            return Err(Error::InvalidRequest("no topic filters".into()));
        }
        for filter in &filters {
            validate_topic_filter(filter).map_err(|e| Error::InvalidRequest(e.to_string()))?;
        }

        let packet_id = self.outbound.allocate()?;
        let packet = Packet::Unsubscribe(Unsubscribe { packet_id, filters });
        self.send_tracked(packet_id, packet, now)?;
        Ok(packet_id)
    }

    /// Client: send DISCONNECT and start closing.
    pub fn disconnect(&mut self, now: Instant) -> Result<()> {
        if self.role != Role::Client {
            return Err(Error::InvalidRequest("only clients send DISCONNECT".into()));
        }
        if self.state == State::Established {
            self.send(&Packet::Disconnect, now)?;
        }
        if self.state != State::Closed {
            self.state = State::Closing;
        }
        Ok(())
    }

    fn send_tracked(&mut self, packet_id: u16, packet: Packet, now: Instant) -> Result<()> {
        if let Err(e) = self.send(&packet, now) {
            self.outbound.release(packet_id);
            return Err(e);
        }
        self.outbound.register(packet_id, packet, now)?;
        Ok(())
    }

    // === Broker responses ===

    /// Accept the pending CONNECT.
    ///
    /// `resume` holds the in-flight tables of a reattached session; its
    /// outbound entries are re-offered before anything else is sent.
    pub fn accept(
        &mut self,
        session_present: bool,
        keep_alive: u16,
        resume: InFlightState,
        now: Instant,
    ) -> Result<()> {
        self.require_awaiting_connect()?;

        self.keep_alive = keep_alive_duration(keep_alive);
        self.send(
            &Packet::Connack(Connack {
                session_present,
                code: ConnackCode::Accepted,
            }),
            now,
        )?;
        self.restore(resume)?;
        self.enter_established(now)
    }

    /// Refuse the pending CONNECT and start closing.
    pub fn reject(&mut self, code: ConnackCode, now: Instant) -> Result<()> {
        self.require_awaiting_connect()?;
        if code == ConnackCode::Accepted {
            return Err(Error::InvalidRequest("reject needs a refusal code".into()));
        }
        self.send(
            &Packet::Connack(Connack {
                session_present: false,
                code,
            }),
            now,
        )?;
        self.state = State::Closing;
        Ok(())
    }

    /// Acknowledge a SUBSCRIBE with one return code per requested filter.
    pub fn suback(
        &mut self,
        packet_id: u16,
        return_codes: Vec<SubscribeReturnCode>,
        now: Instant,
    ) -> Result<()> {
        self.require_established()?;
        let requested = match self.inbound.get(packet_id).map(|e| &e.packet) {
            Some(Packet::Subscribe(s)) => s.filters.len(),
            _ => {
                return Err(Error::InvalidRequest(format!(
                    "no SUBSCRIBE pending for packet identifier {}",
                    packet_id
                )))
            }
        };
        if requested != return_codes.len() {
            return Err(Error::InvalidRequest(format!(
                "{} return codes for {} filters",
                return_codes.len(),
                requested
            )));
        }

        self.inbound.advance(packet_id, AckKind::Suback)?;
        self.send(
            &Packet::Suback(Suback {
                packet_id,
                return_codes,
            }),
            now,
        )
    }

    /// Acknowledge an UNSUBSCRIBE.
    pub fn unsuback(&mut self, packet_id: u16, now: Instant) -> Result<()> {
        self.require_established()?;
        match self.inbound.get(packet_id).map(|e| &e.packet) {
            Some(Packet::Unsubscribe(_)) => {}
            _ => {
                return Err(Error::InvalidRequest(format!(
                    "no UNSUBSCRIBE pending for packet identifier {}",
                    packet_id
                )))
            }
        }
        self.inbound.advance(packet_id, AckKind::Unsuback)?;
        self.send(&Packet::Unsuback { packet_id }, now)
    }

    // === Internals ===

    fn send(&mut self, packet: &Packet, now: Instant) -> Result<()> {
        encode_packet(packet, &mut self.outgoing)?;
        self.last_sent = now;
        log::trace!("{:?} sent {:?}", self.role, packet.packet_type());
        Ok(())
    }

    /// Move to `Closing` and hand the error back.
    fn fail(&mut self, err: Error) -> Error {
        if err.is_fatal() && self.state != State::Closed {
            self.state = State::Closing;
        }
        err
    }

    fn decode_failed(&mut self, err: ProtocolError, now: Instant) -> Error {
        // MQTT-3.1.2-2: answer an unsupported level with CONNACK 0x01
        if self.role == Role::Broker && self.state == State::Idle {
            if let ProtocolError::UnsupportedProtocolLevel(_) = err {
                let refusal = Packet::Connack(Connack {
                    session_present: false,
                    code: ConnackCode::UnacceptableProtocolVersion,
                });
                if let Err(e) = self.send(&refusal, now) {
                    log::warn!("could not queue protocol version refusal: {}", e);
                }
            }
        }
        self.read_buf.clear();
        self.fail(err.into())
    }

    fn require_established(&self) -> Result<()> {
        match self.state {
            State::Established => Ok(()),
            State::Closing | State::Closed => Err(Error::ConnectionClosed),
            _ => Err(Error::NotConnected),
        }
    }

    fn require_client_request(&self) -> Result<()> {
        if self.role != Role::Client {
            return Err(Error::InvalidRequest(
                "only clients subscribe or unsubscribe".into(),
            ));
        }
        self.require_established()
    }

    fn require_awaiting_connect(&self) -> Result<()> {
        if self.role != Role::Broker || self.state != State::AwaitingConnect {
            return Err(Error::InvalidRequest(format!(
                "no CONNECT pending in state {:?}",
                self.state
            )));
        }
        Ok(())
    }

    fn enter_established(&mut self, now: Instant) -> Result<()> {
        self.state = State::Established;
        self.handshake_deadline = None;
        self.ping_sent = None;
        self.last_received = now;

        let resend: Vec<(u16, Packet)> = self
            .outbound
            .resend_order()
            .into_iter()
            .filter(|e| e.is_resend_eligible())
            .map(|e| (e.packet_id, e.resend_packet()))
            .collect();
        if !resend.is_empty() {
            log::debug!("{:?} resending {} in-flight packets", self.role, resend.len());
        }
        for (packet_id, packet) in resend {
            self.send(&packet, now)?;
            self.outbound.mark_resent(packet_id, now);
        }
        Ok(())
    }

    fn handle_packet(&mut self, packet: Packet, now: Instant) -> Result<Option<Event>> {
        match (self.role, self.state) {
            (Role::Broker, State::Idle) => match packet {
                Packet::Connect(connect) => {
                    self.state = State::AwaitingConnect;
                    Ok(Some(Event::ConnectReceived(connect)))
                }
                other => Err(violation(format!(
                    "first packet must be CONNECT, got {:?}",
                    other.packet_type()
                ))),
            },
            (Role::Client, State::AwaitingConnack) => match packet {
                Packet::Connack(connack) => self.handle_connack(connack, now),
                other => Err(violation(format!(
                    "expected CONNACK, got {:?}",
                    other.packet_type()
                ))),
            },
            (_, State::Established) => self.handle_established(packet, now),
            (_, state) => Err(violation(format!(
                "unexpected {:?} in state {:?}",
                packet.packet_type(),
                state
            ))),
        }
    }

    fn handle_connack(&mut self, connack: Connack, now: Instant) -> Result<Option<Event>> {
        if connack.code != ConnackCode::Accepted {
            return Err(Error::ConnectionRefused(connack.code));
        }
        if !connack.session_present {
            // Broker holds no session: peer QoS 2 state is gone with it
            self.inbound.clear();
        }
        if self.resume_session {
            self.enter_established(now)?;
        } else {
            self.outbound.clear();
            self.state = State::Established;
            self.handshake_deadline = None;
        }
        Ok(Some(Event::Connected {
            session_present: connack.session_present,
        }))
    }

    fn handle_established(&mut self, packet: Packet, now: Instant) -> Result<Option<Event>> {
        match (self.role, packet) {
            (_, Packet::Publish(publish)) => self.handle_publish(publish, now),
            (_, Packet::Puback { packet_id }) => self.complete_outbound(packet_id, AckKind::Puback),
            (_, Packet::Pubrec { packet_id }) => self.handle_pubrec(packet_id, now),
            (_, Packet::Pubrel { packet_id }) => self.handle_pubrel(packet_id, now),
            (_, Packet::Pubcomp { packet_id }) => {
                self.complete_outbound(packet_id, AckKind::Pubcomp)
            }

            (Role::Client, Packet::Suback(suback)) => self.handle_suback(suback),
            (Role::Client, Packet::Unsuback { packet_id }) => {
                match self.outbound.advance(packet_id, AckKind::Unsuback)? {
                    Advance::Completed(_) => Ok(Some(Event::Unsubscribed { packet_id })),
                    Advance::StillPending(_) => Ok(None),
                }
            }
            (Role::Client, Packet::Pingresp) => {
                self.ping_sent = None;
                Ok(None)
            }

            (Role::Broker, Packet::Subscribe(subscribe)) => {
                let packet_id = subscribe.packet_id;
                self.inbound
                    .register(packet_id, Packet::Subscribe(subscribe.clone()), now)?;
                Ok(Some(Event::SubscribeRequest(subscribe)))
            }
            (Role::Broker, Packet::Unsubscribe(unsubscribe)) => {
                let packet_id = unsubscribe.packet_id;
                self.inbound
                    .register(packet_id, Packet::Unsubscribe(unsubscribe.clone()), now)?;
                Ok(Some(Event::UnsubscribeRequest(unsubscribe)))
            }
            (Role::Broker, Packet::Pingreq) => {
                self.send(&Packet::Pingresp, now)?;
                Ok(None)
            }
            (Role::Broker, Packet::Disconnect) => {
                self.state = State::Closing;
                Ok(Some(Event::Disconnected))
            }

            (Role::Broker, Packet::Connect(_)) => Err(violation("second CONNECT".into())),
            (role, other) => Err(violation(format!(
                "{:?} must not receive {:?}",
                role,
                other.packet_type()
            ))),
        }
    }

    fn handle_publish(&mut self, publish: Publish, now: Instant) -> Result<Option<Event>> {
        // MQTT-3.3.2-2: topic names carry no wildcards
        validate_topic_name(&publish.topic).map_err(|e| violation(e.to_string()))?;

        match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => Ok(Some(Event::Message(publish))),
            (QoS::AtLeastOnce, Some(packet_id)) => {
                // Duplicates are acknowledged and delivered again
                self.send(&Packet::Puback { packet_id }, now)?;
                Ok(Some(Event::Message(publish)))
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                if let Some(entry) = self.inbound.get(packet_id) {
                    return match (&entry.packet, entry.stage) {
                        (Packet::Publish(_), Stage::Received) => {
                            // Already delivered; the peer missed our PUBREC
                            self.send(&Packet::Pubrec { packet_id }, now)?;
                            Ok(None)
                        }
                        _ => Err(violation(format!(
                            "packet identifier {} reused while in flight",
                            packet_id
                        ))),
                    };
                }
                self.inbound
                    .register(packet_id, Packet::Publish(publish.clone()), now)?;
                self.inbound.advance(packet_id, AckKind::Pubrec)?;
                self.send(&Packet::Pubrec { packet_id }, now)?;
                Ok(Some(Event::Message(publish)))
            }
            (_, None) => Err(violation("QoS 1/2 PUBLISH without packet identifier".into())),
        }
    }

    fn handle_pubrel(&mut self, packet_id: u16, now: Instant) -> Result<Option<Event>> {
        if !self.inbound.contains(packet_id) {
            // Our PUBCOMP was lost before a reconnect; finish the exchange again
            log::warn!(
                "{:?} PUBREL for unknown packet identifier {}, answering PUBCOMP",
                self.role,
                packet_id
            );
            self.send(&Packet::Pubcomp { packet_id }, now)?;
            return Ok(None);
        }
        self.inbound.advance(packet_id, AckKind::Pubrel)?;
        self.send(&Packet::Pubcomp { packet_id }, now)?;
        self.inbound.advance(packet_id, AckKind::Pubcomp)?;
        Ok(None)
    }

    fn handle_pubrec(&mut self, packet_id: u16, now: Instant) -> Result<Option<Event>> {
        self.outbound.advance(packet_id, AckKind::Pubrec)?;
        self.send(&Packet::Pubrel { packet_id }, now)?;
        self.outbound.advance(packet_id, AckKind::Pubrel)?;
        self.outbound.mark_resent(packet_id, now);
        Ok(None)
    }

    fn complete_outbound(&mut self, packet_id: u16, ack: AckKind) -> Result<Option<Event>> {
        match self.outbound.advance(packet_id, ack)? {
            Advance::Completed(_) => Ok(Some(Event::Published { packet_id })),
            Advance::StillPending(_) => Ok(None),
        }
    }

    fn handle_suback(&mut self, suback: Suback) -> Result<Option<Event>> {
        let packet_id = suback.packet_id;
        if let Some(Packet::Subscribe(subscribe)) = self.outbound.get(packet_id).map(|e| &e.packet) {
            if subscribe.filters.len() != suback.return_codes.len() {
                return Err(violation(format!(
                    "SUBACK {} carries {} return codes for {} filters",
                    packet_id,
                    suback.return_codes.len(),
                    subscribe.filters.len()
                )));
            }
        }
        match self.outbound.advance(packet_id, AckKind::Suback)? {
            Advance::Completed(_) => Ok(Some(Event::Subscribed {
                packet_id,
                return_codes: suback.return_codes,
            })),
            Advance::StillPending(_) => Ok(None),
        }
    }
}

fn violation(msg: String) -> Error {
    Error::ProtocolViolation(msg)
}

fn keep_alive_duration(secs: u16) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(u64::from(secs)))
}
