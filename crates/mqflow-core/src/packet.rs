//! MQTT 3.1.1 packet types and codec.
//!
//! Decoding is streaming-safe: [`decode_packet`] returns `Ok(None)` until the
//! buffer holds a complete frame and never consumes partial input. Every
//! decoded packet is fully validated; there are no partially populated
//! variants.

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::varint;

type Result<T> = std::result::Result<T, ProtocolError>;

/// MQTT Control Packet Types (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

impl PacketType {
    /// Fixed header flags required for every type except PUBLISH.
    fn required_flags(self) -> u8 {
        match self {
            // MQTT-3.6.1-1, MQTT-3.8.1-1, MQTT-3.10.1-1
            PacketType::Pubrel | PacketType::Subscribe | PacketType::Unsubscribe => 0x02,
            _ => 0x00,
        }
    }
}

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
#[allow(clippy::enum_variant_names)] // MQTT protocol names
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::InvalidQos(value)),
        }
    }
}

/// CONNACK return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnackCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernamePassword = 4,
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnackCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ConnackCode::Accepted),
            1 => Ok(ConnackCode::UnacceptableProtocolVersion),
            2 => Ok(ConnackCode::IdentifierRejected),
            3 => Ok(ConnackCode::ServerUnavailable),
            4 => Ok(ConnackCode::BadUsernamePassword),
            5 => Ok(ConnackCode::NotAuthorized),
            _ => Err(ProtocolError::MalformedPacket(format!(
                "Invalid CONNACK return code: {:#04x}",
                value
            ))),
        }
    }
}

/// Per-filter result carried by SUBACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    Granted(QoS),
    Failure,
}

impl SubscribeReturnCode {
    pub fn to_u8(self) -> u8 {
        match self {
            SubscribeReturnCode::Granted(qos) => qos as u8,
            SubscribeReturnCode::Failure => 0x80,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x80 => Ok(SubscribeReturnCode::Failure),
            v => QoS::try_from(v)
                .map(SubscribeReturnCode::Granted)
                .map_err(|_| {
                    ProtocolError::MalformedPacket(format!(
                        "Invalid SUBACK return code: {:#04x}",
                        v
                    ))
                }),
        }
    }
}

/// MQTT Packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback { packet_id: u16 },
    Pubrec { packet_id: u16 },
    Pubrel { packet_id: u16 },
    Pubcomp { packet_id: u16 },
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback { packet_id: u16 },
    Pingreq,
    Pingresp,
    Disconnect,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::Connack(_) => PacketType::Connack,
            Packet::Publish(_) => PacketType::Publish,
            Packet::Puback { .. } => PacketType::Puback,
            Packet::Pubrec { .. } => PacketType::Pubrec,
            Packet::Pubrel { .. } => PacketType::Pubrel,
            Packet::Pubcomp { .. } => PacketType::Pubcomp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::Suback(_) => PacketType::Suback,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::Unsuback { .. } => PacketType::Unsuback,
            Packet::Pingreq => PacketType::Pingreq,
            Packet::Pingresp => PacketType::Pingresp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// Packet identifier, for the packet types that carry one.
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            Packet::Publish(p) => p.packet_id,
            Packet::Puback { packet_id }
            | Packet::Pubrec { packet_id }
            | Packet::Pubrel { packet_id }
            | Packet::Pubcomp { packet_id }
            | Packet::Unsuback { packet_id } => Some(*packet_id),
            Packet::Subscribe(s) => Some(s.packet_id),
            Packet::Suback(s) => Some(s.packet_id),
            Packet::Unsubscribe(u) => Some(u.packet_id),
            _ => None,
        }
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        encode_packet(self, &mut buf)?;
        Ok(buf)
    }
}

/// CONNECT packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// "MQTT" for level 4, "MQIsdp" for level 3.
    pub protocol_name: String,
    pub protocol_level: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

impl Connect {
    /// A 3.1.1 CONNECT with no will and no credentials.
    pub fn new(client_id: impl Into<String>, keep_alive: u16, clean_session: bool) -> Self {
        Self {
            protocol_name: "MQTT".to_string(),
            protocol_level: 4,
            clean_session,
            keep_alive,
            client_id: client_id.into(),
            will: None,
            username: None,
            password: None,
        }
    }
}

/// Will message carried in CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK packet data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connack {
    pub session_present: bool,
    pub code: ConnackCode,
}

/// PUBLISH packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Present iff `qos > AtMostOnce`.
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

impl Publish {
    /// A fresh (non-dup) publish without a packet identifier.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> Self {
        Self {
            dup: false,
            qos,
            retain,
            topic: topic.into(),
            packet_id: None,
            payload: payload.into(),
        }
    }
}

/// SUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    /// Topic filters with requested QoS, in request order.
    pub filters: Vec<(String, QoS)>,
}

/// SUBACK packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    pub packet_id: u16,
    /// One entry per requested filter, same order.
    pub return_codes: Vec<SubscribeReturnCode>,
}

/// UNSUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

/// Cursor over the variable header and payload of one complete frame.
///
/// Running past the end means the remaining length lied about the
/// contents, so every short read is `MalformedLength`.
struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_u8(&mut self) -> Result<u8> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or(ProtocolError::MalformedLength)?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_packet_id(&mut self) -> Result<u16> {
        let id = self.read_u16()?;
        // MQTT-2.3.1-1: packet identifiers are non-zero
        if id == 0 {
            return Err(ProtocolError::Violation("packet identifier 0".into()));
        }
        Ok(id)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::MalformedLength);
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        let s = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
        // MQTT-1.5.3-2: UTF-8 string MUST NOT contain null character U+0000
        if s.contains('\0') {
            return Err(ProtocolError::MalformedPacket(
                "UTF-8 string must not contain null character".into(),
            ));
        }
        Ok(s.to_string())
    }

    fn read_binary(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u16()? as usize;
        self.read_bytes(len)
    }

    fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    /// Every byte announced by the remaining length must have been used.
    fn finish(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(ProtocolError::MalformedLength);
        }
        Ok(())
    }
}

/// Decode one packet from the start of `buf`.
///
/// Returns `Ok(Some((packet, bytes_consumed)))` for a complete packet,
/// `Ok(None)` when more data is needed, or `Err` on protocol errors.
/// `max_packet_size` of 0 means no limit.
pub fn decode_packet(buf: &[u8], max_packet_size: usize) -> Result<Option<(Packet, usize)>> {
    let Some(&fixed_header) = buf.first() else {
        return Ok(None);
    };

    let packet_type = PacketType::try_from(fixed_header >> 4)?;
    let flags = fixed_header & 0x0F;

    if packet_type == PacketType::Publish {
        let qos = (flags >> 1) & 0x03;
        if qos == 3 {
            return Err(ProtocolError::InvalidQos(qos));
        }
        // MQTT-3.3.1-2: DUP MUST be 0 for QoS 0 messages
        if qos == 0 && flags & 0x08 != 0 {
            return Err(ProtocolError::InvalidFlags { packet_type, flags });
        }
    } else if flags != packet_type.required_flags() {
        return Err(ProtocolError::InvalidFlags { packet_type, flags });
    }

    let Some((remaining_len, len_bytes)) = varint::decode(&buf[1..])? else {
        return Ok(None);
    };

    let header_len = 1 + len_bytes;
    let total_len = header_len + remaining_len;

    if max_packet_size > 0 && total_len > max_packet_size {
        return Err(ProtocolError::PacketTooLarge {
            size: total_len,
            max: max_packet_size,
        });
    }

    if buf.len() < total_len {
        return Ok(None);
    }

    let body = &buf[header_len..total_len];
    let packet = match packet_type {
        PacketType::Connect => decode_connect(body)?,
        PacketType::Connack => decode_connack(body)?,
        PacketType::Publish => decode_publish(flags, body)?,
        PacketType::Puback => Packet::Puback {
            packet_id: decode_id_only(body)?,
        },
        PacketType::Pubrec => Packet::Pubrec {
            packet_id: decode_id_only(body)?,
        },
        PacketType::Pubrel => Packet::Pubrel {
            packet_id: decode_id_only(body)?,
        },
        PacketType::Pubcomp => Packet::Pubcomp {
            packet_id: decode_id_only(body)?,
        },
        PacketType::Subscribe => decode_subscribe(body)?,
        PacketType::Suback => decode_suback(body)?,
        PacketType::Unsubscribe => decode_unsubscribe(body)?,
        PacketType::Unsuback => Packet::Unsuback {
            packet_id: decode_id_only(body)?,
        },
        PacketType::Pingreq => decode_empty(body, Packet::Pingreq)?,
        PacketType::Pingresp => decode_empty(body, Packet::Pingresp)?,
        PacketType::Disconnect => decode_empty(body, Packet::Disconnect)?,
    };

    Ok(Some((packet, total_len)))
}

fn decode_connect(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);

    let protocol_name = dec.read_string()?;
    let protocol_level = dec.read_u8()?;
    match (protocol_name.as_str(), protocol_level) {
        ("MQTT", 4) | ("MQIsdp", 3) => {}
        ("MQTT", level) | ("MQIsdp", level) => {
            return Err(ProtocolError::UnsupportedProtocolLevel(level))
        }
        _ => return Err(ProtocolError::InvalidProtocolName(protocol_name)),
    }

    let flags = dec.read_u8()?;
    let clean_session = flags & 0x02 != 0;
    let will_flag = flags & 0x04 != 0;
    let will_qos = (flags >> 3) & 0x03;
    let will_retain = flags & 0x20 != 0;
    let password_flag = flags & 0x40 != 0;
    let username_flag = flags & 0x80 != 0;

    // MQTT-3.1.2-3: reserved bit must be 0
    if flags & 0x01 != 0 {
        return Err(ProtocolError::InvalidConnectFlags(flags));
    }
    // MQTT-3.1.2-13, MQTT-3.1.2-15: will QoS and retain require the will flag
    if !will_flag && (will_qos != 0 || will_retain) {
        return Err(ProtocolError::InvalidConnectFlags(flags));
    }
    // MQTT-3.1.2-22: password requires username
    if password_flag && !username_flag {
        return Err(ProtocolError::InvalidConnectFlags(flags));
    }
    let will_qos = QoS::try_from(will_qos)?;

    let keep_alive = dec.read_u16()?;
    let client_id = dec.read_string()?;

    let will = if will_flag {
        let topic = dec.read_string()?;
        let message = Bytes::copy_from_slice(dec.read_binary()?);
        Some(Will {
            topic,
            message,
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        Some(dec.read_string()?)
    } else {
        None
    };
    let password = if password_flag {
        Some(dec.read_binary()?.to_vec())
    } else {
        None
    };

    dec.finish()?;

    Ok(Packet::Connect(Connect {
        protocol_name,
        protocol_level,
        clean_session,
        keep_alive,
        client_id,
        will,
        username,
        password,
    }))
}

fn decode_connack(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let ack_flags = dec.read_u8()?;
    // MQTT-3.2.2-1: bits 7-1 are reserved
    if ack_flags & 0xFE != 0 {
        return Err(ProtocolError::MalformedPacket(format!(
            "Invalid CONNACK flags: {:#04x}",
            ack_flags
        )));
    }
    let code = ConnackCode::try_from(dec.read_u8()?)?;
    dec.finish()?;

    let session_present = ack_flags & 0x01 != 0;
    // MQTT-3.2.2-4: a refusing CONNACK has session present 0
    if session_present && code != ConnackCode::Accepted {
        return Err(ProtocolError::Violation(
            "session present set on a refused CONNACK".into(),
        ));
    }

    Ok(Packet::Connack(Connack {
        session_present,
        code,
    }))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet> {
    let dup = flags & 0x08 != 0;
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let retain = flags & 0x01 != 0;

    let mut dec = Decoder::new(body);
    let topic = dec.read_string()?;

    let packet_id = if qos != QoS::AtMostOnce {
        Some(dec.read_packet_id()?)
    } else {
        None
    };

    let payload = Bytes::copy_from_slice(dec.read_rest());

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload,
    }))
}

fn decode_id_only(body: &[u8]) -> Result<u16> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_packet_id()?;
    dec.finish()?;
    Ok(packet_id)
}

fn decode_empty(body: &[u8], packet: Packet) -> Result<Packet> {
    if !body.is_empty() {
        return Err(ProtocolError::MalformedLength);
    }
    Ok(packet)
}

fn read_filter(dec: &mut Decoder<'_>) -> Result<String> {
    let filter = dec.read_string()?;
    // MQTT-4.7.3-1: topic filters are at least one character
    if filter.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "Topic filter must be at least 1 character".into(),
        ));
    }
    Ok(filter)
}

fn decode_subscribe(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_packet_id()?;

    let mut filters = Vec::new();
    while dec.remaining() > 0 {
        let filter = read_filter(&mut dec)?;
        let options = dec.read_u8()?;
        // MQTT-3.8.3-4: upper six bits of the requested QoS byte are reserved
        if options & 0xFC != 0 {
            return Err(ProtocolError::MalformedPacket(format!(
                "Reserved bits set in requested QoS: {:#04x}",
                options
            )));
        }
        filters.push((filter, QoS::try_from(options)?));
    }

    // MQTT-3.8.3-3: at least one filter
    if filters.is_empty() {
        return Err(ProtocolError::MalformedPacket("SUBSCRIBE with no topics".into()));
    }

    Ok(Packet::Subscribe(Subscribe { packet_id, filters }))
}

fn decode_suback(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_packet_id()?;

    let return_codes = dec
        .read_rest()
        .iter()
        .map(|&b| SubscribeReturnCode::from_u8(b))
        .collect::<Result<Vec<_>>>()?;

    if return_codes.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "SUBACK with no return codes".into(),
        ));
    }

    Ok(Packet::Suback(Suback {
        packet_id,
        return_codes,
    }))
}

fn decode_unsubscribe(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_packet_id()?;

    let mut filters = Vec::new();
    while dec.remaining() > 0 {
        filters.push(read_filter(&mut dec)?);
    }

    // MQTT-3.10.3-2: at least one filter
    if filters.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "UNSUBSCRIBE with no topics".into(),
        ));
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
}

// === Encoding ===

/// Encode a packet, appending it to `buf`.
///
/// Fails without touching `buf` when the packet could not be decoded back:
/// a QoS 0 PUBLISH carrying an identifier, a QoS 1/2 PUBLISH without one,
/// identifier 0, empty filter lists, or oversized strings.
pub fn encode_packet(packet: &Packet, buf: &mut Vec<u8>) -> Result<()> {
    let mut body = Vec::new();
    let mut flags = packet.packet_type().required_flags();

    match packet {
        Packet::Connect(connect) => encode_connect(connect, &mut body)?,
        Packet::Connack(connack) => {
            body.push(u8::from(connack.session_present));
            body.push(connack.code as u8);
        }
        Packet::Publish(publish) => flags = encode_publish(publish, &mut body)?,
        Packet::Puback { packet_id }
        | Packet::Pubrec { packet_id }
        | Packet::Pubrel { packet_id }
        | Packet::Pubcomp { packet_id }
        | Packet::Unsuback { packet_id } => write_packet_id(*packet_id, &mut body)?,
        Packet::Subscribe(subscribe) => {
            write_packet_id(subscribe.packet_id, &mut body)?;
            if subscribe.filters.is_empty() {
                return Err(ProtocolError::MalformedPacket("SUBSCRIBE with no topics".into()));
            }
            for (filter, qos) in &subscribe.filters {
                write_string(filter, &mut body)?;
                body.push(*qos as u8);
            }
        }
        Packet::Suback(suback) => {
            write_packet_id(suback.packet_id, &mut body)?;
            if suback.return_codes.is_empty() {
                return Err(ProtocolError::MalformedPacket(
                    "SUBACK with no return codes".into(),
                ));
            }
            body.extend(suback.return_codes.iter().map(|c| c.to_u8()));
        }
        Packet::Unsubscribe(unsubscribe) => {
            write_packet_id(unsubscribe.packet_id, &mut body)?;
            if unsubscribe.filters.is_empty() {
                return Err(ProtocolError::MalformedPacket(
                    "UNSUBSCRIBE with no topics".into(),
                ));
            }
            for filter in &unsubscribe.filters {
                write_string(filter, &mut body)?;
            }
        }
        Packet::Pingreq | Packet::Pingresp | Packet::Disconnect => {}
    }

    let mut header = Vec::with_capacity(1 + varint::MAX_LEN);
    header.push(((packet.packet_type() as u8) << 4) | flags);
    varint::encode_to_vec(body.len(), &mut header)?;

    buf.reserve(header.len() + body.len());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(&body);
    Ok(())
}

fn encode_connect(connect: &Connect, body: &mut Vec<u8>) -> Result<()> {
    write_string(&connect.protocol_name, body)?;
    body.push(connect.protocol_level);

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(ref will) = connect.will {
        flags |= 0x04;
        flags |= (will.qos as u8) << 3;
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        if connect.username.is_none() {
            return Err(ProtocolError::InvalidConnectFlags(flags | 0x40));
        }
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    body.push(flags);

    body.extend_from_slice(&connect.keep_alive.to_be_bytes());
    write_string(&connect.client_id, body)?;

    if let Some(ref will) = connect.will {
        write_string(&will.topic, body)?;
        write_binary(&will.message, body)?;
    }
    if let Some(ref username) = connect.username {
        write_string(username, body)?;
    }
    if let Some(ref password) = connect.password {
        write_binary(password, body)?;
    }
    Ok(())
}

/// Encode the PUBLISH variable header and payload; returns the header flags.
fn encode_publish(publish: &Publish, body: &mut Vec<u8>) -> Result<u8> {
    let mut flags = (publish.qos as u8) << 1;
    if publish.dup {
        if publish.qos == QoS::AtMostOnce {
            return Err(ProtocolError::InvalidFlags {
                packet_type: PacketType::Publish,
                flags: flags | 0x08,
            });
        }
        flags |= 0x08;
    }
    if publish.retain {
        flags |= 0x01;
    }

    write_string(&publish.topic, body)?;

    match (publish.qos, publish.packet_id) {
        (QoS::AtMostOnce, None) => {}
        (QoS::AtMostOnce, Some(_)) => {
            return Err(ProtocolError::Violation(
                "QoS 0 PUBLISH must not carry a packet identifier".into(),
            ))
        }
        (_, Some(id)) => write_packet_id(id, body)?,
        (_, None) => {
            return Err(ProtocolError::Violation(
                "QoS 1/2 PUBLISH requires a packet identifier".into(),
            ))
        }
    }

    body.extend_from_slice(&publish.payload);
    Ok(flags)
}

fn write_packet_id(packet_id: u16, buf: &mut Vec<u8>) -> Result<()> {
    if packet_id == 0 {
        return Err(ProtocolError::Violation("packet identifier 0".into()));
    }
    buf.extend_from_slice(&packet_id.to_be_bytes());
    Ok(())
}

fn write_string(s: &str, buf: &mut Vec<u8>) -> Result<()> {
    if s.contains('\0') {
        return Err(ProtocolError::MalformedPacket(
            "UTF-8 string must not contain null character".into(),
        ));
    }
    write_binary(s.as_bytes(), buf)
}

fn write_binary(data: &[u8], buf: &mut Vec<u8>) -> Result<()> {
    let len = u16::try_from(data.len()).map_err(|_| {
        ProtocolError::MalformedPacket(format!("Field too long: {} bytes", data.len()))
    })?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(data);
    Ok(())
}
