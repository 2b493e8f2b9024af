//! MQTT 3.1.1 (v4) control packets.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::types::{ConnectReturnCode, PacketType, QoS};

use super::codec::{
    read_fixed_header, variable_int_len, write_binary, write_fixed_header, write_string, Body,
    Result, MAX_REMAINING_LENGTH,
};
use super::{PROTOCOL_LEVEL, PROTOCOL_NAME};

/// MQTT 3.1.1 packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

/// CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub will: Option<Will>,
}

/// Last Will and Testament.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

/// PUBLISH packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Zero for QoS 0.
    pub pkid: u16,
}

/// SUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub pkid: u16,
    pub filters: Vec<SubscribeFilter>,
}

/// Subscribe filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub path: String,
    pub qos: QoS,
}

/// SUBACK packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub pkid: u16,
    pub return_codes: Vec<SubscribeReturnCode>,
}

/// SUBACK return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

impl SubscribeReturnCode {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x80 => Ok(SubscribeReturnCode::Failure),
            v => QoS::from_u8(v)
                .map(SubscribeReturnCode::Success)
                .ok_or(ProtocolError::Malformed("invalid suback return code")),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            SubscribeReturnCode::Success(qos) => qos as u8,
            SubscribeReturnCode::Failure => 0x80,
        }
    }
}

/// UNSUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub pkid: u16,
    pub topics: Vec<String>,
}

// ============================================================================
// Packet parsing
// ============================================================================

impl Packet {
    /// Parse one packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` holds only part of a frame, otherwise the
    /// packet and the number of bytes it occupied.
    pub fn decode(buf: &[u8], max_size: usize) -> Result<Option<(Packet, usize)>> {
        let Some(header) = read_fixed_header(buf)? else {
            return Ok(None);
        };
        let total_len = header.frame_length();

        if total_len > max_size {
            return Err(ProtocolError::PacketTooLarge { size: total_len, max: max_size });
        }

        if buf.len() < total_len {
            return Ok(None);
        }

        let mut body = Body::new(&buf[header.header_length..total_len]);

        let packet = match header.packet_type {
            PacketType::Connect => Packet::Connect(Connect::read(&mut body)?),
            PacketType::ConnAck => Packet::ConnAck(ConnAck::read(&mut body)?),
            PacketType::Publish => Packet::Publish(Publish::read(header.flags, &mut body)?),
            PacketType::PubAck => Packet::PubAck(read_pkid_only(&mut body)?),
            PacketType::PubRec => Packet::PubRec(read_pkid_only(&mut body)?),
            PacketType::PubRel => Packet::PubRel(read_pkid_only(&mut body)?),
            PacketType::PubComp => Packet::PubComp(read_pkid_only(&mut body)?),
            PacketType::Subscribe => Packet::Subscribe(Subscribe::read(&mut body)?),
            PacketType::SubAck => Packet::SubAck(SubAck::read(&mut body)?),
            PacketType::Unsubscribe => Packet::Unsubscribe(Unsubscribe::read(&mut body)?),
            PacketType::UnsubAck => Packet::UnsubAck(read_pkid_only(&mut body)?),
            PacketType::PingReq => {
                body.finish("pingreq")?;
                Packet::PingReq
            }
            PacketType::PingResp => {
                body.finish("pingresp")?;
                Packet::PingResp
            }
            PacketType::Disconnect => {
                body.finish("disconnect")?;
                Packet::Disconnect
            }
        };

        Ok(Some((packet, total_len)))
    }

    /// Append the encoded packet to `buf`, returning the bytes written.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<usize> {
        let remaining = self.remaining_length()?;
        buf.reserve(1 + variable_int_len(remaining) + remaining);

        let header = match self {
            Packet::Connect(_) => write_fixed_header(buf, PacketType::Connect, 0, remaining)?,
            Packet::ConnAck(_) => write_fixed_header(buf, PacketType::ConnAck, 0, remaining)?,
            Packet::Publish(p) => write_fixed_header(buf, PacketType::Publish, p.flags(), remaining)?,
            Packet::PubAck(_) => write_fixed_header(buf, PacketType::PubAck, 0, remaining)?,
            Packet::PubRec(_) => write_fixed_header(buf, PacketType::PubRec, 0, remaining)?,
            Packet::PubRel(_) => write_fixed_header(buf, PacketType::PubRel, 0x02, remaining)?,
            Packet::PubComp(_) => write_fixed_header(buf, PacketType::PubComp, 0, remaining)?,
            Packet::Subscribe(_) => write_fixed_header(buf, PacketType::Subscribe, 0x02, remaining)?,
            Packet::SubAck(_) => write_fixed_header(buf, PacketType::SubAck, 0, remaining)?,
            Packet::Unsubscribe(_) => {
                write_fixed_header(buf, PacketType::Unsubscribe, 0x02, remaining)?
            }
            Packet::UnsubAck(_) => write_fixed_header(buf, PacketType::UnsubAck, 0, remaining)?,
            Packet::PingReq => write_fixed_header(buf, PacketType::PingReq, 0, 0)?,
            Packet::PingResp => write_fixed_header(buf, PacketType::PingResp, 0, 0)?,
            Packet::Disconnect => write_fixed_header(buf, PacketType::Disconnect, 0, 0)?,
        };

        match self {
            Packet::Connect(p) => p.write(buf)?,
            Packet::ConnAck(p) => {
                buf.put_u8(p.session_present as u8);
                buf.put_u8(p.code as u8);
            }
            Packet::Publish(p) => p.write(buf)?,
            Packet::PubAck(pkid)
            | Packet::PubRec(pkid)
            | Packet::PubRel(pkid)
            | Packet::PubComp(pkid)
            | Packet::UnsubAck(pkid) => buf.put_u16(*pkid),
            Packet::Subscribe(p) => p.write(buf)?,
            Packet::SubAck(p) => {
                buf.put_u16(p.pkid);
                for code in &p.return_codes {
                    buf.put_u8(code.to_u8());
                }
            }
            Packet::Unsubscribe(p) => {
                buf.put_u16(p.pkid);
                for topic in &p.topics {
                    write_string(buf, topic)?;
                }
            }
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => {}
        }

        Ok(header + remaining)
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.size()?);
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Calculate the encoded packet size.
    pub fn size(&self) -> Result<usize> {
        let remaining = self.remaining_length()?;
        Ok(1 + variable_int_len(remaining) + remaining)
    }

    /// Short packet name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck(_) => "PUBACK",
            Packet::PubRec(_) => "PUBREC",
            Packet::PubRel(_) => "PUBREL",
            Packet::PubComp(_) => "PUBCOMP",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::UnsubAck(_) => "UNSUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }

    fn remaining_length(&self) -> Result<usize> {
        let len = match self {
            Packet::Connect(p) => p.remaining_length(),
            Packet::ConnAck(_) => 2,
            Packet::Publish(p) => p.remaining_length(),
            Packet::PubAck(_)
            | Packet::PubRec(_)
            | Packet::PubRel(_)
            | Packet::PubComp(_)
            | Packet::UnsubAck(_) => 2,
            Packet::Subscribe(p) => 2 + p.filters.iter().map(|f| 2 + f.path.len() + 1).sum::<usize>(),
            Packet::SubAck(p) => 2 + p.return_codes.len(),
            Packet::Unsubscribe(p) => 2 + p.topics.iter().map(|t| 2 + t.len()).sum::<usize>(),
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => 0,
        };
        if len > MAX_REMAINING_LENGTH {
            return Err(ProtocolError::PacketTooLarge { size: len, max: MAX_REMAINING_LENGTH });
        }
        Ok(len)
    }
}

fn read_pkid_only(body: &mut Body<'_>) -> Result<u16> {
    let pkid = read_pkid(body)?;
    body.finish("acknowledgment")?;
    Ok(pkid)
}

fn read_pkid(body: &mut Body<'_>) -> Result<u16> {
    match body.read_u16("packet identifier")? {
        0 => Err(ProtocolError::ZeroPacketId),
        pkid => Ok(pkid),
    }
}

// ============================================================================
// Individual packet implementations
// ============================================================================

// Connect flag bits.
const FLAG_USERNAME: u8 = 0x80;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_WILL_RETAIN: u8 = 0x20;
const FLAG_WILL: u8 = 0x04;
const FLAG_CLEAN_SESSION: u8 = 0x02;

impl Connect {
    fn read(body: &mut Body<'_>) -> Result<Self> {
        let name = body.read_string("protocol name")?;
        let level = body.read_u8("protocol level")?;
        if name.as_bytes() != PROTOCOL_NAME || level != PROTOCOL_LEVEL {
            return Err(ProtocolError::UnsupportedProtocol(format!("{} level {}", name, level)));
        }

        let flags = body.read_u8("connect flags")?;
        if flags & 0x01 != 0 {
            return Err(ProtocolError::Malformed("reserved connect flag set"));
        }
        let will_qos_bits = (flags >> 3) & 0x03;
        let will_qos = QoS::from_u8(will_qos_bits).ok_or(ProtocolError::InvalidQoS(will_qos_bits))?;
        if flags & FLAG_WILL == 0 && (will_qos_bits != 0 || flags & FLAG_WILL_RETAIN != 0) {
            return Err(ProtocolError::Malformed("will flags without will"));
        }
        if flags & FLAG_PASSWORD != 0 && flags & FLAG_USERNAME == 0 {
            return Err(ProtocolError::Malformed("password without username"));
        }

        let keep_alive = body.read_u16("keep alive")?;
        let client_id = body.read_string("client id")?.to_string();

        let will = if flags & FLAG_WILL != 0 {
            let topic = body.read_string("will topic")?.to_string();
            let payload = Bytes::copy_from_slice(body.read_binary("will payload")?);
            Some(Will {
                topic,
                payload,
                qos: will_qos,
                retain: flags & FLAG_WILL_RETAIN != 0,
            })
        } else {
            None
        };

        let username = if flags & FLAG_USERNAME != 0 {
            Some(body.read_string("username")?.to_string())
        } else {
            None
        };

        let password = if flags & FLAG_PASSWORD != 0 {
            Some(body.read_binary("password")?.to_vec())
        } else {
            None
        };

        body.finish("connect")?;

        Ok(Connect {
            client_id,
            keep_alive,
            clean_session: flags & FLAG_CLEAN_SESSION != 0,
            username,
            password,
            will,
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        // Protocol name + level
        write_binary(buf, PROTOCOL_NAME)?;
        buf.put_u8(PROTOCOL_LEVEL);

        let mut flags = 0u8;
        if self.clean_session {
            flags |= FLAG_CLEAN_SESSION;
        }
        if let Some(ref will) = self.will {
            flags |= FLAG_WILL | ((will.qos as u8) << 3);
            if will.retain {
                flags |= FLAG_WILL_RETAIN;
            }
        }
        if self.username.is_some() {
            flags |= FLAG_USERNAME;
        }
        if self.password.is_some() {
            flags |= FLAG_PASSWORD;
        }
        buf.put_u8(flags);
        buf.put_u16(self.keep_alive);

        write_string(buf, &self.client_id)?;

        if let Some(ref will) = self.will {
            write_string(buf, &will.topic)?;
            write_binary(buf, &will.payload)?;
        }
        if let Some(ref username) = self.username {
            write_string(buf, username)?;
        }
        if let Some(ref password) = self.password {
            write_binary(buf, password)?;
        }

        Ok(())
    }

    fn remaining_length(&self) -> usize {
        let mut len = 2 + PROTOCOL_NAME.len() + 1 + 1 + 2; // protocol name + level + flags + keep_alive
        len += 2 + self.client_id.len();

        if let Some(ref will) = self.will {
            len += 2 + will.topic.len();
            len += 2 + will.payload.len();
        }
        if let Some(ref username) = self.username {
            len += 2 + username.len();
        }
        if let Some(ref password) = self.password {
            len += 2 + password.len();
        }

        len
    }
}

impl ConnAck {
    fn read(body: &mut Body<'_>) -> Result<Self> {
        let ack_flags = body.read_u8("connack flags")?;
        if ack_flags & 0xFE != 0 {
            return Err(ProtocolError::Malformed("reserved connack flags set"));
        }
        let code_byte = body.read_u8("connack return code")?;
        let code = ConnectReturnCode::from_u8(code_byte)
            .ok_or(ProtocolError::InvalidConnectReturnCode(code_byte))?;
        body.finish("connack")?;

        Ok(ConnAck {
            session_present: ack_flags & 0x01 != 0,
            code,
        })
    }
}

impl Publish {
    /// Create a PUBLISH packet. `pkid` is ignored for QoS 0.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS, pkid: u16) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
            dup: false,
            pkid: if qos == QoS::AtMostOnce { 0 } else { pkid },
        }
    }

    fn flags(&self) -> u8 {
        let mut flags = (self.qos as u8) << 1;
        if self.dup {
            flags |= 0x08;
        }
        if self.retain {
            flags |= 0x01;
        }
        flags
    }

    fn read(flags: u8, body: &mut Body<'_>) -> Result<Self> {
        let dup = flags & 0x08 != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let qos = QoS::from_u8(qos_bits).ok_or(ProtocolError::InvalidQoS(qos_bits))?;
        let retain = flags & 0x01 != 0;

        if dup && qos == QoS::AtMostOnce {
            return Err(ProtocolError::Malformed("dup flag on qos 0 publish"));
        }

        let topic = body.read_string("topic")?;
        if topic.contains(['+', '#']) {
            return Err(ProtocolError::Malformed("wildcard in publish topic"));
        }
        let topic = topic.to_string();

        let pkid = if qos != QoS::AtMostOnce { read_pkid(body)? } else { 0 };

        let payload = Bytes::copy_from_slice(body.rest());

        Ok(Publish { topic, payload, qos, retain, dup, pkid })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        write_string(buf, &self.topic)?;
        if self.qos != QoS::AtMostOnce {
            buf.put_u16(self.pkid);
        }
        buf.put_slice(&self.payload);
        Ok(())
    }

    fn remaining_length(&self) -> usize {
        let mut len = 2 + self.topic.len() + self.payload.len();
        if self.qos != QoS::AtMostOnce {
            len += 2;
        }
        len
    }
}

impl Subscribe {
    fn read(body: &mut Body<'_>) -> Result<Self> {
        let pkid = read_pkid(body)?;

        let mut filters = Vec::new();
        while !body.is_empty() {
            let path = body.read_string("topic filter")?.to_string();
            let options = body.read_u8("requested qos")?;
            if options & 0xFC != 0 {
                return Err(ProtocolError::Malformed("reserved subscription option bits set"));
            }
            let qos = QoS::from_u8(options).ok_or(ProtocolError::InvalidQoS(options))?;
            filters.push(SubscribeFilter { path, qos });
        }

        if filters.is_empty() {
            return Err(ProtocolError::Malformed("subscribe without filters"));
        }

        Ok(Subscribe { pkid, filters })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u16(self.pkid);
        for filter in &self.filters {
            write_string(buf, &filter.path)?;
            buf.put_u8(filter.qos as u8);
        }
        Ok(())
    }
}

impl SubAck {
    fn read(body: &mut Body<'_>) -> Result<Self> {
        let pkid = read_pkid(body)?;
        let return_codes = body
            .rest()
            .iter()
            .map(|&b| SubscribeReturnCode::from_u8(b))
            .collect::<Result<Vec<_>>>()?;

        if return_codes.is_empty() {
            return Err(ProtocolError::Malformed("suback without return codes"));
        }

        Ok(SubAck { pkid, return_codes })
    }
}

impl Unsubscribe {
    fn read(body: &mut Body<'_>) -> Result<Self> {
        let pkid = read_pkid(body)?;

        let mut topics = Vec::new();
        while !body.is_empty() {
            topics.push(body.read_string("topic filter")?.to_string());
        }

        if topics.is_empty() {
            return Err(ProtocolError::Malformed("unsubscribe without filters"));
        }

        Ok(Unsubscribe { pkid, topics })
    }
}
