//! MQTT 3.1 control packets
//!
//! Every packet carries the bytes it was (or will be) transmitted as in
//! `raw`: for a packet built locally this is filled in by the encoder at
//! construction time, and for a packet parsed off the wire it is the exact
//! frame the channel's read path accumulated. Keeping the encoded form
//! alongside the parsed fields means a resend is a cursor rewind rather
//! than a re-encode, and the duplicate flag can be flipped in place.

use bytes::{Bytes, BytesMut};
use std::sync::Arc;

use super::{ConnectReturnCode, PacketType, QoS, SubscribeResult};

/// MQTT Packet - unified representation for the 14 MQTT 3.1 control packets
#[derive(Debug, Clone)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq(PingReq),
    PingResp(PingResp),
    Disconnect(Disconnect),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq(_) => PacketType::PingReq,
            Packet::PingResp(_) => PacketType::PingResp,
            Packet::Disconnect(_) => PacketType::Disconnect,
        }
    }

    /// The 16-bit message id, for the packet types that carry one.
    pub fn message_id(&self) -> Option<u16> {
        match self {
            Packet::Publish(p) => p.packet_id,
            Packet::PubAck(p) => Some(p.packet_id),
            Packet::PubRec(p) => Some(p.packet_id),
            Packet::PubRel(p) => Some(p.packet_id),
            Packet::PubComp(p) => Some(p.packet_id),
            Packet::Subscribe(p) => Some(p.packet_id),
            Packet::SubAck(p) => Some(p.packet_id),
            Packet::Unsubscribe(p) => Some(p.packet_id),
            Packet::UnsubAck(p) => Some(p.packet_id),
            _ => None,
        }
    }

    /// A packet whose protocol requires an acknowledgement: Publish at QoS >=
    /// 1, Subscribe, Unsubscribe, PubRel.
    pub fn is_ackable(&self) -> bool {
        match self {
            Packet::Publish(p) => p.qos.is_ackable(),
            Packet::Subscribe(_) | Packet::Unsubscribe(_) | Packet::PubRel(_) => true,
            _ => false,
        }
    }

    pub fn dup(&self) -> bool {
        match self {
            Packet::Publish(p) => p.dup,
            _ => false,
        }
    }

    /// Sets the duplicate flag and flips the corresponding bit in the raw
    /// fixed header in place, so no re-encode is needed before a resend.
    pub fn set_dup(&mut self, dup: bool) {
        if let Packet::Publish(p) = self {
            p.dup = dup;
            if !p.raw.is_empty() {
                if dup {
                    p.raw[0] |= 0x08;
                } else {
                    p.raw[0] &= !0x08;
                }
            }
        }
    }

    pub fn qos(&self) -> QoS {
        match self {
            Packet::Publish(p) => p.qos,
            _ => QoS::AtMostOnce,
        }
    }

    pub fn raw(&self) -> &BytesMut {
        match self {
            Packet::Connect(p) => &p.raw,
            Packet::ConnAck(p) => &p.raw,
            Packet::Publish(p) => &p.raw,
            Packet::PubAck(p) => &p.raw,
            Packet::PubRec(p) => &p.raw,
            Packet::PubRel(p) => &p.raw,
            Packet::PubComp(p) => &p.raw,
            Packet::Subscribe(p) => &p.raw,
            Packet::SubAck(p) => &p.raw,
            Packet::Unsubscribe(p) => &p.raw,
            Packet::UnsubAck(p) => &p.raw,
            Packet::PingReq(p) => &p.raw,
            Packet::PingResp(p) => &p.raw,
            Packet::Disconnect(p) => &p.raw,
        }
    }
}

/// Will message carried in a CONNECT packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNECT packet (client -> server)
#[derive(Debug, Clone)]
pub struct Connect {
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub will: Option<Will>,
    pub raw: BytesMut,
}

/// CONNACK packet (server -> client)
#[derive(Debug, Clone)]
pub struct ConnAck {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
    pub raw: BytesMut,
}

/// PUBLISH packet (bidirectional)
///
/// `topic` uses `Arc<str>` for cheap cloning during broker fan-out.
#[derive(Debug, Clone)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: Arc<str>,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
    pub raw: BytesMut,
}

/// PUBACK packet (bidirectional, QoS 1)
#[derive(Debug, Clone)]
pub struct PubAck {
    pub packet_id: u16,
    pub raw: BytesMut,
}

/// PUBREC packet (bidirectional, QoS 2 step 1)
#[derive(Debug, Clone)]
pub struct PubRec {
    pub packet_id: u16,
    pub raw: BytesMut,
}

/// PUBREL packet (bidirectional, QoS 2 step 2)
#[derive(Debug, Clone)]
pub struct PubRel {
    pub packet_id: u16,
    pub raw: BytesMut,
}

/// PUBCOMP packet (bidirectional, QoS 2 step 3)
#[derive(Debug, Clone)]
pub struct PubComp {
    pub packet_id: u16,
    pub raw: BytesMut,
}

/// A single topic filter + requested QoS within a SUBSCRIBE packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub filter: String,
    pub qos: QoS,
}

/// SUBSCRIBE packet (client -> server)
#[derive(Debug, Clone)]
pub struct Subscribe {
    pub packet_id: u16,
    pub subscriptions: Vec<Subscription>,
    pub raw: BytesMut,
}

/// SUBACK packet (server -> client)
#[derive(Debug, Clone)]
pub struct SubAck {
    pub packet_id: u16,
    pub results: Vec<SubscribeResult>,
    pub raw: BytesMut,
}

/// UNSUBSCRIBE packet (client -> server)
#[derive(Debug, Clone)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
    pub raw: BytesMut,
}

/// UNSUBACK packet (server -> client); MQTT 3.1 carries no payload
#[derive(Debug, Clone)]
pub struct UnsubAck {
    pub packet_id: u16,
    pub raw: BytesMut,
}

/// PINGREQ packet (client -> server)
#[derive(Debug, Clone, Default)]
pub struct PingReq {
    pub raw: BytesMut,
}

/// PINGRESP packet (server -> client)
#[derive(Debug, Clone, Default)]
pub struct PingResp {
    pub raw: BytesMut,
}

/// DISCONNECT packet (client -> server)
#[derive(Debug, Clone, Default)]
pub struct Disconnect {
    pub raw: BytesMut,
}
