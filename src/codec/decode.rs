//! MQTT 3.1 packet decoder

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use super::{read_binary, read_string, read_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Disconnect, Packet, PingReq, PingResp,
    PubAck, PubComp, PubRec, PubRel, Publish, QoS, SubAck, Subscribe, SubscribeResult,
    Subscription, UnsubAck, Unsubscribe, Will,
};

/// Decodes a stream of MQTT 3.1 control packets out of an accumulating buffer
#[derive(Debug, Default)]
pub struct Decoder {
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    /// Decodes a single packet from the front of `buf`.
    /// Returns `(packet, bytes_consumed)` or `None` if the buffer doesn't yet
    /// hold a complete packet.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let payload_start = 1 + len_bytes;
        let payload = &buf[payload_start..total_len];
        let raw = BytesMut::from(&buf[..total_len]);

        let packet = match packet_type {
            1 => decode_connect(payload, raw)?,
            2 => decode_connack(flags, payload, raw)?,
            3 => decode_publish(flags, payload, raw)?,
            4 => decode_puback(flags, payload, raw)?,
            5 => decode_pubrec(flags, payload, raw)?,
            6 => decode_pubrel(flags, payload, raw)?,
            7 => decode_pubcomp(flags, payload, raw)?,
            8 => decode_subscribe(flags, payload, raw)?,
            9 => decode_suback(flags, payload, raw)?,
            10 => decode_unsubscribe(flags, payload, raw)?,
            11 => decode_unsuback(flags, payload, raw)?,
            12 => {
                if flags != 0 {
                    return Err(DecodeError::InvalidFlags);
                }
                Packet::PingReq(PingReq { raw })
            }
            13 => {
                if flags != 0 {
                    return Err(DecodeError::InvalidFlags);
                }
                Packet::PingResp(PingResp { raw })
            }
            14 => decode_disconnect(flags, payload, raw)?,
            _ => return Err(DecodeError::InvalidPacketType(packet_type)),
        };

        Ok(Some((packet, total_len)))
    }
}

fn decode_connect(payload: &[u8], raw: BytesMut) -> Result<Packet, DecodeError> {
    let mut pos = 0;

    let (protocol_name, len) = read_string(&payload[pos..])?;
    pos += len;
    if protocol_name != "MQTT" && protocol_name != "MQIsdp" {
        return Err(DecodeError::InvalidProtocolName);
    }

    if pos >= payload.len() {
        return Err(DecodeError::InsufficientData);
    }
    let version_byte = payload[pos];
    pos += 1;
    if version_byte != 3 && version_byte != 4 {
        return Err(DecodeError::InvalidProtocolVersion(version_byte));
    }

    if pos >= payload.len() {
        return Err(DecodeError::InsufficientData);
    }
    let connect_flags = payload[pos];
    pos += 1;

    if (connect_flags & 0x01) != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let clean_session = (connect_flags & 0x02) != 0;
    let will_flag = (connect_flags & 0x04) != 0;
    let will_qos = (connect_flags >> 3) & 0x03;
    let will_retain = (connect_flags & 0x20) != 0;
    let password_flag = (connect_flags & 0x40) != 0;
    let username_flag = (connect_flags & 0x80) != 0;

    if !username_flag && password_flag {
        return Err(DecodeError::InvalidFlags);
    }
    if will_qos > 2 {
        return Err(DecodeError::InvalidQoS(will_qos));
    }
    if !will_flag && (will_qos != 0 || will_retain) {
        return Err(DecodeError::InvalidFlags);
    }

    if pos + 2 > payload.len() {
        return Err(DecodeError::InsufficientData);
    }
    let keep_alive = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
    pos += 2;

    let (client_id, len) = read_string(&payload[pos..])?;
    pos += len;

    let will = if will_flag {
        let (will_topic, len) = read_string(&payload[pos..])?;
        pos += len;
        let (will_payload, len) = read_binary(&payload[pos..])?;
        pos += len;

        Some(Will {
            topic: will_topic.to_string(),
            payload: Bytes::copy_from_slice(will_payload),
            qos: QoS::from_u8(will_qos).unwrap(),
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        let (s, len) = read_string(&payload[pos..])?;
        pos += len;
        Some(s.to_string())
    } else {
        None
    };

    let password = if password_flag {
        let (data, _len) = read_binary(&payload[pos..])?;
        Some(Bytes::copy_from_slice(data))
    } else {
        None
    };

    Ok(Packet::Connect(Box::new(Connect {
        client_id: client_id.to_string(),
        clean_session,
        keep_alive,
        username,
        password,
        will,
        raw,
    })))
}

fn decode_connack(flags: u8, payload: &[u8], raw: BytesMut) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if payload.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }

    let acknowledge_flags = payload[0];
    if (acknowledge_flags & 0xFE) != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    let session_present = (acknowledge_flags & 0x01) != 0;
    let return_code = ConnectReturnCode::from_u8(payload[1])
        .ok_or(DecodeError::MalformedPacket("invalid CONNACK return code"))?;

    Ok(Packet::ConnAck(ConnAck {
        session_present,
        return_code,
        raw,
    }))
}

fn decode_publish(flags: u8, payload: &[u8], raw: BytesMut) -> Result<Packet, DecodeError> {
    let dup = (flags & 0x08) != 0;
    let qos_bits = (flags >> 1) & 0x03;
    let retain = (flags & 0x01) != 0;
    let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

    if qos == QoS::AtMostOnce && dup {
        return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
    }

    let mut pos = 0;
    let (topic, len) = read_string(&payload[pos..])?;
    pos += len;
    if topic.contains('+') || topic.contains('#') {
        return Err(DecodeError::MalformedPacket("topic contains wildcard"));
    }

    let packet_id = if qos != QoS::AtMostOnce {
        if pos + 2 > payload.len() {
            return Err(DecodeError::InsufficientData);
        }
        let id = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
        if id == 0 {
            return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
        }
        pos += 2;
        Some(id)
    } else {
        None
    };

    let message_payload = Bytes::copy_from_slice(&payload[pos..]);

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic: Arc::from(topic),
        packet_id,
        payload: message_payload,
        raw,
    }))
}

fn decode_puback(flags: u8, payload: &[u8], raw: BytesMut) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if payload.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }
    let packet_id = u16::from_be_bytes([payload[0], payload[1]]);
    Ok(Packet::PubAck(PubAck { packet_id, raw }))
}

fn decode_pubrec(flags: u8, payload: &[u8], raw: BytesMut) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if payload.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }
    let packet_id = u16::from_be_bytes([payload[0], payload[1]]);
    Ok(Packet::PubRec(PubRec { packet_id, raw }))
}

fn decode_pubrel(flags: u8, payload: &[u8], raw: BytesMut) -> Result<Packet, DecodeError> {
    if flags != 0x02 {
        return Err(DecodeError::InvalidFlags);
    }
    if payload.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }
    let packet_id = u16::from_be_bytes([payload[0], payload[1]]);
    Ok(Packet::PubRel(PubRel { packet_id, raw }))
}

fn decode_pubcomp(flags: u8, payload: &[u8], raw: BytesMut) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if payload.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }
    let packet_id = u16::from_be_bytes([payload[0], payload[1]]);
    Ok(Packet::PubComp(PubComp { packet_id, raw }))
}

fn decode_subscribe(flags: u8, payload: &[u8], raw: BytesMut) -> Result<Packet, DecodeError> {
    if flags != 0x02 {
        return Err(DecodeError::InvalidFlags);
    }
    if payload.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }

    let packet_id = u16::from_be_bytes([payload[0], payload[1]]);
    if packet_id == 0 {
        return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
    }

    let mut pos = 2;
    let mut subscriptions = Vec::new();
    while pos < payload.len() {
        let (filter, len) = read_string(&payload[pos..])?;
        pos += len;
        if filter.is_empty() {
            return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
        }
        if pos >= payload.len() {
            return Err(DecodeError::InsufficientData);
        }
        let qos_byte = payload[pos];
        pos += 1;
        let qos = QoS::from_u8(qos_byte & 0x03).ok_or(DecodeError::InvalidQoS(qos_byte & 0x03))?;

        subscriptions.push(Subscription {
            filter: filter.to_string(),
            qos,
        });
    }

    if subscriptions.is_empty() {
        return Err(DecodeError::MalformedPacket(
            "SUBSCRIBE must have at least one topic",
        ));
    }

    Ok(Packet::Subscribe(Subscribe {
        packet_id,
        subscriptions,
        raw,
    }))
}

fn decode_suback(flags: u8, payload: &[u8], raw: BytesMut) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if payload.len() < 3 {
        return Err(DecodeError::InsufficientData);
    }

    let packet_id = u16::from_be_bytes([payload[0], payload[1]]);
    let mut results = Vec::new();
    for &byte in &payload[2..] {
        let result = SubscribeResult::from_byte(byte)
            .ok_or(DecodeError::MalformedPacket("invalid SUBACK return code"))?;
        results.push(result);
    }

    Ok(Packet::SubAck(SubAck {
        packet_id,
        results,
        raw,
    }))
}

fn decode_unsubscribe(flags: u8, payload: &[u8], raw: BytesMut) -> Result<Packet, DecodeError> {
    if flags != 0x02 {
        return Err(DecodeError::InvalidFlags);
    }
    if payload.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }

    let packet_id = u16::from_be_bytes([payload[0], payload[1]]);
    if packet_id == 0 {
        return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
    }

    let mut pos = 2;
    let mut filters = Vec::new();
    while pos < payload.len() {
        let (filter, len) = read_string(&payload[pos..])?;
        pos += len;
        if filter.is_empty() {
            return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
        }
        filters.push(filter.to_string());
    }

    if filters.is_empty() {
        return Err(DecodeError::MalformedPacket(
            "UNSUBSCRIBE must have at least one topic",
        ));
    }

    Ok(Packet::Unsubscribe(Unsubscribe {
        packet_id,
        filters,
        raw,
    }))
}

fn decode_unsuback(flags: u8, payload: &[u8], raw: BytesMut) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if payload.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }
    let packet_id = u16::from_be_bytes([payload[0], payload[1]]);
    Ok(Packet::UnsubAck(UnsubAck { packet_id, raw }))
}

fn decode_disconnect(flags: u8, payload: &[u8], raw: BytesMut) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if !payload.is_empty() {
        return Err(DecodeError::MalformedPacket("DISCONNECT has no payload"));
    }
    Ok(Packet::Disconnect(Disconnect { raw }))
}
