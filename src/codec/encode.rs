//! MQTT 3.1 packet encoder

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int};
use crate::protocol::{
    ConnAck, Connect, Disconnect, EncodeError, Packet, PingReq, PingResp, PubAck, PubComp,
    PubRec, PubRel, Publish, QoS, SubAck, Subscribe, UnsubAck, Unsubscribe,
};

/// Encodes MQTT 3.1 control packets to their wire form
#[derive(Debug, Default)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encodes `packet` into `buf`, appending to whatever is already there.
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.extend_from_slice(packet.raw());
        Ok(())
    }

    pub fn encode_connect(&self, packet: &mut Connect) -> Result<(), EncodeError> {
        let mut remaining_length = 6 + 1 + 1 + 2; // "MQTT" len-prefixed + version + flags + keep_alive
        remaining_length += 2 + packet.client_id.len();

        if let Some(ref will) = packet.will {
            remaining_length += 2 + will.topic.len();
            remaining_length += 2 + will.payload.len();
        }
        if let Some(ref username) = packet.username {
            remaining_length += 2 + username.len();
        }
        if let Some(ref password) = packet.password {
            remaining_length += 2 + password.len();
        }

        let mut buf = BytesMut::new();
        buf.put_u8(0x10);
        write_variable_int(&mut buf, remaining_length as u32)?;

        write_string(&mut buf, "MQTT")?;
        buf.put_u8(4); // protocol level 4 = MQTT 3.1.1

        let mut connect_flags: u8 = 0;
        if packet.clean_session {
            connect_flags |= 0x02;
        }
        if let Some(ref will) = packet.will {
            connect_flags |= 0x04;
            connect_flags |= (will.qos as u8) << 3;
            if will.retain {
                connect_flags |= 0x20;
            }
        }
        if packet.password.is_some() {
            connect_flags |= 0x40;
        }
        if packet.username.is_some() {
            connect_flags |= 0x80;
        }
        buf.put_u8(connect_flags);
        buf.put_u16(packet.keep_alive);

        write_string(&mut buf, &packet.client_id)?;

        if let Some(ref will) = packet.will {
            write_string(&mut buf, &will.topic)?;
            write_binary(&mut buf, &will.payload)?;
        }
        if let Some(ref username) = packet.username {
            write_string(&mut buf, username)?;
        }
        if let Some(ref password) = packet.password {
            write_binary(&mut buf, password)?;
        }

        packet.raw = buf;
        Ok(())
    }

    pub fn encode_connack(&self, packet: &mut ConnAck) -> Result<(), EncodeError> {
        let mut buf = BytesMut::new();
        buf.put_u8(0x20);
        write_variable_int(&mut buf, 2)?;
        buf.put_u8(if packet.session_present { 0x01 } else { 0x00 });
        buf.put_u8(packet.return_code as u8);
        packet.raw = buf;
        Ok(())
    }

    pub fn encode_publish(&self, packet: &mut Publish) -> Result<(), EncodeError> {
        let mut remaining_length = 2 + packet.topic.len();
        if packet.qos != QoS::AtMostOnce {
            remaining_length += 2;
        }
        remaining_length += packet.payload.len();

        let mut buf = BytesMut::new();
        let mut first_byte: u8 = 0x30;
        if packet.dup {
            first_byte |= 0x08;
        }
        first_byte |= (packet.qos as u8) << 1;
        if packet.retain {
            first_byte |= 0x01;
        }
        buf.put_u8(first_byte);
        write_variable_int(&mut buf, remaining_length as u32)?;

        write_string(&mut buf, &packet.topic)?;
        if let Some(packet_id) = packet.packet_id {
            buf.put_u16(packet_id);
        }
        buf.put_slice(&packet.payload);

        packet.raw = buf;
        Ok(())
    }

    pub fn encode_puback(&self, packet: &mut PubAck) -> Result<(), EncodeError> {
        let mut buf = BytesMut::new();
        buf.put_u8(0x40);
        buf.put_u8(0x02);
        buf.put_u16(packet.packet_id);
        packet.raw = buf;
        Ok(())
    }

    pub fn encode_pubrec(&self, packet: &mut PubRec) -> Result<(), EncodeError> {
        let mut buf = BytesMut::new();
        buf.put_u8(0x50);
        buf.put_u8(0x02);
        buf.put_u16(packet.packet_id);
        packet.raw = buf;
        Ok(())
    }

    pub fn encode_pubrel(&self, packet: &mut PubRel) -> Result<(), EncodeError> {
        let mut buf = BytesMut::new();
        buf.put_u8(0x62); // PUBREL type with mandatory flags 0010
        buf.put_u8(0x02);
        buf.put_u16(packet.packet_id);
        packet.raw = buf;
        Ok(())
    }

    pub fn encode_pubcomp(&self, packet: &mut PubComp) -> Result<(), EncodeError> {
        let mut buf = BytesMut::new();
        buf.put_u8(0x70);
        buf.put_u8(0x02);
        buf.put_u16(packet.packet_id);
        packet.raw = buf;
        Ok(())
    }

    pub fn encode_subscribe(&self, packet: &mut Subscribe) -> Result<(), EncodeError> {
        let mut remaining_length = 2;
        for sub in &packet.subscriptions {
            remaining_length += 2 + sub.filter.len() + 1;
        }

        let mut buf = BytesMut::new();
        buf.put_u8(0x82); // SUBSCRIBE type with mandatory flags 0010
        write_variable_int(&mut buf, remaining_length as u32)?;
        buf.put_u16(packet.packet_id);
        for sub in &packet.subscriptions {
            write_string(&mut buf, &sub.filter)?;
            buf.put_u8(sub.qos as u8);
        }

        packet.raw = buf;
        Ok(())
    }

    pub fn encode_suback(&self, packet: &mut SubAck) -> Result<(), EncodeError> {
        let remaining_length = 2 + packet.results.len();

        let mut buf = BytesMut::new();
        buf.put_u8(0x90);
        write_variable_int(&mut buf, remaining_length as u32)?;
        buf.put_u16(packet.packet_id);
        for result in &packet.results {
            buf.put_u8(result.to_byte());
        }

        packet.raw = buf;
        Ok(())
    }

    pub fn encode_unsubscribe(&self, packet: &mut Unsubscribe) -> Result<(), EncodeError> {
        let mut remaining_length = 2;
        for filter in &packet.filters {
            remaining_length += 2 + filter.len();
        }

        let mut buf = BytesMut::new();
        buf.put_u8(0xA2); // UNSUBSCRIBE type with mandatory flags 0010
        write_variable_int(&mut buf, remaining_length as u32)?;
        buf.put_u16(packet.packet_id);
        for filter in &packet.filters {
            write_string(&mut buf, filter)?;
        }

        packet.raw = buf;
        Ok(())
    }

    pub fn encode_unsuback(&self, packet: &mut UnsubAck) -> Result<(), EncodeError> {
        let mut buf = BytesMut::new();
        buf.put_u8(0xB0);
        buf.put_u8(0x02);
        buf.put_u16(packet.packet_id);
        packet.raw = buf;
        Ok(())
    }

    pub fn encode_pingreq(&self, packet: &mut PingReq) {
        let mut buf = BytesMut::new();
        buf.put_u8(0xC0);
        buf.put_u8(0x00);
        packet.raw = buf;
    }

    pub fn encode_pingresp(&self, packet: &mut PingResp) {
        let mut buf = BytesMut::new();
        buf.put_u8(0xD0);
        buf.put_u8(0x00);
        packet.raw = buf;
    }

    pub fn encode_disconnect(&self, packet: &mut Disconnect) {
        let mut buf = BytesMut::new();
        buf.put_u8(0xE0);
        buf.put_u8(0x00);
        packet.raw = buf;
    }
}
