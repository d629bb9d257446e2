//! MQTT 3.1 codec tests

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;

use crate::codec::{Decoder, Encoder};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PubAck, Publish, QoS, Subscribe,
    SubscribeResult, Subscription, UnsubAck, Unsubscribe, Will,
};

fn decode_one(buf: &[u8]) -> Result<Packet, DecodeError> {
    let mut decoder = Decoder::new();
    match decoder.decode(buf)? {
        Some((packet, consumed)) => {
            assert_eq!(consumed, buf.len(), "decoder should consume the whole frame");
            Ok(packet)
        }
        None => Err(DecodeError::InsufficientData),
    }
}

#[test]
fn connect_minimal_round_trips() {
    let encoder = Encoder::new();
    let mut connect = Connect {
        client_id: "dev1".to_string(),
        clean_session: true,
        keep_alive: 60,
        username: None,
        password: None,
        will: None,
        raw: BytesMut::new(),
    };
    encoder.encode_connect(&mut connect).unwrap();

    let decoded = decode_one(&connect.raw).unwrap();
    match decoded {
        Packet::Connect(c) => {
            assert_eq!(c.client_id, "dev1");
            assert!(c.clean_session);
            assert_eq!(c.keep_alive, 60);
            assert!(c.username.is_none());
            assert!(c.will.is_none());
        }
        _ => panic!("expected Connect"),
    }
}

#[test]
fn connect_with_credentials_and_will() {
    let encoder = Encoder::new();
    let mut connect = Connect {
        client_id: "sensor-42".to_string(),
        clean_session: false,
        keep_alive: 30,
        username: Some("alice".to_string()),
        password: Some(Bytes::from_static(b"hunter2")),
        will: Some(Will {
            topic: "sensors/sensor-42/status".to_string(),
            payload: Bytes::from_static(b"offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
        raw: BytesMut::new(),
    };
    encoder.encode_connect(&mut connect).unwrap();

    let decoded = decode_one(&connect.raw).unwrap();
    match decoded {
        Packet::Connect(c) => {
            assert_eq!(c.username.as_deref(), Some("alice"));
            assert_eq!(c.password.as_deref(), Some(&b"hunter2"[..]));
            let will = c.will.unwrap();
            assert_eq!(will.topic, "sensors/sensor-42/status");
            assert_eq!(will.qos, QoS::AtLeastOnce);
            assert!(will.retain);
        }
        _ => panic!("expected Connect"),
    }
}

#[test]
fn connect_rejects_password_without_username() {
    // Build the raw bytes directly since the encoder always sets flags consistently.
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x10, 12]);
    buf.extend_from_slice(&[0x00, 0x04]);
    buf.extend_from_slice(b"MQTT");
    buf.extend_from_slice(&[0x04]);
    buf.extend_from_slice(&[0x40]); // password flag set, username flag clear
    buf.extend_from_slice(&[0x00, 0x3C]);
    buf.extend_from_slice(&[0x00, 0x00]); // empty client id

    let err = decode_one(&buf).unwrap_err();
    assert_eq!(err, DecodeError::InvalidFlags);
}

#[test]
fn connack_round_trips() {
    let encoder = Encoder::new();
    let mut connack = ConnAck {
        session_present: true,
        return_code: ConnectReturnCode::Accepted,
        raw: BytesMut::new(),
    };
    encoder.encode_connack(&mut connack).unwrap();
    assert_eq!(&connack.raw[..], &[0x20, 0x02, 0x01, 0x00]);

    let decoded = decode_one(&connack.raw).unwrap();
    match decoded {
        Packet::ConnAck(c) => {
            assert!(c.session_present);
            assert_eq!(c.return_code, ConnectReturnCode::Accepted);
        }
        _ => panic!("expected ConnAck"),
    }
}

#[test]
fn connack_not_authorized() {
    let encoder = Encoder::new();
    let mut connack = ConnAck {
        session_present: false,
        return_code: ConnectReturnCode::NotAuthorized,
        raw: BytesMut::new(),
    };
    encoder.encode_connack(&mut connack).unwrap();

    let decoded = decode_one(&connack.raw).unwrap();
    match decoded {
        Packet::ConnAck(c) => assert_eq!(c.return_code, ConnectReturnCode::NotAuthorized),
        _ => panic!("expected ConnAck"),
    }
}

#[test]
fn publish_qos0_round_trips() {
    let encoder = Encoder::new();
    let mut publish = Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: false,
        topic: std::sync::Arc::from("sensors/temp"),
        packet_id: None,
        payload: Bytes::from_static(b"21.5"),
        raw: BytesMut::new(),
    };
    encoder.encode_publish(&mut publish).unwrap();

    let decoded = decode_one(&publish.raw).unwrap();
    match decoded {
        Packet::Publish(p) => {
            assert_eq!(&*p.topic, "sensors/temp");
            assert_eq!(p.packet_id, None);
            assert_eq!(&p.payload[..], b"21.5");
        }
        _ => panic!("expected Publish"),
    }
}

#[test]
fn publish_qos1_carries_packet_id_and_dup() {
    let encoder = Encoder::new();
    let mut publish = Publish {
        dup: false,
        qos: QoS::AtLeastOnce,
        retain: false,
        topic: std::sync::Arc::from("a/b"),
        packet_id: Some(7),
        payload: Bytes::from_static(b"x"),
        raw: BytesMut::new(),
    };
    encoder.encode_publish(&mut publish).unwrap();

    let mut packet = Packet::Publish(publish);
    assert!(!packet.dup());
    packet.set_dup(true);
    assert!(packet.dup());
    assert_eq!(packet.raw()[0] & 0x08, 0x08);

    let decoded = decode_one(packet.raw()).unwrap();
    match decoded {
        Packet::Publish(p) => {
            assert!(p.dup);
            assert_eq!(p.packet_id, Some(7));
        }
        _ => panic!("expected Publish"),
    }
}

#[test]
fn publish_rejects_wildcard_topic() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x30, 7]);
    buf.extend_from_slice(&[0x00, 0x03]);
    buf.extend_from_slice(b"a/+");
    buf.extend_from_slice(b"hi");

    let err = decode_one(&buf).unwrap_err();
    assert!(matches!(err, DecodeError::MalformedPacket(_)));
}

#[test]
fn puback_round_trips() {
    let encoder = Encoder::new();
    let mut puback = PubAck {
        packet_id: 99,
        raw: BytesMut::new(),
    };
    encoder.encode_puback(&mut puback).unwrap();
    assert_eq!(&puback.raw[..], &[0x40, 0x02, 0x00, 0x63]);

    match decode_one(&puback.raw).unwrap() {
        Packet::PubAck(p) => assert_eq!(p.packet_id, 99),
        _ => panic!("expected PubAck"),
    }
}

#[test]
fn subscribe_suback_round_trip() {
    let encoder = Encoder::new();
    let mut subscribe = Subscribe {
        packet_id: 1,
        subscriptions: vec![
            Subscription {
                filter: "a/b".to_string(),
                qos: QoS::AtLeastOnce,
            },
            Subscription {
                filter: "c/#".to_string(),
                qos: QoS::ExactlyOnce,
            },
        ],
        raw: BytesMut::new(),
    };
    encoder.encode_subscribe(&mut subscribe).unwrap();
    assert_eq!(subscribe.raw[0], 0x82);

    match decode_one(&subscribe.raw).unwrap() {
        Packet::Subscribe(s) => {
            assert_eq!(s.packet_id, 1);
            assert_eq!(s.subscriptions.len(), 2);
            assert_eq!(s.subscriptions[0].qos, QoS::AtLeastOnce);
        }
        _ => panic!("expected Subscribe"),
    }

    let mut suback = crate::protocol::SubAck {
        packet_id: 1,
        results: vec![
            SubscribeResult::GrantedQoS(QoS::AtLeastOnce),
            SubscribeResult::Failure,
        ],
        raw: BytesMut::new(),
    };
    encoder.encode_suback(&mut suback).unwrap();
    assert_eq!(&suback.raw[..], &[0x90, 0x04, 0x00, 0x01, 0x01, 0x80]);
}

#[test]
fn unsubscribe_unsuback_round_trip() {
    let encoder = Encoder::new();
    let mut unsubscribe = Unsubscribe {
        packet_id: 5,
        filters: vec!["a/b".to_string()],
        raw: BytesMut::new(),
    };
    encoder.encode_unsubscribe(&mut unsubscribe).unwrap();

    match decode_one(&unsubscribe.raw).unwrap() {
        Packet::Unsubscribe(u) => {
            assert_eq!(u.packet_id, 5);
            assert_eq!(u.filters, vec!["a/b".to_string()]);
        }
        _ => panic!("expected Unsubscribe"),
    }

    let mut unsuback = UnsubAck {
        packet_id: 5,
        raw: BytesMut::new(),
    };
    encoder.encode_unsuback(&mut unsuback).unwrap();
    assert_eq!(&unsuback.raw[..], &[0xB0, 0x02, 0x00, 0x05]);
}

#[test]
fn pingreq_pingresp_disconnect_are_two_bytes() {
    let encoder = Encoder::new();

    let mut pingreq = crate::protocol::PingReq::default();
    encoder.encode_pingreq(&mut pingreq);
    assert_eq!(&pingreq.raw[..], &[0xC0, 0x00]);

    let mut pingresp = crate::protocol::PingResp::default();
    encoder.encode_pingresp(&mut pingresp);
    assert_eq!(&pingresp.raw[..], &[0xD0, 0x00]);

    let mut disconnect = crate::protocol::Disconnect::default();
    encoder.encode_disconnect(&mut disconnect);
    assert_eq!(&disconnect.raw[..], &[0xE0, 0x00]);
}

#[test]
fn decode_returns_none_on_partial_frame() {
    let mut decoder = Decoder::new();
    // A PUBLISH fixed header claiming 10 remaining bytes but only 3 supplied.
    let buf = [0x30u8, 10, 0x00, 0x01];
    assert!(decoder.decode(&buf).unwrap().is_none());
}

#[test]
fn decode_rejects_remaining_length_over_four_bytes() {
    let mut decoder = Decoder::new();
    let buf = [0x30u8, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
    let err = decoder.decode(&buf).unwrap_err();
    assert_eq!(err, DecodeError::InvalidRemainingLength);
}

#[test]
fn variable_int_round_trip() {
    use crate::codec::{read_variable_int, write_variable_int};
    for value in [0u32, 127, 128, 16_383, 16_384, 2_097_151, 2_097_152] {
        let mut buf = BytesMut::new();
        write_variable_int(&mut buf, value).unwrap();
        let (decoded, consumed) = read_variable_int(&buf).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, buf.len());
    }
}
