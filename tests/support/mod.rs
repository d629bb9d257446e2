//! Shared plumbing for the end-to-end mock-broker scenarios: a minimal
//! blocking MQTT client built on the crate's own codec (no tokio, no third
//! party MQTT client), since the scenarios only need to drive a handful of
//! packets across a loopback socket.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use mqtt_channel_engine::codec::{Decoder, Encoder};
use mqtt_channel_engine::protocol::{
    Connect, Packet, PubAck, Publish, QoS, Subscribe, Subscription,
};

pub struct TestClient {
    stream: TcpStream,
    decoder: Decoder,
    buf: Vec<u8>,
}

impl TestClient {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect to mock broker");
        Self {
            stream,
            decoder: Decoder::new(),
            buf: Vec::new(),
        }
    }

    pub fn send(&mut self, packet: &Packet) {
        self.stream.write_all(packet.raw()).expect("write packet");
    }

    /// Blocks up to `timeout` for the next complete packet. Returns `None`
    /// on timeout or on a clean peer close.
    pub fn recv_within(&mut self, timeout: Duration) -> Option<Packet> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some((packet, consumed)) =
                self.decoder.decode(&self.buf).expect("decode response")
            {
                self.buf.drain(..consumed);
                return Some(packet);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            self.stream
                .set_read_timeout(Some(remaining))
                .expect("set read timeout");

            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk) {
                Ok(0) => return None,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return None
                }
                Err(e) => panic!("unexpected read error: {e}"),
            }
        }
    }

    /// Performs the CONNECT/CONNACK handshake and returns the return code.
    pub fn handshake(
        &mut self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> mqtt_channel_engine::protocol::ConnectReturnCode {
        self.send(&connect_packet(client_id, username, password));
        match self.recv_within(Duration::from_secs(5)) {
            Some(Packet::ConnAck(ack)) => ack.return_code,
            other => panic!("expected ConnAck, got {other:?}"),
        }
    }
}

pub fn connect_packet(client_id: &str, username: Option<&str>, password: Option<&str>) -> Packet {
    let mut connect = Connect {
        client_id: client_id.to_string(),
        clean_session: true,
        keep_alive: 60,
        username: username.map(str::to_string),
        password: password.map(|p| Bytes::from(p.to_string())),
        will: None,
        raw: BytesMut::new(),
    };
    Encoder::new().encode_connect(&mut connect).unwrap();
    Packet::Connect(Box::new(connect))
}

pub fn subscribe_packet(packet_id: u16, filter: &str, qos: QoS) -> Packet {
    let mut subscribe = Subscribe {
        packet_id,
        subscriptions: vec![Subscription {
            filter: filter.to_string(),
            qos,
        }],
        raw: BytesMut::new(),
    };
    Encoder::new().encode_subscribe(&mut subscribe).unwrap();
    Packet::Subscribe(subscribe)
}

pub fn publish_packet(topic: &str, payload: &[u8], qos: QoS, packet_id: Option<u16>) -> Packet {
    let mut publish = Publish {
        dup: false,
        qos,
        retain: false,
        topic: Arc::from(topic),
        packet_id,
        payload: Bytes::copy_from_slice(payload),
        raw: BytesMut::new(),
    };
    Encoder::new().encode_publish(&mut publish).unwrap();
    Packet::Publish(publish)
}

pub fn puback_packet(packet_id: u16) -> Packet {
    let mut puback = PubAck {
        packet_id,
        raw: BytesMut::new(),
    };
    Encoder::new().encode_puback(&mut puback).unwrap();
    Packet::PubAck(puback)
}
