//! Broker-side [`Handler`] implementation
//!
//! Each accepted channel gets its own `BrokerHandler`, sharing a
//! [`super::BrokerState`] with every other channel on the broker for the
//! subscription table and cross-channel delivery. Per-client max-in-flight
//! enforcement happens in [`Handler::tick`]: publishes destined for this
//! client sit in its inbox until the channel's outstanding ackable count
//! (already tracked by [`ChannelCore`], counting both in-flight and
//! queued-but-undrained sends) has room, rather than handing them all to
//! `send` and letting the channel's write queue absorb them unbounded.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::{Auth, BrokerState};
use crate::channel::{BrokerRole, ChannelCore, ChannelError, Handler};
use crate::codec::Encoder;
use crate::protocol::{
    ConnAck, Connect, Disconnect, Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS, SubAck,
    Subscribe, SubscribeResult, Unsubscribe, UnsubAck,
};

pub struct BrokerHandler {
    state: Arc<BrokerState>,
    auth: Auth,
    max_inflight: Option<usize>,
    encoder: Encoder,
    next_packet_id: u16,
    client_id: Option<String>,
    inbox: Arc<Mutex<VecDeque<Publish>>>,
    /// QoS 2 publishes this client sent that have been PUBREC'd but not yet
    /// PUBREL'd; fan-out is deferred until the PUBREL confirms the sender's
    /// delivery obligation is satisfied.
    awaiting_rel: HashMap<u16, Publish>,
}

impl BrokerHandler {
    pub(crate) fn new(state: Arc<BrokerState>, auth: Auth, max_inflight: Option<usize>) -> Self {
        Self {
            state,
            auth,
            max_inflight,
            encoder: Encoder::new(),
            next_packet_id: 1,
            client_id: None,
            inbox: Arc::new(Mutex::new(VecDeque::new())),
            awaiting_rel: HashMap::new(),
        }
    }

    fn next_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1).max(1);
        id
    }
}

impl Handler<BrokerRole> for BrokerHandler {
    fn channel_opened(&mut self, core: &mut ChannelCore<BrokerRole>) {
        self.state.register(core.id(), self.inbox.clone());
    }

    fn channel_closed(&mut self, core: &mut ChannelCore<BrokerRole>, _cause: Option<&ChannelError>) {
        self.state.forget(core.id());
    }

    fn connect(&mut self, core: &mut ChannelCore<BrokerRole>, packet: &Connect) {
        self.client_id = Some(packet.client_id.clone());
        let return_code = self.auth.authorize(packet);
        debug!(client_id = %packet.client_id, %return_code, "connect");

        let mut ack = ConnAck {
            session_present: false,
            return_code,
            raw: Default::default(),
        };
        let _ = self.encoder.encode_connack(&mut ack);
        core.send(Packet::ConnAck(ack), None);
    }

    fn subscribe(&mut self, core: &mut ChannelCore<BrokerRole>, packet: &Subscribe) {
        let results: Vec<SubscribeResult> = packet
            .subscriptions
            .iter()
            .map(|s| SubscribeResult::GrantedQoS(s.qos.min(QoS::ExactlyOnce)))
            .collect();
        self.state
            .set_subscriptions(core.id(), packet.subscriptions.clone());

        let mut ack = SubAck {
            packet_id: packet.packet_id,
            results,
            raw: Default::default(),
        };
        let _ = self.encoder.encode_suback(&mut ack);
        core.send(Packet::SubAck(ack), None);
    }

    fn unsubscribe(&mut self, core: &mut ChannelCore<BrokerRole>, packet: &Unsubscribe) {
        self.state.remove_filters(core.id(), &packet.filters);

        let mut ack = UnsubAck {
            packet_id: packet.packet_id,
            raw: Default::default(),
        };
        let _ = self.encoder.encode_unsuback(&mut ack);
        core.send(Packet::UnsubAck(ack), None);
    }

    fn publish(&mut self, core: &mut ChannelCore<BrokerRole>, packet: &Publish) {
        match packet.qos {
            QoS::AtMostOnce => {
                self.state.fan_out(packet);
            }
            QoS::AtLeastOnce => {
                self.state.fan_out(packet);
                if let Some(packet_id) = packet.packet_id {
                    let mut ack = PubAck {
                        packet_id,
                        raw: Default::default(),
                    };
                    let _ = self.encoder.encode_puback(&mut ack);
                    core.send(Packet::PubAck(ack), None);
                }
            }
            QoS::ExactlyOnce => {
                if let Some(packet_id) = packet.packet_id {
                    self.awaiting_rel.insert(packet_id, packet.clone());
                    let mut ack = PubRec {
                        packet_id,
                        raw: Default::default(),
                    };
                    let _ = self.encoder.encode_pubrec(&mut ack);
                    core.send(Packet::PubRec(ack), None);
                }
            }
        }
    }

    fn pub_rel(&mut self, core: &mut ChannelCore<BrokerRole>, packet: &PubRel) {
        if let Some(publish) = self.awaiting_rel.remove(&packet.packet_id) {
            self.state.fan_out(&publish);
        }
        let mut comp = PubComp {
            packet_id: packet.packet_id,
            raw: Default::default(),
        };
        let _ = self.encoder.encode_pubcomp(&mut comp);
        core.send(Packet::PubComp(comp), None);
    }

    fn disconnect(&mut self, _core: &mut ChannelCore<BrokerRole>, _packet: &Disconnect) {}

    fn tick(&mut self, core: &mut ChannelCore<BrokerRole>) {
        loop {
            let ceiling_reached = match self.max_inflight {
                Some(limit) => core.outstanding_ackable_count() >= limit,
                None => false,
            };
            if ceiling_reached {
                break;
            }

            let next = {
                let mut inbox = self.inbox.lock().unwrap();
                inbox.pop_front()
            };
            let Some(mut publish) = next else { break };

            if publish.qos.is_ackable() {
                publish.packet_id = Some(self.next_packet_id());
            }
            let _ = self.encoder.encode_publish(&mut publish);
            core.send(Packet::Publish(publish), None);
        }
    }
}
