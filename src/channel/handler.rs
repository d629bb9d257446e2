//! Upcall interface the channel makes into client/broker-specific logic

use crate::channel::{ChannelCore, ChannelError, ChannelRole};
use crate::protocol::{
    ConnAck, Connect, Disconnect, Packet, PubAck, PubComp, PubRec, PubRel, Publish, SubAck,
    Subscribe, UnsubAck, Unsubscribe,
};

/// Lifecycle and per-packet-type upcalls made by a [`crate::channel::Channel`].
///
/// Every method receives the channel's sendable state (`&mut ChannelCore<R>`)
/// rather than just an id, so a handler can reply in-line — e.g. answering a
/// Subscribe with a SubAck from inside `subscribe` — without a side channel
/// back into the selector loop.
///
/// Default no-op bodies are provided for every method: a handler only
/// overrides the ones it cares about. Handler exceptions are not caught by
/// the channel — a handler that cannot fail without poisoning the selector
/// loop should catch its own errors internally.
pub trait Handler<R: ChannelRole> {
    /// Called once per `housekeep` cycle, before resend/keep-alive run.
    /// Not part of the MQTT wire upcalls: it exists so a handler with
    /// state shared across channels (e.g. a broker fanning a publish out
    /// to other subscribers) has a place to push queued sends onto this
    /// channel without a back-reference into the selector loop.
    fn tick(&mut self, _core: &mut ChannelCore<R>) {}

    fn channel_opened(&mut self, _core: &mut ChannelCore<R>) {}
    fn channel_attached(&mut self, _core: &mut ChannelCore<R>) {}
    fn channel_detached(&mut self, _core: &mut ChannelCore<R>) {}
    fn channel_closed(&mut self, _core: &mut ChannelCore<R>, _cause: Option<&ChannelError>) {}
    fn message_sent(&mut self, _core: &mut ChannelCore<R>, _packet: &Packet) {}

    fn connect(&mut self, _core: &mut ChannelCore<R>, _packet: &Connect) {}
    fn conn_ack(&mut self, _core: &mut ChannelCore<R>, _packet: &ConnAck) {}
    fn publish(&mut self, _core: &mut ChannelCore<R>, _packet: &Publish) {}
    fn pub_ack(&mut self, _core: &mut ChannelCore<R>, _packet: &PubAck) {}
    fn pub_rec(&mut self, _core: &mut ChannelCore<R>, _packet: &PubRec) {}
    fn pub_rel(&mut self, _core: &mut ChannelCore<R>, _packet: &PubRel) {}
    fn pub_comp(&mut self, _core: &mut ChannelCore<R>, _packet: &PubComp) {}
    fn subscribe(&mut self, _core: &mut ChannelCore<R>, _packet: &Subscribe) {}
    fn sub_ack(&mut self, _core: &mut ChannelCore<R>, _packet: &SubAck) {}
    fn unsubscribe(&mut self, _core: &mut ChannelCore<R>, _packet: &Unsubscribe) {}
    fn unsub_ack(&mut self, _core: &mut ChannelCore<R>, _packet: &UnsubAck) {}
    fn disconnect(&mut self, _core: &mut ChannelCore<R>, _packet: &Disconnect) {}
}
