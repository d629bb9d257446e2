//! A non-blocking, per-connection channel engine for MQTT 3.1
//!
//! The engine is driven by readiness events from an outer selector loop
//! rather than an async runtime: callers push an explicit `now` timestamp
//! into [`channel::Channel::read`], [`channel::Channel::write`] and
//! [`channel::Channel::housekeep`], which keeps resend and keep-alive
//! scheduling deterministic and easy to test without a clock.

pub mod broker;
pub mod channel;
pub mod codec;
pub mod completion;
pub mod protocol;
pub mod selector;

pub use channel::{Channel, ChannelError, ChannelRole, Handler, Statistics};
pub use completion::{CompletionHandle, CompletionOutcome};
pub use protocol::{Packet, QoS};
pub use selector::SelectorLoop;
