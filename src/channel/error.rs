//! Channel-level errors
//!
//! Mirrors the hand-rolled error style used in the protocol module: a plain
//! enum, a manual `Display`, and `From` conversions from the lower-level
//! codec errors so `?` composes across decode/encode and I/O.

use std::fmt;
use std::io;

use crate::protocol::{DecodeError, EncodeError};

/// The cause a channel closes with, and the failure a pending completion
/// handle is resolved with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The underlying socket returned an I/O error
    Io(String),
    /// A frame could not be decoded
    Decode(DecodeError),
    /// A packet could not be encoded
    Encode(EncodeError),
    /// The peer closed the connection (clean EOF)
    PeerClosed,
    /// No activity was observed within 1.5x the negotiated keep-alive interval
    KeepAliveTimeout,
    /// CONNECT was refused by the peer
    NotAuthorized,
    /// A channel was registered while already registered with a selector
    AlreadyRegistered,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "I/O error: {msg}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::PeerClosed => write!(f, "peer closed the connection"),
            Self::KeepAliveTimeout => write!(f, "keep alive timeout"),
            Self::NotAuthorized => write!(f, "not authorized"),
            Self::AlreadyRegistered => write!(f, "channel already registered"),
        }
    }
}

impl std::error::Error for ChannelError {}

impl From<DecodeError> for ChannelError {
    fn from(e: DecodeError) -> Self {
        ChannelError::Decode(e)
    }
}

impl From<EncodeError> for ChannelError {
    fn from(e: EncodeError) -> Self {
        ChannelError::Encode(e)
    }
}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        ChannelError::Io(e.to_string())
    }
}
