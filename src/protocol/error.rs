//! Protocol error types

use std::fmt;

/// Errors that can occur during packet decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough data in buffer to decode a complete packet yet
    InsufficientData,
    /// Invalid packet type
    InvalidPacketType(u8),
    /// Invalid remaining length encoding
    InvalidRemainingLength,
    /// Remaining length exceeds the 4-byte variable-length-integer maximum
    RemainingLengthTooLarge,
    /// Invalid protocol name in CONNECT
    InvalidProtocolName,
    /// Invalid protocol version in CONNECT
    InvalidProtocolVersion(u8),
    /// Invalid QoS value
    InvalidQoS(u8),
    /// Invalid UTF-8 string
    InvalidUtf8,
    /// String exceeds maximum length
    StringTooLong,
    /// Invalid packet flags for the given packet type
    InvalidFlags,
    /// Malformed packet
    MalformedPacket(&'static str),
    /// Packet too large
    PacketTooLarge,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "insufficient data in buffer"),
            Self::InvalidPacketType(t) => write!(f, "invalid packet type: {}", t),
            Self::InvalidRemainingLength => write!(f, "invalid remaining length encoding"),
            Self::RemainingLengthTooLarge => write!(f, "remaining length exceeds maximum"),
            Self::InvalidProtocolName => write!(f, "invalid protocol name"),
            Self::InvalidProtocolVersion(v) => write!(f, "invalid protocol version: {}", v),
            Self::InvalidQoS(q) => write!(f, "invalid QoS value: {}", q),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            Self::StringTooLong => write!(f, "string exceeds maximum length"),
            Self::InvalidFlags => write!(f, "invalid packet flags"),
            Self::MalformedPacket(msg) => write!(f, "malformed packet: {}", msg),
            Self::PacketTooLarge => write!(f, "packet too large"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors that can occur during packet encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Buffer too small
    BufferTooSmall,
    /// Packet too large
    PacketTooLarge,
    /// String too long
    StringTooLong,
    /// Invalid topic name
    InvalidTopicName,
    /// Too many subscriptions in one SUBSCRIBE/UNSUBSCRIBE packet
    TooManySubscriptions,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferTooSmall => write!(f, "buffer too small"),
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::StringTooLong => write!(f, "string too long"),
            Self::InvalidTopicName => write!(f, "invalid topic name"),
            Self::TooManySubscriptions => write!(f, "too many subscriptions"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// High-level protocol errors surfaced by the channel to its handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Decode error
    Decode(DecodeError),
    /// Encode error
    Encode(EncodeError),
    /// CONNECT was refused with the given CONNACK return code
    ConnectionRefused(u8),
    /// Protocol violation (out-of-order packet, unexpected type, etc.)
    ProtocolViolation(&'static str),
    /// Not authorized
    NotAuthorized,
    /// Keep alive timeout - no packet received within 1.5x the keep-alive interval
    KeepAliveTimeout,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "decode error: {}", e),
            Self::Encode(e) => write!(f, "encode error: {}", e),
            Self::ConnectionRefused(code) => write!(f, "connection refused: {}", code),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Self::NotAuthorized => write!(f, "not authorized"),
            Self::KeepAliveTimeout => write!(f, "keep alive timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<DecodeError> for ProtocolError {
    fn from(e: DecodeError) -> Self {
        ProtocolError::Decode(e)
    }
}

impl From<EncodeError> for ProtocolError {
    fn from(e: EncodeError) -> Self {
        ProtocolError::Encode(e)
    }
}
