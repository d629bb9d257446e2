//! MQTT 3.1 CONNACK return codes
//!
//! Based on the MQTT 3.1 connect return code table. Unlike MQTT 5, a 3.1
//! broker has no per-subscription or per-publish reason codes: SUBACK only
//! carries a granted QoS (or a failure marker) and PUBACK/PUBREC/PUBREL/
//! PUBCOMP carry no status at all beyond the packet id.

use std::fmt;

/// CONNACK return code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ConnectReturnCode {
    /// Connection accepted
    #[default]
    Accepted = 0x00,
    /// The server does not support the level of the MQTT protocol requested
    UnacceptableProtocolVersion = 0x01,
    /// The client identifier is correct UTF-8 but not allowed by the server
    IdentifierRejected = 0x02,
    /// The network connection has been made but the broker is unavailable
    ServerUnavailable = 0x03,
    /// The data in the user name or password is malformed
    BadCredentials = 0x04,
    /// The client is not authorized to connect
    NotAuthorized = 0x05,
}

impl ConnectReturnCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(Self::Accepted),
            0x01 => Some(Self::UnacceptableProtocolVersion),
            0x02 => Some(Self::IdentifierRejected),
            0x03 => Some(Self::ServerUnavailable),
            0x04 => Some(Self::BadCredentials),
            0x05 => Some(Self::NotAuthorized),
            _ => None,
        }
    }

    pub fn is_accepted(self) -> bool {
        matches!(self, Self::Accepted)
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => write!(f, "accepted"),
            Self::UnacceptableProtocolVersion => write!(f, "unacceptable protocol version"),
            Self::IdentifierRejected => write!(f, "identifier rejected"),
            Self::ServerUnavailable => write!(f, "server unavailable"),
            Self::BadCredentials => write!(f, "bad user name or password"),
            Self::NotAuthorized => write!(f, "not authorized"),
        }
    }
}

/// Granted QoS (or failure) for a single SUBSCRIBE filter, as carried in SUBACK
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscribeResult {
    GrantedQoS(super::QoS),
    Failure,
}

impl SubscribeResult {
    pub fn to_byte(self) -> u8 {
        match self {
            Self::GrantedQoS(qos) => qos as u8,
            Self::Failure => 0x80,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        if byte == 0x80 {
            Some(Self::Failure)
        } else {
            super::QoS::from_u8(byte).map(Self::GrantedQoS)
        }
    }
}
