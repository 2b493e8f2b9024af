//! Error types for mqttc.

use serde::Serialize;
use std::fmt;
use std::io;

use crate::types::ConnectReturnCode;

/// Result type alias for mqttc.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for mqttc operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Undecodable bytes on the wire. Fatal for the connection.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// A well-formed packet the broker must not send in the current phase.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Handshake refused, timed out or cancelled.
    #[error("connect failed: {0}")]
    ConnectFailed(ConnectFailure),

    /// Operation requires a connected session.
    #[error("not connected")]
    NotConnected,

    /// `connect` issued while a connection is active or in progress.
    #[error("already connected")]
    AlreadyConnected,

    /// No PINGRESP within the ping timeout.
    #[error("keep-alive timeout")]
    KeepAliveTimeout,

    /// Retry budget exhausted for a QoS 1/2 publish.
    #[error("delivery failed: packet {packet_id} unacknowledged after {attempts} attempts")]
    DeliveryFailed { packet_id: u16, attempts: u32 },

    /// Broker answered SUBSCRIBE with a failure return code.
    #[error("subscription rejected: {0}")]
    SubscriptionRejected(String),

    /// Invalid topic name or topic filter.
    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    /// Encoded packet would exceed the configured maximum.
    #[error("packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },

    /// Every packet identifier is in flight.
    #[error("no free packet identifier")]
    PacketIdsExhausted,

    /// Acknowledgment did not arrive in time.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Connection closed before the operation completed.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The session event loop is gone.
    #[error("session closed")]
    SessionClosed,

    /// A client was created outside a tokio runtime.
    #[error("no tokio runtime: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::MalformedPacket(e.to_string())
    }
}

/// Why a connection attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ConnectFailure {
    /// CONNACK carried a non-zero return code.
    Refused(ConnectReturnCode),
    /// No CONNACK within the connect timeout.
    Timeout,
    /// Disconnect requested while the handshake was in progress.
    Cancelled,
    /// Transport failed or the handshake was malformed.
    Transport(String),
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectFailure::Refused(code) => write!(f, "refused ({})", code),
            ConnectFailure::Timeout => write!(f, "no CONNACK before timeout"),
            ConnectFailure::Cancelled => write!(f, "cancelled"),
            ConnectFailure::Transport(reason) => write!(f, "{}", reason),
        }
    }
}

/// Wire codec errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Packet type nibble is 0 or 15.
    #[error("invalid packet type: {0}")]
    InvalidPacketType(u8),

    /// Reserved fixed-header flags do not match the packet type.
    #[error("invalid flags {flags:#04x} for packet type {packet_type}")]
    InvalidFlags { packet_type: u8, flags: u8 },

    /// QoS bits set to 3.
    #[error("invalid qos: {0}")]
    InvalidQoS(u8),

    /// Remaining length uses more than four bytes.
    #[error("malformed remaining length")]
    MalformedRemainingLength,

    /// Length fields inconsistent with the remaining length.
    #[error("inconsistent length: {0}")]
    InconsistentLength(&'static str),

    /// String is not valid UTF-8.
    #[error("invalid utf-8 string")]
    InvalidUtf8,

    /// Packet identifier 0 where a non-zero one is required.
    #[error("zero packet identifier")]
    ZeroPacketId,

    /// Unknown CONNACK return code.
    #[error("invalid connect return code: {0}")]
    InvalidConnectReturnCode(u8),

    /// Protocol name or level other than MQTT 3.1.1.
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// Packet violates a field-level rule.
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    /// Packet exceeds the maximum size.
    #[error("packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },

    /// String or binary field longer than 65535 bytes.
    #[error("field too long: {0} bytes")]
    FieldTooLong(usize),
}
