//! MQTT 3.1.1 wire protocol.
//!
//! Packet encoding and decoding plus a reassembling stream decoder for
//! byte streams that deliver frames in arbitrary chunks.

pub mod codec;
pub mod stream;
pub mod v4;

pub use stream::{read_packet, write_packet, StreamDecoder};
pub use v4::{
    ConnAck, Connect, Packet, Publish, SubAck, Subscribe, SubscribeFilter, SubscribeReturnCode,
    Unsubscribe, Will,
};

/// Maximum packet size (1MB default).
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Protocol name for MQTT.
pub const PROTOCOL_NAME: &[u8] = b"MQTT";

/// Protocol level for MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;
