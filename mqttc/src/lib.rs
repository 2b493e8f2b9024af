//! MQTT 3.1.1 client session engine.
//!
//! This crate implements the client side of MQTT 3.1.1 from the wire up:
//!
//! - **Codec**: hand-written packet encoding/decoding with a streaming
//!   decoder for arbitrarily chunked input
//! - **Session**: sans-I/O state machine for the connection lifecycle,
//!   keep-alive supervision and pending acknowledgments
//! - **QoS**: packet identifier allocation and QoS 1/2 handshakes with
//!   exponential-backoff retransmission
//! - **Registry**: filter-indexed subscriptions with `+` / `#` matching
//! - **Client**: async facade over a single event-loop task
//!
//! The client does not open sockets. Hand [`Client::connect`] any ordered,
//! reliable byte stream (`TcpStream`, a TLS stream, an in-memory pipe).
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use mqttc::{Client, ClientConfig, Message, QoS};
//!
//! #[tokio::main]
//! async fn main() -> mqttc::Result<()> {
//!     let client = Client::new(ClientConfig::new("client-1"))?;
//!     client.connect(tokio::net::TcpStream::connect("127.0.0.1:1883").await?).await?;
//!
//!     client
//!         .subscribe("device/+/state", QoS::AtLeastOnce, |msg: &Message| {
//!             println!("{} -> {:?}", msg.topic, msg.payload);
//!         })
//!         .await?;
//!
//!     // Resolves when the broker acknowledges delivery.
//!     client.publish("device/gear-001/state", "on", QoS::AtLeastOnce).await?;
//!
//!     client.disconnect(Duration::from_secs(1)).await
//! }
//! ```

mod client;
mod config;
mod error;
pub mod events;
pub mod protocol;
pub mod qos;
pub mod registry;
pub mod session;
mod token;
pub mod topic;
pub mod transport;
pub mod trie;
mod types;

pub use client::Client;
pub use config::ClientConfig;
pub use error::{ConnectFailure, Error, ProtocolError, Result};
pub use events::{EventSink, JsonSink, SessionEvent, TracingSink};
pub use qos::RetryPolicy;
pub use session::{DisconnectReason, Phase, Status};
pub use token::Token;
pub use transport::Transport;
pub use types::{ConnectReturnCode, Handler, Message, PacketType, QoS};

#[cfg(test)]
mod tests;
