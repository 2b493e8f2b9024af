//! Structured session events.
//!
//! The session reports what it does through an injected [`EventSink`]
//! instead of writing to a global logger. [`TracingSink`] is the default
//! and forwards everything to `tracing`; [`JsonSink`] writes one JSON
//! object per line.

use std::io::Write;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::ConnectFailure;
use crate::session::DisconnectReason;
use crate::types::QoS;

/// Something observable happened in the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Connecting {
        client_id: String,
    },
    Connected {
        session_present: bool,
    },
    ConnectFailed {
        reason: ConnectFailure,
    },
    PingSent,
    PingResponse,
    KeepAliveTimeout,
    Retransmit {
        packet_id: u16,
        packet: &'static str,
        attempt: u32,
    },
    DeliveryFailed {
        packet_id: u16,
        attempts: u32,
    },
    Subscribed {
        filter: String,
        qos: QoS,
    },
    SubscriptionRejected {
        filter: String,
    },
    Unsubscribed {
        filter: String,
    },
    /// Inbound publish that no handler claimed.
    MessageDropped {
        topic: String,
    },
    /// A handler panicked while processing a publish on `topic`.
    HandlerPanicked {
        topic: String,
    },
    Disconnected {
        reason: DisconnectReason,
    },
}

/// Receiver for session events.
///
/// Called on the session loop and the dispatcher task, so implementations
/// must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &SessionEvent);
}

impl<F> EventSink for F
where
    F: Fn(&SessionEvent) + Send + Sync,
{
    fn emit(&self, event: &SessionEvent) {
        self(event)
    }
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &SessionEvent) {
        match event {
            SessionEvent::Connecting { client_id } => debug!("connecting as {}", client_id),
            SessionEvent::Connected { session_present } => {
                info!("connected (session present: {})", session_present)
            }
            SessionEvent::ConnectFailed { reason } => warn!("connect failed: {}", reason),
            SessionEvent::PingSent => debug!("PINGREQ sent"),
            SessionEvent::PingResponse => debug!("PINGRESP received"),
            SessionEvent::KeepAliveTimeout => warn!("keep-alive timeout"),
            SessionEvent::Retransmit { packet_id, packet, attempt } => {
                debug!("retransmitting {} {} (attempt {})", packet, packet_id, attempt)
            }
            SessionEvent::DeliveryFailed { packet_id, attempts } => {
                warn!("delivery of packet {} failed after {} attempts", packet_id, attempts)
            }
            SessionEvent::Subscribed { filter, qos } => debug!("subscribed to {} ({})", filter, qos),
            SessionEvent::SubscriptionRejected { filter } => {
                warn!("subscription to {} rejected", filter)
            }
            SessionEvent::Unsubscribed { filter } => debug!("unsubscribed from {}", filter),
            SessionEvent::MessageDropped { topic } => {
                debug!("no handler for {}, message dropped", topic)
            }
            SessionEvent::HandlerPanicked { topic } => {
                warn!("handler panicked on {}", topic)
            }
            SessionEvent::Disconnected { reason } => info!("disconnected: {}", reason),
        }
    }
}

/// Writes each event as a JSON line.
pub struct JsonSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> EventSink for JsonSink<W> {
    fn emit(&self, event: &SessionEvent) {
        let mut writer = self.writer.lock();
        let result = serde_json::to_writer(&mut *writer, event)
            .map_err(std::io::Error::from)
            .and_then(|()| writer.write_all(b"\n"));
        if let Err(e) = result {
            warn!("failed to write session event: {}", e);
        }
    }
}
