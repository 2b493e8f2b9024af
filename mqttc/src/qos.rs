//! QoS 1/2 delivery bookkeeping.
//!
//! Tracks every publish whose acknowledgment handshake is still open,
//! allocates packet identifiers and schedules retransmissions with
//! exponential backoff. Pure state: the session feeds it acks and clock
//! readings and sends whatever packets it hands back.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::{Packet, Publish};
use crate::types::{Message, QoS};

// ============================================================================
// Packet identifiers
// ============================================================================

/// Packet identifier allocator.
///
/// Identifiers are non-zero and are not handed out again while in use.
/// Publishes, subscribes and unsubscribes share one allocator.
#[derive(Debug)]
pub struct PacketIdAllocator {
    next_id: u16,
    in_use: HashSet<u16>,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            in_use: HashSet::new(),
        }
    }

    /// Allocate the next free identifier, wrapping after 65535.
    pub fn allocate(&mut self) -> Result<u16> {
        let start = self.next_id;
        loop {
            let id = self.next_id;
            self.advance_next();
            if self.in_use.insert(id) {
                return Ok(id);
            }
            if self.next_id == start {
                return Err(Error::PacketIdsExhausted);
            }
        }
    }

    /// Release an identifier after its handshake completes.
    pub fn release(&mut self, id: u16) {
        self.in_use.remove(&id);
    }

    pub fn is_in_use(&self, id: u16) -> bool {
        self.in_use.contains(&id)
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    /// Forget every allocation.
    pub fn clear(&mut self) {
        self.in_use.clear();
        self.next_id = 1;
    }

    // Skip 0.
    fn advance_next(&mut self) {
        self.next_id = self.next_id.wrapping_add(1).max(1);
    }
}

// ============================================================================
// Retry policy
// ============================================================================

/// Retransmission schedule for unacknowledged packets.
///
/// The n-th retransmission waits `min(initial * 2^n, max)` after the
/// previous send. After `max_retries` retransmissions the next expiry fails
/// the delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_retries: 5,
        }
    }
}

impl RetryPolicy {
    pub fn new(initial: Duration, max: Duration, max_retries: u32) -> Self {
        Self { initial, max, max_retries }
    }

    /// Delay before the next send, given how many retransmissions happened.
    pub fn delay(&self, retries: u32) -> Duration {
        let factor = 1u32.checked_shl(retries).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

// ============================================================================
// In-flight messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Handshake step an in-flight message is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Outbound QoS 1, PUBLISH sent.
    AwaitPuback,
    /// Outbound QoS 2, PUBLISH sent.
    AwaitPubrec,
    /// Outbound QoS 2, PUBREL sent.
    AwaitPubcomp,
    /// Inbound QoS 2, PUBREC sent.
    AwaitPubrel,
}

/// A message whose QoS handshake is not complete.
#[derive(Debug, Clone)]
pub struct InFlightMessage {
    pub packet_id: u16,
    pub message: Message,
    pub direction: Direction,
    pub stage: Stage,
    /// Retransmissions of the current stage.
    pub retries: u32,
    pub last_sent: Instant,
}

impl InFlightMessage {
    /// When the current stage is due for retransmission.
    pub fn retry_at(&self, policy: &RetryPolicy) -> Instant {
        self.last_sent + policy.delay(self.retries)
    }

    fn packet(&self) -> Packet {
        match self.stage {
            Stage::AwaitPubcomp => Packet::PubRel(self.packet_id),
            _ => {
                let mut publish = publish_for(&self.message, self.packet_id);
                publish.dup = self.retries > 0;
                Packet::Publish(publish)
            }
        }
    }
}

fn publish_for(message: &Message, packet_id: u16) -> Publish {
    let mut publish = Publish::new(
        message.topic.clone(),
        message.payload.clone(),
        message.qos,
        packet_id,
    );
    publish.retain = message.retain;
    publish
}

/// Result of a retry pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retry {
    /// Send this packet again.
    Resend { packet: Packet, attempt: u32 },
    /// Budget exhausted; the entry has been dropped.
    Exhausted { packet_id: u16, attempts: u32 },
}

// ============================================================================
// Delivery manager
// ============================================================================

/// In-flight tables for both directions plus the identifier allocator.
#[derive(Debug)]
pub struct DeliveryManager {
    ids: PacketIdAllocator,
    outbound: BTreeMap<u16, InFlightMessage>,
    inbound: BTreeMap<u16, InFlightMessage>,
    policy: RetryPolicy,
}

impl DeliveryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            ids: PacketIdAllocator::new(),
            outbound: BTreeMap::new(),
            inbound: BTreeMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Reserve an identifier for SUBSCRIBE / UNSUBSCRIBE.
    pub fn allocate_id(&mut self) -> Result<u16> {
        self.ids.allocate()
    }

    pub fn release_id(&mut self, id: u16) {
        self.ids.release(id);
    }

    /// Start tracking an outbound QoS 1/2 publish and return its first PUBLISH.
    pub fn start_outbound(&mut self, message: Message, now: Instant) -> Result<Publish> {
        let stage = match message.qos {
            QoS::AtLeastOnce => Stage::AwaitPuback,
            QoS::ExactlyOnce => Stage::AwaitPubrec,
            QoS::AtMostOnce => return Ok(publish_for(&message, 0)),
        };
        let packet_id = self.ids.allocate()?;
        let publish = publish_for(&message, packet_id);
        self.outbound.insert(
            packet_id,
            InFlightMessage {
                packet_id,
                message,
                direction: Direction::Outbound,
                stage,
                retries: 0,
                last_sent: now,
            },
        );
        Ok(publish)
    }

    /// PUBACK arrived. Returns the completed message.
    pub fn handle_puback(&mut self, packet_id: u16) -> Option<InFlightMessage> {
        self.complete_outbound(packet_id, Stage::AwaitPuback)
    }

    /// PUBREC arrived. Returns the PUBREL to send.
    ///
    /// A repeated PUBREC while waiting for PUBCOMP is answered again.
    pub fn handle_pubrec(&mut self, packet_id: u16, now: Instant) -> Option<Packet> {
        let entry = self.outbound.get_mut(&packet_id)?;
        match entry.stage {
            Stage::AwaitPubrec => {
                entry.stage = Stage::AwaitPubcomp;
                entry.retries = 0;
                entry.last_sent = now;
                Some(Packet::PubRel(packet_id))
            }
            Stage::AwaitPubcomp => {
                entry.last_sent = now;
                Some(Packet::PubRel(packet_id))
            }
            _ => {
                debug!("PUBREC for packet {} in stage {:?}", packet_id, entry.stage);
                None
            }
        }
    }

    /// PUBCOMP arrived. Returns the completed message.
    pub fn handle_pubcomp(&mut self, packet_id: u16) -> Option<InFlightMessage> {
        self.complete_outbound(packet_id, Stage::AwaitPubcomp)
    }

    fn complete_outbound(&mut self, packet_id: u16, expected: Stage) -> Option<InFlightMessage> {
        match self.outbound.get(&packet_id) {
            Some(entry) if entry.stage == expected => {}
            Some(entry) => {
                debug!("ack for packet {} in stage {:?} ignored", packet_id, entry.stage);
                return None;
            }
            None => return None,
        }
        self.ids.release(packet_id);
        self.outbound.remove(&packet_id)
    }

    /// Record an inbound QoS 2 publish.
    ///
    /// Returns false for a duplicate of a message still awaiting PUBREL.
    pub fn receive_qos2(&mut self, publish: &Publish, now: Instant) -> bool {
        if self.inbound.contains_key(&publish.pkid) {
            trace!("duplicate QoS 2 publish {}", publish.pkid);
            return false;
        }
        self.inbound.insert(
            publish.pkid,
            InFlightMessage {
                packet_id: publish.pkid,
                message: Message {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    qos: publish.qos,
                    retain: publish.retain,
                    dup: publish.dup,
                },
                direction: Direction::Inbound,
                stage: Stage::AwaitPubrel,
                retries: 0,
                last_sent: now,
            },
        );
        true
    }

    /// PUBREL arrived. Returns the message to dispatch, if it was pending.
    pub fn release_inbound(&mut self, packet_id: u16) -> Option<Message> {
        self.inbound.remove(&packet_id).map(|entry| entry.message)
    }

    /// Earliest retransmission deadline.
    pub fn next_retry(&self) -> Option<Instant> {
        self.outbound.values().map(|m| m.retry_at(&self.policy)).min()
    }

    /// Retransmit or fail every outbound entry that is due at `now`.
    pub fn poll_retries(&mut self, now: Instant) -> Vec<Retry> {
        let due: Vec<u16> = self
            .outbound
            .values()
            .filter(|m| m.retry_at(&self.policy) <= now)
            .map(|m| m.packet_id)
            .collect();

        let mut out = Vec::with_capacity(due.len());
        for packet_id in due {
            let Some(entry) = self.outbound.get_mut(&packet_id) else {
                continue;
            };
            if entry.retries >= self.policy.max_retries {
                let attempts = entry.retries + 1;
                self.outbound.remove(&packet_id);
                self.ids.release(packet_id);
                out.push(Retry::Exhausted { packet_id, attempts });
                continue;
            }
            entry.retries += 1;
            entry.last_sent = now;
            out.push(Retry::Resend {
                packet: entry.packet(),
                attempt: entry.retries + 1,
            });
        }
        out
    }

    pub fn outbound(&self, packet_id: u16) -> Option<&InFlightMessage> {
        self.outbound.get(&packet_id)
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    /// Drop all in-flight state, returning the outbound identifiers dropped.
    pub fn clear(&mut self) -> Vec<u16> {
        let ids = self.outbound.keys().copied().collect();
        self.outbound.clear();
        self.inbound.clear();
        self.ids.clear();
        ids
    }
}
