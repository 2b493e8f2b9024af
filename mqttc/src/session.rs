//! MQTT session state machine.
//!
//! The session owns connection phase, keep-alive deadlines, pending
//! acknowledgments and the subscription registry. It never touches a
//! socket: callers feed it inbound packets and clock readings, then drain
//! the packets it wants written ([`Session::poll_outgoing`]) and the
//! messages it wants dispatched ([`Session::poll_delivery`]).

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::ClientConfig;
use crate::error::{ConnectFailure, Error, ProtocolError, Result};
use crate::events::{EventSink, SessionEvent};
use crate::protocol::{
    ConnAck, Connect, Packet, Publish, SubAck, Subscribe, SubscribeFilter, SubscribeReturnCode,
    Unsubscribe,
};
use crate::qos::{DeliveryManager, Retry};
use crate::registry::SubscriptionRegistry;
use crate::token::Completer;
use crate::topic::{validate_filter, validate_topic};
use crate::types::{ConnectReturnCode, Handler, Message, QoS};

/// Connection phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Why the last connection ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DisconnectReason {
    /// `disconnect` was called.
    Requested,
    /// The handshake did not complete.
    ConnectFailed(ConnectFailure),
    /// No PINGRESP within the ping timeout.
    KeepAliveTimeout,
    /// The broker sent undecodable bytes.
    MalformedPacket(String),
    /// The broker sent a packet it must not send.
    ProtocolViolation(String),
    /// The transport closed or failed.
    ConnectionLost(String),
}

impl DisconnectReason {
    /// Error handed to every operation still pending at teardown.
    pub fn to_error(&self) -> Error {
        match self {
            DisconnectReason::Requested => {
                Error::ConnectionClosed("disconnect requested".to_string())
            }
            DisconnectReason::ConnectFailed(failure) => Error::ConnectFailed(failure.clone()),
            DisconnectReason::KeepAliveTimeout => Error::KeepAliveTimeout,
            DisconnectReason::MalformedPacket(detail) => Error::MalformedPacket(detail.clone()),
            DisconnectReason::ProtocolViolation(detail) => {
                Error::ProtocolViolation(detail.clone())
            }
            DisconnectReason::ConnectionLost(detail) => Error::ConnectionClosed(detail.clone()),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Requested => f.write_str("requested"),
            DisconnectReason::ConnectFailed(failure) => write!(f, "connect failed: {}", failure),
            DisconnectReason::KeepAliveTimeout => f.write_str("keep-alive timeout"),
            DisconnectReason::MalformedPacket(detail) => write!(f, "malformed packet: {}", detail),
            DisconnectReason::ProtocolViolation(detail) => {
                write!(f, "protocol violation: {}", detail)
            }
            DisconnectReason::ConnectionLost(detail) => write!(f, "connection lost: {}", detail),
        }
    }
}

/// Snapshot published to status watchers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub phase: Phase,
    pub last_disconnect: Option<DisconnectReason>,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            phase: Phase::Disconnected,
            last_disconnect: None,
        }
    }
}

/// Per-connection state.
#[derive(Debug)]
pub struct Connection {
    pub phase: Phase,
    pub client_id: String,
    pub keep_alive: Option<Duration>,
    /// When the last packet was handed to the transport.
    pub last_sent: Option<Instant>,
    /// Set while a PINGREQ is unanswered.
    pub ping_deadline: Option<Instant>,
    /// Set while waiting for CONNACK.
    pub connect_deadline: Option<Instant>,
    /// Set while a graceful disconnect is flushing.
    pub disconnect_deadline: Option<Instant>,
}

impl Connection {
    fn new(config: &ClientConfig) -> Self {
        Self {
            phase: Phase::Disconnected,
            client_id: config.client_id.clone(),
            keep_alive: config.keep_alive_interval(),
            last_sent: None,
            ping_deadline: None,
            connect_deadline: None,
            disconnect_deadline: None,
        }
    }

    /// When the keep-alive machinery next needs attention.
    fn keep_alive_deadline(&self) -> Option<Instant> {
        if self.phase != Phase::Connected {
            return None;
        }
        if self.ping_deadline.is_some() {
            return self.ping_deadline;
        }
        Some(self.last_sent? + self.keep_alive?)
    }
}

/// A packet queued for the transport.
#[derive(Debug)]
pub struct Outgoing {
    pub packet: Packet,
    /// Resolved once the packet is written (QoS 0 publishes).
    sent: Option<Completer<()>>,
}

impl Outgoing {
    /// Report the write result to whoever is waiting on it.
    pub fn complete(self, result: Result<()>) {
        if let Some(done) = self.sent {
            done.complete(result);
        }
    }
}

/// An inbound message and the handlers it must reach.
pub struct Delivery {
    pub message: Message,
    pub handlers: Vec<Arc<dyn Handler>>,
    events: Arc<dyn EventSink>,
}

impl Delivery {
    /// Invoke every handler in order.
    ///
    /// A panicking handler is reported as [`SessionEvent::HandlerPanicked`]
    /// and does not keep the remaining handlers from running. Returns the
    /// number of handlers that completed.
    pub fn dispatch(&self) -> usize {
        let mut completed = 0;
        for handler in &self.handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&self.message))) {
                Ok(()) => completed += 1,
                Err(_) => self.events.emit(&SessionEvent::HandlerPanicked {
                    topic: self.message.topic.clone(),
                }),
            }
        }
        completed
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

struct PendingSubscribe {
    filter: String,
    handler: Option<Arc<dyn Handler>>,
    deadline: Instant,
    done: Completer<QoS>,
}

struct PendingUnsubscribe {
    filter: String,
    deadline: Instant,
    done: Completer<()>,
}

/// Sans-I/O MQTT 3.1.1 client session.
pub struct Session {
    config: ClientConfig,
    conn: Connection,
    qos: DeliveryManager,
    registry: SubscriptionRegistry,
    events: Arc<dyn EventSink>,
    outbox: VecDeque<Outgoing>,
    deliveries: VecDeque<Delivery>,
    last_disconnect: Option<DisconnectReason>,
    connect_waiter: Option<Completer<bool>>,
    disconnect_waiters: Vec<Completer<()>>,
    publishes: HashMap<u16, Completer<()>>,
    subscribes: HashMap<u16, PendingSubscribe>,
    unsubscribes: HashMap<u16, PendingUnsubscribe>,
}

impl Session {
    pub fn new(config: ClientConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            conn: Connection::new(&config),
            qos: DeliveryManager::new(config.retry),
            registry: SubscriptionRegistry::new(),
            events,
            outbox: VecDeque::new(),
            deliveries: VecDeque::new(),
            last_disconnect: None,
            connect_waiter: None,
            disconnect_waiters: Vec::new(),
            publishes: HashMap::new(),
            subscribes: HashMap::new(),
            unsubscribes: HashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.conn.phase
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn status(&self) -> Status {
        Status {
            phase: self.conn.phase,
            last_disconnect: self.last_disconnect.clone(),
        }
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn delivery_manager(&self) -> &DeliveryManager {
        &self.qos
    }

    // ------------------------------------------------------------------
    // Caller operations
    // ------------------------------------------------------------------

    /// Start the handshake on a fresh transport.
    ///
    /// Returns false (and fails `done`) unless the session is disconnected;
    /// the caller must then discard the transport.
    pub(crate) fn connect(&mut self, now: Instant, done: Completer<bool>) -> bool {
        if self.conn.phase != Phase::Disconnected {
            done.complete(Err(Error::AlreadyConnected));
            return false;
        }

        let packet = Packet::Connect(Connect {
            client_id: self.config.client_id.clone(),
            keep_alive: self.config.keep_alive,
            clean_session: self.config.clean_session,
            username: self.config.username.clone(),
            password: self.config.password.clone(),
            will: self.config.will.clone(),
        });

        self.conn = Connection::new(&self.config);
        self.conn.phase = Phase::Connecting;
        self.conn.connect_deadline = Some(now + self.config.connect_timeout);
        self.connect_waiter = Some(done);
        self.events.emit(&SessionEvent::Connecting {
            client_id: self.config.client_id.clone(),
        });
        self.send(now, packet);
        true
    }

    /// Queue a publish. QoS 0 completes once written, QoS 1/2 on the final ack.
    pub(crate) fn publish(&mut self, now: Instant, message: Message, done: Completer<()>) {
        if self.conn.phase != Phase::Connected {
            return done.complete(Err(Error::NotConnected));
        }
        if let Err(e) = validate_topic(&message.topic) {
            return done.complete(Err(e));
        }
        match Packet::Publish(Publish::new(message.topic.as_str(), message.payload.clone(), message.qos, 1))
            .size()
        {
            Ok(size) if size <= self.config.max_packet_size => {}
            Ok(size) => {
                return done.complete(Err(Error::PacketTooLarge {
                    size,
                    max: self.config.max_packet_size,
                }));
            }
            Err(e) => return done.complete(Err(e.into())),
        }

        if message.qos == QoS::AtMostOnce {
            let mut publish = Publish::new(message.topic, message.payload, QoS::AtMostOnce, 0);
            publish.retain = message.retain;
            self.send_with(now, Packet::Publish(publish), Some(done));
            return;
        }

        match self.qos.start_outbound(message, now) {
            Ok(publish) => {
                trace!("publish {} to {} ({})", publish.pkid, publish.topic, publish.qos);
                self.publishes.insert(publish.pkid, done);
                self.send(now, Packet::Publish(publish));
            }
            Err(e) => done.complete(Err(e)),
        }
    }

    /// Queue a SUBSCRIBE. The handler is registered when SUBACK grants it;
    /// without one, matching publishes go to the default handler.
    pub(crate) fn subscribe(
        &mut self,
        now: Instant,
        filter: String,
        qos: QoS,
        handler: Option<Arc<dyn Handler>>,
        done: Completer<QoS>,
    ) {
        if self.conn.phase != Phase::Connected {
            return done.complete(Err(Error::NotConnected));
        }
        if let Err(e) = validate_filter(&filter) {
            return done.complete(Err(e));
        }
        let pkid = match self.qos.allocate_id() {
            Ok(pkid) => pkid,
            Err(e) => return done.complete(Err(e)),
        };

        let packet = Packet::Subscribe(Subscribe {
            pkid,
            filters: vec![SubscribeFilter { path: filter.clone(), qos }],
        });
        self.subscribes.insert(
            pkid,
            PendingSubscribe {
                filter,
                handler,
                deadline: now + self.config.ack_timeout,
                done,
            },
        );
        self.send(now, packet);
    }

    /// Queue an UNSUBSCRIBE. The registry entry goes away on UNSUBACK.
    pub(crate) fn unsubscribe(&mut self, now: Instant, filter: String, done: Completer<()>) {
        if self.conn.phase != Phase::Connected {
            return done.complete(Err(Error::NotConnected));
        }
        if let Err(e) = validate_filter(&filter) {
            return done.complete(Err(e));
        }
        let pkid = match self.qos.allocate_id() {
            Ok(pkid) => pkid,
            Err(e) => return done.complete(Err(e)),
        };

        let packet = Packet::Unsubscribe(Unsubscribe {
            pkid,
            topics: vec![filter.clone()],
        });
        self.unsubscribes.insert(
            pkid,
            PendingUnsubscribe {
                filter,
                deadline: now + self.config.ack_timeout,
                done,
            },
        );
        self.send(now, packet);
    }

    /// Begin a graceful disconnect, or cancel a handshake in progress.
    ///
    /// From `Connected` this queues DISCONNECT and moves to `Disconnecting`;
    /// `done` resolves once [`Session::finish_disconnect`] runs or `grace`
    /// expires.
    pub(crate) fn disconnect(&mut self, now: Instant, grace: Duration, done: Completer<()>) {
        match self.conn.phase {
            Phase::Disconnected => done.complete(Err(Error::NotConnected)),
            Phase::Connecting => {
                self.teardown(DisconnectReason::ConnectFailed(ConnectFailure::Cancelled));
                done.complete(Ok(()));
            }
            Phase::Disconnecting => self.disconnect_waiters.push(done),
            Phase::Connected => {
                self.disconnect_waiters.push(done);
                self.begin_disconnect(now, grace);
            }
        }
    }

    /// Close whatever is open because the owner went away.
    pub(crate) fn shutdown(&mut self, now: Instant, grace: Duration) {
        match self.conn.phase {
            Phase::Connecting => {
                self.teardown(DisconnectReason::ConnectFailed(ConnectFailure::Cancelled))
            }
            Phase::Connected => self.begin_disconnect(now, grace),
            Phase::Disconnected | Phase::Disconnecting => {}
        }
    }

    fn begin_disconnect(&mut self, now: Instant, grace: Duration) {
        debug!("disconnecting {}", self.conn.client_id);
        self.send(now, Packet::Disconnect);
        self.conn.phase = Phase::Disconnecting;
        self.conn.disconnect_deadline = Some(now + grace);
        self.conn.ping_deadline = None;
    }

    /// The transport was flushed and closed after DISCONNECT.
    pub fn finish_disconnect(&mut self) {
        if self.conn.phase == Phase::Disconnecting {
            self.teardown(DisconnectReason::Requested);
        }
    }

    /// Time left before a graceful disconnect is forced.
    pub fn disconnect_grace_remaining(&self, now: Instant) -> Duration {
        self.conn
            .disconnect_deadline
            .map_or(Duration::ZERO, |deadline| deadline.saturating_duration_since(now))
    }

    // ------------------------------------------------------------------
    // Transport input
    // ------------------------------------------------------------------

    /// Process one packet from the broker.
    pub fn handle_packet(&mut self, now: Instant, packet: Packet) {
        trace!("received {}", packet.name());
        match self.conn.phase {
            Phase::Disconnected => {
                debug!("ignoring {} while disconnected", packet.name());
            }
            Phase::Connecting => match packet {
                Packet::ConnAck(ack) => self.handle_connack(ack),
                other => self.teardown(DisconnectReason::ProtocolViolation(format!(
                    "{} before CONNACK",
                    other.name()
                ))),
            },
            Phase::Connected | Phase::Disconnecting => match packet {
                Packet::Publish(publish) => self.handle_publish(now, publish),
                Packet::PubAck(pkid) => self.handle_puback(pkid),
                Packet::PubRec(pkid) => self.handle_pubrec(now, pkid),
                Packet::PubRel(pkid) => self.handle_pubrel(now, pkid),
                Packet::PubComp(pkid) => self.handle_pubcomp(pkid),
                Packet::SubAck(ack) => self.handle_suback(ack),
                Packet::UnsubAck(pkid) => self.handle_unsuback(pkid),
                Packet::PingResp => self.handle_pingresp(),
                Packet::ConnAck(_) => self.teardown(DisconnectReason::ProtocolViolation(
                    "unexpected CONNACK".to_string(),
                )),
                other @ (Packet::Connect(_)
                | Packet::Subscribe(_)
                | Packet::Unsubscribe(_)
                | Packet::PingReq
                | Packet::Disconnect) => self.teardown(DisconnectReason::ProtocolViolation(
                    format!("broker sent {}", other.name()),
                )),
            },
        }
    }

    /// The inbound byte stream could not be decoded.
    pub fn handle_malformed(&mut self, error: ProtocolError) {
        warn!("malformed packet from broker: {}", error);
        if self.conn.phase != Phase::Disconnected {
            self.teardown(DisconnectReason::MalformedPacket(error.to_string()));
        }
    }

    /// The transport closed or failed.
    pub fn handle_connection_lost(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        match self.conn.phase {
            Phase::Disconnected => {}
            // Closing is what we asked for.
            Phase::Disconnecting => self.teardown(DisconnectReason::Requested),
            Phase::Connecting | Phase::Connected => {
                debug!("connection lost: {}", reason);
                self.teardown(DisconnectReason::ConnectionLost(reason));
            }
        }
    }

    fn handle_connack(&mut self, ack: ConnAck) {
        if ack.code != ConnectReturnCode::Success {
            self.teardown(DisconnectReason::ConnectFailed(ConnectFailure::Refused(ack.code)));
            return;
        }
        self.conn.phase = Phase::Connected;
        self.conn.connect_deadline = None;
        self.conn.ping_deadline = None;
        if let Some(done) = self.connect_waiter.take() {
            done.complete(Ok(ack.session_present));
        }
        self.events.emit(&SessionEvent::Connected {
            session_present: ack.session_present,
        });
    }

    fn handle_publish(&mut self, now: Instant, publish: Publish) {
        match publish.qos {
            QoS::AtMostOnce => self.deliver(message_from(publish)),
            QoS::AtLeastOnce => {
                let pkid = publish.pkid;
                self.deliver(message_from(publish));
                self.send(now, Packet::PubAck(pkid));
            }
            QoS::ExactlyOnce => {
                let pkid = publish.pkid;
                self.qos.receive_qos2(&publish, now);
                self.send(now, Packet::PubRec(pkid));
            }
        }
    }

    fn handle_puback(&mut self, pkid: u16) {
        match self.qos.handle_puback(pkid) {
            Some(_) => self.complete_publish(pkid),
            None => debug!("PUBACK for unknown packet {}", pkid),
        }
    }

    fn handle_pubrec(&mut self, now: Instant, pkid: u16) {
        match self.qos.handle_pubrec(pkid, now) {
            Some(pubrel) => self.send(now, pubrel),
            None => debug!("PUBREC for unknown packet {}", pkid),
        }
    }

    fn handle_pubrel(&mut self, now: Instant, pkid: u16) {
        match self.qos.release_inbound(pkid) {
            Some(message) => self.deliver(message),
            None => debug!("PUBREL for unknown packet {}", pkid),
        }
        self.send(now, Packet::PubComp(pkid));
    }

    fn handle_pubcomp(&mut self, pkid: u16) {
        match self.qos.handle_pubcomp(pkid) {
            Some(_) => self.complete_publish(pkid),
            None => debug!("PUBCOMP for unknown packet {}", pkid),
        }
    }

    fn complete_publish(&mut self, pkid: u16) {
        if let Some(done) = self.publishes.remove(&pkid) {
            done.complete(Ok(()));
        }
    }

    fn handle_suback(&mut self, ack: SubAck) {
        let Some(pending) = self.subscribes.remove(&ack.pkid) else {
            debug!("SUBACK for unknown packet {}", ack.pkid);
            return;
        };
        self.qos.release_id(ack.pkid);

        let [code] = ack.return_codes.as_slice() else {
            pending.done.complete(Err(Error::ProtocolViolation(format!(
                "SUBACK carries {} return codes for one filter",
                ack.return_codes.len()
            ))));
            self.teardown(DisconnectReason::ProtocolViolation(
                "SUBACK return code count mismatch".to_string(),
            ));
            return;
        };

        match *code {
            SubscribeReturnCode::Success(granted) => {
                match self.registry.subscribe(&pending.filter, granted, pending.handler) {
                    Ok(_) => {
                        self.events.emit(&SessionEvent::Subscribed {
                            filter: pending.filter,
                            qos: granted,
                        });
                        pending.done.complete(Ok(granted));
                    }
                    Err(e) => pending.done.complete(Err(e)),
                }
            }
            SubscribeReturnCode::Failure => {
                self.events.emit(&SessionEvent::SubscriptionRejected {
                    filter: pending.filter.clone(),
                });
                pending.done.complete(Err(Error::SubscriptionRejected(pending.filter)));
            }
        }
    }

    fn handle_unsuback(&mut self, pkid: u16) {
        let Some(pending) = self.unsubscribes.remove(&pkid) else {
            debug!("UNSUBACK for unknown packet {}", pkid);
            return;
        };
        self.qos.release_id(pkid);
        self.registry.unsubscribe(&pending.filter);
        self.events.emit(&SessionEvent::Unsubscribed {
            filter: pending.filter,
        });
        pending.done.complete(Ok(()));
    }

    fn handle_pingresp(&mut self) {
        if self.conn.ping_deadline.take().is_some() {
            self.events.emit(&SessionEvent::PingResponse);
        } else {
            trace!("unsolicited PINGRESP");
        }
    }

    fn deliver(&mut self, message: Message) {
        let mut handlers = self.registry.matches(&message.topic);
        if handlers.is_empty() {
            match self.config.default_handler {
                Some(ref default) => handlers.push(Arc::clone(default)),
                None => {
                    self.events.emit(&SessionEvent::MessageDropped {
                        topic: message.topic,
                    });
                    return;
                }
            }
        }
        self.deliveries.push_back(Delivery {
            message,
            handlers,
            events: Arc::clone(&self.events),
        });
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Earliest instant at which [`Session::handle_tick`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut deadlines = Vec::with_capacity(5);
        match self.conn.phase {
            Phase::Disconnected => return None,
            Phase::Connecting => deadlines.push(self.conn.connect_deadline),
            Phase::Disconnecting => deadlines.push(self.conn.disconnect_deadline),
            Phase::Connected => {
                deadlines.push(self.conn.keep_alive_deadline());
                deadlines.push(self.qos.next_retry());
                deadlines.push(self.subscribes.values().map(|p| p.deadline).min());
                deadlines.push(self.unsubscribes.values().map(|p| p.deadline).min());
            }
        }
        deadlines.into_iter().flatten().min()
    }

    /// Fire every timer that is due at `now`.
    pub fn handle_tick(&mut self, now: Instant) {
        match self.conn.phase {
            Phase::Disconnected => {}
            Phase::Connecting => {
                if self.conn.connect_deadline.is_some_and(|d| now >= d) {
                    self.teardown(DisconnectReason::ConnectFailed(ConnectFailure::Timeout));
                }
            }
            Phase::Disconnecting => {
                if self.conn.disconnect_deadline.is_some_and(|d| now >= d) {
                    debug!("disconnect grace period elapsed");
                    self.teardown(DisconnectReason::Requested);
                }
            }
            Phase::Connected => {
                if !self.check_keep_alive(now) {
                    return;
                }
                self.check_retries(now);
                self.check_ack_timeouts(now);
            }
        }
    }

    /// Returns false if the connection was torn down.
    fn check_keep_alive(&mut self, now: Instant) -> bool {
        if let Some(deadline) = self.conn.ping_deadline {
            if now >= deadline {
                self.events.emit(&SessionEvent::KeepAliveTimeout);
                self.teardown(DisconnectReason::KeepAliveTimeout);
                return false;
            }
            return true;
        }

        let (Some(interval), Some(last_sent)) = (self.conn.keep_alive, self.conn.last_sent) else {
            return true;
        };
        if now >= last_sent + interval {
            self.send(now, Packet::PingReq);
            self.conn.ping_deadline = Some(now + self.config.effective_ping_timeout());
            self.events.emit(&SessionEvent::PingSent);
        }
        true
    }

    fn check_retries(&mut self, now: Instant) {
        for retry in self.qos.poll_retries(now) {
            match retry {
                Retry::Resend { packet, attempt } => {
                    let packet_id = match packet {
                        Packet::Publish(ref p) => p.pkid,
                        Packet::PubRel(pkid) => pkid,
                        _ => 0,
                    };
                    self.events.emit(&SessionEvent::Retransmit {
                        packet_id,
                        packet: packet.name(),
                        attempt,
                    });
                    self.send(now, packet);
                }
                Retry::Exhausted { packet_id, attempts } => {
                    self.events.emit(&SessionEvent::DeliveryFailed { packet_id, attempts });
                    if let Some(done) = self.publishes.remove(&packet_id) {
                        done.complete(Err(Error::DeliveryFailed { packet_id, attempts }));
                    }
                }
            }
        }
    }

    fn check_ack_timeouts(&mut self, now: Instant) {
        let expired: Vec<u16> = self
            .subscribes
            .iter()
            .filter(|(_, p)| now >= p.deadline)
            .map(|(&pkid, _)| pkid)
            .collect();
        for pkid in expired {
            if let Some(pending) = self.subscribes.remove(&pkid) {
                self.qos.release_id(pkid);
                pending.done.complete(Err(Error::Timeout(format!(
                    "no SUBACK for {}",
                    pending.filter
                ))));
            }
        }

        let expired: Vec<u16> = self
            .unsubscribes
            .iter()
            .filter(|(_, p)| now >= p.deadline)
            .map(|(&pkid, _)| pkid)
            .collect();
        for pkid in expired {
            if let Some(pending) = self.unsubscribes.remove(&pkid) {
                self.qos.release_id(pkid);
                pending.done.complete(Err(Error::Timeout(format!(
                    "no UNSUBACK for {}",
                    pending.filter
                ))));
            }
        }
    }

    // ------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------

    /// Next packet to write.
    pub fn poll_outgoing(&mut self) -> Option<Outgoing> {
        self.outbox.pop_front()
    }

    /// Next message to hand to the dispatcher.
    pub fn poll_delivery(&mut self) -> Option<Delivery> {
        self.deliveries.pop_front()
    }

    fn send(&mut self, now: Instant, packet: Packet) {
        self.send_with(now, packet, None);
    }

    fn send_with(&mut self, now: Instant, packet: Packet, sent: Option<Completer<()>>) {
        self.conn.last_sent = Some(now);
        self.outbox.push_back(Outgoing { packet, sent });
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// End the connection: fail everything pending and discard session state.
    fn teardown(&mut self, reason: DisconnectReason) {
        let reason = match (self.conn.phase, reason) {
            (Phase::Connecting, reason @ DisconnectReason::ConnectFailed(_)) => reason,
            (Phase::Connecting, other) => {
                DisconnectReason::ConnectFailed(ConnectFailure::Transport(other.to_string()))
            }
            (_, reason) => reason,
        };
        debug!("session teardown: {}", reason);

        if let DisconnectReason::ConnectFailed(ref failure) = reason {
            self.events.emit(&SessionEvent::ConnectFailed {
                reason: failure.clone(),
            });
        }
        if let Some(done) = self.connect_waiter.take() {
            done.complete(Err(reason.to_error()));
        }

        for outgoing in self.outbox.drain(..) {
            outgoing.complete(Err(reason.to_error()));
        }
        for (_, done) in self.publishes.drain() {
            done.complete(Err(reason.to_error()));
        }
        for (_, pending) in self.subscribes.drain() {
            pending.done.complete(Err(reason.to_error()));
        }
        for (_, pending) in self.unsubscribes.drain() {
            pending.done.complete(Err(reason.to_error()));
        }
        for done in self.disconnect_waiters.drain(..) {
            done.complete(Ok(()));
        }

        let dropped = self.qos.clear();
        if !dropped.is_empty() {
            debug!("discarded {} in-flight publishes", dropped.len());
        }
        self.registry.clear();

        self.conn.phase = Phase::Disconnected;
        self.conn.connect_deadline = None;
        self.conn.ping_deadline = None;
        self.conn.disconnect_deadline = None;
        self.events.emit(&SessionEvent::Disconnected {
            reason: reason.clone(),
        });
        self.last_disconnect = Some(reason);
    }
}

fn message_from(publish: Publish) -> Message {
    Message {
        topic: publish.topic,
        payload: publish.payload,
        qos: publish.qos,
        retain: publish.retain,
        dup: publish.dup,
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("conn", &self.conn)
            .field("registry", &self.registry)
            .field("in_flight", &self.qos.outbound_len())
            .field("outbox", &self.outbox.len())
            .finish_non_exhaustive()
    }
}
