//! MQTT client facade.
//!
//! [`Client`] is a cheap handle onto a background event loop. The loop
//! owns the [`Session`], the transport and the stream decoder; every
//! public call becomes a command on a channel, so session state is only
//! ever touched from one task. Writes go through a per-link writer task and
//! inbound messages through a dispatcher task, so neither a stalled peer nor
//! a slow handler holds up the timers.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::events::{EventSink, TracingSink};
use crate::protocol::{write_packet, StreamDecoder};
use crate::session::{Delivery, DisconnectReason, Outgoing, Phase, Session, Status};
use crate::token::{pair, Completer, Token};
use crate::transport::Transport;
use crate::types::{Handler, Message, QoS};

/// Grace period used when the last client handle is dropped.
const DROP_DISCONNECT_GRACE: Duration = Duration::from_secs(1);

const READ_BUFFER_SIZE: usize = 4096;

enum Command {
    Connect {
        transport: Box<dyn Transport>,
        done: Completer<bool>,
    },
    Subscribe {
        filter: String,
        qos: QoS,
        handler: Option<Arc<dyn Handler>>,
        done: Completer<QoS>,
    },
    Unsubscribe {
        filter: String,
        done: Completer<()>,
    },
    Publish {
        message: Message,
        done: Completer<()>,
    },
    Disconnect {
        grace: Duration,
        done: Completer<()>,
    },
}

/// MQTT 3.1.1 client.
///
/// Cloning is cheap; all clones drive the same session. Dropping the last
/// clone disconnects gracefully and stops the event loop.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use mqttc::{Client, ClientConfig, Message, QoS};
///
/// #[tokio::main]
/// async fn main() -> mqttc::Result<()> {
///     let config = ClientConfig::new("emqx_test_client")
///         .with_keep_alive(60)
///         .with_ping_timeout(Duration::from_secs(1));
///     let client = Client::new(config)?;
///
///     let stream = tokio::net::TcpStream::connect("broker.emqx.io:1883").await?;
///     client.connect(stream).await?;
///
///     client
///         .subscribe("testtopic/#", QoS::AtMostOnce, |msg: &Message| {
///             println!("{}: {:?}", msg.topic, msg.payload_str());
///         })
///         .await?;
///     client.publish("testtopic/1", "Hello World", QoS::AtLeastOnce).await?;
///
///     client.unsubscribe("testtopic/#").await?;
///     client.disconnect(Duration::from_millis(250)).await
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<Status>,
}

impl Client {
    /// Create a client that reports session events through `tracing`.
    ///
    /// Fails with [`Error::NoRuntime`] outside a tokio runtime.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_event_sink(config, Arc::new(TracingSink))
    }

    /// Create a client with a custom event sink.
    pub fn with_event_sink(config: ClientConfig, events: Arc<dyn EventSink>) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(Status::default());
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let (link_events_tx, link_events_rx) = mpsc::unbounded_channel();

        runtime.spawn(dispatch_loop(delivery_rx));

        let max_packet_size = config.max_packet_size;
        let event_loop = EventLoop {
            session: Session::new(config, events),
            link: None,
            next_link_id: 0,
            decoder: StreamDecoder::new(max_packet_size),
            read_buf: vec![0u8; READ_BUFFER_SIZE],
            commands: command_rx,
            commands_open: true,
            link_events_tx,
            link_events: link_events_rx,
            deliveries: delivery_tx,
            status: status_tx,
        };
        runtime.spawn(event_loop.run());

        Ok(Self {
            commands: command_tx,
            status: status_rx,
        })
    }

    /// Start the MQTT handshake over `transport`.
    ///
    /// Resolves to the broker's session-present flag once CONNACK accepts
    /// the connection.
    pub fn connect<T: Transport>(&self, transport: T) -> Token<bool> {
        self.request(|done| Command::Connect {
            transport: Box::new(transport),
            done,
        })
    }

    /// Subscribe to `filter`. Resolves to the QoS granted by the broker.
    pub fn subscribe<H>(&self, filter: impl Into<String>, qos: QoS, handler: H) -> Token<QoS>
    where
        H: Handler + 'static,
    {
        self.subscribe_handler(filter, qos, Arc::new(handler))
    }

    /// Subscribe with a shared handler.
    pub fn subscribe_handler(
        &self,
        filter: impl Into<String>,
        qos: QoS,
        handler: Arc<dyn Handler>,
    ) -> Token<QoS> {
        self.request(|done| Command::Subscribe {
            filter: filter.into(),
            qos,
            handler: Some(handler),
            done,
        })
    }

    /// Subscribe without a handler of its own.
    ///
    /// Matching publishes go to [`ClientConfig::with_default_handler`]; with
    /// no default handler they are dropped and reported as
    /// [`SessionEvent::MessageDropped`](crate::SessionEvent::MessageDropped).
    pub fn subscribe_default(&self, filter: impl Into<String>, qos: QoS) -> Token<QoS> {
        self.request(|done| Command::Subscribe {
            filter: filter.into(),
            qos,
            handler: None,
            done,
        })
    }

    /// Remove the subscription for `filter`.
    pub fn unsubscribe(&self, filter: impl Into<String>) -> Token<()> {
        self.request(|done| Command::Unsubscribe {
            filter: filter.into(),
            done,
        })
    }

    /// Publish a message without the retain flag.
    pub fn publish(&self, topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Token<()> {
        self.publish_message(Message::new(topic, payload).with_qos(qos))
    }

    /// Publish a message.
    ///
    /// QoS 0 resolves once written to the transport, QoS 1 on PUBACK and
    /// QoS 2 on PUBCOMP.
    pub fn publish_message(&self, message: Message) -> Token<()> {
        self.request(|done| Command::Publish { message, done })
    }

    /// Disconnect gracefully, waiting at most `grace` for the transport to close.
    pub fn disconnect(&self, grace: Duration) -> Token<()> {
        self.request(|done| Command::Disconnect { grace, done })
    }

    /// Current connection status.
    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    /// Receiver notified on every status change.
    pub fn watch_status(&self) -> watch::Receiver<Status> {
        self.status.clone()
    }

    fn request<T>(&self, command: impl FnOnce(Completer<T>) -> Command) -> Token<T> {
        let (done, token) = pair();
        if self.commands.send(command(done)).is_err() {
            return Token::ready(Err(Error::SessionClosed));
        }
        token
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("status", &*self.status.borrow()).finish()
    }
}

// ============================================================================
// Event loop
// ============================================================================

enum Event {
    Command(Command),
    Read(io::Result<usize>),
    Link(LinkEvent),
    Tick,
    Shutdown,
}

struct EventLoop {
    session: Session,
    link: Option<Link>,
    next_link_id: u64,
    decoder: StreamDecoder,
    read_buf: Vec<u8>,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_open: bool,
    link_events_tx: mpsc::UnboundedSender<LinkEvent>,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    deliveries: mpsc::UnboundedSender<Delivery>,
    status: watch::Sender<Status>,
}

impl EventLoop {
    async fn run(mut self) {
        loop {
            self.flush();
            if !self.commands_open && self.session.phase() == Phase::Disconnected {
                break;
            }

            let deadline = self.session.next_deadline();
            let event = tokio::select! {
                () = sleep_until(deadline) => Event::Tick,
                Some(link_event) = self.link_events.recv() => Event::Link(link_event),
                read = read_some(self.link.as_mut(), &mut self.read_buf) => Event::Read(read),
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(command) => Event::Command(command),
                    None => Event::Shutdown,
                },
            };

            let now = Instant::now();
            match event {
                Event::Command(command) => self.handle_command(now, command),
                Event::Read(Ok(0)) => self.session.handle_connection_lost("connection closed by broker"),
                Event::Read(Ok(n)) => {
                    self.decoder.feed(&self.read_buf[..n]);
                    self.drain_decoder(now);
                }
                Event::Read(Err(e)) => self.session.handle_connection_lost(e.to_string()),
                Event::Link(event) => self.handle_link_event(event),
                Event::Tick => self.session.handle_tick(now),
                Event::Shutdown => {
                    debug!("all client handles dropped, shutting down");
                    self.commands_open = false;
                    self.session.shutdown(now, DROP_DISCONNECT_GRACE);
                }
            }
        }
        trace!("event loop stopped");
    }

    fn handle_command(&mut self, now: Instant, command: Command) {
        match command {
            Command::Connect { transport, done } => {
                if self.session.connect(now, done) {
                    self.next_link_id += 1;
                    self.link = Some(Link::open(
                        self.next_link_id,
                        transport,
                        self.session.config().max_packet_size,
                        self.link_events_tx.clone(),
                    ));
                    self.decoder.clear();
                }
            }
            Command::Subscribe { filter, qos, handler, done } => {
                self.session.subscribe(now, filter, qos, handler, done)
            }
            Command::Unsubscribe { filter, done } => self.session.unsubscribe(now, filter, done),
            Command::Publish { message, done } => self.session.publish(now, message, done),
            Command::Disconnect { grace, done } => self.session.disconnect(now, grace, done),
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        let current = self.link.as_ref().map(|link| link.id);
        match event {
            LinkEvent::Failed { link, reason } if current == Some(link) => {
                self.session.handle_connection_lost(reason)
            }
            LinkEvent::Closed { link } if current == Some(link) => self.session.finish_disconnect(),
            LinkEvent::Failed { link, .. } | LinkEvent::Closed { link } => {
                trace!("ignoring event from stale link {}", link)
            }
        }
    }

    fn drain_decoder(&mut self, now: Instant) {
        loop {
            match self.decoder.next_packet() {
                Ok(Some(packet)) => {
                    self.session.handle_packet(now, packet);
                    if self.session.phase() == Phase::Disconnected {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.session.handle_malformed(e);
                    break;
                }
            }
        }
    }

    /// Hand queued packets to the writer, close the link when the session
    /// is done with it, forward deliveries and publish the status.
    ///
    /// Never waits on the transport.
    fn flush(&mut self) {
        while let Some(outgoing) = self.session.poll_outgoing() {
            match self.link.as_ref() {
                Some(link) => link.write(outgoing),
                None => outgoing.complete(Err(Error::NotConnected)),
            }
        }

        match self.session.phase() {
            Phase::Disconnecting => match self.link.as_mut() {
                Some(link) => link.shutdown(),
                None => self.session.finish_disconnect(),
            },
            Phase::Disconnected => {
                if let Some(link) = self.link.take() {
                    let reason = self
                        .session
                        .status()
                        .last_disconnect
                        .unwrap_or(DisconnectReason::Requested);
                    link.close(reason);
                    self.decoder.clear();
                }
            }
            Phase::Connecting | Phase::Connected => {}
        }

        while let Some(delivery) = self.session.poll_delivery() {
            if self.deliveries.send(delivery).is_err() {
                warn!("dispatcher stopped, dropping delivery");
            }
        }

        let status = self.session.status();
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}

async fn read_some(link: Option<&mut Link>, buf: &mut [u8]) -> io::Result<usize> {
    match link {
        Some(link) => link.reader.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// Link
// ============================================================================

/// Work for a link's writer task.
enum WriteJob {
    Packet(Outgoing),
    Shutdown,
}

/// Reports from a link's writer task, tagged with the link they belong to.
enum LinkEvent {
    Failed { link: u64, reason: String },
    Closed { link: u64 },
}

/// An attached transport: the read half stays with the event loop, the
/// write half belongs to a writer task so a stalled peer cannot block
/// timers or commands.
struct Link {
    id: u64,
    reader: ReadHalf<Box<dyn Transport>>,
    writes: mpsc::UnboundedSender<WriteJob>,
    abort: oneshot::Sender<DisconnectReason>,
    shutting_down: bool,
}

impl Link {
    fn open(
        id: u64,
        transport: Box<dyn Transport>,
        max_packet_size: usize,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(transport);
        let (writes, jobs) = mpsc::unbounded_channel();
        let (abort, aborted) = oneshot::channel();
        tokio::spawn(write_loop(id, writer, jobs, aborted, max_packet_size, events));
        Self {
            id,
            reader,
            writes,
            abort,
            shutting_down: false,
        }
    }

    fn write(&self, outgoing: Outgoing) {
        if let Err(mpsc::error::SendError(WriteJob::Packet(outgoing))) =
            self.writes.send(WriteJob::Packet(outgoing))
        {
            outgoing.complete(Err(Error::ConnectionClosed("writer stopped".to_string())));
        }
    }

    /// Flush what is queued, then close the write side.
    fn shutdown(&mut self) {
        if !self.shutting_down {
            self.shutting_down = true;
            let _ = self.writes.send(WriteJob::Shutdown);
        }
    }

    /// Stop the writer now. Packets it still holds fail with `reason`.
    fn close(self, reason: DisconnectReason) {
        let _ = self.abort.send(reason);
    }
}

async fn write_loop(
    link: u64,
    mut writer: WriteHalf<Box<dyn Transport>>,
    mut jobs: mpsc::UnboundedReceiver<WriteJob>,
    mut aborted: oneshot::Receiver<DisconnectReason>,
    max_packet_size: usize,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let reason = loop {
        let job = tokio::select! {
            reason = &mut aborted => break abort_reason(reason),
            job = jobs.recv() => job,
        };
        match job {
            Some(WriteJob::Packet(outgoing)) => {
                let written = tokio::select! {
                    reason = &mut aborted => Err(abort_reason(reason)),
                    result = write_packet(&mut writer, &outgoing.packet, max_packet_size) => Ok(result),
                };
                match written {
                    Ok(Ok(())) => {
                        trace!("sent {}", outgoing.packet.name());
                        outgoing.complete(Ok(()));
                    }
                    Ok(Err(e @ Error::PacketTooLarge { .. })) => {
                        warn!("not sending {}: {}", outgoing.packet.name(), e);
                        outgoing.complete(Err(e));
                    }
                    Ok(Err(e)) => {
                        let reason = e.to_string();
                        warn!("write of {} failed: {}", outgoing.packet.name(), reason);
                        outgoing.complete(Err(Error::ConnectionClosed(reason.clone())));
                        let _ = events.send(LinkEvent::Failed {
                            link,
                            reason: reason.clone(),
                        });
                        break DisconnectReason::ConnectionLost(reason);
                    }
                    Err(reason) => {
                        outgoing.complete(Err(reason.to_error()));
                        break reason;
                    }
                }
            }
            Some(WriteJob::Shutdown) => {
                let closed = tokio::select! {
                    reason = &mut aborted => Err(abort_reason(reason)),
                    result = writer.shutdown() => Ok(result),
                };
                match closed {
                    Ok(Ok(())) => trace!("transport closed"),
                    Ok(Err(e)) => debug!("transport shutdown failed: {}", e),
                    Err(reason) => break reason,
                }
                let _ = events.send(LinkEvent::Closed { link });
                break DisconnectReason::Requested;
            }
            None => break DisconnectReason::ConnectionLost("link dropped".to_string()),
        }
    };

    jobs.close();
    while let Ok(job) = jobs.try_recv() {
        if let WriteJob::Packet(outgoing) = job {
            outgoing.complete(Err(reason.to_error()));
        }
    }
    trace!("writer for link {} stopped", link);
}

fn abort_reason(
    received: std::result::Result<DisconnectReason, oneshot::error::RecvError>,
) -> DisconnectReason {
    received.unwrap_or_else(|_| DisconnectReason::ConnectionLost("link dropped".to_string()))
}

// ============================================================================
// Dispatcher
// ============================================================================

async fn dispatch_loop(mut deliveries: mpsc::UnboundedReceiver<Delivery>) {
    while let Some(delivery) = deliveries.recv().await {
        trace!(
            "dispatching {} to {} handlers",
            delivery.message.topic,
            delivery.handlers.len()
        );
        let completed = delivery.dispatch();
        if completed < delivery.handlers.len() {
            warn!(
                "{} of {} handlers for {} panicked",
                delivery.handlers.len() - completed,
                delivery.handlers.len(),
                delivery.message.topic
            );
        }
    }
    trace!("dispatcher stopped");
}
