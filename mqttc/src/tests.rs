//! End-to-end tests for mqttc.
//!
//! The client runs against a scripted broker on the other end of a
//! `tokio::io::duplex` pipe. The broker side speaks through the crate's own
//! codec, and the `interop` module cross-checks that codec against
//! rumqttc's independent MQTT 3.1.1 implementation.
//!
//! Timer-driven tests run on a paused clock, so elapsed times are exact.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{ConnectFailure, Error};
use crate::events::SessionEvent;
use crate::protocol::{
    read_packet, write_packet, ConnAck, Connect, Packet, Publish, StreamDecoder, SubAck,
    SubscribeReturnCode, MAX_PACKET_SIZE,
};
use crate::qos::RetryPolicy;
use crate::session::{DisconnectReason, Phase, Status};
use crate::types::{ConnectReturnCode, Message, QoS};
use crate::{Client, ClientConfig};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Scripted broker end of the pipe.
struct FakeBroker {
    stream: DuplexStream,
    decoder: StreamDecoder,
}

impl FakeBroker {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            decoder: StreamDecoder::new(MAX_PACKET_SIZE),
        }
    }

    async fn recv(&mut self) -> Packet {
        read_packet(&mut self.stream, &mut self.decoder)
            .await
            .expect("broker read failed")
    }

    /// Wait for the client to close its end.
    async fn expect_closed(&mut self) {
        match read_packet(&mut self.stream, &mut self.decoder).await {
            Err(Error::ConnectionClosed(_)) => {}
            other => panic!("expected closed connection, got {:?}", other),
        }
    }

    async fn send(&mut self, packet: Packet) {
        write_packet(&mut self.stream, &packet, MAX_PACKET_SIZE)
            .await
            .expect("broker write failed");
    }

    async fn expect_connect(&mut self) -> Connect {
        match self.recv().await {
            Packet::Connect(connect) => connect,
            other => panic!("expected CONNECT, got {:?}", other),
        }
    }

    async fn accept(&mut self) -> Connect {
        let connect = self.expect_connect().await;
        self.send(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        }))
        .await;
        connect
    }

    /// Answer the next SUBSCRIBE with `granted`.
    async fn grant_subscribe(&mut self, granted: QoS) -> String {
        match self.recv().await {
            Packet::Subscribe(sub) => {
                self.send(Packet::SubAck(SubAck {
                    pkid: sub.pkid,
                    return_codes: vec![SubscribeReturnCode::Success(granted)],
                }))
                .await;
                sub.filters[0].path.clone()
            }
            other => panic!("expected SUBSCRIBE, got {:?}", other),
        }
    }

    async fn expect_publish(&mut self) -> Publish {
        match self.recv().await {
            Packet::Publish(publish) => publish,
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }
}

type Events = Arc<Mutex<Vec<SessionEvent>>>;

async fn connected(config: ClientConfig) -> (Client, FakeBroker, Events) {
    connected_over(config, 64 * 1024).await
}

/// Connect over a pipe that buffers at most `capacity` bytes per direction.
async fn connected_over(config: ClientConfig, capacity: usize) -> (Client, FakeBroker, Events) {
    init_tracing();
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let sink_events = events.clone();
    let client = Client::with_event_sink(
        config,
        Arc::new(move |event: &SessionEvent| sink_events.lock().push(event.clone())),
    )
    .unwrap();

    let (client_io, broker_io) = tokio::io::duplex(capacity);
    let token = client.connect(client_io);
    let mut broker = FakeBroker::new(broker_io);
    broker.accept().await;
    assert!(!token.await.unwrap());
    assert_eq!(client.status().phase, Phase::Connected);

    (client, broker, events)
}

fn collector() -> (
    impl Fn(&Message) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<(String, Bytes)>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |msg: &Message| {
        let _ = tx.send((msg.topic.clone(), msg.payload.clone()));
    };
    (handler, rx)
}

async fn wait_for_phase(client: &Client, phase: Phase) -> Status {
    client
        .watch_status()
        .wait_for(|status| status.phase == phase)
        .await
        .expect("event loop stopped")
        .clone()
}

fn config() -> ClientConfig {
    ClientConfig::new("emqx_test_client")
}

#[tokio::test(start_paused = true)]
async fn test_connect_sends_configured_connect() {
    init_tracing();
    let client = Client::new(
        config()
            .with_keep_alive(60)
            .with_credentials("user", b"secret".to_vec())
            .with_will("clients/emqx_test_client", "offline", QoS::AtLeastOnce, true),
    )
    .unwrap();
    let (client_io, broker_io) = tokio::io::duplex(4096);
    let token = client.connect(client_io);

    let mut broker = FakeBroker::new(broker_io);
    let connect = broker.expect_connect().await;
    assert_eq!(connect.client_id, "emqx_test_client");
    assert_eq!(connect.keep_alive, 60);
    assert!(connect.clean_session);
    assert_eq!(connect.username.as_deref(), Some("user"));
    assert_eq!(connect.password.as_deref(), Some(&b"secret"[..]));
    let will = connect.will.unwrap();
    assert_eq!(will.topic, "clients/emqx_test_client");
    assert!(will.retain);
    assert_eq!(client.status().phase, Phase::Connecting);

    broker
        .send(Packet::ConnAck(ConnAck { session_present: true, code: ConnectReturnCode::Success }))
        .await;
    assert!(token.await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_connect_refused() {
    init_tracing();
    let client = Client::new(config()).unwrap();
    let (client_io, broker_io) = tokio::io::duplex(4096);
    let token = client.connect(client_io);

    let mut broker = FakeBroker::new(broker_io);
    broker.expect_connect().await;
    broker
        .send(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::NotAuthorized,
        }))
        .await;

    assert!(matches!(
        token.await,
        Err(Error::ConnectFailed(ConnectFailure::Refused(ConnectReturnCode::NotAuthorized)))
    ));
    let status = wait_for_phase(&client, Phase::Disconnected).await;
    assert_eq!(
        status.last_disconnect,
        Some(DisconnectReason::ConnectFailed(ConnectFailure::Refused(
            ConnectReturnCode::NotAuthorized
        )))
    );
    broker.expect_closed().await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout() {
    init_tracing();
    let client = Client::new(config().with_connect_timeout(Duration::from_secs(5))).unwrap();
    let (client_io, broker_io) = tokio::io::duplex(4096);
    let start = Instant::now();
    let token = client.connect(client_io);

    let mut broker = FakeBroker::new(broker_io);
    broker.expect_connect().await;

    assert!(matches!(token.await, Err(Error::ConnectFailed(ConnectFailure::Timeout))));
    assert_eq!(start.elapsed(), Duration::from_secs(5));
    broker.expect_closed().await;

    // A second connect on a fresh transport is allowed.
    let (client_io, broker_io) = tokio::io::duplex(4096);
    let token = client.connect(client_io);
    let mut broker = FakeBroker::new(broker_io);
    broker.accept().await;
    assert!(token.await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_connect_twice_is_rejected() {
    let (client, _broker, _) = connected(config()).await;
    let (other_io, _other_broker) = tokio::io::duplex(4096);
    assert!(matches!(client.connect(other_io).await, Err(Error::AlreadyConnected)));
    assert_eq!(client.status().phase, Phase::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_connect() {
    init_tracing();
    let client = Client::new(config()).unwrap();
    let (client_io, broker_io) = tokio::io::duplex(4096);
    let connect = client.connect(client_io);
    let mut broker = FakeBroker::new(broker_io);
    broker.expect_connect().await;

    client.disconnect(Duration::from_secs(1)).await.unwrap();
    assert!(matches!(connect.await, Err(Error::ConnectFailed(ConnectFailure::Cancelled))));
    broker.expect_closed().await;
}

#[tokio::test(start_paused = true)]
async fn test_qos1_receive_and_redelivery() {
    let (client, mut broker, _) = connected(config()).await;
    let (handler, mut received) = collector();

    let subscribe = client.subscribe("a/b", QoS::AtLeastOnce, handler);
    assert_eq!(broker.grant_subscribe(QoS::AtLeastOnce).await, "a/b");
    assert_eq!(subscribe.await.unwrap(), QoS::AtLeastOnce);

    broker
        .send(Packet::Publish(Publish::new("a/b", "x", QoS::AtLeastOnce, 7)))
        .await;
    assert_eq!(broker.recv().await, Packet::PubAck(7));
    assert_eq!(
        received.recv().await.unwrap(),
        ("a/b".to_string(), Bytes::from_static(b"x"))
    );

    let mut redelivery = Publish::new("a/b", "x", QoS::AtLeastOnce, 7);
    redelivery.dup = true;
    broker.send(Packet::Publish(redelivery)).await;
    assert_eq!(broker.recv().await, Packet::PubAck(7));
    assert_eq!(
        received.recv().await.unwrap(),
        ("a/b".to_string(), Bytes::from_static(b"x"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_qos2_receive_exactly_once() {
    let (client, mut broker, _) = connected(config()).await;
    let (handler, mut received) = collector();

    let subscribe = client.subscribe("sensors/#", QoS::ExactlyOnce, handler);
    broker.grant_subscribe(QoS::ExactlyOnce).await;
    subscribe.await.unwrap();

    for _ in 0..2 {
        broker
            .send(Packet::Publish(Publish::new("sensors/t1", "21.5", QoS::ExactlyOnce, 9)))
            .await;
        assert_eq!(broker.recv().await, Packet::PubRec(9));
    }
    assert!(received.try_recv().is_err());

    broker.send(Packet::PubRel(9)).await;
    assert_eq!(broker.recv().await, Packet::PubComp(9));
    assert_eq!(received.recv().await.unwrap().1, Bytes::from_static(b"21.5"));

    // Give the dispatcher every chance to deliver a duplicate.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(received.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_qos1_publish_acknowledged() {
    let (client, mut broker, _) = connected(config()).await;

    let token = client.publish_message(
        Message::new("device/gear-001/state", "on")
            .with_qos(QoS::AtLeastOnce)
            .with_retain(true),
    );
    let publish = broker.expect_publish().await;
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    assert!(publish.retain);
    assert!(!publish.dup);

    broker.send(Packet::PubAck(publish.pkid)).await;
    token.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_qos1_publish_retries_then_fails() {
    let retry = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 2);
    let (client, mut broker, events) = connected(config().with_retry_policy(retry)).await;
    let start = Instant::now();

    let mut token = client.publish("a/b", "x", QoS::AtLeastOnce);
    let first = broker.expect_publish().await;
    assert!(!first.dup);

    for elapsed in [1, 3] {
        let retry = broker.expect_publish().await;
        assert!(retry.dup);
        assert_eq!(retry.pkid, first.pkid);
        assert_eq!(start.elapsed(), Duration::from_secs(elapsed));
        assert!(token.try_result().is_none());
    }

    assert!(matches!(
        token.await,
        Err(Error::DeliveryFailed { attempts: 3, .. })
    ));
    assert_eq!(start.elapsed(), Duration::from_secs(7));
    assert_eq!(client.status().phase, Phase::Connected);
    assert!(events
        .lock()
        .iter()
        .any(|e| matches!(e, SessionEvent::DeliveryFailed { attempts: 3, .. })));
}

#[tokio::test(start_paused = true)]
async fn test_qos2_publish_flow() {
    let (client, mut broker, _) = connected(config()).await;

    let token = client.publish("a/b", "x", QoS::ExactlyOnce);
    let publish = broker.expect_publish().await;
    assert_eq!(publish.qos, QoS::ExactlyOnce);

    broker.send(Packet::PubRec(publish.pkid)).await;
    assert_eq!(broker.recv().await, Packet::PubRel(publish.pkid));

    // Lose the PUBCOMP once; PUBREL comes back after the retry timeout.
    assert_eq!(broker.recv().await, Packet::PubRel(publish.pkid));
    broker.send(Packet::PubComp(publish.pkid)).await;
    token.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_ping_and_timeout() {
    let (client, mut broker, events) = connected(config().with_keep_alive(10)).await;
    let start = Instant::now();

    // Answered ping.
    assert_eq!(broker.recv().await, Packet::PingReq);
    assert_eq!(start.elapsed(), Duration::from_secs(10));
    broker.send(Packet::PingResp).await;

    // Unanswered ping.
    assert_eq!(broker.recv().await, Packet::PingReq);
    assert_eq!(start.elapsed(), Duration::from_secs(20));

    let status = wait_for_phase(&client, Phase::Disconnected).await;
    assert_eq!(start.elapsed(), Duration::from_secs(25));
    assert_eq!(status.last_disconnect, Some(DisconnectReason::KeepAliveTimeout));
    broker.expect_closed().await;

    let events = events.lock();
    assert!(events.contains(&SessionEvent::PingResponse));
    assert!(events.contains(&SessionEvent::KeepAliveTimeout));
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_rejected() {
    let (client, mut broker, _) = connected(config()).await;
    let (handler, _received) = collector();

    let token = client.subscribe("$SYS/#", QoS::AtMostOnce, handler);
    let pkid = match broker.recv().await {
        Packet::Subscribe(sub) => sub.pkid,
        other => panic!("expected SUBSCRIBE, got {:?}", other),
    };
    broker
        .send(Packet::SubAck(SubAck { pkid, return_codes: vec![SubscribeReturnCode::Failure] }))
        .await;

    assert!(matches!(token.await, Err(Error::SubscriptionRejected(ref f)) if f == "$SYS/#"));
    assert_eq!(client.status().phase, Phase::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_ack_timeout() {
    let (client, mut broker, _) = connected(config().with_ack_timeout(Duration::from_secs(2))).await;
    let (handler, _received) = collector();
    let start = Instant::now();

    let token = client.subscribe("a/b", QoS::AtMostOnce, handler);
    broker.recv().await;
    assert!(matches!(token.await, Err(Error::Timeout(_))));
    assert_eq!(start.elapsed(), Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_filter_rejected_locally() {
    let (client, _broker, _) = connected(config()).await;
    let (handler, _received) = collector();
    assert!(matches!(
        client.subscribe("sport/#/ranking", QoS::AtMostOnce, handler).await,
        Err(Error::InvalidTopic(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_publish_unsubscribe_disconnect() {
    let (client, mut broker, events) = connected(
        config()
            .with_keep_alive(60)
            .with_ping_timeout(Duration::from_secs(1)),
    )
    .await;
    let (handler, mut received) = collector();

    let subscribe = client.subscribe("testtopic/#", QoS::AtMostOnce, handler);
    broker.grant_subscribe(QoS::AtMostOnce).await;
    subscribe.await.unwrap();

    // QoS 0 publish resolves once written; the broker echoes it back.
    client.publish("testtopic/1", "Hello World", QoS::AtMostOnce).await.unwrap();
    let publish = broker.expect_publish().await;
    assert_eq!(publish.topic, "testtopic/1");
    broker.send(Packet::Publish(publish)).await;
    assert_eq!(
        received.recv().await.unwrap(),
        ("testtopic/1".to_string(), Bytes::from_static(b"Hello World"))
    );

    let unsubscribe = client.unsubscribe("testtopic/#");
    let pkid = match broker.recv().await {
        Packet::Unsubscribe(unsub) => {
            assert_eq!(unsub.topics, vec!["testtopic/#".to_string()]);
            unsub.pkid
        }
        other => panic!("expected UNSUBSCRIBE, got {:?}", other),
    };
    broker.send(Packet::UnsubAck(pkid)).await;
    unsubscribe.await.unwrap();

    // No subscription left: dropped, and reported.
    broker
        .send(Packet::Publish(Publish::new("testtopic/2", "late", QoS::AtMostOnce, 0)))
        .await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let disconnect = client.disconnect(Duration::from_millis(250));
    assert_eq!(broker.recv().await, Packet::Disconnect);
    broker.expect_closed().await;
    disconnect.await.unwrap();

    let status = client.status();
    assert_eq!(status.phase, Phase::Disconnected);
    assert_eq!(status.last_disconnect, Some(DisconnectReason::Requested));
    assert!(received.try_recv().is_err());
    assert!(events
        .lock()
        .contains(&SessionEvent::MessageDropped { topic: "testtopic/2".to_string() }));
}

#[tokio::test(start_paused = true)]
async fn test_publish_after_disconnect_fails() {
    let (client, mut broker, _) = connected(config()).await;
    let disconnect = client.disconnect(Duration::from_secs(1));
    assert_eq!(broker.recv().await, Packet::Disconnect);
    disconnect.await.unwrap();

    assert!(matches!(
        client.publish("a", "x", QoS::AtMostOnce).await,
        Err(Error::NotConnected)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_chunked_input() {
    let (client, mut broker, _) = connected(config()).await;
    let (handler, mut received) = collector();
    let subscribe = client.subscribe("a/+", QoS::AtLeastOnce, handler);

    let pkid = match broker.recv().await {
        Packet::Subscribe(sub) => sub.pkid,
        other => panic!("expected SUBSCRIBE, got {:?}", other),
    };
    let mut bytes = BytesMut::new();
    Packet::SubAck(SubAck {
        pkid,
        return_codes: vec![SubscribeReturnCode::Success(QoS::AtLeastOnce)],
    })
    .encode(&mut bytes)
    .unwrap();
    Packet::Publish(Publish::new("a/b", vec![0x42u8; 300], QoS::AtLeastOnce, 11))
        .encode(&mut bytes)
        .unwrap();

    for chunk in bytes.chunks(3) {
        broker.stream.write_all(chunk).await.unwrap();
        tokio::task::yield_now().await;
    }

    assert_eq!(subscribe.await.unwrap(), QoS::AtLeastOnce);
    assert_eq!(broker.recv().await, Packet::PubAck(11));
    assert_eq!(received.recv().await.unwrap().1.len(), 300);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_input_drops_connection() {
    let (client, mut broker, _) = connected(config()).await;
    let publish = client.publish("a/b", "x", QoS::AtLeastOnce);
    broker.expect_publish().await;

    // Packet type 0 is reserved.
    broker.stream.write_all(&[0x00, 0x00]).await.unwrap();

    assert!(matches!(publish.await, Err(Error::MalformedPacket(_))));
    let status = wait_for_phase(&client, Phase::Disconnected).await;
    assert!(matches!(status.last_disconnect, Some(DisconnectReason::MalformedPacket(_))));
    broker.expect_closed().await;
}

#[tokio::test(start_paused = true)]
async fn test_broker_close_fails_pending() {
    let (client, broker, _) = connected(config()).await;
    let (handler, _received) = collector();
    let subscribe = client.subscribe("a/b", QoS::AtMostOnce, handler);
    drop(broker);

    assert!(matches!(subscribe.await, Err(Error::ConnectionClosed(_))));
    let status = wait_for_phase(&client, Phase::Disconnected).await;
    assert!(matches!(status.last_disconnect, Some(DisconnectReason::ConnectionLost(_))));
}

#[tokio::test(start_paused = true)]
async fn test_dropping_client_disconnects() {
    let (client, mut broker, _) = connected(config()).await;
    let clone = client.clone();
    drop(client);
    assert!(clone.status().phase == Phase::Connected);
    drop(clone);

    assert_eq!(broker.recv().await, Packet::Disconnect);
    broker.expect_closed().await;
}

#[tokio::test(start_paused = true)]
async fn test_default_handler_receives_messages() {
    let (handler, mut received) = collector();
    let (client, mut broker, events) = connected(config().with_default_handler(handler)).await;

    let subscribe = client.subscribe_default("testtopic/#", QoS::AtMostOnce);
    assert_eq!(broker.grant_subscribe(QoS::AtMostOnce).await, "testtopic/#");
    subscribe.await.unwrap();

    broker
        .send(Packet::Publish(Publish::new("testtopic/1", "Hello World", QoS::AtMostOnce, 0)))
        .await;
    assert_eq!(
        received.recv().await.unwrap(),
        ("testtopic/1".to_string(), Bytes::from_static(b"Hello World"))
    );
    assert!(!events
        .lock()
        .iter()
        .any(|e| matches!(e, SessionEvent::MessageDropped { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_default_without_handler_drops() {
    let (client, mut broker, events) = connected(config()).await;

    let subscribe = client.subscribe_default("testtopic/#", QoS::AtMostOnce);
    broker.grant_subscribe(QoS::AtMostOnce).await;
    subscribe.await.unwrap();

    broker
        .send(Packet::Publish(Publish::new("testtopic/1", "x", QoS::AtLeastOnce, 4)))
        .await;
    assert_eq!(broker.recv().await, Packet::PubAck(4));
    assert!(events
        .lock()
        .contains(&SessionEvent::MessageDropped { topic: "testtopic/1".to_string() }));
}

// ============================================================================
// Liveness: stalled transports and misbehaving handlers
// ============================================================================

/// Larger than the pipe, so the write never finishes while the broker
/// is not reading.
fn bulk_payload() -> Vec<u8> {
    vec![0u8; 4096]
}

#[tokio::test(start_paused = true)]
async fn test_stalled_write_disconnect_within_grace() {
    let (client, _broker, _) = connected_over(config().with_keep_alive(2), 256).await;
    let start = Instant::now();

    let stalled = client.publish("a/b", bulk_payload(), QoS::AtMostOnce);
    client.disconnect(Duration::from_millis(100)).await.unwrap();
    assert_eq!(start.elapsed(), Duration::from_millis(100));

    assert!(matches!(stalled.await, Err(Error::ConnectionClosed(_))));
    let status = client.status();
    assert_eq!(status.phase, Phase::Disconnected);
    assert_eq!(status.last_disconnect, Some(DisconnectReason::Requested));
}

#[tokio::test(start_paused = true)]
async fn test_stalled_write_keep_alive_timeout() {
    let (client, _broker, events) = connected_over(config().with_keep_alive(2), 256).await;
    let start = Instant::now();

    let stalled = client.publish("a/b", bulk_payload(), QoS::AtMostOnce);
    let status = wait_for_phase(&client, Phase::Disconnected).await;
    assert_eq!(start.elapsed(), Duration::from_secs(3));
    assert_eq!(status.last_disconnect, Some(DisconnectReason::KeepAliveTimeout));
    assert!(matches!(stalled.await, Err(Error::KeepAliveTimeout)));

    let events = events.lock();
    assert!(events.contains(&SessionEvent::PingSent));
    assert!(events.contains(&SessionEvent::KeepAliveTimeout));
}

#[tokio::test(start_paused = true)]
async fn test_stalled_write_retries_still_expire() {
    let retry = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 2);
    let (client, _broker, _) = connected_over(config().with_retry_policy(retry), 256).await;
    let start = Instant::now();

    let _stalled = client.publish("bulk", bulk_payload(), QoS::AtMostOnce);
    let acked = client.publish("a/b", "x", QoS::AtLeastOnce);
    assert!(matches!(acked.await, Err(Error::DeliveryFailed { attempts: 3, .. })));
    assert_eq!(start.elapsed(), Duration::from_secs(7));
    assert_eq!(client.status().phase, Phase::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_handler_does_not_stop_dispatch() {
    let (client, mut broker, events) = connected(config()).await;

    let failing = |msg: &Message| assert!(msg.topic != "boom", "handler failure");
    let subscribe = client.subscribe("boom", QoS::AtMostOnce, failing);
    broker.grant_subscribe(QoS::AtMostOnce).await;
    subscribe.await.unwrap();

    let (handler, mut received) = collector();
    let subscribe = client.subscribe("ok", QoS::AtLeastOnce, handler);
    broker.grant_subscribe(QoS::AtLeastOnce).await;
    subscribe.await.unwrap();

    broker
        .send(Packet::Publish(Publish::new("boom", "x", QoS::AtMostOnce, 0)))
        .await;
    broker
        .send(Packet::Publish(Publish::new("ok", "y", QoS::AtLeastOnce, 5)))
        .await;
    assert_eq!(broker.recv().await, Packet::PubAck(5));
    assert_eq!(
        received.recv().await.unwrap(),
        ("ok".to_string(), Bytes::from_static(b"y"))
    );

    assert!(events
        .lock()
        .contains(&SessionEvent::HandlerPanicked { topic: "boom".to_string() }));
    assert_eq!(client.status().phase, Phase::Connected);
}

// ============================================================================
// Interop with rumqttc's codec
// ============================================================================

mod interop {
    use super::*;
    use rumqttc::mqttbytes::v4 as rumqtt;
    use rumqttc::mqttbytes::QoS as RumQoS;

    fn to_rumqttc(packet: &Packet) -> rumqtt::Packet {
        let mut buf = BytesMut::from(&packet.to_bytes().unwrap()[..]);
        rumqtt::Packet::read(&mut buf, MAX_PACKET_SIZE).unwrap()
    }

    fn from_rumqttc(packet: rumqtt::Packet) -> Packet {
        let mut buf = BytesMut::new();
        packet.write(&mut buf, MAX_PACKET_SIZE).unwrap();
        let (decoded, consumed) = Packet::decode(&buf, MAX_PACKET_SIZE).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        decoded
    }

    #[test]
    fn test_connect_read_by_rumqttc() {
        let packet = Packet::Connect(Connect {
            client_id: "emqx_test_client".to_string(),
            keep_alive: 60,
            clean_session: true,
            username: None,
            password: None,
            will: None,
        });
        match to_rumqttc(&packet) {
            rumqtt::Packet::Connect(connect) => {
                assert_eq!(connect.client_id, "emqx_test_client");
                assert_eq!(connect.keep_alive, 60);
                assert!(connect.clean_session);
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn test_publish_both_ways() {
        let mut ours = Publish::new("testtopic/1", "Hello World", QoS::AtLeastOnce, 7);
        ours.retain = true;
        match to_rumqttc(&Packet::Publish(ours)) {
            rumqtt::Packet::Publish(p) => {
                assert_eq!(p.topic, "testtopic/1");
                assert_eq!(p.pkid, 7);
                assert_eq!(p.qos, RumQoS::AtLeastOnce);
                assert!(p.retain);
                assert_eq!(&p.payload[..], b"Hello World");
            }
            other => panic!("unexpected packet: {:?}", other),
        }

        let mut theirs = rumqtt::Publish::new("a/b", RumQoS::ExactlyOnce, b"x".to_vec());
        theirs.pkid = 9;
        theirs.dup = true;
        let mut expected = Publish::new("a/b", "x", QoS::ExactlyOnce, 9);
        expected.dup = true;
        assert_eq!(from_rumqttc(rumqtt::Packet::Publish(theirs)), Packet::Publish(expected));
    }

    #[test]
    fn test_subscribe_read_by_rumqttc() {
        let packet = Packet::Subscribe(crate::protocol::Subscribe {
            pkid: 3,
            filters: vec![crate::protocol::SubscribeFilter {
                path: "testtopic/#".to_string(),
                qos: QoS::ExactlyOnce,
            }],
        });
        match to_rumqttc(&packet) {
            rumqtt::Packet::Subscribe(sub) => {
                assert_eq!(sub.pkid, 3);
                assert_eq!(sub.filters[0].path, "testtopic/#");
                assert_eq!(sub.filters[0].qos, RumQoS::ExactlyOnce);
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn test_broker_packets_from_rumqttc() {
        assert_eq!(
            from_rumqttc(rumqtt::Packet::ConnAck(rumqtt::ConnAck::new(
                rumqtt::ConnectReturnCode::Success,
                true
            ))),
            Packet::ConnAck(ConnAck { session_present: true, code: ConnectReturnCode::Success })
        );
        assert_eq!(
            from_rumqttc(rumqtt::Packet::SubAck(rumqtt::SubAck::new(
                4,
                vec![
                    rumqtt::SubscribeReasonCode::Success(RumQoS::AtLeastOnce),
                    rumqtt::SubscribeReasonCode::Failure,
                ]
            ))),
            Packet::SubAck(SubAck {
                pkid: 4,
                return_codes: vec![
                    SubscribeReturnCode::Success(QoS::AtLeastOnce),
                    SubscribeReturnCode::Failure,
                ],
            })
        );
        assert_eq!(
            from_rumqttc(rumqtt::Packet::UnsubAck(rumqtt::UnsubAck::new(5))),
            Packet::UnsubAck(5)
        );
        assert_eq!(from_rumqttc(rumqtt::Packet::PingResp), Packet::PingResp);
    }

    #[test]
    fn test_acks_read_by_rumqttc() {
        match to_rumqttc(&Packet::PubRel(12)) {
            rumqtt::Packet::PubRel(rel) => assert_eq!(rel.pkid, 12),
            other => panic!("unexpected packet: {:?}", other),
        }
        match to_rumqttc(&Packet::PubAck(13)) {
            rumqtt::Packet::PubAck(ack) => assert_eq!(ack.pkid, 13),
            other => panic!("unexpected packet: {:?}", other),
        }
        assert_eq!(to_rumqttc(&Packet::PingReq), rumqtt::Packet::PingReq);
        assert_eq!(to_rumqttc(&Packet::Disconnect), rumqtt::Packet::Disconnect);
    }
}
