use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tsbridge_codec::footer::{decode_payload, encode_payload};
use tsbridge_transport::adapter::{
    ConnectOptions, DeliveryToken, DisconnectReason, PubSubTransport, Qos, TransportCallbacks,
};
use tsbridge_transport_websocket::{RelayServer, RelayServerConfig, WebSocketTransport};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq)]
enum Event {
    Delivered(DeliveryToken),
    Lost,
    Arrived(String, Vec<u8>),
    Disconnected(DisconnectReason),
}

struct Channel {
    tx: Mutex<Sender<Event>>,
}

impl Channel {
    fn new() -> (Arc<Self>, Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Self { tx: Mutex::new(tx) }), rx)
    }

    fn push(&self, event: Event) {
        let _ = self.tx.lock().expect("channel lock").send(event);
    }
}

impl TransportCallbacks for Channel {
    fn on_delivered(&self, token: DeliveryToken) {
        self.push(Event::Delivered(token));
    }
    fn on_connection_lost(&self, _cause: &str) {
        self.push(Event::Lost);
    }
    fn on_message_arrived(&self, topic: &str, payload: Bytes) -> bool {
        self.push(Event::Arrived(topic.to_string(), payload.to_vec()));
        true
    }
    fn on_disconnected(&self, reason: DisconnectReason) {
        self.push(Event::Disconnected(reason));
    }
}

fn connect(server: &RelayServer, id: &str) -> (WebSocketTransport, Receiver<Event>) {
    let (callbacks, events) = Channel::new();
    let mut transport = WebSocketTransport::default();
    transport
        .connect(&ConnectOptions::new(server.url(), id), callbacks)
        .expect("connect to relay");
    assert!(transport.is_connected());
    (transport, events)
}

#[test]
fn publish_reaches_subscriber_and_is_acknowledged() {
    let server = RelayServer::listen(RelayServerConfig::new("127.0.0.1:0")).expect("listen");
    let (mut subscriber, sub_events) = connect(&server, "sub-0000000000000001");
    let (mut publisher, pub_events) = connect(&server, "pub-0000000000000001");

    subscriber
        .subscribe("sensors/temp", Qos::AtLeastOnce)
        .expect("subscribe");

    let stamped = encode_payload(b"21.5", true, 1_700_000_000_000_000_000);
    let token = publisher
        .publish("sensors/temp", Bytes::from(stamped.clone()), Qos::AtLeastOnce, false)
        .expect("publish");

    assert_eq!(pub_events.recv_timeout(WAIT).expect("ack"), Event::Delivered(token));
    match sub_events.recv_timeout(WAIT).expect("delivery") {
        Event::Arrived(topic, payload) => {
            assert_eq!(topic, "sensors/temp");
            assert_eq!(payload, stamped);
            assert_eq!(
                decode_payload(&payload),
                (&b"21.5"[..], Some(1_700_000_000_000_000_000))
            );
        }
        other => panic!("unexpected event {other:?}"),
    }

    let stats = server.stats_snapshot();
    assert_eq!(stats.publishes_routed, 1);
    assert_eq!(stats.deliveries_sent, 1);

    publisher.disconnect(WAIT).expect("publisher disconnect");
    subscriber.disconnect(WAIT).expect("subscriber disconnect");
    assert!(pub_events.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn tokens_increase_per_publish() {
    let server = RelayServer::listen(RelayServerConfig::new("127.0.0.1:0")).expect("listen");
    let (mut publisher, events) = connect(&server, "pub-tokens");
    let first = publisher
        .publish("a", Bytes::from_static(b"1"), Qos::AtMostOnce, false)
        .expect("first publish");
    let second = publisher
        .publish("a", Bytes::from_static(b"2"), Qos::AtMostOnce, false)
        .expect("second publish");
    assert!(second > first);
    assert_eq!(events.recv_timeout(WAIT).expect("ack"), Event::Delivered(first));
    assert_eq!(events.recv_timeout(WAIT).expect("ack"), Event::Delivered(second));
}

#[test]
fn retained_message_is_replayed_to_late_subscriber() {
    let server = RelayServer::listen(RelayServerConfig::new("127.0.0.1:0")).expect("listen");
    let (mut publisher, pub_events) = connect(&server, "pub-retained");
    let token = publisher
        .publish("status/door", Bytes::from_static(b"open"), Qos::AtLeastOnce, true)
        .expect("publish retained");
    assert_eq!(pub_events.recv_timeout(WAIT).expect("ack"), Event::Delivered(token));

    let (mut subscriber, sub_events) = connect(&server, "sub-retained");
    subscriber.subscribe("status/+", Qos::AtLeastOnce).expect("subscribe");
    assert_eq!(
        sub_events.recv_timeout(WAIT).expect("retained replay"),
        Event::Arrived("status/door".to_string(), b"open".to_vec())
    );
}

#[test]
fn duplicate_client_id_disconnects_previous_session() {
    let server = RelayServer::listen(RelayServerConfig::new("127.0.0.1:0")).expect("listen");
    let (first, first_events) = connect(&server, "pub-duplicate");
    let (second, second_events) = connect(&server, "pub-duplicate");

    assert_eq!(
        first_events.recv_timeout(WAIT).expect("takeover notice"),
        Event::Disconnected(DisconnectReason::DuplicateClientId)
    );
    assert!(second.is_connected());
    assert!(second_events.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(server.stats_snapshot().sessions_taken_over, 1);
    drop(first);
}

#[test]
fn relay_shutdown_notifies_clients() {
    let server = RelayServer::listen(RelayServerConfig::new("127.0.0.1:0")).expect("listen");
    let (_client, events) = connect(&server, "sub-shutdown");
    server.shutdown();
    assert_eq!(
        events.recv_timeout(WAIT).expect("shutdown notice"),
        Event::Disconnected(DisconnectReason::ServerShutdown)
    );
}

#[test]
fn connect_to_missing_relay_fails() {
    let (callbacks, _events) = Channel::new();
    let mut transport = WebSocketTransport::default();
    let mut options = ConnectOptions::new("ws://127.0.0.1:1", "pub-nowhere");
    options.connect_timeout = Duration::from_secs(1);
    assert!(transport.connect(&options, callbacks).is_err());
    assert!(!transport.is_connected());
}
