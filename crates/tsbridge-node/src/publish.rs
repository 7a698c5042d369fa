use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, warn};
use tsbridge_codec::footer::encode_payload;
use tsbridge_core::{Instant, Tag};
use tsbridge_transport::adapter::{
    DeliveryToken, DisconnectReason, PubSubTransport, TransportCallbacks,
};

use crate::config::{ConfigError, PublisherConfig};
use crate::critical::enter_critical_section;
use crate::fatal::{FatalError, FatalSignal};
use crate::gate::{DeliveryGate, GateError, GateStats};
use crate::scheduler::HostScheduler;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("invalid publisher config: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fatal(#[from] FatalError),
    #[error("payload dropped: {0}")]
    Dropped(#[from] GateError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub sent: u64,
    pub dropped: u64,
    pub gate: GateStats,
}

/// Transport callbacks registered by a [`Publisher`].
pub struct PublisherCallbacks {
    gate: Arc<DeliveryGate>,
    fatal: FatalSignal,
    client_id: String,
    closing: Arc<AtomicBool>,
}

impl PublisherCallbacks {
    fn fatal_unless_closing(&self, err: FatalError) {
        if self.closing.load(Ordering::SeqCst) {
            debug!(client_id = %self.client_id, "ignoring {err} during shutdown");
            return;
        }
        self.fatal.raise(err);
    }
}

impl TransportCallbacks for PublisherCallbacks {
    fn on_delivered(&self, token: DeliveryToken) {
        self.gate.on_acknowledged(token);
    }

    fn on_connection_lost(&self, cause: &str) {
        self.fatal_unless_closing(FatalError::ConnectionLost {
            topic: self.gate.topic().to_string(),
            client_id: self.client_id.clone(),
            cause: cause.to_string(),
        });
    }

    fn on_message_arrived(&self, topic: &str, _payload: Bytes) -> bool {
        debug!(client_id = %self.client_id, %topic, "publisher ignoring inbound message");
        false
    }

    fn on_disconnected(&self, reason: DisconnectReason) {
        self.fatal_unless_closing(FatalError::Disconnected {
            topic: self.gate.topic().to_string(),
            client_id: self.client_id.clone(),
            reason,
        });
    }
}

/// Sends payloads on one topic with at most one unacknowledged at a time.
///
/// Failed sends are logged and dropped, never retried: a retry could
/// overtake a later payload and break per-topic order.
pub struct Publisher<T: PubSubTransport> {
    transport: T,
    config: PublisherConfig,
    client_id: String,
    gate: Arc<DeliveryGate>,
    closing: Arc<AtomicBool>,
    sent: u64,
    dropped: u64,
}

impl<T: PubSubTransport> Publisher<T> {
    /// Connects `transport` and registers the publisher callbacks.
    ///
    /// A connect failure is raised on `fatal` before being returned.
    pub fn start(
        mut transport: T,
        config: PublisherConfig,
        fatal: FatalSignal,
    ) -> Result<Self, PublishError> {
        config.validate()?;
        let client_id = config.client_id();
        let topic = config.connection.topic.clone();
        let gate = Arc::new(DeliveryGate::new(&topic, &client_id, fatal.clone()));
        let closing = Arc::new(AtomicBool::new(false));
        let callbacks = Arc::new(PublisherCallbacks {
            gate: Arc::clone(&gate),
            fatal: fatal.clone(),
            client_id: client_id.clone(),
            closing: Arc::clone(&closing),
        });

        let options = config.connection.connect_options(&client_id);
        let connected = {
            let _section = enter_critical_section();
            transport.connect(&options, callbacks)
        };
        if let Err(err) = connected {
            let fatal_err = FatalError::ConnectFailed {
                topic,
                client_id,
                broker: options.broker,
                cause: err.to_string(),
            };
            fatal.raise(fatal_err.clone());
            return Err(PublishError::Fatal(fatal_err));
        }
        info!(%topic, %client_id, broker = %options.broker, "publisher connected");

        Ok(Self {
            transport,
            config,
            client_id,
            gate,
            closing,
            sent: 0,
            dropped: 0,
        })
    }

    /// Sends `payload` stamped from the host scheduler's current tag.
    pub fn send(
        &mut self,
        payload: &[u8],
        scheduler: &dyn HostScheduler,
    ) -> Result<DeliveryToken, PublishError> {
        let current = scheduler.current_tag();
        self.send_at(payload, current, scheduler.start_time())
    }

    /// Sends `payload` as if at logical tag `current`.
    ///
    /// With relative timestamps the footer carries `current.time - start_time`.
    pub fn send_at(
        &mut self,
        payload: &[u8],
        current: Tag,
        start_time: Instant,
    ) -> Result<DeliveryToken, PublishError> {
        let timestamp = if self.config.relative_timestamp {
            current.time.saturating_sub(start_time)
        } else {
            current.time
        };
        let buffer = Bytes::from(encode_payload(
            payload,
            self.config.include_timestamp,
            timestamp,
        ));
        match self.gate.try_send(
            &mut self.transport,
            buffer,
            self.config.connection.qos,
            self.config.retained,
            self.config.send_timeout,
        ) {
            Ok(token) => {
                self.sent += 1;
                debug!(topic = %self.gate.topic(), token, %current, "payload sent");
                Ok(token)
            }
            Err(GateError::Fatal(err)) => {
                self.dropped += 1;
                debug!(client_id = %self.client_id, "not sending after fatal error: {err}");
                Err(PublishError::Fatal(err))
            }
            Err(err) => {
                self.dropped += 1;
                warn!(
                    topic = %self.gate.topic(),
                    client_id = %self.client_id,
                    "dropping payload: {err}"
                );
                Err(PublishError::Dropped(err))
            }
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn gate(&self) -> &DeliveryGate {
        &self.gate
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            sent: self.sent,
            dropped: self.dropped,
            gate: self.gate.stats(),
        }
    }

    /// Abandons any in-flight message and disconnects.
    ///
    /// A failed disconnect is only logged.
    pub fn shutdown(mut self, timeout: Duration) -> PublisherStats {
        self.closing.store(true, Ordering::SeqCst);
        self.gate.abandon();
        {
            let _section = enter_critical_section();
            if let Err(err) = self.transport.disconnect(timeout) {
                warn!(client_id = %self.client_id, "disconnect failed: {err}");
            }
        }
        let stats = self.stats();
        info!(
            topic = %self.gate.topic(),
            client_id = %self.client_id,
            sent = stats.sent,
            dropped = stats.dropped,
            "publisher stopped"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::{PublishError, Publisher};
    use crate::config::PublisherConfig;
    use crate::fatal::{FatalError, FatalSignal};
    use std::time::Duration;
    use tsbridge_codec::footer::decode_payload;
    use tsbridge_core::Tag;
    use tsbridge_transport::adapter::{
        ConnectOptions, DeliveryToken, DisconnectReason, PubSubTransport, Qos, TransportCallbacks,
    };
    use tsbridge_transport::memory::InMemoryBroker;

    use bytes::Bytes;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Sink {
        payloads: Mutex<Vec<Vec<u8>>>,
    }

    impl TransportCallbacks for Sink {
        fn on_delivered(&self, _token: DeliveryToken) {}
        fn on_connection_lost(&self, _cause: &str) {}
        fn on_message_arrived(&self, _topic: &str, payload: Bytes) -> bool {
            self.payloads.lock().expect("sink lock").push(payload.to_vec());
            true
        }
        fn on_disconnected(&self, _reason: DisconnectReason) {}
    }

    fn config(topic: &str, id: &str) -> PublisherConfig {
        let mut cfg = PublisherConfig::new("memory", topic);
        cfg.connection.client_id = Some(id.to_string());
        cfg.send_timeout = Duration::from_millis(200);
        cfg
    }

    fn listen(broker: &InMemoryBroker, topic: &str) -> (impl PubSubTransport, Arc<Sink>) {
        let sink = Arc::new(Sink::default());
        let mut transport = broker.transport();
        transport
            .connect(&ConnectOptions::new("memory", "sub-sink"), sink.clone())
            .expect("sink connect");
        transport.subscribe(topic, Qos::AtLeastOnce).expect("sink subscribe");
        (transport, sink)
    }

    #[test]
    fn absolute_timestamp_is_current_logical_time() {
        let broker = InMemoryBroker::new();
        let (_sub, sink) = listen(&broker, "pub/abs");
        let mut publisher =
            Publisher::start(broker.transport(), config("pub/abs", "pub-abs"), FatalSignal::new())
                .expect("start");

        publisher
            .send_at(b"reading", Tag::new(5_000, 3), 1_000)
            .expect("send");
        broker.pump();

        let payloads = sink.payloads.lock().expect("sink lock").clone();
        assert_eq!(payloads.len(), 1);
        assert_eq!(decode_payload(&payloads[0]), (&b"reading"[..], Some(5_000)));
    }

    #[test]
    fn relative_timestamp_subtracts_start_time() {
        let broker = InMemoryBroker::new();
        let (_sub, sink) = listen(&broker, "pub/rel");
        let mut cfg = config("pub/rel", "pub-rel");
        cfg.relative_timestamp = true;
        let mut publisher =
            Publisher::start(broker.transport(), cfg, FatalSignal::new()).expect("start");

        publisher.send_at(b"r", Tag::new(5_000, 0), 1_000).expect("send");
        broker.pump();

        let payloads = sink.payloads.lock().expect("sink lock").clone();
        assert_eq!(decode_payload(&payloads[0]).1, Some(4_000));
    }

    #[test]
    fn timestamp_can_be_disabled() {
        let broker = InMemoryBroker::new();
        let (_sub, sink) = listen(&broker, "pub/plain");
        let mut cfg = config("pub/plain", "pub-plain");
        cfg.include_timestamp = false;
        let mut publisher =
            Publisher::start(broker.transport(), cfg, FatalSignal::new()).expect("start");

        publisher.send_at(b"plain", Tag::new(9, 0), 0).expect("send");
        broker.pump();
        assert_eq!(
            sink.payloads.lock().expect("sink lock").as_slice(),
            &[b"plain".to_vec()]
        );
    }

    #[test]
    fn rejected_publish_is_dropped_not_retried() {
        let broker = InMemoryBroker::new();
        let mut publisher =
            Publisher::start(broker.transport(), config("pub/rej", "pub-rej"), FatalSignal::new())
                .expect("start");
        broker.set_reject_publishes(true);

        let err = publisher.send_at(b"x", Tag::new(1, 0), 0).expect_err("rejected");
        assert!(matches!(err, PublishError::Dropped(_)));
        broker.set_reject_publishes(false);
        publisher.send_at(b"y", Tag::new(2, 0), 0).expect("next send");

        let stats = publisher.stats();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(broker.publish_count(), 1);
    }

    #[test]
    fn send_after_connection_loss_reports_fatal() {
        let broker = InMemoryBroker::new();
        let fatal = FatalSignal::new();
        let mut publisher =
            Publisher::start(broker.transport(), config("pub/lost", "pub-lost"), fatal.clone())
                .expect("start");
        assert!(broker.sever("pub-lost", "link down"));
        broker.pump();
        assert!(matches!(fatal.get(), Some(FatalError::ConnectionLost { .. })));

        let err = publisher.send_at(b"x", Tag::new(1, 0), 0).expect_err("fatal");
        assert!(matches!(err, PublishError::Fatal(FatalError::ConnectionLost { .. })));
        assert_eq!(publisher.stats().dropped, 1);
        assert_eq!(broker.publish_count(), 0);
    }

    #[test]
    fn connect_failure_is_fatal() {
        let broker = InMemoryBroker::new();
        broker.set_refuse_connects(true);
        let fatal = FatalSignal::new();
        let cfg = config("pub/refused", "pub-refused");
        let err = Publisher::start(broker.transport(), cfg, fatal.clone())
            .err()
            .expect("refused");
        assert!(matches!(err, PublishError::Fatal(FatalError::ConnectFailed { .. })));
        assert!(matches!(fatal.get(), Some(FatalError::ConnectFailed { .. })));
    }

    #[test]
    fn shutdown_abandons_in_flight_message() {
        let broker = InMemoryBroker::new();
        broker.set_withhold_acks(true);
        let mut publisher =
            Publisher::start(broker.transport(), config("pub/down", "pub-down"), FatalSignal::new())
                .expect("start");
        publisher.send_at(b"x", Tag::new(1, 0), 0).expect("send");
        assert!(publisher.gate().is_in_flight());

        let stats = publisher.shutdown(Duration::from_millis(100));
        assert_eq!(stats.gate.abandoned, 1);
        assert!(!broker.is_connected("pub-down"));
    }
}
