//! In-process broker and transport for tests and simulations.
//!
//! Callbacks are never invoked from inside a transport call. Events queue up
//! in the broker and are dispatched by [`InMemoryBroker::pump`], on whatever
//! thread calls it, with no broker lock held.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tracing::debug;
use tsbridge_core::error::CoreError;
use tsbridge_core::ident::{topic_matches, validate_topic, validate_topic_filter};

use crate::adapter::{
    ConnectOptions, DeliveryToken, DisconnectReason, PubSubTransport, Qos, TransportCallbacks,
};

#[derive(Debug, Error)]
pub enum MemoryTransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("client id must not be empty")]
    EmptyClientId,
    #[error("{0}")]
    Topic(#[from] CoreError),
    #[error("connect refused by broker")]
    Refused,
    #[error("publish rejected by broker")]
    PublishRejected,
    #[error("subscribe rejected by broker")]
    SubscribeRejected,
}

enum Event {
    Delivered(DeliveryToken),
    Arrived { topic: String, payload: Bytes },
    Lost(String),
    Disconnected(DisconnectReason),
}

struct QueuedEvent {
    session: u64,
    client_id: String,
    callbacks: Arc<dyn TransportCallbacks>,
    event: Event,
}

struct ClientEntry {
    session: u64,
    callbacks: Arc<dyn TransportCallbacks>,
    filters: Vec<String>,
}

#[derive(Default)]
struct BrokerState {
    clients: HashMap<String, ClientEntry>,
    retained: HashMap<String, Bytes>,
    queue: VecDeque<QueuedEvent>,
    withheld: Vec<QueuedEvent>,
    unresolved: HashMap<String, usize>,
    max_unresolved: usize,
    publish_count: u64,
    next_session: u64,
    refuse_connects: bool,
    reject_publishes: bool,
    reject_subscribes: bool,
    withhold_acks: bool,
}

impl BrokerState {
    fn purge_session(&mut self, session: u64) {
        self.queue.retain(|queued| queued.session != session);
        self.withheld.retain(|queued| queued.session != session);
    }

    fn fan_out(&mut self, topic: &str, payload: &Bytes) {
        let mut deliveries = Vec::new();
        for (client_id, entry) in &self.clients {
            if entry.filters.iter().any(|f| topic_matches(f, topic)) {
                deliveries.push(QueuedEvent {
                    session: entry.session,
                    client_id: client_id.clone(),
                    callbacks: Arc::clone(&entry.callbacks),
                    event: Event::Arrived {
                        topic: topic.to_string(),
                        payload: payload.clone(),
                    },
                });
            }
        }
        self.queue.extend(deliveries);
    }
}

/// Shared handle to one in-process broker. Cloning shares the broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates an unconnected client transport bound to this broker.
    pub fn transport(&self) -> InMemoryTransport {
        InMemoryTransport {
            broker: self.clone(),
            client_id: None,
            session: 0,
            next_token: 1,
        }
    }

    /// Dispatches queued callbacks until the queue is empty.
    ///
    /// Returns the number of callbacks invoked.
    pub fn pump(&self) -> usize {
        let mut dispatched = 0_usize;
        loop {
            let next = {
                let mut state = self.lock();
                let next = state.queue.pop_front();
                if let Some(QueuedEvent {
                    client_id,
                    event: Event::Delivered(_),
                    ..
                }) = &next
                {
                    if let Some(count) = state.unresolved.get_mut(client_id) {
                        *count = count.saturating_sub(1);
                    }
                }
                next
            };
            let Some(queued) = next else {
                return dispatched;
            };
            match queued.event {
                Event::Delivered(token) => queued.callbacks.on_delivered(token),
                Event::Arrived { topic, payload } => {
                    if !queued.callbacks.on_message_arrived(&topic, payload) {
                        debug!(client_id = %queued.client_id, %topic, "message left unhandled");
                    }
                }
                Event::Lost(cause) => queued.callbacks.on_connection_lost(&cause),
                Event::Disconnected(reason) => queued.callbacks.on_disconnected(reason),
            }
            dispatched += 1;
        }
    }

    /// When enabled, publish acknowledgements are held back until
    /// [`InMemoryBroker::release_withheld_acks`].
    pub fn set_withhold_acks(&self, withhold: bool) {
        self.lock().withhold_acks = withhold;
    }

    /// Moves withheld acknowledgements to the dispatch queue.
    pub fn release_withheld_acks(&self) -> usize {
        let mut state = self.lock();
        let withheld = std::mem::take(&mut state.withheld);
        let released = withheld.len();
        state.queue.extend(withheld);
        released
    }

    /// Drops withheld acknowledgements, simulating lost broker replies.
    pub fn discard_withheld_acks(&self) -> usize {
        let mut state = self.lock();
        let dropped = state.withheld.len();
        state.withheld.clear();
        dropped
    }

    pub fn set_reject_publishes(&self, reject: bool) {
        self.lock().reject_publishes = reject;
    }

    pub fn set_reject_subscribes(&self, reject: bool) {
        self.lock().reject_subscribes = reject;
    }

    pub fn set_refuse_connects(&self, refuse: bool) {
        self.lock().refuse_connects = refuse;
    }

    /// Publishes directly from the broker side, as a foreign client would.
    pub fn inject(&self, topic: &str, payload: Bytes) {
        self.lock().fan_out(topic, &payload);
    }

    /// Drops a client's connection; its handler sees `on_connection_lost`.
    pub fn sever(&self, client_id: &str, cause: &str) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.clients.remove(client_id) else {
            return false;
        };
        state.purge_session(entry.session);
        state.queue.push_back(QueuedEvent {
            session: entry.session,
            client_id: client_id.to_string(),
            callbacks: entry.callbacks,
            event: Event::Lost(cause.to_string()),
        });
        true
    }

    /// Ends a client's session from the broker side.
    pub fn kick(&self, client_id: &str, reason: DisconnectReason) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.clients.remove(client_id) else {
            return false;
        };
        state.purge_session(entry.session);
        state.queue.push_back(QueuedEvent {
            session: entry.session,
            client_id: client_id.to_string(),
            callbacks: entry.callbacks,
            event: Event::Disconnected(reason),
        });
        true
    }

    /// Total publishes accepted by the broker.
    pub fn publish_count(&self) -> u64 {
        self.lock().publish_count
    }

    /// Highest number of accepted-but-unacknowledged publishes any single
    /// client has had outstanding.
    pub fn max_unresolved(&self) -> usize {
        self.lock().max_unresolved
    }

    pub fn retained(&self, topic: &str) -> Option<Bytes> {
        self.lock().retained.get(topic).cloned()
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.lock().clients.contains_key(client_id)
    }

    pub fn pending_events(&self) -> usize {
        self.lock().queue.len()
    }
}

/// Client side of an [`InMemoryBroker`] session.
pub struct InMemoryTransport {
    broker: InMemoryBroker,
    client_id: Option<String>,
    session: u64,
    next_token: DeliveryToken,
}

impl InMemoryTransport {
    fn current_client<'a>(
        &self,
        state: &'a mut BrokerState,
    ) -> Result<(String, &'a mut ClientEntry), MemoryTransportError> {
        let client_id = self
            .client_id
            .as_deref()
            .ok_or(MemoryTransportError::NotConnected)?;
        match state.clients.get_mut(client_id) {
            Some(entry) if entry.session == self.session => Ok((client_id.to_string(), entry)),
            _ => Err(MemoryTransportError::NotConnected),
        }
    }
}

impl PubSubTransport for InMemoryTransport {
    type Error = MemoryTransportError;

    fn connect(
        &mut self,
        options: &ConnectOptions,
        callbacks: Arc<dyn TransportCallbacks>,
    ) -> Result<(), Self::Error> {
        if options.client_id.trim().is_empty() {
            return Err(MemoryTransportError::EmptyClientId);
        }
        let mut state = self.broker.lock();
        if state.refuse_connects {
            return Err(MemoryTransportError::Refused);
        }
        state.next_session += 1;
        let session = state.next_session;
        if let Some(previous) = state.clients.remove(&options.client_id) {
            state.purge_session(previous.session);
            state.queue.push_back(QueuedEvent {
                session: previous.session,
                client_id: options.client_id.clone(),
                callbacks: previous.callbacks,
                event: Event::Disconnected(DisconnectReason::DuplicateClientId),
            });
        }
        state.unresolved.insert(options.client_id.clone(), 0);
        state.clients.insert(
            options.client_id.clone(),
            ClientEntry {
                session,
                callbacks,
                filters: Vec::new(),
            },
        );
        self.client_id = Some(options.client_id.clone());
        self.session = session;
        Ok(())
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        _qos: Qos,
        retained: bool,
    ) -> Result<DeliveryToken, Self::Error> {
        validate_topic(topic)?;
        let mut state = self.broker.lock();
        let (client_id, entry) = self.current_client(&mut state)?;
        let callbacks = Arc::clone(&entry.callbacks);
        if state.reject_publishes {
            return Err(MemoryTransportError::PublishRejected);
        }

        let token = self.next_token;
        self.next_token += 1;
        state.publish_count += 1;

        if retained {
            if payload.is_empty() {
                state.retained.remove(topic);
            } else {
                state.retained.insert(topic.to_string(), payload.clone());
            }
        }
        state.fan_out(topic, &payload);

        let unresolved = state.unresolved.entry(client_id.clone()).or_insert(0);
        *unresolved += 1;
        let unresolved = *unresolved;
        state.max_unresolved = state.max_unresolved.max(unresolved);

        let ack = QueuedEvent {
            session: self.session,
            client_id,
            callbacks,
            event: Event::Delivered(token),
        };
        if state.withhold_acks {
            state.withheld.push(ack);
        } else {
            state.queue.push_back(ack);
        }
        Ok(token)
    }

    fn subscribe(&mut self, topic: &str, _qos: Qos) -> Result<(), Self::Error> {
        validate_topic_filter(topic)?;
        let mut state = self.broker.lock();
        if state.reject_subscribes {
            return Err(MemoryTransportError::SubscribeRejected);
        }
        let (client_id, entry) = self.current_client(&mut state)?;
        entry.filters.push(topic.to_string());
        let callbacks = Arc::clone(&entry.callbacks);

        let retained: Vec<QueuedEvent> = state
            .retained
            .iter()
            .filter(|(name, _)| topic_matches(topic, name))
            .map(|(name, payload)| QueuedEvent {
                session: self.session,
                client_id: client_id.clone(),
                callbacks: Arc::clone(&callbacks),
                event: Event::Arrived {
                    topic: name.clone(),
                    payload: payload.clone(),
                },
            })
            .collect();
        state.queue.extend(retained);
        Ok(())
    }

    fn disconnect(&mut self, _timeout: Duration) -> Result<(), Self::Error> {
        let client_id = self
            .client_id
            .take()
            .ok_or(MemoryTransportError::NotConnected)?;
        let mut state = self.broker.lock();
        let current = state
            .clients
            .get(&client_id)
            .is_some_and(|entry| entry.session == self.session);
        if !current {
            return Err(MemoryTransportError::NotConnected);
        }
        state.clients.remove(&client_id);
        state.purge_session(self.session);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        let Some(client_id) = self.client_id.as_deref() else {
            return false;
        };
        self.broker
            .lock()
            .clients
            .get(client_id)
            .is_some_and(|entry| entry.session == self.session)
    }
}

#[cfg(test)]
mod tests {
    use super::{InMemoryBroker, MemoryTransportError};
    use crate::adapter::{
        ConnectOptions, DeliveryToken, DisconnectReason, PubSubTransport, Qos,
        TransportCallbacks,
    };
    use bytes::Bytes;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Seen {
        Delivered(DeliveryToken),
        Lost(String),
        Arrived(String, Vec<u8>),
        Disconnected(DisconnectReason),
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Seen>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<Seen> {
            std::mem::take(&mut *self.seen.lock().expect("recorder lock"))
        }
    }

    impl TransportCallbacks for Recorder {
        fn on_delivered(&self, token: DeliveryToken) {
            self.seen.lock().expect("recorder lock").push(Seen::Delivered(token));
        }
        fn on_connection_lost(&self, cause: &str) {
            self.seen
                .lock()
                .expect("recorder lock")
                .push(Seen::Lost(cause.to_string()));
        }
        fn on_message_arrived(&self, topic: &str, payload: Bytes) -> bool {
            self.seen
                .lock()
                .expect("recorder lock")
                .push(Seen::Arrived(topic.to_string(), payload.to_vec()));
            true
        }
        fn on_disconnected(&self, reason: DisconnectReason) {
            self.seen
                .lock()
                .expect("recorder lock")
                .push(Seen::Disconnected(reason));
        }
    }

    fn connected(broker: &InMemoryBroker, id: &str) -> (super::InMemoryTransport, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let mut transport = broker.transport();
        transport
            .connect(&ConnectOptions::new("memory", id), recorder.clone())
            .expect("connect should succeed");
        (transport, recorder)
    }

    #[test]
    fn publish_routes_to_matching_subscribers_and_acks_sender() {
        let broker = InMemoryBroker::new();
        let (mut publisher, pub_events) = connected(&broker, "pub");
        let (mut subscriber, sub_events) = connected(&broker, "sub");
        subscriber
            .subscribe("sensors/+", Qos::AtLeastOnce)
            .expect("subscribe should succeed");

        let token = publisher
            .publish("sensors/temp", Bytes::from_static(b"21"), Qos::AtLeastOnce, false)
            .expect("publish should succeed");
        publisher
            .publish("other", Bytes::from_static(b"x"), Qos::AtLeastOnce, false)
            .expect("publish should succeed");
        assert_eq!(broker.pump(), 3);

        assert_eq!(
            pub_events.take(),
            vec![Seen::Delivered(token), Seen::Delivered(token + 1)]
        );
        assert_eq!(
            sub_events.take(),
            vec![Seen::Arrived("sensors/temp".to_string(), b"21".to_vec())]
        );
    }

    #[test]
    fn callbacks_wait_for_pump() {
        let broker = InMemoryBroker::new();
        let (mut publisher, events) = connected(&broker, "pub");
        publisher
            .publish("t", Bytes::from_static(b"x"), Qos::AtMostOnce, false)
            .expect("publish should succeed");
        assert!(events.take().is_empty());
        assert_eq!(broker.pending_events(), 1);
        broker.pump();
        assert_eq!(events.take().len(), 1);
    }

    #[test]
    fn retained_message_is_replayed_on_subscribe_and_cleared_by_empty_payload() {
        let broker = InMemoryBroker::new();
        let (mut publisher, _) = connected(&broker, "pub");
        publisher
            .publish("cfg", Bytes::from_static(b"v1"), Qos::AtLeastOnce, true)
            .expect("publish should succeed");
        broker.pump();

        let (mut late, late_events) = connected(&broker, "late");
        late.subscribe("cfg", Qos::AtLeastOnce)
            .expect("subscribe should succeed");
        broker.pump();
        assert_eq!(
            late_events.take(),
            vec![Seen::Arrived("cfg".to_string(), b"v1".to_vec())]
        );

        publisher
            .publish("cfg", Bytes::new(), Qos::AtLeastOnce, true)
            .expect("publish should succeed");
        assert!(broker.retained("cfg").is_none());
    }

    #[test]
    fn duplicate_client_id_takes_over_and_notifies_old_session() {
        let broker = InMemoryBroker::new();
        let (mut first, first_events) = connected(&broker, "same");
        let (_second, second_events) = connected(&broker, "same");
        broker.pump();

        assert_eq!(
            first_events.take(),
            vec![Seen::Disconnected(DisconnectReason::DuplicateClientId)]
        );
        assert!(second_events.take().is_empty());
        assert!(!first.is_connected());
        let err = first
            .publish("t", Bytes::from_static(b"x"), Qos::AtLeastOnce, false)
            .expect_err("stale session must not publish");
        assert!(matches!(err, MemoryTransportError::NotConnected));
    }

    #[test]
    fn injected_failures_are_reported_synchronously() {
        let broker = InMemoryBroker::new();
        broker.set_refuse_connects(true);
        let mut refused = broker.transport();
        assert!(matches!(
            refused.connect(&ConnectOptions::new("memory", "x"), Arc::new(Recorder::default())),
            Err(MemoryTransportError::Refused)
        ));
        broker.set_refuse_connects(false);

        let (mut client, _) = connected(&broker, "c");
        broker.set_reject_publishes(true);
        assert!(matches!(
            client.publish("t", Bytes::from_static(b"x"), Qos::AtLeastOnce, false),
            Err(MemoryTransportError::PublishRejected)
        ));
        assert_eq!(broker.publish_count(), 0);

        broker.set_reject_subscribes(true);
        assert!(client.subscribe("t", Qos::AtLeastOnce).is_err());
    }

    #[test]
    fn withheld_acks_are_released_on_demand_and_tracked_as_unresolved() {
        let broker = InMemoryBroker::new();
        let (mut client, events) = connected(&broker, "c");
        broker.set_withhold_acks(true);
        for _ in 0..3 {
            client
                .publish("t", Bytes::from_static(b"x"), Qos::AtLeastOnce, false)
                .expect("publish should succeed");
        }
        broker.pump();
        assert!(events.take().is_empty());
        assert_eq!(broker.max_unresolved(), 3);

        assert_eq!(broker.release_withheld_acks(), 3);
        broker.pump();
        assert_eq!(events.take().len(), 3);
    }

    #[test]
    fn discarded_acks_never_reach_the_client() {
        let broker = InMemoryBroker::new();
        let (mut client, events) = connected(&broker, "c");
        broker.set_withhold_acks(true);
        client
            .publish("t", Bytes::from_static(b"x"), Qos::AtLeastOnce, false)
            .expect("publish should succeed");
        assert_eq!(broker.discard_withheld_acks(), 1);
        assert_eq!(broker.release_withheld_acks(), 0);
        assert_eq!(broker.pump(), 0);
        assert!(events.take().is_empty());
    }

    #[test]
    fn is_connected_follows_the_session() {
        let broker = InMemoryBroker::new();
        let mut client = broker.transport();
        assert!(!client.is_connected());
        client
            .connect(
                &ConnectOptions::new("memory", "c"),
                Arc::new(Recorder::default()),
            )
            .expect("connect should succeed");
        assert!(client.is_connected());
        assert!(broker.sever("c", "cable pulled"));
        assert!(!client.is_connected());

        let (mut other, _events) = connected(&broker, "d");
        other
            .disconnect(Duration::from_millis(10))
            .expect("disconnect should succeed");
        assert!(!other.is_connected());
    }

    #[test]
    fn sever_and_kick_notify_the_client() {
        let broker = InMemoryBroker::new();
        let (_a, a_events) = connected(&broker, "a");
        let (_b, b_events) = connected(&broker, "b");
        assert!(broker.sever("a", "network unreachable"));
        assert!(broker.kick("b", DisconnectReason::ServerShutdown));
        assert!(!broker.sever("a", "again"));
        broker.pump();
        assert_eq!(
            a_events.take(),
            vec![Seen::Lost("network unreachable".to_string())]
        );
        assert_eq!(
            b_events.take(),
            vec![Seen::Disconnected(DisconnectReason::ServerShutdown)]
        );
    }

    #[test]
    fn client_disconnect_is_silent_and_drops_queued_events() {
        let broker = InMemoryBroker::new();
        let (mut client, events) = connected(&broker, "c");
        client
            .publish("t", Bytes::from_static(b"x"), Qos::AtLeastOnce, false)
            .expect("publish should succeed");
        client
            .disconnect(Duration::from_millis(10))
            .expect("disconnect should succeed");
        assert_eq!(broker.pump(), 0);
        assert!(events.take().is_empty());
        assert!(client.disconnect(Duration::from_millis(10)).is_err());
    }
}
