use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, warn};
use tsbridge_transport::adapter::{DeliveryToken, PubSubTransport, Qos};

use crate::critical::{enter_critical_section, notify_all};
use crate::fatal::{FatalError, FatalSignal};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error(transparent)]
    Fatal(#[from] FatalError),
    #[error("publish rejected by transport: {0}")]
    Rejected(String),
}

/// The one message a publisher may have unacknowledged.
///
/// Holds the outgoing buffer until the transport acknowledges or the slot is
/// abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightSlot {
    pub token: DeliveryToken,
    pub buffer: Bytes,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateStats {
    pub sent: u64,
    pub acknowledged: u64,
    pub stale_acks: u64,
    pub timeouts: u64,
    pub rejected: u64,
    pub abandoned: u64,
}

#[derive(Debug, Default)]
struct GateState {
    slot: Option<InFlightSlot>,
    stats: GateStats,
}

/// Single-slot flow control: at most one message unacknowledged at a time.
///
/// All slot changes happen inside the process-wide critical section;
/// waiting for an acknowledgement leaves the section so transport callback
/// threads can deliver it.
#[derive(Debug)]
pub struct DeliveryGate {
    topic: String,
    client_id: String,
    fatal: FatalSignal,
    state: Mutex<GateState>,
}

impl DeliveryGate {
    pub fn new(topic: impl Into<String>, client_id: impl Into<String>, fatal: FatalSignal) -> Self {
        Self {
            topic: topic.into(),
            client_id: client_id.into(),
            fatal,
            state: Mutex::new(GateState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publishes `buffer` once the previous message has resolved.
    ///
    /// Waits at most `timeout` for the previous acknowledgement; after that
    /// the previous slot is abandoned and the send goes ahead. A synchronous
    /// rejection drops `buffer` and leaves the slot empty.
    pub fn try_send<T>(
        &self,
        transport: &mut T,
        buffer: Bytes,
        qos: Qos,
        retained: bool,
        timeout: Duration,
    ) -> Result<DeliveryToken, GateError>
    where
        T: PubSubTransport + ?Sized,
    {
        let section = enter_critical_section();
        if let Some(err) = self.fatal.get() {
            return Err(GateError::Fatal(err));
        }

        let deadline = Instant::now() + timeout;
        let (_section, timed_out) = section.wait_until(deadline, || {
            self.state().slot.is_some() && !self.fatal.is_raised()
        });
        if let Some(err) = self.fatal.get() {
            return Err(GateError::Fatal(err));
        }
        if timed_out {
            let mut state = self.state();
            if let Some(stale) = state.slot.take() {
                state.stats.timeouts += 1;
                warn!(
                    topic = %self.topic,
                    client_id = %self.client_id,
                    token = stale.token,
                    ?timeout,
                    "no acknowledgement before timeout; abandoning previous message"
                );
            }
        }

        match transport.publish(&self.topic, buffer.clone(), qos, retained) {
            Ok(token) => {
                let mut state = self.state();
                state.slot = Some(InFlightSlot { token, buffer });
                state.stats.sent += 1;
                debug!(topic = %self.topic, token, "message in flight");
                Ok(token)
            }
            Err(err) => {
                self.state().stats.rejected += 1;
                Err(GateError::Rejected(err.to_string()))
            }
        }
    }

    /// Clears the slot when `token` matches it. Stale tokens are ignored.
    pub fn on_acknowledged(&self, token: DeliveryToken) -> bool {
        let _section = enter_critical_section();
        let mut state = self.state();
        if state.slot.as_ref().is_some_and(|slot| slot.token == token) {
            state.slot = None;
            state.stats.acknowledged += 1;
            drop(state);
            notify_all();
            true
        } else {
            state.stats.stale_acks += 1;
            debug!(topic = %self.topic, token, "ignoring stale acknowledgement");
            false
        }
    }

    /// Releases a pending slot without waiting. Returns whether one was pending.
    pub fn abandon(&self) -> bool {
        let _section = enter_critical_section();
        let mut state = self.state();
        let Some(slot) = state.slot.take() else {
            return false;
        };
        state.stats.abandoned += 1;
        drop(state);
        warn!(
            topic = %self.topic,
            client_id = %self.client_id,
            token = slot.token,
            "abandoning unacknowledged message"
        );
        notify_all();
        true
    }

    pub fn is_in_flight(&self) -> bool {
        self.state().slot.is_some()
    }

    pub fn in_flight_token(&self) -> Option<DeliveryToken> {
        self.state().slot.as_ref().map(|slot| slot.token)
    }

    pub fn stats(&self) -> GateStats {
        self.state().stats
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}
