use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, warn};
use tsbridge_codec::footer::decode_bytes;
use tsbridge_core::types::duration_to_interval;
use tsbridge_core::{Instant, Interval, Tag};
use tsbridge_transport::adapter::{
    DeliveryToken, DisconnectReason, PubSubTransport, TransportCallbacks,
};

use crate::config::{ConfigError, SubscriberConfig};
use crate::critical::enter_critical_section;
use crate::fatal::{FatalError, FatalSignal};
use crate::latency::{LatencyReport, LatencyTracker};
use crate::scheduler::{ActionHandle, HostScheduler};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscribeError {
    #[error("invalid subscriber config: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fatal(#[from] FatalError),
}

/// Where one arrival was scheduled, and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrivalOutcome {
    /// Tag the payload was scheduled at.
    pub tag: Tag,
    /// Delay handed to the scheduler, after clamping.
    pub delay: Interval,
    /// The target time was not after the current tag.
    pub clamped: bool,
    /// Timestamp found in the footer, if any.
    pub timestamp: Option<Instant>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    pub arrivals: u64,
    pub timestamped: u64,
    pub untimestamped: u64,
    pub clamped: u64,
}

#[derive(Debug, Default)]
struct ContextState {
    latency: LatencyTracker,
    stats: SubscriberStats,
}

/// Per-subscriber reconciliation state: turns arrivals into scheduled events.
pub struct SubscriberContext {
    topic: String,
    scheduler: Arc<dyn HostScheduler>,
    action: ActionHandle,
    use_physical_time: bool,
    relative_timestamp: bool,
    offset: Interval,
    state: Mutex<ContextState>,
}

impl SubscriberContext {
    pub fn new(
        config: &SubscriberConfig,
        scheduler: Arc<dyn HostScheduler>,
        action: ActionHandle,
    ) -> Self {
        Self {
            topic: config.connection.topic.clone(),
            scheduler,
            action,
            use_physical_time: config.use_physical_time,
            relative_timestamp: config.relative_timestamp,
            offset: duration_to_interval(config.offset),
            state: Mutex::new(ContextState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedules one received payload for the downstream action.
    ///
    /// The whole read-compute-schedule sequence runs inside the critical
    /// section, so the scheduler's current tag cannot move underneath it.
    pub fn handle_arrival(&self, payload: Bytes, physical: Instant) -> ArrivalOutcome {
        let _section = enter_critical_section();
        let (data, timestamp) = decode_bytes(payload);
        let mut state = self.state();
        state.stats.arrivals += 1;

        match timestamp {
            Some(ts) => {
                state.stats.timestamped += 1;
                if !self.relative_timestamp {
                    state.latency.record(physical.saturating_sub(ts));
                }
            }
            None => state.stats.untimestamped += 1,
        }

        let target = if self.use_physical_time {
            Some(physical.saturating_add(self.offset))
        } else if let Some(ts) = timestamp {
            let base = if self.relative_timestamp {
                ts.saturating_add(self.scheduler.start_time())
            } else {
                ts
            };
            Some(base.saturating_add(self.offset))
        } else {
            warn!(topic = %self.topic, "no timestamp on arrival; delivering at the next microstep");
            None
        };

        let current = self.scheduler.current_tag();
        let (delay, clamped) = match target {
            Some(target) => {
                let delay = target.saturating_sub(current.time);
                if delay <= 0 {
                    warn!(
                        topic = %self.topic,
                        target,
                        %current,
                        "target timestamp is in the past; delivering at the next microstep"
                    );
                    (0, true)
                } else {
                    (delay, false)
                }
            }
            None => (0, false),
        };
        if clamped {
            state.stats.clamped += 1;
        }

        let tag = self.scheduler.schedule_at(self.action, delay, data);
        debug!(topic = %self.topic, %tag, delay, "arrival scheduled");
        ArrivalOutcome {
            tag,
            delay,
            clamped,
            timestamp,
        }
    }

    pub fn stats(&self) -> SubscriberStats {
        self.state().stats
    }

    pub fn latency(&self) -> LatencyTracker {
        self.state().latency
    }

    pub fn latency_report(&self) -> Option<LatencyReport> {
        self.state().latency.report()
    }
}

/// Transport callbacks registered by a [`Subscriber`].
pub struct SubscriberCallbacks {
    context: Arc<SubscriberContext>,
    fatal: FatalSignal,
    client_id: String,
    closing: Arc<AtomicBool>,
}

impl SubscriberCallbacks {
    fn fatal_unless_closing(&self, err: FatalError) {
        if self.closing.load(Ordering::SeqCst) {
            debug!(client_id = %self.client_id, "ignoring {err} during shutdown");
            return;
        }
        self.fatal.raise(err);
    }
}

impl TransportCallbacks for SubscriberCallbacks {
    fn on_delivered(&self, token: DeliveryToken) {
        debug!(client_id = %self.client_id, token, "subscriber ignoring delivery notice");
    }

    fn on_connection_lost(&self, cause: &str) {
        self.fatal_unless_closing(FatalError::ConnectionLost {
            topic: self.context.topic.clone(),
            client_id: self.client_id.clone(),
            cause: cause.to_string(),
        });
    }

    fn on_message_arrived(&self, _topic: &str, payload: Bytes) -> bool {
        let physical = self.context.scheduler.physical_time();
        self.context.handle_arrival(payload, physical);
        true
    }

    fn on_disconnected(&self, reason: DisconnectReason) {
        self.fatal_unless_closing(FatalError::Disconnected {
            topic: self.context.topic.clone(),
            client_id: self.client_id.clone(),
            reason,
        });
    }
}

/// Receives payloads on one topic and schedules them with the host.
pub struct Subscriber<T: PubSubTransport> {
    transport: T,
    client_id: String,
    context: Arc<SubscriberContext>,
    closing: Arc<AtomicBool>,
}

impl<T: PubSubTransport> Subscriber<T> {
    /// Connects, registers callbacks and subscribes.
    ///
    /// Connect and subscribe failures are raised on `fatal` before being
    /// returned.
    pub fn start(
        mut transport: T,
        config: SubscriberConfig,
        scheduler: Arc<dyn HostScheduler>,
        action: ActionHandle,
        fatal: FatalSignal,
    ) -> Result<Self, SubscribeError> {
        config.validate()?;
        let client_id = config.client_id();
        let topic = config.connection.topic.clone();
        let context = Arc::new(SubscriberContext::new(&config, scheduler, action));
        let closing = Arc::new(AtomicBool::new(false));
        let callbacks = Arc::new(SubscriberCallbacks {
            context: Arc::clone(&context),
            fatal: fatal.clone(),
            client_id: client_id.clone(),
            closing: Arc::clone(&closing),
        });

        let options = config.connection.connect_options(&client_id);
        let section = enter_critical_section();
        if let Err(err) = transport.connect(&options, callbacks) {
            drop(section);
            let fatal_err = FatalError::ConnectFailed {
                topic,
                client_id,
                broker: options.broker,
                cause: err.to_string(),
            };
            fatal.raise(fatal_err.clone());
            return Err(SubscribeError::Fatal(fatal_err));
        }
        if let Err(err) = transport.subscribe(&topic, config.connection.qos) {
            drop(section);
            let fatal_err = FatalError::SubscribeFailed {
                topic,
                client_id,
                cause: err.to_string(),
            };
            fatal.raise(fatal_err.clone());
            return Err(SubscribeError::Fatal(fatal_err));
        }
        drop(section);
        info!(
            %topic,
            %client_id,
            broker = %options.broker,
            use_physical_time = config.use_physical_time,
            relative_timestamp = config.relative_timestamp,
            offset = ?config.offset,
            "subscriber started"
        );

        Ok(Self {
            transport,
            client_id,
            context,
            closing,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn context(&self) -> &SubscriberContext {
        &self.context
    }

    pub fn stats(&self) -> SubscriberStats {
        self.context.stats()
    }

    /// Disconnects and reports latency, if any sample was taken.
    pub fn shutdown(mut self, timeout: Duration) -> Option<LatencyReport> {
        self.closing.store(true, Ordering::SeqCst);
        {
            let _section = enter_critical_section();
            if let Err(err) = self.transport.disconnect(timeout) {
                warn!(client_id = %self.client_id, "disconnect failed: {err}");
            }
        }
        let report = self.context.latency_report();
        match &report {
            Some(report) => info!(
                topic = %self.context.topic,
                samples = report.count,
                max_latency_ns = report.max,
                average_latency_ns = report.average,
                "apparent latency"
            ),
            None => debug!(topic = %self.context.topic, "no timestamped arrivals"),
        }
        report
    }
}
