//! Timestamp bridging between a deterministic scheduler and pub/sub transports.
//!
//! [`publish::Publisher`] stamps outgoing payloads with logical time and keeps
//! at most one message unacknowledged through a [`gate::DeliveryGate`].
//! [`receive::Subscriber`] reconciles arrivals against the host scheduler's
//! current tag and tracks apparent latency. Transport calls and scheduling
//! decisions share one process-wide critical section ([`critical`]).

pub mod config;
pub mod critical;
pub mod fatal;
pub mod gate;
pub mod latency;
pub mod publish;
pub mod receive;
pub mod scheduler;

pub use config::{ConfigError, ConnectionConfig, PublisherConfig, SubscriberConfig};
pub use fatal::{FatalError, FatalHook, FatalSignal};
pub use latency::{LatencyReport, LatencyTracker};
pub use publish::{PublishError, Publisher, PublisherStats};
pub use receive::{ArrivalOutcome, SubscribeError, Subscriber, SubscriberStats};
pub use scheduler::{ActionHandle, HostScheduler, LocalScheduler, ManualClock, SystemClock};
