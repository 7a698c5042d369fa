use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tsbridge_codec::frame::{
    REASON_NORMAL, REASON_PROTOCOL_ERROR, REASON_SERVER_SHUTTING_DOWN, REASON_SESSION_TAKEN_OVER,
};

/// Opaque per-connection identifier of one accepted publish.
pub type DeliveryToken = u64;

/// Delivery guarantee requested from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Qos {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn as_u8(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }

    /// Parses a wire QoS level; values above 2 are rejected.
    pub fn from_u8(level: u8) -> Option<Self> {
        match level {
            0 => Some(Qos::AtMostOnce),
            1 => Some(Qos::AtLeastOnce),
            2 => Some(Qos::ExactlyOnce),
            _ => None,
        }
    }
}

/// Why a broker ended a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client asked to disconnect.
    Requested,
    /// The broker is going away.
    ServerShutdown,
    /// Another connection presented the same client id.
    DuplicateClientId,
    /// Any other broker reason code.
    Other(u8),
}

impl DisconnectReason {
    pub fn from_code(code: u8) -> Self {
        match code {
            REASON_NORMAL => DisconnectReason::Requested,
            REASON_SERVER_SHUTTING_DOWN => DisconnectReason::ServerShutdown,
            REASON_SESSION_TAKEN_OVER => DisconnectReason::DuplicateClientId,
            other => DisconnectReason::Other(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            DisconnectReason::Requested => REASON_NORMAL,
            DisconnectReason::ServerShutdown => REASON_SERVER_SHUTTING_DOWN,
            DisconnectReason::DuplicateClientId => REASON_SESSION_TAKEN_OVER,
            DisconnectReason::Other(code) => code,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Requested => f.write_str("requested by client"),
            DisconnectReason::ServerShutdown => f.write_str("broker shutting down"),
            DisconnectReason::DuplicateClientId => {
                f.write_str("session taken over by a client with the same id")
            }
            DisconnectReason::Other(REASON_PROTOCOL_ERROR) => f.write_str("protocol error"),
            DisconnectReason::Other(code) => write!(f, "reason code {code:#04x}"),
        }
    }
}

/// Per-connection options supplied at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Broker address (connection string).
    pub broker: String,
    /// Client identity; brokers allow one live session per id.
    pub client_id: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub connect_timeout: Duration,
}

impl ConnectOptions {
    pub fn new(broker: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            client_id: client_id.into(),
            keep_alive: Duration::from_secs(20),
            clean_session: true,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Notifications a transport delivers on its own threads.
///
/// Implementations must not be invoked from inside a call the core makes into
/// [`PubSubTransport`]; the core holds its critical section around those calls.
pub trait TransportCallbacks: Send + Sync {
    /// A publish identified by `token` reached the broker.
    fn on_delivered(&self, token: DeliveryToken);
    /// The connection dropped without a broker-initiated disconnect.
    fn on_connection_lost(&self, cause: &str);
    /// A message arrived on a subscribed topic. Returns whether it was handled.
    fn on_message_arrived(&self, topic: &str, payload: Bytes) -> bool;
    /// The broker ended the session.
    fn on_disconnected(&self, reason: DisconnectReason);
}

/// Pub/sub client contract used by the tsbridge publisher and subscriber.
///
/// Implementations are not assumed to be reentrant; callers serialize every
/// call through one process-wide critical section.
pub trait PubSubTransport: Send {
    /// Transport-specific error.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Opens the session and registers the callback handler.
    fn connect(
        &mut self,
        options: &ConnectOptions,
        callbacks: Arc<dyn TransportCallbacks>,
    ) -> Result<(), Self::Error>;

    /// Hands `payload` to the broker; acceptance returns the delivery token
    /// later reported through [`TransportCallbacks::on_delivered`].
    fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: Qos,
        retained: bool,
    ) -> Result<DeliveryToken, Self::Error>;

    fn subscribe(&mut self, topic: &str, qos: Qos) -> Result<(), Self::Error>;

    fn disconnect(&mut self, timeout: Duration) -> Result<(), Self::Error>;

    /// Whether the session is currently open.
    fn is_connected(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::{ConnectOptions, DisconnectReason, Qos};
    use std::time::Duration;

    #[test]
    fn qos_levels_map_to_wire_values() {
        for qos in [Qos::AtMostOnce, Qos::AtLeastOnce, Qos::ExactlyOnce] {
            assert_eq!(Qos::from_u8(qos.as_u8()), Some(qos));
        }
        assert_eq!(Qos::from_u8(3), None);
        assert_eq!(Qos::default(), Qos::AtLeastOnce);
    }

    #[test]
    fn disconnect_reason_codes_round_trip() {
        for reason in [
            DisconnectReason::Requested,
            DisconnectReason::ServerShutdown,
            DisconnectReason::DuplicateClientId,
            DisconnectReason::Other(0x99),
        ] {
            assert_eq!(DisconnectReason::from_code(reason.code()), reason);
        }
        assert!(DisconnectReason::DuplicateClientId
            .to_string()
            .contains("same id"));
    }

    #[test]
    fn connect_options_defaults() {
        let opts = ConnectOptions::new("ws://127.0.0.1:9001", "pub-1");
        assert_eq!(opts.keep_alive, Duration::from_secs(20));
        assert!(opts.clean_session);
    }
}
