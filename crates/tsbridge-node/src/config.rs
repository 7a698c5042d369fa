use std::time::Duration;

use thiserror::Error;
use tsbridge_core::error::CoreError;
use tsbridge_core::ident::{derive_client_id, validate_topic, Role};
use tsbridge_transport::adapter::{ConnectOptions, Qos};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("broker address must not be empty")]
    EmptyBroker,
    #[error("client id must not be empty when given")]
    EmptyClientId,
    #[error("send timeout must be greater than zero")]
    ZeroSendTimeout,
    #[error("topic: {0}")]
    Topic(#[from] CoreError),
}

/// Connection settings shared by both roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Broker connection string, e.g. `ws://127.0.0.1:9001`.
    pub broker: String,
    pub topic: String,
    /// Explicit client id. Derived from role, topic and instance when absent.
    pub client_id: Option<String>,
    pub instance: String,
    pub qos: Qos,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            broker: "ws://127.0.0.1:9001".to_string(),
            topic: "tsbridge/default".to_string(),
            client_id: None,
            instance: String::new(),
            qos: Qos::AtLeastOnce,
            keep_alive: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl ConnectionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.trim().is_empty() {
            return Err(ConfigError::EmptyBroker);
        }
        if self
            .client_id
            .as_deref()
            .is_some_and(|id| id.trim().is_empty())
        {
            return Err(ConfigError::EmptyClientId);
        }
        validate_topic(&self.topic)?;
        Ok(())
    }

    /// Client id for `role`: the explicit one, or a deterministic derivation.
    pub fn client_id_for(&self, role: Role) -> String {
        match &self.client_id {
            Some(id) => id.clone(),
            None => derive_client_id(role, &self.topic, &self.instance),
        }
    }

    pub fn connect_options(&self, client_id: &str) -> ConnectOptions {
        ConnectOptions {
            keep_alive: self.keep_alive,
            connect_timeout: self.connect_timeout,
            ..ConnectOptions::new(self.broker.clone(), client_id)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherConfig {
    pub connection: ConnectionConfig,
    /// Append a timestamp footer to each payload.
    pub include_timestamp: bool,
    /// Stamp elapsed logical time instead of absolute logical time.
    pub relative_timestamp: bool,
    /// Longest wait for the previous acknowledgement before abandoning it.
    pub send_timeout: Duration,
    pub retained: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            include_timestamp: true,
            relative_timestamp: false,
            send_timeout: Duration::from_secs(10),
            retained: false,
        }
    }
}

impl PublisherConfig {
    pub fn new(broker: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig {
                broker: broker.into(),
                topic: topic.into(),
                ..ConnectionConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection.validate()?;
        if self.send_timeout.is_zero() {
            return Err(ConfigError::ZeroSendTimeout);
        }
        Ok(())
    }

    pub fn client_id(&self) -> String {
        self.connection.client_id_for(Role::Publisher)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberConfig {
    pub connection: ConnectionConfig,
    /// Schedule at arrival time plus offset, ignoring embedded timestamps.
    pub use_physical_time: bool,
    /// Embedded timestamps are elapsed time and get the local start time added.
    pub relative_timestamp: bool,
    /// Added to the target time of every arrival.
    pub offset: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            use_physical_time: false,
            relative_timestamp: false,
            offset: Duration::ZERO,
        }
    }
}

impl SubscriberConfig {
    pub fn new(broker: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig {
                broker: broker.into(),
                topic: topic.into(),
                ..ConnectionConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection.validate()
    }

    pub fn client_id(&self) -> String {
        self.connection.client_id_for(Role::Subscriber)
    }
}
