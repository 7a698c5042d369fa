//! WebSocket transport for tsbridge.
//!
//! [`client::WebSocketTransport`] implements `PubSubTransport` over a single
//! WebSocket connection to a [`server::RelayServer`], which routes CBOR relay
//! frames between clients by topic.

pub mod client;
pub mod server;

pub use client::{WebSocketTransport, WebSocketTransportConfig, WebSocketTransportError};
pub use server::{RelayServer, RelayServerConfig, RelayServerError, RelayStats};
