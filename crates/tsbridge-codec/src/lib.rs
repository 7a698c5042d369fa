//! tsbridge wire codec primitives.
//!
//! Defines the optional timestamp footer carried on opaque payloads and the
//! CBOR frames spoken between WebSocket clients and the relay broker.

pub mod error;
pub mod footer;
pub mod frame;
