use serde::{Deserialize, Serialize};
use tsbridge_core::ident::{validate_topic, validate_topic_filter};

use crate::error::CodecError;

/// Relay protocol version carried in `Connect`.
pub const RELAY_PROTOCOL_VERSION: u16 = 1;
/// Highest QoS level understood on the wire.
pub const MAX_QOS: u8 = 2;

/// Disconnect reason codes (MQTT 5 numbering).
pub const REASON_NORMAL: u8 = 0x00;
pub const REASON_SERVER_SHUTTING_DOWN: u8 = 0x8B;
pub const REASON_SESSION_TAKEN_OVER: u8 = 0x8E;
pub const REASON_PROTOCOL_ERROR: u8 = 0x82;

/// One binary WebSocket message between a client transport and the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayFrame {
    /// Client → relay session open.
    Connect {
        version: u16,
        client_id: String,
        clean_session: bool,
        keep_alive_secs: u16,
    },
    /// Relay → client session accepted.
    ConnAck { session_present: bool },
    /// Relay → client session rejected; the socket is closed afterwards.
    Refused { reason: String },
    /// Client → relay subscription request.
    Subscribe { topic: String, qos: u8 },
    /// Relay → client subscription confirmed.
    SubAck { topic: String, granted_qos: u8 },
    /// Client → relay message; `token` is echoed back in `PubAck`.
    Publish {
        token: u64,
        topic: String,
        qos: u8,
        retained: bool,
        payload: Vec<u8>,
    },
    /// Relay → client publish accepted and fanned out.
    PubAck { token: u64 },
    /// Relay → client message on a subscribed topic.
    Deliver {
        topic: String,
        retained: bool,
        payload: Vec<u8>,
    },
    /// Either direction; the sender closes the socket afterwards.
    Disconnect { reason_code: u8 },
}

impl RelayFrame {
    /// Validates frame fields that the relay and clients rely on.
    pub fn validate(&self) -> Result<(), CodecError> {
        match self {
            RelayFrame::Connect {
                version, client_id, ..
            } => {
                if *version != RELAY_PROTOCOL_VERSION {
                    return Err(CodecError::InvalidFrame("unsupported relay protocol version"));
                }
                if client_id.trim().is_empty() {
                    return Err(CodecError::InvalidFrame("client id must not be empty"));
                }
            }
            RelayFrame::Subscribe { topic, qos } => {
                validate_topic_filter(topic)
                    .map_err(|_| CodecError::InvalidFrame("bad topic filter"))?;
                check_qos(*qos)?;
            }
            RelayFrame::SubAck { granted_qos, .. } => check_qos(*granted_qos)?,
            RelayFrame::Publish { topic, qos, .. } => {
                validate_topic(topic).map_err(|_| CodecError::InvalidFrame("bad topic name"))?;
                check_qos(*qos)?;
            }
            RelayFrame::Deliver { topic, .. } => {
                validate_topic(topic).map_err(|_| CodecError::InvalidFrame("bad topic name"))?;
            }
            RelayFrame::ConnAck { .. }
            | RelayFrame::Refused { .. }
            | RelayFrame::PubAck { .. }
            | RelayFrame::Disconnect { .. } => {}
        }
        Ok(())
    }
}

fn check_qos(qos: u8) -> Result<(), CodecError> {
    if qos > MAX_QOS {
        return Err(CodecError::InvalidFrame("qos out of range"));
    }
    Ok(())
}

/// Encodes a frame as CBOR after validation.
pub fn encode_frame(frame: &RelayFrame) -> Result<Vec<u8>, CodecError> {
    frame.validate()?;
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(frame, &mut bytes).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(bytes)
}

/// Decodes and validates one CBOR frame.
pub fn decode_frame(bytes: &[u8]) -> Result<RelayFrame, CodecError> {
    let frame: RelayFrame =
        ciborium::de::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;
    frame.validate()?;
    Ok(frame)
}
