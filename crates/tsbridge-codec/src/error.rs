use thiserror::Error;

/// Errors returned by relay frame encode/decode operations.
///
/// Footer decoding never fails; a payload without a valid footer simply has
/// no timestamp.
#[derive(Debug, Error)]
pub enum CodecError {
    /// CBOR serialization failure.
    #[error("encode error: {0}")]
    Encode(String),
    /// CBOR deserialization failure.
    #[error("decode error: {0}")]
    Decode(String),
    /// Frame-level schema validation failure.
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),
}
