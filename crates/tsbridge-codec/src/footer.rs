//! Optional timestamp footer for opaque payloads.
//!
//! Layout: `data [0x00]? 'L' 'F' 't' 's' <i64, native byte order>`.
//! Presence is detected from the trailing bytes only; nothing in the payload
//! declares it.

use bytes::Bytes;
use tsbridge_core::Instant;

/// Marker that precedes the embedded timestamp.
pub const TIMESTAMP_MAGIC: [u8; 4] = *b"LFts";
/// Width of the encoded timestamp.
pub const TIMESTAMP_LEN: usize = 8;
/// Marker plus timestamp.
pub const FOOTER_LEN: usize = TIMESTAMP_MAGIC.len() + TIMESTAMP_LEN;
/// Shortest payload that can carry a footer (NUL terminator included).
pub const MIN_STAMPED_LEN: usize = FOOTER_LEN + 1;

/// Appends a timestamp footer when `append_timestamp` is set.
///
/// The payload is NUL-terminated first unless it already ends with NUL.
pub fn encode_payload(payload: &[u8], append_timestamp: bool, timestamp: Instant) -> Vec<u8> {
    if !append_timestamp {
        return payload.to_vec();
    }
    let terminated = payload.last() == Some(&0);
    let extra = if terminated { 0 } else { 1 };
    let mut out = Vec::with_capacity(payload.len() + extra + FOOTER_LEN);
    out.extend_from_slice(payload);
    if !terminated {
        out.push(0);
    }
    out.extend_from_slice(&TIMESTAMP_MAGIC);
    out.extend_from_slice(&timestamp.to_ne_bytes());
    out
}

/// Locates a footer, returning the data length (NUL excluded) and timestamp.
pub fn find_footer(received: &[u8]) -> Option<(usize, Instant)> {
    if received.len() < MIN_STAMPED_LEN {
        return None;
    }
    let marker_at = received.len() - FOOTER_LEN;
    let data_len = marker_at - 1;
    if received[data_len] != 0 {
        return None;
    }
    if received[marker_at..marker_at + TIMESTAMP_MAGIC.len()] != TIMESTAMP_MAGIC {
        return None;
    }
    let mut raw = [0_u8; TIMESTAMP_LEN];
    raw.copy_from_slice(&received[received.len() - TIMESTAMP_LEN..]);
    Some((data_len, Instant::from_ne_bytes(raw)))
}

/// Splits a received payload into its data and optional timestamp.
///
/// Never fails: anything without a well-formed footer is returned whole.
pub fn decode_payload(received: &[u8]) -> (&[u8], Option<Instant>) {
    match find_footer(received) {
        Some((data_len, timestamp)) => (&received[..data_len], Some(timestamp)),
        None => (received, None),
    }
}

/// Zero-copy variant of [`decode_payload`] for owned buffers.
pub fn decode_bytes(received: Bytes) -> (Bytes, Option<Instant>) {
    match find_footer(&received) {
        Some((data_len, timestamp)) => (received.slice(..data_len), Some(timestamp)),
        None => (received, None),
    }
}
