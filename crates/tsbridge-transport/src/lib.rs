//! Transport abstractions for tsbridge.
//!
//! The publisher and subscriber only depend on the pub/sub contract and
//! callback set defined in this crate.

pub mod adapter;
pub mod memory;
