//! Core tsbridge primitives shared across crates.
//!
//! Includes logical/physical time types, client identity derivation, topic
//! validation, and base errors.

pub mod error;
pub mod ident;
pub mod types;

pub use types::{Instant, Interval, Tag, FOREVER};
