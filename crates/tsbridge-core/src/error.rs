use thiserror::Error;

/// Shared lightweight error type for core primitive operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    /// Invalid caller input or malformed primitive value.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Topic name rejected by validation.
    #[error("invalid topic: {0}")]
    InvalidTopic(&'static str),
}
