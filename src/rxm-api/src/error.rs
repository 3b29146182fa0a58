use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned synchronously by endpoint, pool and fabric operations.
///
/// None of these are retried internally. `ResourceExhausted` is the only
/// kind a caller is expected to retry, and it is always returned before any
/// state is mutated.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum Error {
    #[error("Resource exhausted, try again later")]
    ResourceExhausted,
    #[error("Message of {size} bytes exceeds the inline limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Operation not supported by this endpoint")]
    Unsupported,
    #[error("Missing resource: {0}")]
    MissingResource(&'static str),
    #[error("Invalid message id {0:#x}")]
    InvalidId(u64),
    #[error("Resource already bound: {0}")]
    DuplicateBinding(&'static str),
    #[error("Protocol version mismatch: expected {expected}, got {found}")]
    VersionMismatch { expected: u8, found: u8 },
    #[error("Endpoint is not enabled")]
    NotEnabled,
    #[error("No matching fabric: {0}")]
    NoData(String),
    #[error("Transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Returns `true` if the operation may succeed when retried later.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ResourceExhausted)
    }
}
