//! Error types for Skein

use thiserror::Error;

use crate::EventId;

/// Core Skein errors
#[derive(Error, Debug)]
pub enum SkeinError {
    // Request errors
    #[error("Request has no filters")]
    EmptyFilters,

    #[error("Request has no relays")]
    EmptyRelays,

    #[error("Invalid relay url: {0}")]
    InvalidRelayUrl(String),

    // Encoding errors
    #[error("Invalid hex: {0}")]
    InvalidHex(String),

    // Verification errors
    #[error("Event id mismatch: {0:?}")]
    InvalidId(EventId),

    #[error("Invalid signature on event {0:?}")]
    InvalidSignature(EventId),

    // Transport errors
    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // Lifecycle errors
    #[error("Service stopped")]
    ServiceStopped,

    // Configuration errors
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

/// Result type for Skein operations
pub type SkeinResult<T> = Result<T, SkeinError>;
