//! Network error types

use thiserror::Error;

/// Pub/sub transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Broker could not be reached
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Subscription to '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },

    /// Transport handle was closed
    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Check if error is recoverable by a later call
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Publish { .. } | Self::Subscribe { .. })
    }
}

/// Direct-delivery RPC errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// Connection refused, host unreachable, DNS failure
    #[error("Peer unreachable at {0}")]
    Unreachable(String),

    #[error("Call to {0} timed out")]
    Timeout(String),

    /// Peer answered but did not acknowledge the message
    #[error("Peer rejected call: {0}")]
    Rejected(String),

    /// Malformed request or response
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl RpcError {
    /// JSON-RPC error code for server responses
    pub fn code(&self) -> i64 {
        match self {
            Self::Protocol(_) => -32600,
            Self::Rejected(_) => -32000,
            Self::Unreachable(_) | Self::Timeout(_) => -32603,
        }
    }
}
