//! Node error types

use geochat_core::error::ProtocolError;
use geochat_network::{RpcError, TransportError};
use thiserror::Error;

/// Result type alias for node operations
pub type Result<T> = std::result::Result<T, NodeError>;

#[derive(Error, Debug)]
pub enum NodeError {
    /// Recipient never announced itself
    #[error("Unknown recipient: {0}")]
    UnknownRecipient(String),

    #[error("Recipient must not be empty")]
    EmptyRecipient,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeError {
    pub fn code(&self) -> u32 {
        match self {
            Self::UnknownRecipient(_) => 3001,
            Self::EmptyRecipient => 3002,
            Self::Transport(_) => 3003,
            Self::Rpc(_) => 3004,
            Self::Protocol(e) => e.code(),
            Self::Config(_) => 3005,
            Self::Metrics(_) => 3006,
            Self::Io(_) => 3007,
        }
    }

    /// Check if a later call may succeed without operator action
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_recoverable(),
            Self::Rpc(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_recipient() {
        let err = NodeError::UnknownRecipient("Z".to_string());
        assert_eq!(err.code(), 3001);
        assert_eq!(err.to_string(), "Unknown recipient: Z");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_from_transport() {
        let err: NodeError = TransportError::Unavailable("broker down".to_string()).into();
        assert_eq!(err.code(), 3003);
        assert!(!err.is_recoverable());
    }
}
