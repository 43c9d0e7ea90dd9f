//! Error types for GeoChat protocol payloads

use thiserror::Error;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while decoding or validating wire payloads
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Discovery announcement is malformed or missing a mandatory field
    #[error("Invalid announcement: {0}")]
    InvalidAnnouncement(String),

    /// Accumulated backlog envelope is malformed
    #[error("Invalid backlog envelope: {0}")]
    InvalidEnvelope(String),

    /// Latitude/longitude outside the valid range
    #[error("Invalid coordinate: lat={latitude}, lon={longitude}")]
    InvalidCoordinate { latitude: f64, longitude: f64 },

    /// Payload could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ProtocolError {
    /// Get the error code for logs and RPC responses
    pub fn code(&self) -> u32 {
        match self {
            Self::InvalidAnnouncement(_) => 2001,
            Self::InvalidEnvelope(_) => 2002,
            Self::InvalidCoordinate { .. } => 2003,
            Self::Serialization(_) => 2004,
        }
    }

    /// Malformed inbound payloads are dropped and never retried
    pub fn is_recoverable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = ProtocolError::InvalidAnnouncement("missing field `port`".to_string());
        assert_eq!(err.code(), 2001);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = ProtocolError::InvalidCoordinate {
            latitude: 91.0,
            longitude: 0.0,
        };
        assert!(err.to_string().contains("lat=91"));
    }
}
