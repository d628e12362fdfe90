//! Error types for a3s-trip

use thiserror::Error;

/// Errors that can occur while coordinating a trip
#[derive(Debug, Error)]
pub enum TripError {
    /// Envelope signature did not verify against the sender's public key
    #[error("Signature invalid for message from '{sender}': {reason}")]
    SignatureInvalid { sender: String, reason: String },

    /// A nonce was issued or received twice
    #[error("Nonce reuse detected: {0}")]
    NonceReuse(String),

    /// Encryption, decryption, or key handling failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// No public identity registered for the agent
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    /// Delivery failed after exhausting retries
    #[error("Delivery of message '{message_id}' failed after {attempts} attempt(s): {reason}")]
    DeliveryFailure {
        message_id: String,
        attempts: u32,
        reason: String,
    },

    /// Agent search or handler failed
    #[error("Agent '{agent}' failed: {reason}")]
    AgentFailure { agent: String, reason: String },

    /// A conflict could not be repaired structurally
    #[error("Conflict unresolved: {0}")]
    ConflictUnresolved(String),

    /// Path is locked by a different writer
    #[error("Path '{path}' is locked by '{holder}'")]
    LockContention { path: String, holder: String },

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Planning run was aborted
    #[error("Run aborted: {0}")]
    Aborted(String),

    /// Trip request failed validation
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Lookup miss
    #[error("Not found: {0}")]
    NotFound(String),
}

impl TripError {
    /// Stable code carried by outbound `error` events
    pub fn code(&self) -> &'static str {
        match self {
            TripError::SignatureInvalid { .. } => "SIGNATURE_INVALID",
            TripError::NonceReuse(_) => "NONCE_REUSE",
            TripError::Crypto(_) => "CRYPTO",
            TripError::UnknownAgent(_) => "UNKNOWN_AGENT",
            TripError::DeliveryFailure { .. } => "DELIVERY_FAILURE",
            TripError::AgentFailure { .. } => "AGENT_FAILURE",
            TripError::ConflictUnresolved(_) => "CONFLICT_UNRESOLVED",
            TripError::LockContention { .. } => "LOCK_CONTENTION",
            TripError::Serialization(_) => "SERIALIZATION",
            TripError::Config(_) => "CONFIG",
            TripError::Timeout(_) => "TIMEOUT",
            TripError::Aborted(_) => "ABORTED",
            TripError::InvalidRequest(_) => "INVALID_REQUEST",
            TripError::NotFound(_) => "NOT_FOUND",
        }
    }

    /// Security faults are never retried
    pub fn is_security_fault(&self) -> bool {
        matches!(
            self,
            TripError::SignatureInvalid { .. }
                | TripError::NonceReuse(_)
                | TripError::Crypto(_)
                | TripError::UnknownAgent(_)
        )
    }
}

/// Result type alias for trip operations
pub type Result<T> = std::result::Result<T, TripError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = TripError::LockContention {
            path: "itinerary.items".to_string(),
            holder: "hotel-agent".to_string(),
        };
        assert_eq!(err.code(), "LOCK_CONTENTION");
        assert_eq!(
            err.to_string(),
            "Path 'itinerary.items' is locked by 'hotel-agent'"
        );

        let err = TripError::DeliveryFailure {
            message_id: "msg-1".to_string(),
            attempts: 3,
            reason: "unreachable".to_string(),
        };
        assert_eq!(err.code(), "DELIVERY_FAILURE");
        assert!(err.to_string().contains("3 attempt(s)"));
    }

    #[test]
    fn test_security_faults() {
        assert!(TripError::NonceReuse("n".into()).is_security_fault());
        assert!(TripError::SignatureInvalid {
            sender: "a".into(),
            reason: "b".into()
        }
        .is_security_fault());
        assert!(!TripError::Timeout("t".into()).is_security_fault());
        assert!(!TripError::NotFound("endpoint".into()).is_security_fault());
    }

    #[test]
    fn test_serialization_error_converts() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: TripError = parse.unwrap_err().into();
        assert_eq!(err.code(), "SERIALIZATION");
    }
}
