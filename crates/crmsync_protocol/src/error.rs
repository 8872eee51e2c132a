//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while validating or encoding protocol values.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A phone number could not be normalized.
    #[error("invalid phone number {raw:?}: {reason}")]
    InvalidPhone {
        /// The raw input.
        raw: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A record failed validation.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A query string parameter was malformed.
    #[error("invalid query parameter {name}: {value:?}")]
    InvalidQuery {
        /// Parameter name.
        name: String,
        /// Offending value.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::InvalidPhone {
            raw: "abc".into(),
            reason: "no digits".into(),
        };
        assert!(err.to_string().contains("abc"));
        assert!(err.to_string().contains("no digits"));
    }
}
