//! Error types for the sync server.

use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or invalid credentials.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Caller may not touch the resource.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// Unknown resource.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unknown route.
    #[error("no route for {method} {path}")]
    NoRoute {
        /// Request method.
        method: String,
        /// Request path.
        path: String,
    },

    /// Resource conflict.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Batch exceeds the server cap; nothing was processed.
    #[error("batch too large: {size} > {max}")]
    BatchTooLarge {
        /// Entries in the request.
        size: usize,
        /// Server cap.
        max: usize,
    },

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::InvalidRequest(_) => 400,
            ServerError::AuthenticationFailed(_) => 401,
            ServerError::NotAuthorized(_) => 403,
            ServerError::NotFound(_) | ServerError::NoRoute { .. } => 404,
            ServerError::Conflict(_) => 409,
            ServerError::BatchTooLarge { .. } => 413,
            ServerError::Internal(_) => 500,
        }
    }

    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        self.status_code() >= 500
    }
}

impl From<crmsync_protocol::ProtocolError> for ServerError {
    fn from(err: crmsync_protocol::ProtocolError) -> Self {
        ServerError::InvalidRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidRequest("bad".into()).is_client_error());
        assert!(ServerError::Internal("oops".into()).is_server_error());
        assert!(!ServerError::InvalidRequest("bad".into()).is_server_error());
        assert_eq!(ServerError::AuthenticationFailed("x".into()).status_code(), 401);
        assert_eq!(ServerError::NotAuthorized("x".into()).status_code(), 403);
        assert_eq!(ServerError::Conflict("x".into()).status_code(), 409);
    }

    #[test]
    fn error_display() {
        let err = ServerError::BatchTooLarge {
            size: 1001,
            max: 1000,
        };
        let msg = err.to_string();
        assert!(msg.contains("1001"));
        assert!(msg.contains("1000"));
        assert_eq!(err.status_code(), 413);
    }
}
