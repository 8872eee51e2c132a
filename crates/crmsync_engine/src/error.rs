//! Error types for the sync engine.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Coarse error classes that drive propagation policy.
///
/// - per-record classes (`Conflict`, `Validation`) never abort a batch;
/// - `Network` and `Unexpected` fail only the current domain;
/// - `Auth` and `Timeout` abort the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient transport failure.
    Network,
    /// Credentials rejected (401/403).
    Auth,
    /// Resource conflict (409).
    Conflict,
    /// Malformed record or request.
    Validation,
    /// Run budget exhausted or run cancelled.
    Timeout,
    /// Anything else.
    Unexpected,
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("network error: {message}")]
    Network {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Authentication or authorization failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The server reported a conflict.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A record or request was malformed.
    #[error("validation error: {0}")]
    Validation(String),

    /// The run exceeded its wall-clock budget.
    #[error("sync run exceeded its time budget")]
    Timeout,

    /// The run was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// A run for this owner is already active.
    #[error("sync already running for owner {owner_id}")]
    AlreadyRunning {
        /// Owner whose run is active.
        owner_id: String,
    },

    /// Response could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local store failure.
    #[error("local store error: {0}")]
    Store(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Device bridge failure.
    #[error("device bridge error: {0}")]
    Device(String),

    /// Unclassified server response.
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl SyncError {
    /// Creates a retryable network error.
    pub fn network_retryable(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable network error.
    pub fn network_fatal(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: false,
        }
    }

    /// Maps a non-2xx HTTP status to an error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => SyncError::Auth(format!("{status}: {message}")),
            409 => SyncError::Conflict(message),
            400 | 413 | 422 => SyncError::Validation(message),
            408 | 504 => SyncError::Timeout,
            500..=599 => SyncError::network_retryable(format!("server returned {status}: {message}")),
            _ => SyncError::Unexpected(format!("status {status}: {message}")),
        }
    }

    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Network { .. } => ErrorKind::Network,
            SyncError::Auth(_) => ErrorKind::Auth,
            SyncError::Conflict(_) => ErrorKind::Conflict,
            SyncError::Validation(_) => ErrorKind::Validation,
            SyncError::Timeout | SyncError::Cancelled => ErrorKind::Timeout,
            SyncError::AlreadyRunning { .. }
            | SyncError::Protocol(_)
            | SyncError::Store(_)
            | SyncError::Io(_)
            | SyncError::Device(_)
            | SyncError::Unexpected(_) => ErrorKind::Unexpected,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network { retryable: true, .. })
    }

    /// Returns true if this error aborts the whole run.
    pub fn aborts_run(&self) -> bool {
        matches!(self.kind(), ErrorKind::Auth | ErrorKind::Timeout)
    }

    /// Returns true if this error only affects one record or batch.
    pub fn is_per_record(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict | ErrorKind::Validation)
    }
}

impl From<crmsync_protocol::ProtocolError> for SyncError {
    fn from(err: crmsync_protocol::ProtocolError) -> Self {
        match err {
            crmsync_protocol::ProtocolError::InvalidPhone { .. }
            | crmsync_protocol::ProtocolError::InvalidRecord(_) => {
                SyncError::Validation(err.to_string())
            }
            other => SyncError::Protocol(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Store(format!("snapshot encoding: {err}"))
    }
}
