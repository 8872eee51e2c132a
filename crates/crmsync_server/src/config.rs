//! Server configuration.

use crmsync_protocol::MAX_BATCH_SIZE;

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Page size used when a list request omits `limit`.
    pub default_page_size: u32,
    /// Largest page a list request may ask for.
    pub max_page_size: u32,
    /// Largest batch accepted by the upload endpoints.
    pub max_batch_size: usize,
    /// Whether bearer tokens must be HMAC-signed.
    pub require_auth: bool,
    /// Secret key for token validation (if auth enabled).
    pub auth_secret: Option<Vec<u8>>,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new() -> Self {
        Self {
            default_page_size: 50,
            max_page_size: 500,
            max_batch_size: MAX_BATCH_SIZE,
            require_auth: false,
            auth_secret: None,
        }
    }

    /// Sets the maximum page size.
    pub fn with_max_page_size(mut self, size: u32) -> Self {
        self.max_page_size = size;
        self
    }

    /// Sets the maximum batch size, clamped to the protocol cap.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.min(MAX_BATCH_SIZE);
        self
    }

    /// Enables authentication with the given secret.
    pub fn with_auth(mut self, secret: Vec<u8>) -> Self {
        self.require_auth = true;
        self.auth_secret = Some(secret);
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}
