//! HTTP transport implementation.
//!
//! This module provides an HTTP-based transport for the sync engine.
//! The actual HTTP client is abstracted via a trait to allow different
//! implementations (reqwest, ureq, a platform networking stack, ...).

use crate::config::SyncConfig;
use crate::context::Session;
use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use crmsync_protocol::{
    decode, routes, AuditRequest, AuditResponse, CallBatchRequest, CallBatchResponse, CallLog,
    Contact, ContactBatchRequest, ContactBatchResponse, HttpRequest, HttpResponse, Page,
    PageQuery, SyncAudit,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::trace;

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport. An `Err`
/// means no response was received at all (connection refused, reset,
/// client-side timeout); any received response, whatever its status, is
/// returned as `Ok`.
pub trait HttpClient: Send + Sync {
    /// Sends `request` to `base_url` and waits at most `timeout`.
    fn execute(
        &self,
        base_url: &str,
        request: &HttpRequest,
        timeout: Duration,
    ) -> Result<HttpResponse, String>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// HTTP-based sync transport using JSON bodies.
pub struct HttpTransport<C: HttpClient> {
    /// Base URL of the server (e.g., "https://crm.example.com/api").
    base_url: String,
    /// HTTP client implementation.
    client: C,
    /// Per-request timeout.
    timeout: Duration,
    /// Last error message.
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into(),
            client,
            timeout: Duration::from_secs(30),
            last_error: RwLock::new(None),
        }
    }

    /// Creates a transport for the server and timeout of `config`.
    pub fn from_config(config: &SyncConfig, client: C) -> Self {
        Self::new(config.server_url.clone(), client).with_timeout(config.request_timeout)
    }

    /// Sets the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the per-request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Returns true if the underlying client reports itself healthy.
    pub fn is_healthy(&self) -> bool {
        self.client.is_healthy()
    }

    fn exchange(&self, session: &Session, request: HttpRequest) -> SyncResult<HttpResponse> {
        if !self.client.is_healthy() {
            return Err(SyncError::network_retryable("http client unavailable"));
        }

        let request = request.with_bearer(session.token.clone());
        trace!(target = %request.target(), "sending request");

        self.client
            .execute(&self.base_url, &request, self.timeout)
            .map_err(|e| {
                *self.last_error.write() = Some(e.clone());
                SyncError::network_retryable(e)
            })
    }

    fn send(&self, session: &Session, request: HttpRequest) -> SyncResult<HttpResponse> {
        let response = self.exchange(session, request)?;
        if response.is_success() {
            *self.last_error.write() = None;
            Ok(response)
        } else {
            let err = SyncError::from_status(response.status, response.error_message());
            *self.last_error.write() = Some(err.to_string());
            Err(err)
        }
    }

    fn send_json<T: DeserializeOwned>(&self, session: &Session, request: HttpRequest) -> SyncResult<T> {
        let response = self.send(session, request)?;
        decode(&response.body).map_err(|e| SyncError::Protocol(format!("bad response body: {e}")))
    }
}

impl<C: HttpClient> SyncTransport for HttpTransport<C> {
    fn list_contacts(&self, session: &Session, query: &PageQuery) -> SyncResult<Page<Contact>> {
        self.send_json(session, HttpRequest::get(routes::CONTACTS, query.to_query_string()))
    }

    fn upload_contacts(
        &self,
        session: &Session,
        request: &ContactBatchRequest,
    ) -> SyncResult<ContactBatchResponse> {
        self.send_json(session, HttpRequest::post(routes::CONTACTS_BATCH, request)?)
    }

    fn delete_contact(&self, session: &Session, id: &str) -> SyncResult<()> {
        let response = self.exchange(session, HttpRequest::delete(routes::contact(id)))?;
        match response.status {
            404 => Ok(()),
            _ if response.is_success() => Ok(()),
            status => Err(SyncError::from_status(status, response.error_message())),
        }
    }

    fn list_calls(&self, session: &Session, query: &PageQuery) -> SyncResult<Page<CallLog>> {
        self.send_json(session, HttpRequest::get(routes::CALLS, query.to_query_string()))
    }

    fn upload_calls(
        &self,
        session: &Session,
        request: &CallBatchRequest,
    ) -> SyncResult<CallBatchResponse> {
        self.send_json(session, HttpRequest::post(routes::CALLS, request)?)
    }

    fn record_audit(&self, session: &Session, request: &AuditRequest) -> SyncResult<SyncAudit> {
        let response: AuditResponse =
            self.send_json(session, HttpRequest::post(routes::SYNC_AUDIT, request)?)?;
        Ok(response.sync_audit)
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer: Send + Sync {
    /// Handles one request and returns the response.
    fn handle(&self, request: &HttpRequest) -> HttpResponse;
}

impl<F> LoopbackServer for F
where
    F: Fn(&HttpRequest) -> HttpResponse + Send + Sync,
{
    fn handle(&self, request: &HttpRequest) -> HttpResponse {
        self(request)
    }
}

/// A loopback HTTP client that routes requests directly to a server.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }
}

impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    fn execute(
        &self,
        _base_url: &str,
        request: &HttpRequest,
        _timeout: Duration,
    ) -> Result<HttpResponse, String> {
        Ok(self.server.handle(request))
    }
}
