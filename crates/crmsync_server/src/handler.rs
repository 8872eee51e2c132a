//! Request handlers for sync endpoints.

use crate::auth::{Authenticator, AuthConfig, Principal, TokenValidator};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::store::RemoteStore;
use crmsync_protocol::{
    decode, AuditRequest, AuditResponse, CallBatchRequest, CallBatchResponse, CallLog, Contact,
    ContactBatchRequest, ContactBatchResponse, Page, PageQuery,
};
use std::sync::Arc;
use tracing::info;

/// Context for request handling.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Authoritative store (shared across all handlers).
    pub store: Arc<RemoteStore>,
    /// Resolves bearer tokens.
    authenticator: Authenticator,
}

impl HandlerContext {
    /// Creates a new handler context.
    ///
    /// Signed tokens are required when the config enables auth; otherwise
    /// bearer tokens are trusted as owner ids.
    pub fn new(config: ServerConfig, store: Arc<RemoteStore>) -> Self {
        let authenticator = match (&config.auth_secret, config.require_auth) {
            (Some(secret), true) => {
                Authenticator::Signed(TokenValidator::new(AuthConfig::new(secret.clone())))
            }
            _ => Authenticator::Trusted,
        };
        Self {
            config,
            store,
            authenticator,
        }
    }

    /// Resolves the caller of a request.
    pub fn authenticate(&self, bearer: Option<&str>) -> ServerResult<Principal> {
        self.authenticator.authenticate(bearer)
    }
}

/// Handler for sync requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    fn page_query(&self, query: &str) -> ServerResult<PageQuery> {
        let config = &self.context.config;
        let mut parsed = PageQuery::parse(query, config.default_page_size)?;
        parsed.limit = parsed.limit.min(config.max_page_size);
        Ok(parsed)
    }

    /// Handles `GET /contacts`.
    pub fn handle_list_contacts(
        &self,
        principal: &Principal,
        query: &str,
    ) -> ServerResult<Page<Contact>> {
        let query = self.page_query(query)?;
        Ok(self.context.store.list_contacts(principal, &query))
    }

    /// Handles `POST /contacts/batch`.
    pub fn handle_contact_batch(
        &self,
        principal: &Principal,
        body: &[u8],
    ) -> ServerResult<ContactBatchResponse> {
        let request: ContactBatchRequest = decode(body)?;
        let response = self.context.store.upsert_contacts(
            principal,
            &request.contacts,
            request.force_restore.unwrap_or(false),
            self.context.config.max_batch_size,
        )?;

        info!(
            owner = %principal.owner_id,
            total = response.summary.total,
            errors = response.summary.errors,
            "contact batch processed"
        );
        Ok(response)
    }

    /// Handles `DELETE /contacts/{id}`.
    pub fn handle_delete_contact(&self, principal: &Principal, id: &str) -> ServerResult<Contact> {
        if id.is_empty() || id.contains('/') {
            return Err(ServerError::InvalidRequest(format!("bad contact id {id:?}")));
        }
        self.context.store.delete_contact(principal, id)
    }

    /// Handles `GET /calls`.
    pub fn handle_list_calls(
        &self,
        principal: &Principal,
        query: &str,
    ) -> ServerResult<Page<CallLog>> {
        let query = self.page_query(query)?;
        Ok(self.context.store.list_calls(principal, &query))
    }

    /// Handles `POST /calls`.
    pub fn handle_create_calls(
        &self,
        principal: &Principal,
        body: &[u8],
    ) -> ServerResult<CallBatchResponse> {
        let request: CallBatchRequest = decode(body)?;
        let calls = self.context.store.insert_calls(
            principal,
            &request.calls,
            self.context.config.max_batch_size,
        )?;
        Ok(CallBatchResponse {
            count: calls.len(),
            calls,
        })
    }

    /// Handles `POST /sync-audit`.
    pub fn handle_audit(&self, principal: &Principal, body: &[u8]) -> ServerResult<AuditResponse> {
        let request: AuditRequest = decode(body)?;
        Ok(AuditResponse {
            sync_audit: self.context.store.record_audit(principal, &request),
        })
    }
}
