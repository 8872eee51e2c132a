//! Main sync server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, RequestHandler};
use crate::store::RemoteStore;
use crmsync_protocol::{routes, HttpRequest, HttpResponse, Method};
use std::sync::Arc;
use tracing::{debug, warn};

/// The sync server.
///
/// Routes protocol requests to the handlers and renders their results as
/// JSON responses. Embedding applications expose [`SyncServer::handle`]
/// behind their HTTP stack; tests call it in-process.
///
/// # Example
///
/// ```
/// use crmsync_protocol::{routes, HttpRequest};
/// use crmsync_server::{ServerConfig, SyncServer};
///
/// let server = SyncServer::new(ServerConfig::default());
/// let response = server.handle(&HttpRequest::get(routes::CONTACTS, "").with_bearer("owner-1"));
/// assert_eq!(response.status, 200);
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl SyncServer {
    /// Creates a new sync server with an empty store.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_store(config, Arc::new(RemoteStore::new()))
    }

    /// Creates a sync server over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<RemoteStore>) -> Self {
        let context = Arc::new(HandlerContext::new(config, store));
        let handler = RequestHandler::new(Arc::clone(&context));

        Self { handler, context }
    }

    /// Handles one HTTP request.
    pub fn handle(&self, request: &HttpRequest) -> HttpResponse {
        match self.dispatch(request) {
            Ok(response) => response,
            Err(e) => {
                if e.is_server_error() {
                    warn!(target = %request.target(), error = %e, "request failed");
                } else {
                    debug!(target = %request.target(), error = %e, "request rejected");
                }
                HttpResponse::error(e.status_code(), e.to_string())
            }
        }
    }

    fn dispatch(&self, request: &HttpRequest) -> ServerResult<HttpResponse> {
        let principal = self
            .context
            .authenticate(request.bearer_token.as_deref())?;
        let path = request.path.trim_end_matches('/');

        match (request.method, path) {
            (Method::Get, routes::CONTACTS) => {
                let page = self.handler.handle_list_contacts(&principal, &request.query)?;
                Ok(HttpResponse::json(200, &page))
            }
            (Method::Post, routes::CONTACTS_BATCH) => {
                let response = self.handler.handle_contact_batch(&principal, &request.body)?;
                Ok(HttpResponse::json(200, &response))
            }
            (Method::Get, routes::CALLS) => {
                let page = self.handler.handle_list_calls(&principal, &request.query)?;
                Ok(HttpResponse::json(200, &page))
            }
            (Method::Post, routes::CALLS) => {
                let response = self.handler.handle_create_calls(&principal, &request.body)?;
                Ok(HttpResponse::json(201, &response))
            }
            (Method::Post, routes::SYNC_AUDIT) => {
                let response = self.handler.handle_audit(&principal, &request.body)?;
                Ok(HttpResponse::json(201, &response))
            }
            (Method::Delete, _) if path.starts_with("/contacts/") => {
                let id = &path["/contacts/".len()..];
                let contact = self.handler.handle_delete_contact(&principal, id)?;
                Ok(HttpResponse::json(200, &contact))
            }
            (method, _) => Err(ServerError::NoRoute {
                method: method.to_string(),
                path: path.to_string(),
            }),
        }
    }

    /// The authoritative store.
    pub fn store(&self) -> &Arc<RemoteStore> {
        &self.context.store
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.context.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crmsync_protocol::{
        decode, ContactBatchRequest, ContactBatchResponse, ContactInput, Contact, Page,
    };

    fn batch(n: usize) -> ContactBatchRequest {
        ContactBatchRequest::new(
            (0..n)
                .map(|i| ContactInput {
                    name: format!("Contact {i}"),
                    phone_raw: format!("+1555{i:07}"),
                    created_at: None,
                })
                .collect(),
        )
    }

    #[test]
    fn requires_bearer_token() {
        let server = SyncServer::new(ServerConfig::default());
        let response = server.handle(&HttpRequest::get(routes::CONTACTS, ""));
        assert_eq!(response.status, 401);
    }

    #[test]
    fn unknown_route() {
        let server = SyncServer::new(ServerConfig::default());
        let response = server.handle(&HttpRequest::get("/users", "").with_bearer("u1"));
        assert_eq!(response.status, 404);
    }

    #[test]
    fn full_upload_and_list_flow() {
        let server = SyncServer::new(ServerConfig::default());

        let request = HttpRequest::post(routes::CONTACTS_BATCH, &batch(3))
            .unwrap()
            .with_bearer("u1");
        let response = server.handle(&request);
        assert_eq!(response.status, 200);
        let body: ContactBatchResponse = decode(&response.body).unwrap();
        assert_eq!(body.summary.created, 3);

        let response = server.handle(&HttpRequest::get(routes::CONTACTS, "page=1&limit=2").with_bearer("u1"));
        let page: Page<Contact> = decode(&response.body).unwrap();
        assert_eq!(page.data.len(), 2);
        assert!(page.pagination.has_next);
    }

    #[test]
    fn oversized_batch_is_413() {
        let server = SyncServer::new(ServerConfig::default());
        let request = HttpRequest::post(routes::CONTACTS_BATCH, &batch(1001))
            .unwrap()
            .with_bearer("u1");

        let response = server.handle(&request);
        assert_eq!(response.status, 413);
        assert_eq!(server.store().contact_count(), 0);
    }

    #[test]
    fn delete_route() {
        let server = SyncServer::new(ServerConfig::default());
        let request = HttpRequest::post(routes::CONTACTS_BATCH, &batch(1))
            .unwrap()
            .with_bearer("u1");
        let body: ContactBatchResponse = decode(&server.handle(&request).body).unwrap();
        let id = body.results[0].contact.id.clone();

        let forbidden = server.handle(&HttpRequest::delete(routes::contact(&id)).with_bearer("u2"));
        assert_eq!(forbidden.status, 403);

        let deleted = server.handle(&HttpRequest::delete(routes::contact(&id)).with_bearer("u1"));
        assert_eq!(deleted.status, 200);

        let missing = server.handle(&HttpRequest::delete(routes::contact(&id)).with_bearer("u1"));
        assert_eq!(missing.status, 404);
    }
}
