//! Transport layer abstraction for sync operations.

use crate::context::Session;
use crate::error::SyncResult;
use crmsync_protocol::{
    AuditRequest, CallBatchRequest, CallBatchResponse, CallLog, Contact, ContactBatchRequest,
    ContactBatchResponse, Page, PageQuery, SyncAudit,
};
use std::sync::Arc;

/// A sync transport handles network communication with the sync server.
///
/// One method per protocol endpoint. Implementations map non-2xx statuses
/// onto [`SyncError`](crate::SyncError) with
/// [`SyncError::from_status`](crate::SyncError::from_status); retries and
/// deadlines are the caller's business.
pub trait SyncTransport: Send + Sync {
    /// `GET /contacts`.
    fn list_contacts(&self, session: &Session, query: &PageQuery) -> SyncResult<Page<Contact>>;

    /// `POST /contacts/batch`.
    fn upload_contacts(
        &self,
        session: &Session,
        request: &ContactBatchRequest,
    ) -> SyncResult<ContactBatchResponse>;

    /// `DELETE /contacts/{id}`. Deleting an already missing contact succeeds.
    fn delete_contact(&self, session: &Session, id: &str) -> SyncResult<()>;

    /// `GET /calls`.
    fn list_calls(&self, session: &Session, query: &PageQuery) -> SyncResult<Page<CallLog>>;

    /// `POST /calls`.
    fn upload_calls(
        &self,
        session: &Session,
        request: &CallBatchRequest,
    ) -> SyncResult<CallBatchResponse>;

    /// `POST /sync-audit`.
    fn record_audit(&self, session: &Session, request: &AuditRequest) -> SyncResult<SyncAudit>;
}

impl<T: SyncTransport + ?Sized> SyncTransport for Arc<T> {
    fn list_contacts(&self, session: &Session, query: &PageQuery) -> SyncResult<Page<Contact>> {
        (**self).list_contacts(session, query)
    }

    fn upload_contacts(
        &self,
        session: &Session,
        request: &ContactBatchRequest,
    ) -> SyncResult<ContactBatchResponse> {
        (**self).upload_contacts(session, request)
    }

    fn delete_contact(&self, session: &Session, id: &str) -> SyncResult<()> {
        (**self).delete_contact(session, id)
    }

    fn list_calls(&self, session: &Session, query: &PageQuery) -> SyncResult<Page<CallLog>> {
        (**self).list_calls(session, query)
    }

    fn upload_calls(
        &self,
        session: &Session,
        request: &CallBatchRequest,
    ) -> SyncResult<CallBatchResponse> {
        (**self).upload_calls(session, request)
    }

    fn record_audit(&self, session: &Session, request: &AuditRequest) -> SyncResult<SyncAudit> {
        (**self).record_audit(session, request)
    }
}
