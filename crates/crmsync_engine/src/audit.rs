//! Per-domain audit entries.

use crate::context::Session;
use crate::transport::SyncTransport;
use crmsync_protocol::{AuditRequest, AuditStatus, SyncAudit, SyncDomain};
use tracing::{debug, warn};

/// Posts one audit entry per domain per run.
///
/// Recording is best-effort: a failed post is logged and dropped, and it
/// never changes the outcome of the run it describes.
#[derive(Debug, Default, Clone, Copy)]
pub struct AuditRecorder;

impl AuditRecorder {
    /// Creates a new recorder.
    pub fn new() -> Self {
        Self
    }

    /// Records the outcome of one domain.
    pub fn record<T: SyncTransport + ?Sized>(
        &self,
        transport: &T,
        session: &Session,
        domain: SyncDomain,
        error: Option<String>,
        synced_contacts: u64,
        synced_calls: u64,
    ) -> Option<SyncAudit> {
        let request = AuditRequest {
            sync_type: domain,
            status: if error.is_some() {
                AuditStatus::Error
            } else {
                AuditStatus::Success
            },
            error_message: error,
            synced_contacts,
            synced_calls,
        };

        match transport.record_audit(session, &request) {
            Ok(audit) => {
                debug!(owner = %session.owner_id, %domain, id = %audit.id, "audit recorded");
                Some(audit)
            }
            Err(e) => {
                warn!(owner = %session.owner_id, %domain, error = %e, "recording audit failed");
                None
            }
        }
    }
}
