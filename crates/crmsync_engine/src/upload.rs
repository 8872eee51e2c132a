//! Upload stage: pushes dirty local records to the server.

use crate::config::SyncConfig;
use crate::context::RunContext;
use crate::error::{ErrorKind, SyncResult};
use crate::store::{CallChanges, ContactChanges, ContactUpdate, LocalContact, LocalStore};
use crate::transport::SyncTransport;
use crmsync_protocol::{
    BatchErrorKind, CallBatchRequest, CallInput, CallLog, ContactBatchRequest, ContactInput,
    UpsertAction,
};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// A local contact the server refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedContact {
    /// Local id of the refused record.
    pub local_id: String,
    /// Whether the refusal was a conflict or a validation failure.
    pub kind: BatchErrorKind,
    /// Server message.
    pub message: String,
}

/// Outcome of a contact upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactUploadReport {
    /// New server records.
    pub created: usize,
    /// Server records overwritten with local values.
    pub updated: usize,
    /// Local edits discarded in favor of the server copy.
    pub existing: usize,
    /// Soft-deleted server records revived.
    pub restored: usize,
    /// Deletions propagated to the server.
    pub deleted: usize,
    /// Server records deleted because an edited phone moved the contact to
    /// another record.
    pub retired: usize,
    /// Accepted records left dirty because they were edited while the
    /// batch was in flight.
    pub edited_in_flight: usize,
    /// Refused records; they stay dirty.
    pub rejected: Vec<RejectedContact>,
    /// Contacts hard-removed locally; their device entries are stale.
    pub removed: Vec<LocalContact>,
}

impl ContactUploadReport {
    /// Records the server accepted.
    pub fn accepted(&self) -> usize {
        self.created + self.updated + self.existing + self.restored
    }

    /// Refusals of one kind.
    pub fn rejected_of(&self, kind: BatchErrorKind) -> usize {
        self.rejected.iter().filter(|r| r.kind == kind).count()
    }
}

/// Outcome of a call upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallUploadReport {
    /// Temp records sent.
    pub sent: usize,
    /// Canonical records returned by the server.
    pub server_records: Vec<CallLog>,
    /// Batches the server refused as a whole.
    pub rejected_batches: usize,
    /// Temp records dropped locally because they can never be uploaded.
    pub discarded: usize,
}

/// Pushes dirty local records.
pub struct UploadStage<'a, T: ?Sized, S: ?Sized> {
    transport: &'a T,
    store: &'a S,
    config: &'a SyncConfig,
}

impl<'a, T, S> UploadStage<'a, T, S>
where
    T: SyncTransport + ?Sized,
    S: LocalStore + ?Sized,
{
    /// Creates a new upload stage.
    pub fn new(transport: &'a T, store: &'a S, config: &'a SyncConfig) -> Self {
        Self {
            transport,
            store,
            config,
        }
    }

    /// Uploads dirty contacts of the run's owner.
    ///
    /// Deletions go first so a deleted phone number is free again before
    /// new records claim it. Each accepted record is replaced locally by the
    /// server copy (possibly changing its id) and marked clean.
    pub fn upload_contacts(&self, ctx: &RunContext) -> SyncResult<ContactUploadReport> {
        let owner = ctx.owner_id();
        let dirty = self.store.dirty_contacts(owner)?;
        let mut report = ContactUploadReport::default();
        if dirty.is_empty() {
            return Ok(report);
        }

        let (deleted, live): (Vec<_>, Vec<_>) =
            dirty.into_iter().partition(|c| c.contact.is_deleted());

        self.push_deletions(ctx, deleted, &mut report)?;

        for chunk in live.chunks(self.config.upload_batch_size.max(1)) {
            self.push_contact_batch(ctx, chunk, &mut report)?;
        }

        info!(
            owner,
            created = report.created,
            updated = report.updated,
            existing = report.existing,
            restored = report.restored,
            deleted = report.deleted,
            retired = report.retired,
            rejected = report.rejected.len(),
            "contacts uploaded"
        );
        Ok(report)
    }

    fn push_deletions(
        &self,
        ctx: &RunContext,
        deleted: Vec<LocalContact>,
        report: &mut ContactUploadReport,
    ) -> SyncResult<()> {
        let mut changes = ContactChanges::new();

        for contact in deleted {
            if !contact.is_local_only() {
                let id = contact.contact.id.clone();
                let outcome = ctx.call("delete contact", || {
                    self.transport.delete_contact(ctx.session(), &id)
                });
                match outcome {
                    Ok(()) => report.deleted += 1,
                    Err(e) if e.is_per_record() => {
                        warn!(id = %id, error = %e, "contact deletion refused");
                        report.rejected.push(RejectedContact {
                            local_id: id,
                            kind: batch_kind(e.kind()),
                            message: e.to_string(),
                        });
                        continue;
                    }
                    Err(e) => {
                        // Keep what was already confirmed.
                        self.commit_removals(changes, report)?;
                        return Err(e);
                    }
                }
            }
            changes.removes.push(contact.contact.id.clone());
            report.removed.push(contact);
        }

        self.commit_removals(changes, report)
    }

    fn commit_removals(
        &self,
        changes: ContactChanges,
        report: &ContactUploadReport,
    ) -> SyncResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        self.store.apply_contact_changes(&changes)?;
        debug!(removed = report.removed.len(), "deleted contacts removed locally");
        Ok(())
    }

    fn push_contact_batch(
        &self,
        ctx: &RunContext,
        chunk: &[LocalContact],
        report: &mut ContactUploadReport,
    ) -> SyncResult<()> {
        let inputs: Vec<ContactInput> = chunk
            .iter()
            .map(|c| ContactInput {
                name: c.contact.name.clone(),
                phone_raw: c.contact.phone_raw.clone(),
                // The conflict tie-breaker is the time of the last local edit.
                created_at: Some(c.contact.updated_at),
            })
            .collect();
        let mut request = ContactBatchRequest::new(inputs);
        if self.config.force_restore {
            request = request.with_force_restore(true);
        }

        let response = match ctx.call("upload contacts", || {
            self.transport.upload_contacts(ctx.session(), &request)
        }) {
            Ok(response) => response,
            Err(e) if e.is_per_record() => {
                warn!(size = chunk.len(), error = %e, "contact batch refused");
                report.rejected.extend(chunk.iter().map(|c| RejectedContact {
                    local_id: c.contact.id.clone(),
                    kind: batch_kind(e.kind()),
                    message: e.to_string(),
                }));
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut updates: Vec<ContactUpdate> = Vec::new();
        let mut claimed: HashMap<String, usize> = HashMap::new();
        let mut retired: Vec<String> = Vec::new();

        for result in response.results {
            let Some(local) = chunk.get(result.index) else {
                warn!(index = result.index, "batch result index out of range");
                continue;
            };
            match result.action {
                UpsertAction::Created => report.created += 1,
                UpsertAction::Updated => report.updated += 1,
                UpsertAction::Existing => report.existing += 1,
                UpsertAction::Restored => report.restored += 1,
            }

            let server_id = result.contact.id.clone();
            let mut confirmed = local.overwritten_by(result.contact);
            if local.contact.id != server_id {
                if !local.is_local_only() {
                    retired.push(local.contact.id.clone());
                }
                // Another local row may already hold the server record.
                if let Some(holder) = self.store.contact(&server_id)? {
                    if confirmed.device_ref.is_none() {
                        confirmed.device_ref = holder.device_ref;
                        confirmed.exported_at = holder.exported_at;
                    }
                }
            }
            // The last row mapped to a server record keeps it.
            if let Some(previous) = claimed.insert(server_id, updates.len()) {
                updates[previous].replacement = None;
            }
            updates.push(ContactUpdate::replace(local, confirmed));
        }

        for error in response.errors {
            let Some(local) = chunk.get(error.index) else {
                continue;
            };
            debug!(id = %local.contact.id, kind = ?error.kind, error = %error.error, "contact refused");
            report.rejected.push(RejectedContact {
                local_id: local.contact.id.clone(),
                kind: error.kind,
                message: error.error,
            });
        }

        let skipped = if updates.is_empty() {
            Vec::new()
        } else {
            ctx.check()?;
            self.store.apply_contact_updates(&updates)?
        };
        if !skipped.is_empty() {
            debug!(count = skipped.len(), "contacts edited during upload stay dirty");
            report.edited_in_flight += skipped.len();
        }
        retired.retain(|id| !claimed.contains_key(id) && !skipped.contains(id));

        // The old record still holds the previous phone number.
        for id in retired {
            match ctx.call("retire contact", || {
                self.transport.delete_contact(ctx.session(), &id)
            }) {
                Ok(()) => report.retired += 1,
                Err(e) if e.is_per_record() => {
                    warn!(id = %id, error = %e, "retiring superseded contact failed");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Uploads the owner's temp-id calls.
    ///
    /// The local temp records are left in place; reconciliation replaces
    /// them with the returned canonical records.
    pub fn upload_calls(&self, ctx: &RunContext) -> SyncResult<CallUploadReport> {
        let owner = ctx.owner_id();
        let pending: Vec<CallLog> = self
            .store
            .calls(owner)?
            .into_iter()
            .filter(|c| c.is_temporary())
            .collect();
        let mut report = CallUploadReport::default();

        for chunk in pending.chunks(self.config.upload_batch_size.max(1)) {
            let request = CallBatchRequest {
                calls: chunk.iter().map(CallInput::from).collect(),
            };
            match ctx.call("upload calls", || {
                self.transport.upload_calls(ctx.session(), &request)
            }) {
                Ok(response) => {
                    report.sent += chunk.len();
                    if response.calls.len() < chunk.len() {
                        report.discarded += self.discard_unaccepted(chunk, &response.calls)?;
                    }
                    report.server_records.extend(response.calls);
                }
                Err(e) if e.is_per_record() => {
                    warn!(size = chunk.len(), error = %e, "call batch refused");
                    report.rejected_batches += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if report.sent > 0 {
            info!(owner, sent = report.sent, returned = report.server_records.len(), "calls uploaded");
        }
        Ok(report)
    }

    /// Drops temp calls the server skipped; they would be re-sent forever.
    ///
    /// Returns the number of calls dropped.
    fn discard_unaccepted(&self, chunk: &[CallLog], returned: &[CallLog]) -> SyncResult<usize> {
        let mut changes = CallChanges::new();
        for call in chunk {
            let key = call.match_key();
            if !returned.iter().any(|r| r.match_key() == key) {
                changes.removes.push(call.id.clone());
            }
        }
        if !changes.is_empty() {
            warn!(count = changes.removes.len(), "server skipped calls; dropping them locally");
            self.store.apply_call_changes(&changes)?;
        }
        Ok(changes.removes.len())
    }
}

fn batch_kind(kind: ErrorKind) -> BatchErrorKind {
    match kind {
        ErrorKind::Conflict => BatchErrorKind::Conflict,
        _ => BatchErrorKind::Validation,
    }
}
