//! Authoritative remote store.
//!
//! Every mutating call runs under a single write lock, which is the
//! transaction boundary of the protocol: entries of one upload batch that race
//! for the same phone key are resolved one after another.

use crate::auth::Principal;
use crate::error::{ServerError, ServerResult};
use chrono::{DateTime, Duration, Utc};
use crmsync_protocol::{
    new_canonical_id, normalize_phone, AuditRequest, BatchError, BatchErrorKind, BatchResult,
    BatchSummary, CallInput, CallLog, Contact, ContactBatchResponse, ContactInput, Page,
    PageQuery, Pagination, SyncAudit, UpsertAction,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// Server-side tables.
#[derive(Default)]
struct Tables {
    /// All contacts by id, soft-deleted ones included.
    contacts: HashMap<String, Contact>,
    /// phone_normalized -> id of the single non-deleted contact.
    live_by_phone: HashMap<String, String>,
    /// All calls by id.
    calls: HashMap<String, CallLog>,
    /// (owner, phone, timestamp) -> call id.
    call_keys: HashMap<(String, String, DateTime<Utc>), String>,
    /// Audit entries in append order.
    audits: Vec<SyncAudit>,
    /// Last issued write stamp.
    last_stamp: Option<DateTime<Utc>>,
}

impl Tables {
    /// Returns a strictly increasing write timestamp.
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_stamp {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }
}

/// The authoritative store behind the sync endpoints.
#[derive(Default)]
pub struct RemoteStore {
    tables: RwLock<Tables>,
}

impl RemoteStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves a batch of uploaded contacts for `principal`.
    ///
    /// A batch larger than `max_batch` is rejected before any entry is
    /// looked at.
    pub fn upsert_contacts(
        &self,
        principal: &Principal,
        contacts: &[ContactInput],
        force_restore: bool,
        max_batch: usize,
    ) -> ServerResult<ContactBatchResponse> {
        if contacts.len() > max_batch {
            return Err(ServerError::BatchTooLarge {
                size: contacts.len(),
                max: max_batch,
            });
        }

        let mut tables = self.tables.write();
        let mut results = Vec::with_capacity(contacts.len());
        let mut errors = Vec::new();
        let mut summary = BatchSummary {
            total: contacts.len(),
            ..BatchSummary::default()
        };

        for (index, input) in contacts.iter().enumerate() {
            match upsert_one(&mut tables, principal, input, force_restore) {
                Ok((action, contact)) => {
                    match action {
                        UpsertAction::Created => summary.created += 1,
                        UpsertAction::Updated => summary.updated += 1,
                        UpsertAction::Existing => summary.existing += 1,
                        UpsertAction::Restored => summary.restored += 1,
                    }
                    results.push(BatchResult {
                        index,
                        action,
                        contact,
                    });
                }
                Err((kind, error)) => {
                    summary.errors += 1;
                    errors.push(BatchError {
                        index,
                        error,
                        kind,
                        contact: input.clone(),
                    });
                }
            }
        }

        debug!(
            owner = %principal.owner_id,
            created = summary.created,
            updated = summary.updated,
            existing = summary.existing,
            errors = summary.errors,
            "contact batch resolved"
        );

        Ok(ContactBatchResponse {
            results,
            errors,
            summary,
        })
    }

    /// Soft-deletes a contact.
    pub fn delete_contact(&self, principal: &Principal, id: &str) -> ServerResult<Contact> {
        let mut tables = self.tables.write();
        let stamp = tables.stamp();

        let contact = tables
            .contacts
            .get_mut(id)
            .filter(|c| !c.is_deleted())
            .ok_or_else(|| ServerError::NotFound(format!("contact {id}")))?;

        if !principal.may_mutate(&contact.owner_id) {
            return Err(ServerError::NotAuthorized(format!(
                "contact {id} belongs to another owner"
            )));
        }

        contact.deleted_at = Some(stamp);
        contact.updated_at = stamp;
        let deleted = contact.clone();
        tables.live_by_phone.remove(&deleted.phone_normalized);
        Ok(deleted)
    }

    /// Lists the caller's live contacts, ordered by `(updated_at, id)`.
    pub fn list_contacts(&self, principal: &Principal, query: &PageQuery) -> Page<Contact> {
        let tables = self.tables.read();
        let mut matching: Vec<&Contact> = tables
            .contacts
            .values()
            .filter(|c| c.owner_id == principal.owner_id && !c.is_deleted())
            .filter(|c| query.updated_since.map_or(true, |since| c.updated_at >= since))
            .collect();
        matching.sort_by(|a, b| (a.updated_at, &a.id).cmp(&(b.updated_at, &b.id)));
        paginate(matching, query)
    }

    /// Stores uploaded calls, returning one canonical record per valid input.
    ///
    /// Calls are keyed by `(owner, phone, timestamp)`; re-uploading a call
    /// returns the record stored the first time.
    pub fn insert_calls(
        &self,
        principal: &Principal,
        calls: &[CallInput],
        max_batch: usize,
    ) -> ServerResult<Vec<CallLog>> {
        if calls.len() > max_batch {
            return Err(ServerError::BatchTooLarge {
                size: calls.len(),
                max: max_batch,
            });
        }

        let mut tables = self.tables.write();
        let mut stored = Vec::with_capacity(calls.len());

        for input in calls {
            let Some(phone) = input
                .phone_normalized
                .as_deref()
                .and_then(|p| normalize_phone(p).ok())
            else {
                debug!(owner = %principal.owner_id, "skipping call without a valid phone number");
                continue;
            };

            let key = (principal.owner_id.clone(), phone.clone(), input.timestamp);
            if let Some(existing) = tables.call_keys.get(&key).and_then(|id| tables.calls.get(id)) {
                stored.push(existing.clone());
                continue;
            }

            let contact_id = input.contact_id.clone().or_else(|| {
                tables
                    .live_by_phone
                    .get(&phone)
                    .and_then(|id| tables.contacts.get(id))
                    .filter(|c| c.owner_id == principal.owner_id)
                    .map(|c| c.id.clone())
            });

            let call = CallLog {
                id: new_canonical_id(),
                owner_id: principal.owner_id.clone(),
                contact_id,
                direction: input.direction,
                duration_seconds: input.duration_seconds,
                timestamp: input.timestamp,
                phone_number: phone,
                created_at: tables.stamp(),
            };
            tables.call_keys.insert(key, call.id.clone());
            tables.calls.insert(call.id.clone(), call.clone());
            stored.push(call);
        }

        Ok(stored)
    }

    /// Lists the caller's calls, ordered by `(created_at, id)`.
    pub fn list_calls(&self, principal: &Principal, query: &PageQuery) -> Page<CallLog> {
        let tables = self.tables.read();
        let mut matching: Vec<&CallLog> = tables
            .calls
            .values()
            .filter(|c| c.owner_id == principal.owner_id)
            .filter(|c| query.updated_since.map_or(true, |since| c.created_at >= since))
            .collect();
        matching.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        paginate(matching, query)
    }

    /// Appends an audit entry.
    pub fn record_audit(&self, principal: &Principal, request: &AuditRequest) -> SyncAudit {
        let mut tables = self.tables.write();
        let audit = SyncAudit {
            id: new_canonical_id(),
            owner_id: principal.owner_id.clone(),
            sync_type: request.sync_type,
            status: request.status,
            synced_contacts: request.synced_contacts,
            synced_calls: request.synced_calls,
            error_message: request.error_message.clone(),
            created_at: tables.stamp(),
        };
        tables.audits.push(audit.clone());
        audit
    }

    /// Inserts or replaces a contact directly, bypassing conflict resolution.
    ///
    /// Seeds fixtures and lets administrative tooling repair data.
    pub fn put_contact(&self, contact: Contact) {
        let mut tables = self.tables.write();
        if let Some(previous) = tables.contacts.get(&contact.id) {
            let phone = previous.phone_normalized.clone();
            if tables.live_by_phone.get(&phone) == Some(&contact.id) {
                tables.live_by_phone.remove(&phone);
            }
        }
        if !contact.is_deleted() {
            tables
                .live_by_phone
                .insert(contact.phone_normalized.clone(), contact.id.clone());
        }
        tables.contacts.insert(contact.id.clone(), contact);
    }

    /// Returns a contact by id.
    pub fn contact(&self, id: &str) -> Option<Contact> {
        self.tables.read().contacts.get(id).cloned()
    }

    /// Returns the live contact holding a phone key.
    pub fn contact_by_phone(&self, phone_normalized: &str) -> Option<Contact> {
        let tables = self.tables.read();
        tables
            .live_by_phone
            .get(phone_normalized)
            .and_then(|id| tables.contacts.get(id))
            .cloned()
    }

    /// Number of stored contacts, soft-deleted ones included.
    pub fn contact_count(&self) -> usize {
        self.tables.read().contacts.len()
    }

    /// Number of stored calls.
    pub fn call_count(&self) -> usize {
        self.tables.read().calls.len()
    }

    /// All audit entries in append order.
    pub fn audits(&self) -> Vec<SyncAudit> {
        self.tables.read().audits.clone()
    }
}

/// Resolves one batch entry against the tables.
fn upsert_one(
    tables: &mut Tables,
    principal: &Principal,
    input: &ContactInput,
    force_restore: bool,
) -> Result<(UpsertAction, Contact), (BatchErrorKind, String)> {
    let name = input.name.trim();
    if name.is_empty() {
        return Err((BatchErrorKind::Validation, "name is required".into()));
    }
    let phone = normalize_phone(&input.phone_raw)
        .map_err(|e| (BatchErrorKind::Validation, e.to_string()))?;

    if let Some(id) = tables.live_by_phone.get(&phone).cloned() {
        let stamp = tables.stamp();
        let Some(existing) = tables.contacts.get_mut(&id) else {
            return Err((BatchErrorKind::Validation, format!("dangling phone index for {id}")));
        };

        if existing.owner_id != principal.owner_id {
            return Err((
                BatchErrorKind::Conflict,
                format!("phone number {phone} belongs to another owner"),
            ));
        }

        return match input.created_at {
            Some(local_created) if local_created > existing.created_at => {
                existing.name = name.to_string();
                existing.phone_raw = input.phone_raw.clone();
                existing.created_at = local_created;
                existing.updated_at = stamp;
                Ok((UpsertAction::Updated, existing.clone()))
            }
            _ => Ok((UpsertAction::Existing, existing.clone())),
        };
    }

    let stamp = tables.stamp();

    if force_restore {
        let restorable = tables
            .contacts
            .values()
            .filter(|c| {
                c.is_deleted() && c.phone_normalized == phone && c.owner_id == principal.owner_id
            })
            .max_by_key(|c| c.deleted_at)
            .map(|c| c.id.clone());

        if let Some(id) = restorable {
            if let Some(contact) = tables.contacts.get_mut(&id) {
                contact.name = name.to_string();
                contact.phone_raw = input.phone_raw.clone();
                contact.deleted_at = None;
                contact.updated_at = stamp;
                if let Some(created) = input.created_at {
                    contact.created_at = created;
                }
                let restored = contact.clone();
                tables.live_by_phone.insert(phone, id);
                return Ok((UpsertAction::Restored, restored));
            }
        }
    }

    let contact = Contact {
        id: new_canonical_id(),
        name: name.to_string(),
        phone_raw: input.phone_raw.clone(),
        phone_normalized: phone.clone(),
        owner_id: principal.owner_id.clone(),
        created_at: input.created_at.unwrap_or(stamp),
        updated_at: stamp,
        deleted_at: None,
    };
    tables.live_by_phone.insert(phone, contact.id.clone());
    tables.contacts.insert(contact.id.clone(), contact.clone());
    Ok((UpsertAction::Created, contact))
}

fn paginate<T: Clone>(matching: Vec<&T>, query: &PageQuery) -> Page<T> {
    let total = matching.len() as u64;
    let start = (query.page.saturating_sub(1) as usize).saturating_mul(query.limit as usize);
    let data = matching
        .into_iter()
        .skip(start)
        .take(query.limit as usize)
        .cloned()
        .collect();

    Page {
        data,
        pagination: Pagination::new(query.page, query.limit, total),
    }
}
