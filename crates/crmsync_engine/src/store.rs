//! Local persistence for the sync engine.
//!
//! The store is the only place records live on the client. Every write goes
//! through a [`Changes`] set that is applied atomically: either every removal
//! and upsert of the set becomes visible, or none does.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use crmsync_protocol::{
    is_local_contact_id, new_local_contact_id, normalize_phone, CallLog, Contact, SyncDomain,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// A contact as held on the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalContact {
    /// The record itself.
    pub contact: Contact,
    /// Edits not yet confirmed by the server.
    pub dirty: bool,
    /// Handle of the copy in the device address book.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_ref: Option<String>,
    /// `updated_at` of the version last written to the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exported_at: Option<DateTime<Utc>>,
}

impl LocalContact {
    /// Creates a contact that only exists locally.
    pub fn new_local(
        owner_id: impl Into<String>,
        name: impl Into<String>,
        phone_raw: impl Into<String>,
    ) -> SyncResult<Self> {
        let name = name.into();
        let phone_raw = phone_raw.into();
        if name.trim().is_empty() {
            return Err(SyncError::Validation("name is required".into()));
        }
        let phone_normalized = normalize_phone(&phone_raw)?;
        let now = Utc::now();

        Ok(Self {
            contact: Contact {
                id: new_local_contact_id(),
                name,
                phone_raw,
                phone_normalized,
                owner_id: owner_id.into(),
                created_at: now,
                updated_at: now,
                deleted_at: None,
            },
            dirty: true,
            device_ref: None,
            exported_at: None,
        })
    }

    /// Wraps a record received from the server.
    pub fn from_remote(contact: Contact) -> Self {
        Self {
            contact,
            dirty: false,
            device_ref: None,
            exported_at: None,
        }
    }

    /// Replaces the record with a server copy, keeping the device link.
    pub fn overwritten_by(&self, remote: Contact) -> Self {
        Self {
            contact: remote,
            dirty: false,
            device_ref: self.device_ref.clone(),
            exported_at: self.exported_at,
        }
    }

    /// Applies a user edit.
    pub fn edit(&mut self, name: impl Into<String>, phone_raw: impl Into<String>) -> SyncResult<()> {
        let name = name.into();
        let phone_raw = phone_raw.into();
        if name.trim().is_empty() {
            return Err(SyncError::Validation("name is required".into()));
        }
        self.contact.phone_normalized = normalize_phone(&phone_raw)?;
        self.contact.name = name;
        self.contact.phone_raw = phone_raw;
        self.contact.updated_at = Utc::now();
        self.dirty = true;
        Ok(())
    }

    /// Soft-deletes the contact.
    pub fn mark_deleted(&mut self) {
        let now = Utc::now();
        self.contact.deleted_at = Some(now);
        self.contact.updated_at = now;
        self.dirty = true;
    }

    /// Returns true if the server has never confirmed this contact.
    pub fn is_local_only(&self) -> bool {
        is_local_contact_id(&self.contact.id)
    }

    /// Returns true if the device copy is missing or stale.
    pub fn needs_export(&self) -> bool {
        !self.contact.is_deleted()
            && (self.device_ref.is_none() || self.exported_at != Some(self.contact.updated_at))
    }
}

/// An atomic change set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changes<T> {
    /// Ids to remove. Applied first.
    pub removes: Vec<String>,
    /// Records to insert or overwrite, keyed by their id.
    pub upserts: Vec<T>,
}

impl<T> Changes<T> {
    /// Creates an empty change set.
    pub fn new() -> Self {
        Self {
            removes: Vec::new(),
            upserts: Vec::new(),
        }
    }

    /// Returns true if applying the set changes nothing.
    pub fn is_empty(&self) -> bool {
        self.removes.is_empty() && self.upserts.is_empty()
    }
}

impl<T> Default for Changes<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Change set over contacts.
pub type ContactChanges = Changes<LocalContact>;

/// Change set over call logs.
pub type CallChanges = Changes<CallLog>;

/// A write-back of one contact that was read before a server round trip.
///
/// It applies only while the stored row still equals `expected`; a row
/// edited in the meantime is left alone and stays dirty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactUpdate {
    /// Id of the row being replaced.
    pub id: String,
    /// The row as read, or `None` if there was none.
    pub expected: Option<LocalContact>,
    /// The new row, stored under its own id. `None` removes the row.
    pub replacement: Option<LocalContact>,
}

impl ContactUpdate {
    /// Replaces `current` with `replacement`.
    pub fn replace(current: &LocalContact, replacement: LocalContact) -> Self {
        Self {
            id: current.contact.id.clone(),
            expected: Some(current.clone()),
            replacement: Some(replacement),
        }
    }

    /// Inserts a row that was absent when read.
    pub fn insert(contact: LocalContact) -> Self {
        Self {
            id: contact.contact.id.clone(),
            expected: None,
            replacement: Some(contact),
        }
    }

    /// Removes `current`.
    pub fn remove(current: &LocalContact) -> Self {
        Self {
            id: current.contact.id.clone(),
            expected: Some(current.clone()),
            replacement: None,
        }
    }
}

/// Per-owner checkpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoints {
    /// High-water mark of the contacts domain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contacts: Option<DateTime<Utc>>,
    /// High-water mark of the calls domain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calls: Option<DateTime<Utc>>,
}

impl Checkpoints {
    fn get(&self, domain: SyncDomain) -> Option<DateTime<Utc>> {
        match domain {
            SyncDomain::Contacts => self.contacts,
            SyncDomain::Calls => self.calls,
        }
    }

    fn set(&mut self, domain: SyncDomain, at: Option<DateTime<Utc>>) {
        match domain {
            SyncDomain::Contacts => self.contacts = at,
            SyncDomain::Calls => self.calls = at,
        }
    }

    fn is_empty(&self) -> bool {
        self.contacts.is_none() && self.calls.is_none()
    }
}

/// Full content of a local store.
///
/// Ordered maps keep the serialized form stable, so an unchanged store
/// always persists to the same bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Contacts by id.
    #[serde(default)]
    pub contacts: BTreeMap<String, LocalContact>,
    /// Call logs by id.
    #[serde(default)]
    pub calls: BTreeMap<String, CallLog>,
    /// Checkpoints by owner.
    #[serde(default)]
    pub checkpoints: BTreeMap<String, Checkpoints>,
    /// Newest device call-log timestamp read, in epoch millis, by owner.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub device_watermarks: BTreeMap<String, i64>,
}

impl Snapshot {
    /// Contacts of one owner, in id order.
    pub fn contacts_of(&self, owner_id: &str) -> Vec<LocalContact> {
        self.contacts
            .values()
            .filter(|c| c.contact.owner_id == owner_id)
            .cloned()
            .collect()
    }

    /// Call logs of one owner, in id order.
    pub fn calls_of(&self, owner_id: &str) -> Vec<CallLog> {
        self.calls
            .values()
            .filter(|c| c.owner_id == owner_id)
            .cloned()
            .collect()
    }

    /// Applies a contact change set.
    pub fn apply_contacts(&mut self, changes: &ContactChanges) {
        for id in &changes.removes {
            self.contacts.remove(id);
        }
        for contact in &changes.upserts {
            self.contacts.insert(contact.contact.id.clone(), contact.clone());
        }
    }

    /// Applies the updates whose rows are unchanged and returns the ids of
    /// the skipped ones.
    ///
    /// Every guard is checked against the state before any update applies.
    pub fn apply_contact_updates(&mut self, updates: &[ContactUpdate]) -> Vec<String> {
        let (fresh, stale): (Vec<&ContactUpdate>, Vec<&ContactUpdate>) = updates
            .iter()
            .partition(|u| self.contacts.get(&u.id) == u.expected.as_ref());
        for update in &fresh {
            self.contacts.remove(&update.id);
        }
        for contact in fresh.into_iter().filter_map(|u| u.replacement.as_ref()) {
            self.contacts.insert(contact.contact.id.clone(), contact.clone());
        }
        stale.into_iter().map(|u| u.id.clone()).collect()
    }

    /// Applies a call change set.
    pub fn apply_calls(&mut self, changes: &CallChanges) {
        for id in &changes.removes {
            self.calls.remove(id);
        }
        for call in &changes.upserts {
            self.calls.insert(call.id.clone(), call.clone());
        }
    }

    /// Reads a checkpoint.
    pub fn checkpoint(&self, owner_id: &str, domain: SyncDomain) -> Option<DateTime<Utc>> {
        self.checkpoints.get(owner_id).and_then(|c| c.get(domain))
    }

    /// Writes or clears a checkpoint.
    pub fn set_checkpoint(&mut self, owner_id: &str, domain: SyncDomain, at: Option<DateTime<Utc>>) {
        let entry = self.checkpoints.entry(owner_id.to_string()).or_default();
        entry.set(domain, at);
        if entry.is_empty() {
            self.checkpoints.remove(owner_id);
        }
    }

    /// Raises the owner's device watermark; it never moves back.
    pub fn advance_device_watermark(&mut self, owner_id: &str, millis: i64) {
        let entry = self.device_watermarks.entry(owner_id.to_string()).or_insert(millis);
        *entry = (*entry).max(millis);
    }

    /// Device refs held by any contact.
    pub fn device_refs(&self) -> HashSet<String> {
        self.contacts
            .values()
            .filter_map(|c| c.device_ref.clone())
            .collect()
    }
}

/// Durable client-side storage.
///
/// Implementations must apply each change set atomically and make it
/// durable before returning.
pub trait LocalStore: Send + Sync {
    /// All contacts of an owner, including soft-deleted ones.
    fn contacts(&self, owner_id: &str) -> SyncResult<Vec<LocalContact>>;

    /// Looks up a contact by id.
    fn contact(&self, id: &str) -> SyncResult<Option<LocalContact>>;

    /// Applies a contact change set.
    fn apply_contact_changes(&self, changes: &ContactChanges) -> SyncResult<()>;

    /// Applies conditional contact write-backs atomically.
    ///
    /// Returns the ids of updates skipped because their row changed.
    fn apply_contact_updates(&self, updates: &[ContactUpdate]) -> SyncResult<Vec<String>>;

    /// All call logs of an owner.
    fn calls(&self, owner_id: &str) -> SyncResult<Vec<CallLog>>;

    /// Applies a call change set.
    fn apply_call_changes(&self, changes: &CallChanges) -> SyncResult<()>;

    /// Reads the checkpoint of a domain.
    fn checkpoint(&self, owner_id: &str, domain: SyncDomain) -> SyncResult<Option<DateTime<Utc>>>;

    /// Writes (or with `None`, clears) the checkpoint of a domain.
    fn set_checkpoint(
        &self,
        owner_id: &str,
        domain: SyncDomain,
        at: Option<DateTime<Utc>>,
    ) -> SyncResult<()>;

    /// Newest device call-log timestamp already read for an owner.
    fn device_watermark(&self, owner_id: &str) -> SyncResult<Option<i64>>;

    /// Raises the device watermark of an owner.
    fn advance_device_watermark(&self, owner_id: &str, millis: i64) -> SyncResult<()>;

    /// Device refs held by contacts of any owner.
    fn device_refs(&self) -> SyncResult<HashSet<String>>;

    /// Contacts of an owner with unconfirmed edits.
    fn dirty_contacts(&self, owner_id: &str) -> SyncResult<Vec<LocalContact>> {
        Ok(self
            .contacts(owner_id)?
            .into_iter()
            .filter(|c| c.dirty)
            .collect())
    }

    /// Creates a new local contact and returns it.
    fn create_contact(&self, owner_id: &str, name: &str, phone_raw: &str) -> SyncResult<LocalContact> {
        let contact = LocalContact::new_local(owner_id, name, phone_raw)?;
        self.apply_contact_changes(&Changes {
            removes: Vec::new(),
            upserts: vec![contact.clone()],
        })?;
        Ok(contact)
    }

    /// Edits an existing contact.
    fn edit_contact(&self, id: &str, name: &str, phone_raw: &str) -> SyncResult<LocalContact> {
        let mut contact = self
            .contact(id)?
            .ok_or_else(|| SyncError::Store(format!("no contact {id}")))?;
        contact.edit(name, phone_raw)?;
        self.apply_contact_changes(&Changes {
            removes: Vec::new(),
            upserts: vec![contact.clone()],
        })?;
        Ok(contact)
    }

    /// Soft-deletes a contact; the next upload propagates the deletion.
    fn delete_contact(&self, id: &str) -> SyncResult<()> {
        let mut contact = self
            .contact(id)?
            .ok_or_else(|| SyncError::Store(format!("no contact {id}")))?;
        contact.mark_deleted();
        self.apply_contact_changes(&Changes {
            removes: Vec::new(),
            upserts: vec![contact],
        })
    }
}

/// In-memory local store.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    snapshot: RwLock<Snapshot>,
}

impl MemoryLocalStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `snapshot`.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
        }
    }

    /// Copies the current content.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.read().clone()
    }
}

impl LocalStore for MemoryLocalStore {
    fn contacts(&self, owner_id: &str) -> SyncResult<Vec<LocalContact>> {
        Ok(self.snapshot.read().contacts_of(owner_id))
    }

    fn contact(&self, id: &str) -> SyncResult<Option<LocalContact>> {
        Ok(self.snapshot.read().contacts.get(id).cloned())
    }

    fn apply_contact_changes(&self, changes: &ContactChanges) -> SyncResult<()> {
        self.snapshot.write().apply_contacts(changes);
        Ok(())
    }

    fn apply_contact_updates(&self, updates: &[ContactUpdate]) -> SyncResult<Vec<String>> {
        Ok(self.snapshot.write().apply_contact_updates(updates))
    }

    fn calls(&self, owner_id: &str) -> SyncResult<Vec<CallLog>> {
        Ok(self.snapshot.read().calls_of(owner_id))
    }

    fn apply_call_changes(&self, changes: &CallChanges) -> SyncResult<()> {
        self.snapshot.write().apply_calls(changes);
        Ok(())
    }

    fn checkpoint(&self, owner_id: &str, domain: SyncDomain) -> SyncResult<Option<DateTime<Utc>>> {
        Ok(self.snapshot.read().checkpoint(owner_id, domain))
    }

    fn set_checkpoint(
        &self,
        owner_id: &str,
        domain: SyncDomain,
        at: Option<DateTime<Utc>>,
    ) -> SyncResult<()> {
        self.snapshot.write().set_checkpoint(owner_id, domain, at);
        Ok(())
    }

    fn device_watermark(&self, owner_id: &str) -> SyncResult<Option<i64>> {
        Ok(self.snapshot.read().device_watermarks.get(owner_id).copied())
    }

    fn advance_device_watermark(&self, owner_id: &str, millis: i64) -> SyncResult<()> {
        self.snapshot.write().advance_device_watermark(owner_id, millis);
        Ok(())
    }

    fn device_refs(&self) -> SyncResult<HashSet<String>> {
        Ok(self.snapshot.read().device_refs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use crmsync_protocol::{temp_call_id, CallDirection};

    fn call(owner: &str, phone: &str, secs: i64) -> CallLog {
        let timestamp = Utc.timestamp_opt(secs, 0).unwrap();
        CallLog {
            id: temp_call_id(&timestamp, phone),
            owner_id: owner.into(),
            contact_id: None,
            direction: CallDirection::Outgoing,
            duration_seconds: 30,
            timestamp,
            phone_number: phone.into(),
            created_at: timestamp,
        }
    }

    #[test]
    fn local_contact_lifecycle() {
        let mut contact = LocalContact::new_local("u1", "Ada", "+1 555 0100").unwrap();
        assert!(contact.is_local_only());
        assert!(contact.dirty);
        assert_eq!(contact.contact.phone_normalized, "+15550100");

        contact.edit("Ada L.", "555-0101").unwrap();
        assert_eq!(contact.contact.phone_normalized, "5550101");

        contact.mark_deleted();
        assert!(contact.contact.is_deleted());
        assert!(!contact.needs_export());
    }

    #[test]
    fn invalid_local_contact() {
        assert!(matches!(
            LocalContact::new_local("u1", "", "5550100"),
            Err(SyncError::Validation(_))
        ));
        assert!(matches!(
            LocalContact::new_local("u1", "Ada", "12"),
            Err(SyncError::Validation(_))
        ));
    }

    #[test]
    fn change_sets_remove_before_upsert() {
        let store = MemoryLocalStore::new();
        let local = store.create_contact("u1", "Ada", "5550100").unwrap();

        let mut confirmed = local.clone();
        confirmed.contact.id = "c1".into();
        confirmed.dirty = false;
        store
            .apply_contact_changes(&Changes {
                removes: vec![local.contact.id.clone()],
                upserts: vec![confirmed],
            })
            .unwrap();

        let contacts = store.contacts("u1").unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].contact.id, "c1");
        assert!(store.dirty_contacts("u1").unwrap().is_empty());
    }

    #[test]
    fn updates_skip_rows_edited_since_read() {
        let store = MemoryLocalStore::new();
        let ada = store.create_contact("u1", "Ada", "5550100").unwrap();
        let bob = store.create_contact("u1", "Bob", "5550200").unwrap();

        let mut ada_confirmed = ada.clone();
        ada_confirmed.contact.id = "c-ada".into();
        ada_confirmed.dirty = false;
        let mut bob_confirmed = bob.clone();
        bob_confirmed.contact.id = "c-bob".into();
        bob_confirmed.dirty = false;

        store.edit_contact(&bob.contact.id, "Robert", "5550200").unwrap();

        let skipped = store
            .apply_contact_updates(&[
                ContactUpdate::replace(&ada, ada_confirmed),
                ContactUpdate::replace(&bob, bob_confirmed),
            ])
            .unwrap();
        assert_eq!(skipped, vec![bob.contact.id.clone()]);

        assert!(store.contact(&ada.contact.id).unwrap().is_none());
        assert!(!store.contact("c-ada").unwrap().unwrap().dirty);
        assert!(store.contact("c-bob").unwrap().is_none());
        let kept = store.contact(&bob.contact.id).unwrap().unwrap();
        assert_eq!(kept.contact.name, "Robert");
        assert!(kept.dirty);
    }

    #[test]
    fn insert_update_skips_when_row_appeared() {
        let store = MemoryLocalStore::new();
        let mut remote = LocalContact::new_local("u1", "Ada", "5550100").unwrap();
        remote.contact.id = "c1".into();
        remote.dirty = false;
        assert!(store
            .apply_contact_updates(&[ContactUpdate::insert(remote.clone())])
            .unwrap()
            .is_empty());

        let skipped = store
            .apply_contact_updates(&[ContactUpdate::insert(remote)])
            .unwrap();
        assert_eq!(skipped, vec!["c1".to_string()]);
    }

    #[test]
    fn contacts_are_owner_scoped() {
        let store = MemoryLocalStore::new();
        store.create_contact("u1", "Ada", "5550100").unwrap();
        store.create_contact("u2", "Bob", "5550200").unwrap();
        assert_eq!(store.contacts("u1").unwrap().len(), 1);
        assert_eq!(store.contacts("u2").unwrap().len(), 1);
    }

    #[test]
    fn calls_round_trip_through_changes() {
        let store = MemoryLocalStore::new();
        let a = call("u1", "5550100", 1_700_000_000);
        let b = call("u1", "5550200", 1_700_000_100);
        store
            .apply_call_changes(&Changes {
                removes: vec![],
                upserts: vec![a.clone(), b.clone()],
            })
            .unwrap();
        store
            .apply_call_changes(&Changes {
                removes: vec![a.id.clone()],
                upserts: vec![],
            })
            .unwrap();
        assert_eq!(store.calls("u1").unwrap(), vec![b]);
    }

    #[test]
    fn checkpoints_per_owner_and_domain() {
        let store = MemoryLocalStore::new();
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        store.set_checkpoint("u1", SyncDomain::Contacts, Some(at)).unwrap();

        assert_eq!(store.checkpoint("u1", SyncDomain::Contacts).unwrap(), Some(at));
        assert_eq!(store.checkpoint("u1", SyncDomain::Calls).unwrap(), None);
        assert_eq!(store.checkpoint("u2", SyncDomain::Contacts).unwrap(), None);

        store.set_checkpoint("u1", SyncDomain::Contacts, None).unwrap();
        assert!(store.snapshot().checkpoints.is_empty());
    }

    #[test]
    fn edit_and_delete_mark_dirty() {
        let store = MemoryLocalStore::new();
        let mut remote = LocalContact::new_local("u1", "Ada", "5550100").unwrap();
        remote.contact.id = "c1".into();
        remote.dirty = false;
        store
            .apply_contact_changes(&Changes {
                removes: vec![],
                upserts: vec![remote],
            })
            .unwrap();

        store.edit_contact("c1", "Ada L.", "5550100").unwrap();
        assert_eq!(store.dirty_contacts("u1").unwrap().len(), 1);

        store.delete_contact("c1").unwrap();
        let contact = store.contact("c1").unwrap().unwrap();
        assert!(contact.contact.is_deleted());
        assert!(store.delete_contact("missing").is_err());
    }

    #[test]
    fn snapshot_serialization_is_stable() {
        let store = MemoryLocalStore::new();
        store.create_contact("u1", "Ada", "5550100").unwrap();
        store.create_contact("u1", "Bob", "5550200").unwrap();
        let snapshot = store.snapshot();

        let first = serde_json::to_vec(&snapshot).unwrap();
        let second = serde_json::to_vec(&snapshot.clone()).unwrap();
        assert_eq!(first, second);
        assert_eq!(serde_json::from_slice::<Snapshot>(&first).unwrap(), snapshot);
    }
}
