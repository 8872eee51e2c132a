//! Mirroring between the local store and the device.
//!
//! Device failures are logged and counted, never propagated: the device is
//! a best-effort mirror, and the store remains the source of truth. Store
//! failures still propagate.

use crate::device::{DeviceBridge, RawCallRecord};
use crate::error::SyncResult;
use crate::store::{CallChanges, ContactChanges, LocalContact, LocalStore};
use crmsync_protocol::normalize_phone;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Outcome of a device pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceReport {
    /// Rows read or records written.
    pub processed: usize,
    /// Rows skipped as unrepresentable or already present.
    pub skipped: usize,
    /// Device entries removed.
    pub removed: usize,
    /// Failed device calls.
    pub errors: usize,
}

/// Reads new call-log rows into the store as temp-id records.
///
/// Only rows at or after the owner's device watermark are read. The
/// watermark follows rows read off this device, never calls downloaded from
/// other devices. Rows whose key is already held locally (temp or
/// canonical) are skipped.
pub fn import_call_logs<S, D>(store: &S, device: &D, owner_id: &str) -> SyncResult<DeviceReport>
where
    S: LocalStore + ?Sized,
    D: DeviceBridge + ?Sized,
{
    let mut report = DeviceReport::default();
    let since = store.device_watermark(owner_id)?.unwrap_or(0);
    let mut known: HashSet<(String, i64)> = store
        .calls(owner_id)?
        .iter()
        .map(|c| (c.phone_number.clone(), c.timestamp.timestamp_millis()))
        .collect();

    let rows: Vec<RawCallRecord> = match device.read_device_call_logs(since) {
        Ok(rows) => rows,
        Err(e) => {
            warn!(error = %e, "reading device call log failed");
            report.errors += 1;
            return Ok(report);
        }
    };
    let newest = rows.iter().map(|r| r.timestamp_millis).max();

    let mut changes = CallChanges::new();
    for row in rows {
        match row.to_call_log(owner_id) {
            Ok(call) => {
                if known.insert((call.phone_number.clone(), call.timestamp.timestamp_millis())) {
                    changes.upserts.push(call);
                    report.processed += 1;
                } else {
                    report.skipped += 1;
                }
            }
            Err(e) => {
                debug!(error = %e, "skipping device call");
                report.skipped += 1;
            }
        }
    }

    if !changes.is_empty() {
        store.apply_call_changes(&changes)?;
        debug!(owner = owner_id, imported = report.processed, "device calls imported");
    }
    // Rows at the watermark are read again next time and skipped by key.
    if let Some(newest) = newest {
        store.advance_device_watermark(owner_id, newest)?;
    }
    Ok(report)
}

/// Writes the owner's contacts to the device and removes stale entries.
///
/// `removed` are contacts this run deleted from the store; their entries go
/// too. Entries this app owns that no local contact references any more
/// are removed last.
pub fn export_contacts<S, D>(
    store: &S,
    device: &D,
    owner_id: &str,
    removed: &[LocalContact],
) -> SyncResult<DeviceReport>
where
    S: LocalStore + ?Sized,
    D: DeviceBridge + ?Sized,
{
    let mut report = DeviceReport::default();

    for contact in removed {
        if let Some(device_ref) = &contact.device_ref {
            match device.delete_contact(device_ref) {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    warn!(device_ref = %device_ref, error = %e, "removing device contact failed");
                    report.errors += 1;
                }
            }
        }
    }

    let mut changes = ContactChanges::new();
    for mut contact in store.contacts(owner_id)? {
        if !contact.needs_export() {
            continue;
        }
        let written = match &contact.device_ref {
            Some(device_ref) => device
                .update_contact(device_ref, &contact.contact)
                .map(|()| device_ref.clone()),
            None => device.write_contact(&contact.contact),
        };
        match written {
            Ok(device_ref) => {
                contact.device_ref = Some(device_ref);
                contact.exported_at = Some(contact.contact.updated_at);
                changes.upserts.push(contact);
                report.processed += 1;
            }
            Err(e) => {
                warn!(id = %contact.contact.id, error = %e, "exporting contact failed");
                report.errors += 1;
            }
        }
    }
    if !changes.is_empty() {
        store.apply_contact_changes(&changes)?;
    }

    remove_orphans(store, device, &mut report)?;
    Ok(report)
}

fn remove_orphans<S, D>(store: &S, device: &D, report: &mut DeviceReport) -> SyncResult<()>
where
    S: LocalStore + ?Sized,
    D: DeviceBridge + ?Sized,
{
    let owned = match device.list_owned_device_refs() {
        Ok(owned) => owned,
        Err(e) => {
            warn!(error = %e, "listing device contacts failed");
            report.errors += 1;
            return Ok(());
        }
    };
    let referenced = store.device_refs()?;

    for device_ref in owned.into_iter().filter(|r| !referenced.contains(r)) {
        match device.delete_contact(&device_ref) {
            Ok(()) => report.removed += 1,
            Err(e) => {
                warn!(device_ref = %device_ref, error = %e, "removing orphaned device contact failed");
                report.errors += 1;
            }
        }
    }
    Ok(())
}

/// Creates local contacts for address-book entries whose number is unknown.
///
/// The new contacts are dirty and go up with the next upload.
pub fn import_contacts<S, D>(store: &S, device: &D, owner_id: &str) -> SyncResult<DeviceReport>
where
    S: LocalStore + ?Sized,
    D: DeviceBridge + ?Sized,
{
    let mut report = DeviceReport::default();
    let entries = match device.read_device_contacts() {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "reading device contacts failed");
            report.errors += 1;
            return Ok(report);
        }
    };

    let mut known: HashSet<String> = store
        .contacts(owner_id)?
        .into_iter()
        .map(|c| c.contact.phone_normalized)
        .collect();

    let mut changes = ContactChanges::new();
    for entry in entries {
        let phone = match normalize_phone(&entry.phone) {
            Ok(phone) => phone,
            Err(_) => {
                report.skipped += 1;
                continue;
            }
        };
        if known.contains(&phone) {
            report.skipped += 1;
            continue;
        }
        match LocalContact::new_local(owner_id, entry.display_name.as_str(), entry.phone.as_str()) {
            Ok(contact) => {
                known.insert(phone);
                changes.upserts.push(contact);
                report.processed += 1;
            }
            Err(_) => report.skipped += 1,
        }
    }

    if !changes.is_empty() {
        store.apply_contact_changes(&changes)?;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MemoryDeviceBridge, RawCallKind, RawContact};
    use crate::store::MemoryLocalStore;

    fn row(number: &str, millis: i64) -> RawCallRecord {
        RawCallRecord {
            number: number.into(),
            timestamp_millis: millis,
            duration_seconds: 5,
            kind: RawCallKind::Outgoing,
        }
    }

    #[test]
    fn call_import_is_idempotent() {
        let store = MemoryLocalStore::new();
        let device = MemoryDeviceBridge::new();
        device.push_call(row("5550100", 1_000));
        device.push_call(row("5550200", 2_000));
        device.push_call(row("not a number", 3_000));

        let first = import_call_logs(&store, &device, "u1").unwrap();
        assert_eq!(first.processed, 2);
        assert_eq!(first.skipped, 1);

        let second = import_call_logs(&store, &device, "u1").unwrap();
        assert_eq!(second.processed, 0);
        assert_eq!(store.calls("u1").unwrap().len(), 2);
        assert!(store.calls("u1").unwrap().iter().all(|c| c.is_temporary()));
    }

    #[test]
    fn downloaded_calls_do_not_hide_older_device_rows() {
        let store = MemoryLocalStore::new();
        let device = MemoryDeviceBridge::new();
        let mut downloaded = row("5550900", 2_000_000).to_call_log("u1").unwrap();
        downloaded.id = crmsync_protocol::new_canonical_id();
        store
            .apply_call_changes(&CallChanges {
                removes: vec![],
                upserts: vec![downloaded],
            })
            .unwrap();
        device.push_call(row("5550100", 1_500_000));

        let report = import_call_logs(&store, &device, "u1").unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(store.calls("u1").unwrap().len(), 2);
        assert_eq!(store.device_watermark("u1").unwrap(), Some(1_500_000));

        // Rows older than what this device already gave are not read again.
        device.push_call(row("5550200", 1_000_000));
        assert_eq!(import_call_logs(&store, &device, "u1").unwrap().processed, 0);
    }

    #[test]
    fn device_failure_is_not_fatal() {
        let store = MemoryLocalStore::new();
        let device = MemoryDeviceBridge::new();
        device.set_failing(true);

        let report = import_call_logs(&store, &device, "u1").unwrap();
        assert_eq!(report.errors, 1);

        store.create_contact("u1", "Ada", "5550100").unwrap();
        let report = export_contacts(&store, &device, "u1", &[]).unwrap();
        assert!(report.errors >= 1);
        assert!(store.contacts("u1").unwrap()[0].device_ref.is_none());
    }

    #[test]
    fn export_writes_then_updates() {
        let store = MemoryLocalStore::new();
        let device = MemoryDeviceBridge::new();
        let contact = store.create_contact("u1", "Ada", "5550100").unwrap();

        let report = export_contacts(&store, &device, "u1", &[]).unwrap();
        assert_eq!(report.processed, 1);
        let exported = store.contact(&contact.contact.id).unwrap().unwrap();
        let device_ref = exported.device_ref.clone().unwrap();
        assert!(!exported.needs_export());

        // Nothing changed: nothing to write.
        assert_eq!(export_contacts(&store, &device, "u1", &[]).unwrap().processed, 0);

        store.edit_contact(&contact.contact.id, "Ada L.", "5550100").unwrap();
        export_contacts(&store, &device, "u1", &[]).unwrap();
        assert_eq!(device.owned_contacts()[&device_ref].name, "Ada L.");
    }

    #[test]
    fn removed_and_orphaned_entries_are_deleted() {
        let store = MemoryLocalStore::new();
        let device = MemoryDeviceBridge::new();
        let contact = store.create_contact("u1", "Ada", "5550100").unwrap();
        export_contacts(&store, &device, "u1", &[]).unwrap();
        let exported = store.contact(&contact.contact.id).unwrap().unwrap();

        let orphan = LocalContact::new_local("u1", "Ghost", "5550999").unwrap();
        device.write_contact(&orphan.contact).unwrap();
        assert_eq!(device.owned_contacts().len(), 2);

        store
            .apply_contact_changes(&ContactChanges {
                removes: vec![contact.contact.id.clone()],
                upserts: vec![],
            })
            .unwrap();
        let report = export_contacts(&store, &device, "u1", &[exported]).unwrap();
        assert_eq!(report.removed, 2);
        assert!(device.owned_contacts().is_empty());
    }

    #[test]
    fn contact_import_skips_known_numbers() {
        let store = MemoryLocalStore::new();
        let device = MemoryDeviceBridge::new();
        store.create_contact("u1", "Ada", "555-0100").unwrap();
        device.push_contact(RawContact {
            display_name: "Ada Lovelace".into(),
            phone: "5550100".into(),
        });
        device.push_contact(RawContact {
            display_name: "Bob".into(),
            phone: "5550200".into(),
        });
        device.push_contact(RawContact {
            display_name: "".into(),
            phone: "5550300".into(),
        });

        let report = import_contacts(&store, &device, "u1").unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(store.dirty_contacts("u1").unwrap().len(), 2);
    }
}
