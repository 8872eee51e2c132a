//! Inspect command implementation.

use chrono::{DateTime, Utc};
use crmsync_engine::Snapshot;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Snapshot file size in bytes.
    pub file_size: u64,
    /// Per-owner statistics.
    pub owners: Vec<OwnerStats>,
}

/// Statistics for a single owner.
#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct OwnerStats {
    /// Owner id.
    pub owner_id: String,
    /// Live contacts.
    pub contacts: usize,
    /// Contacts with unconfirmed edits, deletions included.
    pub dirty_contacts: usize,
    /// Soft-deleted contacts waiting for upload.
    pub deleted_contacts: usize,
    /// Contacts the server has never seen.
    pub local_only_contacts: usize,
    /// Contacts mirrored to the device.
    pub device_contacts: usize,
    /// Call logs.
    pub calls: usize,
    /// Calls still carrying a temporary id.
    pub temp_calls: usize,
    /// Contacts checkpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contacts_checkpoint: Option<DateTime<Utc>>,
    /// Calls checkpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calls_checkpoint: Option<DateTime<Utc>>,
}

/// Runs the inspect command.
pub fn run(path: &Path, owner: Option<&str>, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_store(path)?;
    let snapshot = store.snapshot();

    let result = InspectResult {
        path: path.display().to_string(),
        file_size: std::fs::metadata(store.store_file())?.len(),
        owners: owner_stats(&snapshot, owner),
    };

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Collects statistics for every owner in the snapshot, or just `only`.
pub fn owner_stats(snapshot: &Snapshot, only: Option<&str>) -> Vec<OwnerStats> {
    let mut owners: BTreeSet<&str> = BTreeSet::new();
    owners.extend(snapshot.contacts.values().map(|c| c.contact.owner_id.as_str()));
    owners.extend(snapshot.calls.values().map(|c| c.owner_id.as_str()));
    owners.extend(snapshot.checkpoints.keys().map(String::as_str));

    owners
        .into_iter()
        .filter(|o| only.map_or(true, |only| only == *o))
        .map(|owner_id| {
            let mut stats = OwnerStats {
                owner_id: owner_id.to_string(),
                ..OwnerStats::default()
            };
            for contact in snapshot.contacts_of(owner_id) {
                if contact.contact.is_deleted() {
                    stats.deleted_contacts += 1;
                } else {
                    stats.contacts += 1;
                }
                if contact.dirty {
                    stats.dirty_contacts += 1;
                }
                if contact.is_local_only() {
                    stats.local_only_contacts += 1;
                }
                if contact.device_ref.is_some() {
                    stats.device_contacts += 1;
                }
            }
            for call in snapshot.calls_of(owner_id) {
                stats.calls += 1;
                if call.is_temporary() {
                    stats.temp_calls += 1;
                }
            }
            if let Some(checkpoints) = snapshot.checkpoints.get(owner_id) {
                stats.contacts_checkpoint = checkpoints.contacts;
                stats.calls_checkpoint = checkpoints.calls;
            }
            stats
        })
        .collect()
}

fn print_text_output(result: &InspectResult) {
    println!("crmsync Local Store Inspection");
    println!("==============================");
    println!();
    println!("Path: {}", result.path);
    println!("Snapshot size: {} bytes", result.file_size);

    if result.owners.is_empty() {
        println!();
        println!("No records.");
        return;
    }

    for owner in &result.owners {
        println!();
        println!("Owner {}", owner.owner_id);
        println!("  Contacts:       {}", owner.contacts);
        println!("    dirty:        {}", owner.dirty_contacts);
        println!("    deleted:      {}", owner.deleted_contacts);
        println!("    local only:   {}", owner.local_only_contacts);
        println!("    on device:    {}", owner.device_contacts);
        println!("  Calls:          {}", owner.calls);
        println!("    temporary:    {}", owner.temp_calls);
        println!("  Checkpoints:");
        println!("    contacts:     {}", format_checkpoint(owner.contacts_checkpoint));
        println!("    calls:        {}", format_checkpoint(owner.calls_checkpoint));
    }
}

fn format_checkpoint(at: Option<DateTime<Utc>>) -> String {
    at.map_or_else(|| "none (next sync runs full)".to_string(), |at| at.to_rfc3339())
}
