//! Pending command implementation.

use crmsync_engine::{LocalContact, LocalStore};
use crmsync_protocol::CallLog;
use serde::Serialize;
use std::path::Path;

/// What the next upload would send.
#[derive(Debug, Serialize)]
pub struct PendingResult {
    /// Owner id.
    pub owner_id: String,
    /// Contacts to delete on the server.
    pub deletions: Vec<PendingContact>,
    /// Contacts to create or update.
    pub upserts: Vec<PendingContact>,
    /// Calls still carrying a temporary id.
    pub calls: Vec<CallLog>,
}

/// A dirty contact.
#[derive(Debug, Serialize)]
pub struct PendingContact {
    /// Local id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Normalized phone.
    pub phone: String,
    /// True if the server has never confirmed the contact.
    pub local_only: bool,
}

impl From<&LocalContact> for PendingContact {
    fn from(local: &LocalContact) -> Self {
        Self {
            id: local.contact.id.clone(),
            name: local.contact.name.clone(),
            phone: local.contact.phone_normalized.clone(),
            local_only: local.is_local_only(),
        }
    }
}

/// Runs the pending command.
pub fn run(path: &Path, owner: &str, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_store(path)?;
    let result = collect(&store, owner)?;

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

/// Gathers the owner's pending records.
pub fn collect<S: LocalStore>(store: &S, owner: &str) -> Result<PendingResult, Box<dyn std::error::Error>> {
    let dirty = store.dirty_contacts(owner)?;
    let (deleted, live): (Vec<_>, Vec<_>) = dirty.iter().partition(|c| c.contact.is_deleted());

    Ok(PendingResult {
        owner_id: owner.to_string(),
        // Never-uploaded deletions are dropped locally without a request.
        deletions: deleted
            .into_iter()
            .filter(|c| !c.is_local_only())
            .map(PendingContact::from)
            .collect(),
        upserts: live.into_iter().map(PendingContact::from).collect(),
        calls: store
            .calls(owner)?
            .into_iter()
            .filter(|c| c.is_temporary())
            .collect(),
    })
}

fn print_text_output(result: &PendingResult) {
    println!("Pending uploads for {}", result.owner_id);
    println!();

    if result.deletions.is_empty() && result.upserts.is_empty() && result.calls.is_empty() {
        println!("Nothing pending.");
        return;
    }

    if !result.deletions.is_empty() {
        println!("Deletions ({}):", result.deletions.len());
        for contact in &result.deletions {
            println!("  {}  {}  {}", contact.id, contact.phone, contact.name);
        }
    }
    if !result.upserts.is_empty() {
        println!("Contacts ({}):", result.upserts.len());
        for contact in &result.upserts {
            let marker = if contact.local_only { "new" } else { "edit" };
            println!("  [{marker}] {}  {}  {}", contact.id, contact.phone, contact.name);
        }
    }
    if !result.calls.is_empty() {
        println!("Calls ({}):", result.calls.len());
        for call in &result.calls {
            println!(
                "  {}  {}  {:?}  {}s",
                call.timestamp.to_rfc3339(),
                call.phone_number,
                call.direction,
                call.duration_seconds
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crmsync_engine::{Changes, MemoryLocalStore};

    #[test]
    fn pending_splits_deletions_and_upserts() {
        let store = MemoryLocalStore::new();
        store.create_contact("u1", "Ada", "5550100").unwrap();

        let mut synced = LocalContact::new_local("u1", "Bob", "5550200").unwrap();
        synced.contact.id = "c-bob".into();
        synced.dirty = false;
        store
            .apply_contact_changes(&Changes {
                removes: vec![],
                upserts: vec![synced],
            })
            .unwrap();
        store.delete_contact("c-bob").unwrap();

        let draft = store.create_contact("u1", "Draft", "5550300").unwrap();
        store.delete_contact(&draft.contact.id).unwrap();

        let pending = collect(&store, "u1").unwrap();
        assert_eq!(pending.upserts.len(), 1);
        assert!(pending.upserts[0].local_only);
        assert_eq!(pending.deletions.len(), 1);
        assert_eq!(pending.deletions[0].id, "c-bob");
        assert!(pending.calls.is_empty());
    }
}
