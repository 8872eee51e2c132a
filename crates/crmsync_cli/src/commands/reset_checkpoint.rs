//! Reset-checkpoint command implementation.

use crmsync_engine::LocalStore;
use crmsync_protocol::SyncDomain;
use std::path::Path;
use tracing::info;

/// Runs the reset-checkpoint command.
pub fn run(path: &Path, owner: &str, domain: Option<SyncDomain>) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_store(path)?;
    let cleared = reset(&store, owner, domain)?;

    if cleared.is_empty() {
        println!("No checkpoints set for {owner}.");
    } else {
        for domain in cleared {
            println!("Cleared {domain} checkpoint for {owner}; the next sync runs full.");
        }
    }
    Ok(())
}

/// Clears the owner's checkpoints and returns the domains that had one.
pub fn reset<S: LocalStore>(
    store: &S,
    owner: &str,
    domain: Option<SyncDomain>,
) -> Result<Vec<SyncDomain>, Box<dyn std::error::Error>> {
    let domains = match domain {
        Some(domain) => vec![domain],
        None => SyncDomain::ALL.to_vec(),
    };

    let mut cleared = Vec::new();
    for domain in domains {
        if let Some(at) = store.checkpoint(owner, domain)? {
            store.set_checkpoint(owner, domain, None)?;
            info!(owner, %domain, previous = %at, "checkpoint cleared");
            cleared.push(domain);
        }
    }
    Ok(cleared)
}
