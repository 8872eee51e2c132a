//! File-backed local store.
//!
//! Layout of a store directory:
//!
//! ```text
//! <store_path>/
//! ├─ LOCK              # Advisory lock for single-writer
//! ├─ store.json        # Current snapshot
//! └─ store.json.tmp    # Scratch file of an in-progress commit
//! ```
//!
//! Every change set is committed by writing a complete new snapshot to the
//! scratch file, syncing it, and renaming it over `store.json`. A crash
//! leaves either the old or the new snapshot in place, never a mix.

use crate::error::{SyncError, SyncResult};
use crate::store::{CallChanges, ContactChanges, ContactUpdate, LocalContact, LocalStore, Snapshot};
use chrono::{DateTime, Utc};
use crmsync_protocol::{CallLog, SyncDomain};
use fs2::FileExt;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

const LOCK_FILE: &str = "LOCK";
const STORE_FILE: &str = "store.json";
const STORE_TEMP: &str = "store.json.tmp";

/// A local store persisted as a JSON snapshot in a directory.
///
/// The directory is locked for the lifetime of the value; a second open of
/// the same directory fails.
#[derive(Debug)]
pub struct FileLocalStore {
    path: PathBuf,
    snapshot: RwLock<Snapshot>,
    _lock_file: File,
}

impl FileLocalStore {
    /// Opens or creates a store directory.
    pub fn open(path: &Path) -> SyncResult<Self> {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(SyncError::Store(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(SyncError::Store(format!(
                "store is locked by another process: {}",
                path.display()
            )));
        }

        let store_path = path.join(STORE_FILE);
        let snapshot = if store_path.exists() {
            let data = fs::read(&store_path)?;
            serde_json::from_slice(&data)?
        } else {
            Snapshot::default()
        };
        debug!(path = %path.display(), contacts = snapshot.contacts.len(), calls = snapshot.calls.len(), "local store opened");

        Ok(Self {
            path: path.to_path_buf(),
            snapshot: RwLock::new(snapshot),
            _lock_file: lock_file,
        })
    }

    /// Returns true if `path` holds a committed snapshot.
    pub fn exists(path: &Path) -> bool {
        path.join(STORE_FILE).is_file()
    }

    /// Returns the store directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the snapshot file.
    pub fn store_file(&self) -> PathBuf {
        self.path.join(STORE_FILE)
    }

    /// Copies the current content.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.read().clone()
    }

    /// Applies `mutate` to a copy of the snapshot, persists the copy, and
    /// only then publishes it.
    fn commit<R>(&self, mutate: impl FnOnce(&mut Snapshot) -> R) -> SyncResult<R> {
        let mut guard = self.snapshot.write();
        let mut next = guard.clone();
        let outcome = mutate(&mut next);
        if next == *guard {
            return Ok(outcome);
        }
        self.persist(&next)?;
        *guard = next;
        Ok(outcome)
    }

    fn persist(&self, snapshot: &Snapshot) -> SyncResult<()> {
        let data = serde_json::to_vec_pretty(snapshot)?;
        let temp_path = self.path.join(STORE_TEMP);

        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.store_file())?;
        self.sync_directory()
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> SyncResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> SyncResult<()> {
        Ok(())
    }
}

impl LocalStore for FileLocalStore {
    fn contacts(&self, owner_id: &str) -> SyncResult<Vec<LocalContact>> {
        Ok(self.snapshot.read().contacts_of(owner_id))
    }

    fn contact(&self, id: &str) -> SyncResult<Option<LocalContact>> {
        Ok(self.snapshot.read().contacts.get(id).cloned())
    }

    fn apply_contact_changes(&self, changes: &ContactChanges) -> SyncResult<()> {
        self.commit(|s| s.apply_contacts(changes))
    }

    fn apply_contact_updates(&self, updates: &[ContactUpdate]) -> SyncResult<Vec<String>> {
        self.commit(|s| s.apply_contact_updates(updates))
    }

    fn calls(&self, owner_id: &str) -> SyncResult<Vec<CallLog>> {
        Ok(self.snapshot.read().calls_of(owner_id))
    }

    fn apply_call_changes(&self, changes: &CallChanges) -> SyncResult<()> {
        self.commit(|s| s.apply_calls(changes))
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
        self.commit(|s| s.set_checkpoint(owner_id, domain, at))
    }

    fn device_watermark(&self, owner_id: &str) -> SyncResult<Option<i64>> {
        Ok(self.snapshot.read().device_watermarks.get(owner_id).copied())
    }

    fn advance_device_watermark(&self, owner_id: &str, millis: i64) -> SyncResult<()> {
        self.commit(|s| s.advance_device_watermark(owner_id, millis))
    }

    fn device_refs(&self) -> SyncResult<HashSet<String>> {
        Ok(self.snapshot.read().device_refs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("store");
        let store = FileLocalStore::open(&path).unwrap();
        assert!(path.join(LOCK_FILE).exists());
        assert!(store.contacts("u1").unwrap().is_empty());
        assert!(!FileLocalStore::exists(&path));

        store.create_contact("u1", "Ada", "5550100").unwrap();
        assert!(FileLocalStore::exists(&path));
    }

    #[test]
    fn second_open_is_locked() {
        let temp = tempdir().unwrap();
        let _first = FileLocalStore::open(temp.path()).unwrap();
        assert!(matches!(
            FileLocalStore::open(temp.path()),
            Err(SyncError::Store(_))
        ));
    }

    #[test]
    fn content_survives_reopen() {
        let temp = tempdir().unwrap();
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let id = {
            let store = FileLocalStore::open(temp.path()).unwrap();
            let contact = store.create_contact("u1", "Ada", "5550100").unwrap();
            store.set_checkpoint("u1", SyncDomain::Calls, Some(at)).unwrap();
            contact.contact.id
        };

        let store = FileLocalStore::open(temp.path()).unwrap();
        assert_eq!(store.contact(&id).unwrap().unwrap().contact.name, "Ada");
        assert_eq!(store.checkpoint("u1", SyncDomain::Calls).unwrap(), Some(at));
        assert!(!temp.path().join(STORE_TEMP).exists());
    }

    #[test]
    fn noop_commit_leaves_file_untouched() {
        let temp = tempdir().unwrap();
        let store = FileLocalStore::open(temp.path()).unwrap();
        store.create_contact("u1", "Ada", "5550100").unwrap();
        let before = fs::read(store.store_file()).unwrap();

        store.apply_contact_changes(&ContactChanges::new()).unwrap();
        store.set_checkpoint("u1", SyncDomain::Contacts, None).unwrap();

        assert_eq!(fs::read(store.store_file()).unwrap(), before);
    }

    #[test]
    fn corrupt_snapshot_is_rejected() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join(STORE_FILE), b"{ not json").unwrap();
        assert!(matches!(
            FileLocalStore::open(temp.path()),
            Err(SyncError::Store(_))
        ));
    }
}
