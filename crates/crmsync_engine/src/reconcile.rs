//! Call-log reconciliation.
//!
//! Calls read off the device carry temporary ids derived from
//! `(timestamp, phone_number)`. Once the server has issued the canonical
//! record, the temp record is replaced by it. The replacement is a delete
//! of the temp row plus an insert of the canonical row, applied as one
//! change set, so no observer ever sees both or neither.

use crate::error::SyncResult;
use crate::store::{CallChanges, LocalStore};
use chrono::{DateTime, Utc};
use crmsync_protocol::CallLog;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, warn};

/// Several temp records matched the same canonical record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallCollision {
    /// Shared phone number.
    pub phone_number: String,
    /// Shared timestamp.
    pub timestamp: DateTime<Utc>,
    /// Temp records that were all replaced.
    pub temp_ids: Vec<String>,
    /// The canonical record that replaced them.
    pub server_id: String,
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Server records with no local counterpart.
    pub inserted: usize,
    /// Temp records replaced by their canonical counterpart.
    pub replaced: usize,
    /// Canonical records whose fields changed.
    pub refreshed: usize,
    /// Canonical records already identical locally.
    pub unchanged: usize,
    /// Canonical records removed because the server no longer has them.
    pub pruned: usize,
    /// Ambiguous temp matches.
    pub collisions: Vec<CallCollision>,
}

impl ReconcileReport {
    /// Folds another report into this one.
    pub fn merge(&mut self, other: ReconcileReport) {
        self.inserted += other.inserted;
        self.replaced += other.replaced;
        self.refreshed += other.refreshed;
        self.unchanged += other.unchanged;
        self.pruned += other.pruned;
        self.collisions.extend(other.collisions);
    }

    /// Number of local rows written or removed.
    pub fn changed(&self) -> usize {
        self.inserted + self.replaced + self.refreshed + self.pruned
    }
}

/// Merges server call records into the local store.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReconciliationEngine;

impl ReconciliationEngine {
    /// Creates a new engine.
    pub fn new() -> Self {
        Self
    }

    /// Plans the merge of `server` records into `local`.
    ///
    /// Only temp-id locals are replacement candidates; a canonical local with
    /// a different id is never touched. When several temp records share the
    /// key of one server record, all of them are replaced and the collision is
    /// reported.
    pub fn plan(&self, local: &[CallLog], server: &[CallLog]) -> (CallChanges, ReconcileReport) {
        let by_id: HashMap<&str, &CallLog> = local.iter().map(|c| (c.id.as_str(), c)).collect();
        let mut temps_by_key: HashMap<(&str, DateTime<Utc>), Vec<&CallLog>> = HashMap::new();
        for call in local.iter().filter(|c| c.is_temporary()) {
            temps_by_key
                .entry((call.phone_number.as_str(), call.timestamp))
                .or_default()
                .push(call);
        }

        // Last copy of an id wins.
        let mut incoming: BTreeMap<&str, &CallLog> = BTreeMap::new();
        for call in server {
            if call.is_temporary() {
                warn!(id = %call.id, "ignoring server record with a temporary id");
                continue;
            }
            incoming.insert(call.id.as_str(), call);
        }

        let mut changes = CallChanges::new();
        let mut report = ReconcileReport::default();
        let mut consumed: HashSet<&str> = HashSet::new();

        for (id, call) in incoming {
            let candidates: Vec<&CallLog> = temps_by_key
                .get(&(call.phone_number.as_str(), call.timestamp))
                .map(|v| v.iter().copied().filter(|t| !consumed.contains(t.id.as_str())).collect())
                .unwrap_or_default();

            if candidates.len() > 1 {
                warn!(
                    phone = %call.phone_number,
                    timestamp = %call.timestamp,
                    count = candidates.len(),
                    "several temp calls match one server record"
                );
                report.collisions.push(CallCollision {
                    phone_number: call.phone_number.clone(),
                    timestamp: call.timestamp,
                    temp_ids: candidates.iter().map(|t| t.id.clone()).collect(),
                    server_id: call.id.clone(),
                });
            }
            for temp in &candidates {
                consumed.insert(temp.id.as_str());
                changes.removes.push(temp.id.clone());
            }

            match by_id.get(id) {
                Some(existing) if *existing == call => {
                    if candidates.is_empty() {
                        report.unchanged += 1;
                    } else {
                        report.replaced += 1;
                    }
                }
                Some(_) => {
                    changes.upserts.push(call.clone());
                    if candidates.is_empty() {
                        report.refreshed += 1;
                    } else {
                        report.replaced += 1;
                    }
                }
                None => {
                    changes.upserts.push(call.clone());
                    if candidates.is_empty() {
                        report.inserted += 1;
                    } else {
                        report.replaced += 1;
                    }
                }
            }
        }

        changes.removes.sort();
        (changes, report)
    }

    /// Plans the removal of canonical records the server no longer has.
    ///
    /// Temp records are never pruned; they have not been uploaded yet.
    pub fn plan_prune(&self, local: &[CallLog], observed: &HashSet<String>) -> CallChanges {
        let mut changes = CallChanges::new();
        changes.removes = local
            .iter()
            .filter(|c| !c.is_temporary() && !observed.contains(&c.id))
            .map(|c| c.id.clone())
            .collect();
        changes
    }

    /// Merges `server` records into the owner's local calls.
    pub fn reconcile<S: LocalStore + ?Sized>(
        &self,
        store: &S,
        owner_id: &str,
        server: &[CallLog],
    ) -> SyncResult<ReconcileReport> {
        if server.is_empty() {
            return Ok(ReconcileReport::default());
        }
        let local = store.calls(owner_id)?;
        let (changes, report) = self.plan(&local, server);
        if !changes.is_empty() {
            store.apply_call_changes(&changes)?;
        }
        debug!(
            owner = owner_id,
            inserted = report.inserted,
            replaced = report.replaced,
            refreshed = report.refreshed,
            "calls reconciled"
        );
        Ok(report)
    }

    /// Removes the owner's canonical calls absent from `observed`.
    pub fn prune<S: LocalStore + ?Sized>(
        &self,
        store: &S,
        owner_id: &str,
        observed: &HashSet<String>,
    ) -> SyncResult<usize> {
        let local = store.calls(owner_id)?;
        let changes = self.plan_prune(&local, observed);
        let pruned = changes.removes.len();
        if pruned > 0 {
            store.apply_call_changes(&changes)?;
            debug!(owner = owner_id, pruned, "calls pruned");
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryLocalStore;
    use chrono::TimeZone;
    use crmsync_protocol::{temp_call_id, CallDirection};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn temp(phone: &str, secs: i64) -> CallLog {
        CallLog {
            id: temp_call_id(&ts(secs), phone),
            owner_id: "u1".into(),
            contact_id: None,
            direction: CallDirection::Incoming,
            duration_seconds: 10,
            timestamp: ts(secs),
            phone_number: phone.into(),
            created_at: ts(secs),
        }
    }

    fn canonical(id: &str, phone: &str, secs: i64) -> CallLog {
        CallLog {
            id: id.into(),
            created_at: ts(secs + 1),
            ..temp(phone, secs)
        }
    }

    #[test]
    fn temp_is_replaced_by_canonical() {
        let store = MemoryLocalStore::new();
        let local = temp("5550100", 1_700_000_000);
        store
            .apply_call_changes(&CallChanges {
                removes: vec![],
                upserts: vec![local],
            })
            .unwrap();

        let report = ReconciliationEngine::new()
            .reconcile(&store, "u1", &[canonical("srv-1", "5550100", 1_700_000_000)])
            .unwrap();

        let calls = store.calls("u1").unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "srv-1");
        assert_eq!(report.replaced, 1);
        assert!(report.collisions.is_empty());
    }

    #[test]
    fn unknown_server_record_is_inserted() {
        let engine = ReconciliationEngine::new();
        let (changes, report) = engine.plan(&[], &[canonical("srv-1", "5550100", 10)]);
        assert_eq!(changes.upserts.len(), 1);
        assert!(changes.removes.is_empty());
        assert_eq!(report.inserted, 1);
    }

    #[test]
    fn identical_record_is_left_alone() {
        let engine = ReconciliationEngine::new();
        let record = canonical("srv-1", "5550100", 10);
        let (changes, report) = engine.plan(&[record.clone()], &[record]);
        assert!(changes.is_empty());
        assert_eq!(report.unchanged, 1);
    }

    #[test]
    fn changed_fields_are_refreshed() {
        let engine = ReconciliationEngine::new();
        let local = canonical("srv-1", "5550100", 10);
        let mut remote = local.clone();
        remote.contact_id = Some("c1".into());

        let (changes, report) = engine.plan(&[local], &[remote.clone()]);
        assert_eq!(changes.upserts, vec![remote]);
        assert_eq!(report.refreshed, 1);
    }

    #[test]
    fn canonical_locals_are_not_candidates() {
        let engine = ReconciliationEngine::new();
        let other = canonical("srv-9", "5550100", 10);
        let (changes, report) = engine.plan(&[other], &[canonical("srv-1", "5550100", 10)]);
        assert!(changes.removes.is_empty());
        assert_eq!(report.inserted, 1);
    }

    #[test]
    fn collision_replaces_every_candidate() {
        let engine = ReconciliationEngine::new();
        let a = temp("5550100", 10);
        let mut b = a.clone();
        b.id = "tmp-legacy".into();

        let (changes, report) = engine.plan(&[a.clone(), b.clone()], &[canonical("srv-1", "5550100", 10)]);
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(changes.removes, expected);
        assert_eq!(report.collisions.len(), 1);
        assert_eq!(report.collisions[0].server_id, "srv-1");
        assert_eq!(report.replaced, 1);
    }

    #[test]
    fn server_temp_ids_are_ignored() {
        let engine = ReconciliationEngine::new();
        let (changes, report) = engine.plan(&[], &[temp("5550100", 10)]);
        assert!(changes.is_empty());
        assert_eq!(report, ReconcileReport::default());
    }

    #[test]
    fn prune_keeps_temp_records() {
        let engine = ReconciliationEngine::new();
        let pending = temp("5550100", 10);
        let gone = canonical("srv-1", "5550200", 20);
        let kept = canonical("srv-2", "5550300", 30);
        let observed: HashSet<String> = ["srv-2".to_string()].into_iter().collect();

        let changes = engine.plan_prune(&[pending, gone, kept], &observed);
        assert_eq!(changes.removes, vec!["srv-1".to_string()]);
    }
}
