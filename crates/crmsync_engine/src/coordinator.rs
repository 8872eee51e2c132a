//! Sync coordinator: drives the stages of a run.
//!
//! A run syncs the contacts domain, then the calls domain:
//!
//! ```text
//! contacts:  upload ─▶ download (merge, prune on full) ─▶ checkpoint ─▶ device export
//! calls:     device import ─▶ upload ─▶ reconcile ─▶ download (reconcile, prune on full) ─▶ checkpoint
//! ```
//!
//! At most one run per owner is active; a trigger arriving while one runs
//! is dropped, not queued. A failure in one domain leaves the other domain
//! running, except auth failures and timeouts, which abort the run.

use crate::audit::AuditRecorder;
use crate::config::SyncConfig;
use crate::context::{CancelHandle, RunContext, Session};
use crate::device::{DeviceBridge, NoDevice};
use crate::download::{DownloadStage, SyncMode};
use crate::error::{SyncError, SyncResult};
use crate::mirror::{self, DeviceReport};
use crate::reconcile::ReconciliationEngine;
use crate::report::{DomainReport, DomainStatus, SyncRunReport, SyncState, SyncStats};
use crate::store::LocalStore;
use crate::transport::SyncTransport;
use crate::upload::UploadStage;
use chrono::{DateTime, Utc};
use crmsync_protocol::{BatchErrorKind, SyncDomain};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Default)]
struct OwnerEntry {
    state: SyncState,
    stats: SyncStats,
    /// Present while a run holds the owner.
    active: Option<CancelHandle>,
}

/// Releases the owner when the run ends, however it ends.
struct FlightGuard<'a> {
    owners: &'a RwLock<HashMap<String, OwnerEntry>>,
    owner_id: String,
    cancel: CancelHandle,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.owners.write().get_mut(&self.owner_id) {
            entry.active = None;
            if entry.state.is_active() {
                entry.state = SyncState::Error;
            }
        }
    }
}

/// Orchestrates sync runs.
pub struct SyncCoordinator<T, S, D = NoDevice>
where
    T: SyncTransport,
    S: LocalStore,
    D: DeviceBridge,
{
    config: SyncConfig,
    transport: Arc<T>,
    store: Arc<S>,
    device: Arc<D>,
    reconciler: ReconciliationEngine,
    audit: AuditRecorder,
    owners: RwLock<HashMap<String, OwnerEntry>>,
}

impl<T, S> SyncCoordinator<T, S, NoDevice>
where
    T: SyncTransport,
    S: LocalStore,
{
    /// Creates a coordinator without a device.
    pub fn new(config: SyncConfig, transport: T, store: Arc<S>) -> Self {
        Self::with_device(config, transport, store, Arc::new(NoDevice))
    }
}

impl<T, S, D> SyncCoordinator<T, S, D>
where
    T: SyncTransport,
    S: LocalStore,
    D: DeviceBridge,
{
    /// Creates a coordinator mirroring to `device`.
    pub fn with_device(config: SyncConfig, transport: T, store: Arc<S>, device: Arc<D>) -> Self {
        Self {
            config,
            transport: Arc::new(transport),
            store,
            device,
            reconciler: ReconciliationEngine::new(),
            audit: AuditRecorder::new(),
            owners: RwLock::new(HashMap::new()),
        }
    }

    /// The configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The local store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Current state of an owner.
    pub fn state(&self, owner_id: &str) -> SyncState {
        self.owners
            .read()
            .get(owner_id)
            .map(|e| e.state)
            .unwrap_or_default()
    }

    /// Statistics of an owner.
    pub fn stats(&self, owner_id: &str) -> SyncStats {
        self.owners
            .read()
            .get(owner_id)
            .map(|e| e.stats.clone())
            .unwrap_or_default()
    }

    /// Returns true while a run holds the owner.
    pub fn is_running(&self, owner_id: &str) -> bool {
        self.owners
            .read()
            .get(owner_id)
            .is_some_and(|e| e.active.is_some())
    }

    /// Cancels the owner's active run. Returns false if none was active.
    pub fn cancel(&self, owner_id: &str) -> bool {
        match self.owners.read().get(owner_id).and_then(|e| e.active.as_ref()) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Runs a full sync. Returns true if every domain succeeded.
    pub fn perform_full_sync(&self, session: &Session) -> bool {
        self.run(session, SyncMode::Full)
            .map(|r| r.succeeded())
            .unwrap_or(false)
    }

    /// Runs a delta sync. Returns true if every domain succeeded.
    pub fn perform_delta_sync(&self, session: &Session) -> bool {
        self.run(session, SyncMode::Delta)
            .map(|r| r.succeeded())
            .unwrap_or(false)
    }

    /// Runs both domains and reports per domain.
    ///
    /// Fails only with [`SyncError::AlreadyRunning`]; every other failure is
    /// part of the report.
    pub fn run(&self, session: &Session, mode: SyncMode) -> SyncResult<SyncRunReport> {
        let guard = self.begin(&session.owner_id)?;
        let owner = session.owner_id.as_str();
        if let Some(entry) = self.owners.write().get_mut(owner) {
            entry.stats.runs_started += 1;
        }
        let started = Instant::now();
        let ctx = RunContext::new(
            session.clone(),
            self.config.run_budget,
            self.config.retry.clone(),
            guard.cancel.clone(),
        );
        let mut report = SyncRunReport::new(owner, mode);
        info!(owner, %mode, "sync run started");

        for domain in SyncDomain::ALL {
            let mut domain_report = DomainReport::new(domain, mode);

            if let Some(reason) = &report.aborted {
                domain_report.status = DomainStatus::Skipped {
                    reason: reason.clone(),
                };
            } else {
                let outcome = match domain {
                    SyncDomain::Contacts => self.sync_contacts(&ctx, mode, &mut domain_report),
                    SyncDomain::Calls => self.sync_calls(&ctx, mode, &mut domain_report),
                };
                if let Err(e) = outcome {
                    warn!(owner, %domain, error = %e, "domain failed");
                    if e.aborts_run() {
                        report.aborted = Some(e.to_string());
                    }
                    domain_report.status = DomainStatus::failed(&e);
                }
            }

            let synced = domain_report.synced();
            let (synced_contacts, synced_calls) = match domain {
                SyncDomain::Contacts => (synced, 0),
                SyncDomain::Calls => (0, synced),
            };
            domain_report.audit_id = self
                .audit
                .record(
                    &*self.transport,
                    session,
                    domain,
                    domain_report.status.error_message(),
                    synced_contacts,
                    synced_calls,
                )
                .map(|a| a.id);
            report.domains.push(domain_report);
        }

        report.duration = started.elapsed();
        let succeeded = report.succeeded();
        {
            let mut owners = self.owners.write();
            let entry = owners.entry(owner.to_string()).or_default();
            entry.stats.record(&report);
            entry.state = if succeeded {
                SyncState::Synced
            } else {
                SyncState::Error
            };
        }
        drop(guard);

        info!(
            owner,
            %mode,
            succeeded,
            duration_ms = report.duration.as_millis() as u64,
            "sync run finished"
        );
        Ok(report)
    }

    /// Creates local contacts for unknown address-book entries.
    ///
    /// Takes the owner's run slot, so it never interleaves with a run.
    pub fn import_device_contacts(&self, session: &Session) -> SyncResult<DeviceReport> {
        let _guard = self.begin(&session.owner_id)?;
        self.set_state(&session.owner_id, SyncState::Importing);
        let report = mirror::import_contacts(&*self.store, &*self.device, &session.owner_id);
        self.set_state(&session.owner_id, SyncState::Idle);
        let report = report?;
        info!(owner = %session.owner_id, imported = report.processed, "device contacts imported");
        Ok(report)
    }

    fn begin(&self, owner_id: &str) -> SyncResult<FlightGuard<'_>> {
        let mut owners = self.owners.write();
        let entry = owners.entry(owner_id.to_string()).or_default();
        if entry.active.is_some() {
            entry.stats.triggers_dropped += 1;
            warn!(owner = owner_id, "sync already running; trigger dropped");
            return Err(SyncError::AlreadyRunning {
                owner_id: owner_id.to_string(),
            });
        }
        let cancel = CancelHandle::new();
        entry.active = Some(cancel.clone());

        Ok(FlightGuard {
            owners: &self.owners,
            owner_id: owner_id.to_string(),
            cancel,
        })
    }

    fn set_state(&self, owner_id: &str, state: SyncState) {
        if let Some(entry) = self.owners.write().get_mut(owner_id) {
            entry.state = state;
        }
    }

    fn sync_contacts(
        &self,
        ctx: &RunContext,
        requested: SyncMode,
        report: &mut DomainReport,
    ) -> SyncResult<()> {
        let owner = ctx.owner_id();
        let checkpoint = self.store.checkpoint(owner, SyncDomain::Contacts)?;
        let mode = effective_mode(requested, checkpoint);
        report.mode = mode;

        self.set_state(owner, SyncState::Uploading);
        let upload = UploadStage::new(&*self.transport, &*self.store, &self.config).upload_contacts(ctx)?;
        report.uploaded = upload.accepted() + upload.deleted;
        report.conflicts = upload.rejected_of(BatchErrorKind::Conflict);
        report.rejected = upload.rejected_of(BatchErrorKind::Validation);
        let mut removed = upload.removed;

        self.set_state(owner, SyncState::Downloading);
        let download = DownloadStage::new(&*self.transport, &*self.store, &self.config)
            .download_contacts(ctx, mode, checkpoint)?;
        report.downloaded = download.received;
        report.removed = download.removed.len();
        removed.extend(download.removed);

        ctx.check()?;
        let next = download.checkpoint.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        self.store.set_checkpoint(owner, SyncDomain::Contacts, Some(next))?;
        report.checkpoint = Some(next);

        if self.device.is_available() {
            self.set_state(owner, SyncState::Exporting);
            report.device = mirror::export_contacts(&*self.store, &*self.device, owner, &removed)?;
        }
        Ok(())
    }

    fn sync_calls(
        &self,
        ctx: &RunContext,
        requested: SyncMode,
        report: &mut DomainReport,
    ) -> SyncResult<()> {
        let owner = ctx.owner_id();
        let checkpoint = self.store.checkpoint(owner, SyncDomain::Calls)?;
        let mode = effective_mode(requested, checkpoint);
        report.mode = mode;

        if self.device.is_available() {
            self.set_state(owner, SyncState::Importing);
            report.device = mirror::import_call_logs(&*self.store, &*self.device, owner)?;
        }

        self.set_state(owner, SyncState::Uploading);
        let upload = UploadStage::new(&*self.transport, &*self.store, &self.config).upload_calls(ctx)?;
        report.uploaded = upload.server_records.len();
        report.rejected = upload.rejected_batches;

        self.set_state(owner, SyncState::Reconciling);
        ctx.check()?;
        report.reconcile = self
            .reconciler
            .reconcile(&*self.store, owner, &upload.server_records)?;

        self.set_state(owner, SyncState::Downloading);
        let download = DownloadStage::new(&*self.transport, &*self.store, &self.config)
            .download_calls(ctx, mode, checkpoint, &self.reconciler)?;
        report.downloaded = download.received;
        report.removed = download.reconcile.pruned;
        report.reconcile.merge(download.reconcile);

        ctx.check()?;
        let next = download.checkpoint.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        self.store.set_checkpoint(owner, SyncDomain::Calls, Some(next))?;
        report.checkpoint = Some(next);
        Ok(())
    }
}

/// A delta without a checkpoint has nothing to be relative to.
fn effective_mode(requested: SyncMode, checkpoint: Option<DateTime<Utc>>) -> SyncMode {
    match (requested, checkpoint) {
        (SyncMode::Delta, None) => SyncMode::Full,
        (mode, _) => mode,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn delta_without_checkpoint_runs_full() {
        assert_eq!(effective_mode(SyncMode::Delta, None), SyncMode::Full);
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(effective_mode(SyncMode::Delta, Some(at)), SyncMode::Delta);
        assert_eq!(effective_mode(SyncMode::Full, Some(at)), SyncMode::Full);
    }
}
