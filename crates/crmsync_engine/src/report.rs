//! Run reports, per-owner state and statistics.

use crate::download::SyncMode;
use crate::error::{ErrorKind, SyncError};
use crate::mirror::DeviceReport;
use crate::reconcile::ReconcileReport;
use chrono::{DateTime, Utc};
use crmsync_protocol::SyncDomain;
use std::time::Duration;

/// What the coordinator is doing for an owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncState {
    /// No run has happened yet.
    #[default]
    Idle,
    /// Reading the device.
    Importing,
    /// Pushing dirty records.
    Uploading,
    /// Sweeping server pages.
    Downloading,
    /// Replacing temp records.
    Reconciling,
    /// Writing contacts to the device.
    Exporting,
    /// The last run succeeded.
    Synced,
    /// The last run failed in at least one domain.
    Error,
}

impl SyncState {
    /// Returns true while a run is in progress.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Importing
                | SyncState::Uploading
                | SyncState::Downloading
                | SyncState::Reconciling
                | SyncState::Exporting
        )
    }
}

/// Cumulative statistics of one owner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Runs started.
    pub runs_started: u64,
    /// Runs where every domain succeeded.
    pub runs_succeeded: u64,
    /// Runs where some domain failed.
    pub runs_failed: u64,
    /// Triggers dropped because a run was active.
    pub triggers_dropped: u64,
    /// Records accepted by the server.
    pub records_uploaded: u64,
    /// Records received from the server.
    pub records_downloaded: u64,
    /// Contacts refused with a conflict.
    pub conflicts: u64,
    /// End of the last successful run.
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Message of the last failure.
    pub last_error: Option<String>,
}

impl SyncStats {
    pub(crate) fn record(&mut self, report: &SyncRunReport) {
        self.records_uploaded += report.domains.iter().map(|d| d.uploaded as u64).sum::<u64>();
        self.records_downloaded += report.domains.iter().map(|d| d.downloaded as u64).sum::<u64>();
        self.conflicts += report.domains.iter().map(|d| d.conflicts as u64).sum::<u64>();
        match report.first_error() {
            None => {
                self.runs_succeeded += 1;
                self.last_sync_time = Some(Utc::now());
                self.last_error = None;
            }
            Some(message) => {
                self.runs_failed += 1;
                self.last_error = Some(message.to_string());
            }
        }
    }
}

/// How one domain ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainStatus {
    /// Every stage completed.
    Succeeded,
    /// A stage failed; later stages of the domain did not run.
    Failed {
        /// Error class.
        kind: ErrorKind,
        /// Error message.
        message: String,
    },
    /// The run was aborted before the domain started.
    Skipped {
        /// Why the run was aborted.
        reason: String,
    },
}

impl DomainStatus {
    pub(crate) fn failed(error: &SyncError) -> Self {
        DomainStatus::Failed {
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    /// Error message for the audit entry, if any.
    pub fn error_message(&self) -> Option<String> {
        match self {
            DomainStatus::Succeeded => None,
            DomainStatus::Failed { message, .. } => Some(message.clone()),
            DomainStatus::Skipped { reason } => Some(format!("skipped: {reason}")),
        }
    }
}

/// Outcome of one domain in a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainReport {
    /// The domain.
    pub domain: SyncDomain,
    /// Effective mode (a delta without checkpoint runs full).
    pub mode: SyncMode,
    /// How the domain ended.
    pub status: DomainStatus,
    /// Records accepted by the server, deletions included.
    pub uploaded: usize,
    /// Records received from the server.
    pub downloaded: usize,
    /// Local records removed by pruning or server deletion.
    pub removed: usize,
    /// Contacts refused with a conflict.
    pub conflicts: usize,
    /// Records or batches refused as invalid.
    pub rejected: usize,
    /// Call reconciliation.
    pub reconcile: ReconcileReport,
    /// Device pass.
    pub device: DeviceReport,
    /// Checkpoint after the domain.
    pub checkpoint: Option<DateTime<Utc>>,
    /// Id of the recorded audit entry.
    pub audit_id: Option<String>,
}

impl DomainReport {
    pub(crate) fn new(domain: SyncDomain, mode: SyncMode) -> Self {
        Self {
            domain,
            mode,
            status: DomainStatus::Succeeded,
            uploaded: 0,
            downloaded: 0,
            removed: 0,
            conflicts: 0,
            rejected: 0,
            reconcile: ReconcileReport::default(),
            device: DeviceReport::default(),
            checkpoint: None,
            audit_id: None,
        }
    }

    /// Returns true if the domain completed.
    pub fn succeeded(&self) -> bool {
        self.status == DomainStatus::Succeeded
    }

    /// Count reported as synced in the audit entry.
    pub fn synced(&self) -> u64 {
        let changed = match self.domain {
            SyncDomain::Contacts => self.downloaded,
            SyncDomain::Calls => self.reconcile.changed(),
        };
        (self.uploaded + changed) as u64
    }
}

/// Outcome of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRunReport {
    /// Owner of the run.
    pub owner_id: String,
    /// Requested mode.
    pub requested: SyncMode,
    /// Per-domain outcomes, in run order.
    pub domains: Vec<DomainReport>,
    /// Set when an auth failure or timeout aborted the run.
    pub aborted: Option<String>,
    /// Wall-clock duration.
    pub duration: Duration,
}

impl SyncRunReport {
    pub(crate) fn new(owner_id: impl Into<String>, requested: SyncMode) -> Self {
        Self {
            owner_id: owner_id.into(),
            requested,
            domains: Vec::new(),
            aborted: None,
            duration: Duration::ZERO,
        }
    }

    /// Returns true if every domain succeeded.
    pub fn succeeded(&self) -> bool {
        self.aborted.is_none() && self.domains.iter().all(DomainReport::succeeded)
    }

    /// The report of one domain.
    pub fn domain(&self, domain: SyncDomain) -> Option<&DomainReport> {
        self.domains.iter().find(|d| d.domain == domain)
    }

    /// Message of the first failure.
    pub fn first_error(&self) -> Option<String> {
        self.domains
            .iter()
            .find_map(|d| d.status.error_message())
            .or_else(|| self.aborted.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_states() {
        assert!(SyncState::Uploading.is_active());
        assert!(SyncState::Exporting.is_active());
        assert!(!SyncState::Idle.is_active());
        assert!(!SyncState::Synced.is_active());
        assert!(!SyncState::Error.is_active());
    }

    #[test]
    fn run_report_success() {
        let mut report = SyncRunReport::new("u1", SyncMode::Delta);
        report.domains.push(DomainReport::new(SyncDomain::Contacts, SyncMode::Delta));
        assert!(report.succeeded());
        assert!(report.first_error().is_none());

        let mut calls = DomainReport::new(SyncDomain::Calls, SyncMode::Full);
        calls.status = DomainStatus::failed(&SyncError::network_retryable("reset"));
        report.domains.push(calls);
        assert!(!report.succeeded());
        assert!(report.first_error().unwrap().contains("reset"));
        assert_eq!(
            report.domain(SyncDomain::Calls).unwrap().mode,
            SyncMode::Full
        );
    }

    #[test]
    fn skipped_domain_message() {
        let status = DomainStatus::Skipped {
            reason: "authentication failed: 401".into(),
        };
        assert!(status.error_message().unwrap().starts_with("skipped:"));
    }

    #[test]
    fn stats_accumulate() {
        let mut stats = SyncStats::default();
        let mut report = SyncRunReport::new("u1", SyncMode::Full);
        let mut contacts = DomainReport::new(SyncDomain::Contacts, SyncMode::Full);
        contacts.uploaded = 3;
        contacts.downloaded = 5;
        contacts.conflicts = 1;
        report.domains.push(contacts);

        stats.record(&report);
        assert_eq!(stats.runs_succeeded, 1);
        assert_eq!(stats.records_uploaded, 3);
        assert_eq!(stats.records_downloaded, 5);
        assert_eq!(stats.conflicts, 1);
        assert!(stats.last_sync_time.is_some());

        report.aborted = Some("timeout".into());
        stats.record(&report);
        assert_eq!(stats.runs_failed, 1);
        assert_eq!(stats.last_error.as_deref(), Some("timeout"));
    }
}
