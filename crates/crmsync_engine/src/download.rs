//! Download stage: paged sweeps of server records.
//!
//! A sweep requests pages `1, 2, ...` until a short page or a page without
//! a successor. Each page is merged as it arrives. Pruning and the new
//! checkpoint depend on having seen the whole sweep, so both happen only
//! after the last page; a failure mid-sweep leaves them untouched.

use crate::config::SyncConfig;
use crate::context::RunContext;
use crate::error::{SyncError, SyncResult};
use crate::reconcile::{ReconcileReport, ReconciliationEngine};
use crate::store::{ContactUpdate, LocalContact, LocalStore};
use crate::transport::SyncTransport;
use chrono::{DateTime, Utc};
use crmsync_protocol::{is_local_contact_id, CallLog, Contact, Page, PageQuery};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, info};

/// How much of the server state a sweep covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Every record; absent records are pruned locally.
    Full,
    /// Records changed since the checkpoint; nothing is pruned.
    Delta,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Full => f.write_str("full"),
            SyncMode::Delta => f.write_str("delta"),
        }
    }
}

/// Outcome of a completed sweep.
#[derive(Debug)]
struct Sweep {
    pages: u32,
    records: usize,
    observed: HashSet<String>,
    high_water: Option<DateTime<Utc>>,
}

/// Outcome of a contact download.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactDownloadReport {
    /// Pages fetched.
    pub pages: u32,
    /// Records received.
    pub received: usize,
    /// Local rows written.
    pub merged: usize,
    /// Dirty local rows that beat the server copy.
    pub kept_local: usize,
    /// Local rows removed: pruned by a full sweep, or deleted on the server.
    pub removed: Vec<LocalContact>,
    /// Checkpoint to record once the domain succeeds.
    pub checkpoint: Option<DateTime<Utc>>,
}

/// Outcome of a call download.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallDownloadReport {
    /// Pages fetched.
    pub pages: u32,
    /// Records received.
    pub received: usize,
    /// Reconciliation of the received records.
    pub reconcile: ReconcileReport,
    /// Checkpoint to record once the domain succeeds.
    pub checkpoint: Option<DateTime<Utc>>,
}

/// Pulls server records into the local store.
pub struct DownloadStage<'a, T: ?Sized, S: ?Sized> {
    transport: &'a T,
    store: &'a S,
    config: &'a SyncConfig,
}

impl<'a, T, S> DownloadStage<'a, T, S>
where
    T: SyncTransport + ?Sized,
    S: LocalStore + ?Sized,
{
    /// Creates a new download stage.
    pub fn new(transport: &'a T, store: &'a S, config: &'a SyncConfig) -> Self {
        Self {
            transport,
            store,
            config,
        }
    }

    /// Sweeps contacts and merges them.
    ///
    /// A dirty local record survives only if it was edited after the server
    /// copy; otherwise the server copy overwrites it.
    pub fn download_contacts(
        &self,
        ctx: &RunContext,
        mode: SyncMode,
        checkpoint: Option<DateTime<Utc>>,
    ) -> SyncResult<ContactDownloadReport> {
        let owner = ctx.owner_id();
        let mut report = ContactDownloadReport::default();

        let sweep = self.sweep(
            ctx,
            mode,
            checkpoint,
            |query| self.transport.list_contacts(ctx.session(), query),
            |c: &Contact| (c.id.clone(), c.updated_at),
            |page| self.merge_contacts(ctx, page, &mut report),
        )?;

        if mode == SyncMode::Full {
            let removed = self.prune_contacts(ctx, &sweep.observed)?;
            report.removed.extend(removed);
        }

        report.pages = sweep.pages;
        report.received = sweep.records;
        report.checkpoint = sweep.high_water.or(checkpoint);
        info!(
            owner,
            %mode,
            pages = report.pages,
            received = report.received,
            merged = report.merged,
            kept_local = report.kept_local,
            removed = report.removed.len(),
            "contacts downloaded"
        );
        Ok(report)
    }

    fn merge_contacts(
        &self,
        ctx: &RunContext,
        page: Vec<Contact>,
        report: &mut ContactDownloadReport,
    ) -> SyncResult<()> {
        let mut updates = Vec::new();
        let mut removed = Vec::new();

        for remote in page {
            if remote.owner_id != ctx.owner_id() {
                debug!(id = %remote.id, "skipping contact of another owner");
                continue;
            }
            let local = self.store.contact(&remote.id)?;

            if remote.is_deleted() {
                if let Some(local) = local.filter(|l| !l.dirty) {
                    updates.push(ContactUpdate::remove(&local));
                    removed.push(local);
                }
                continue;
            }

            match local {
                None => {
                    updates.push(ContactUpdate::insert(LocalContact::from_remote(remote)));
                }
                Some(local) if local.dirty && local.contact.updated_at > remote.updated_at => {
                    report.kept_local += 1;
                }
                Some(local) if !local.dirty && local.contact == remote => {}
                Some(local) => {
                    let merged = local.overwritten_by(remote);
                    updates.push(ContactUpdate::replace(&local, merged));
                }
            }
        }

        if !updates.is_empty() {
            ctx.check()?;
            let skipped = self.store.apply_contact_updates(&updates)?;
            report.merged += updates
                .iter()
                .filter(|u| u.replacement.is_some() && !skipped.contains(&u.id))
                .count();
            report.kept_local += skipped.len();
            removed.retain(|c| !skipped.contains(&c.contact.id));
            report.removed.extend(removed);
        }
        Ok(())
    }

    fn prune_contacts(
        &self,
        ctx: &RunContext,
        observed: &HashSet<String>,
    ) -> SyncResult<Vec<LocalContact>> {
        let mut stale: Vec<LocalContact> = self
            .store
            .contacts(ctx.owner_id())?
            .into_iter()
            .filter(|c| {
                !c.dirty && !is_local_contact_id(&c.contact.id) && !observed.contains(&c.contact.id)
            })
            .collect();

        if !stale.is_empty() {
            ctx.check()?;
            let updates: Vec<ContactUpdate> = stale.iter().map(ContactUpdate::remove).collect();
            let skipped = self.store.apply_contact_updates(&updates)?;
            stale.retain(|c| !skipped.contains(&c.contact.id));
            debug!(owner = ctx.owner_id(), pruned = stale.len(), "contacts pruned");
        }
        Ok(stale)
    }

    /// Sweeps calls and reconciles them page by page.
    pub fn download_calls(
        &self,
        ctx: &RunContext,
        mode: SyncMode,
        checkpoint: Option<DateTime<Utc>>,
        reconciler: &ReconciliationEngine,
    ) -> SyncResult<CallDownloadReport> {
        let owner = ctx.owner_id();
        let mut report = CallDownloadReport::default();

        let sweep = self.sweep(
            ctx,
            mode,
            checkpoint,
            |query| self.transport.list_calls(ctx.session(), query),
            |c: &CallLog| (c.id.clone(), c.created_at),
            |page| {
                let page: Vec<CallLog> = page.into_iter().filter(|c| c.owner_id == owner).collect();
                ctx.check()?;
                let merged = reconciler.reconcile(self.store, owner, &page)?;
                report.reconcile.merge(merged);
                Ok(())
            },
        )?;

        if mode == SyncMode::Full {
            ctx.check()?;
            report.reconcile.pruned += reconciler.prune(self.store, owner, &sweep.observed)?;
        }

        report.pages = sweep.pages;
        report.received = sweep.records;
        report.checkpoint = sweep.high_water.or(checkpoint);
        info!(
            owner,
            %mode,
            pages = report.pages,
            received = report.received,
            changed = report.reconcile.changed(),
            "calls downloaded"
        );
        Ok(report)
    }

    fn sweep<R>(
        &self,
        ctx: &RunContext,
        mode: SyncMode,
        checkpoint: Option<DateTime<Utc>>,
        fetch: impl Fn(&PageQuery) -> SyncResult<Page<R>>,
        key: impl Fn(&R) -> (String, DateTime<Utc>),
        mut merge: impl FnMut(Vec<R>) -> SyncResult<()>,
    ) -> SyncResult<Sweep> {
        let since = match mode {
            SyncMode::Full => None,
            SyncMode::Delta => checkpoint,
        };
        let limit = self.config.page_size.max(1);
        let mut sweep = Sweep {
            pages: 0,
            records: 0,
            observed: HashSet::new(),
            high_water: None,
        };

        for page_number in 1..=self.config.max_pages {
            let query = PageQuery::new(page_number, limit).with_updated_since(since);
            let page = ctx.call("list page", || fetch(&query))?;
            let last = page.is_last();

            sweep.pages += 1;
            sweep.records += page.data.len();
            for record in &page.data {
                let (id, stamp) = key(record);
                sweep.observed.insert(id);
                sweep.high_water = sweep.high_water.max(Some(stamp));
            }
            merge(page.data)?;

            if last {
                return Ok(sweep);
            }
        }

        Err(SyncError::Unexpected(format!(
            "sweep did not end within {} pages",
            self.config.max_pages
        )))
    }
}
