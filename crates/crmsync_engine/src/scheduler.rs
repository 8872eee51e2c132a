//! Background scheduling of sync runs.
//!
//! The scheduler turns interval ticks, content-change notifications and
//! manual requests into coordinator runs. Runs execute on the blocking
//! pool; the coordinator's single-flight gate drops triggers that arrive
//! while a run is active. After a failed run, automatic triggers are held
//! back with exponential backoff; manual triggers always go through.

use crate::config::RetryConfig;
use crate::context::Session;
use crate::coordinator::SyncCoordinator;
use crate::device::DeviceBridge;
use crate::download::SyncMode;
use crate::store::LocalStore;
use crate::transport::SyncTransport;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

const TRIGGER_QUEUE: usize = 16;

/// Why a run was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// The periodic timer fired.
    Interval,
    /// Device content changed.
    ContentChanged,
    /// The user asked for a sync.
    Manual {
        /// Request a full sweep instead of a delta.
        full: bool,
    },
}

impl SyncTrigger {
    /// Mode of the run this trigger starts.
    pub fn mode(&self) -> SyncMode {
        match self {
            SyncTrigger::Manual { full: true } => SyncMode::Full,
            _ => SyncMode::Delta,
        }
    }

    fn is_manual(&self) -> bool {
        matches!(self, SyncTrigger::Manual { .. })
    }
}

#[derive(Debug, Default)]
struct Backoff {
    consecutive_failures: u32,
    not_before: Option<Instant>,
}

impl Backoff {
    fn blocks(&self, now: Instant) -> bool {
        self.not_before.is_some_and(|t| now < t)
    }

    fn record(&mut self, succeeded: bool, retry: &RetryConfig) {
        if succeeded {
            self.consecutive_failures = 0;
            self.not_before = None;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            let delay = retry.delay_for_attempt(self.consecutive_failures);
            self.not_before = Some(Instant::now() + delay);
        }
    }
}

/// Handle to a running scheduler task.
pub struct SyncScheduler {
    triggers: mpsc::Sender<SyncTrigger>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    backoff: Arc<Mutex<Backoff>>,
}

impl SyncScheduler {
    /// Spawns the scheduler on the current tokio runtime.
    ///
    /// Interval ticks start one period after spawning, and only when the
    /// coordinator config sets an interval.
    pub fn spawn<T, S, D>(coordinator: Arc<SyncCoordinator<T, S, D>>, session: Session) -> Self
    where
        T: SyncTransport + 'static,
        S: LocalStore + 'static,
        D: DeviceBridge + 'static,
    {
        let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_QUEUE);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let backoff = Arc::new(Mutex::new(Backoff::default()));

        let task = tokio::spawn(run_loop(
            coordinator,
            session,
            trigger_rx,
            shutdown_rx,
            Arc::clone(&backoff),
        ));

        Self {
            triggers: trigger_tx,
            shutdown: Some(shutdown_tx),
            task,
            backoff,
        }
    }

    /// Requests a run. Returns false if the trigger queue is full.
    pub fn trigger(&self, trigger: SyncTrigger) -> bool {
        self.triggers.try_send(trigger).is_ok()
    }

    /// Failed runs since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.backoff.lock().consecutive_failures
    }

    /// Stops the scheduler. Runs already started finish on their own.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "scheduler task ended abnormally");
        }
    }
}

async fn run_loop<T, S, D>(
    coordinator: Arc<SyncCoordinator<T, S, D>>,
    session: Session,
    mut triggers: mpsc::Receiver<SyncTrigger>,
    mut shutdown: oneshot::Receiver<()>,
    backoff: Arc<Mutex<Backoff>>,
) where
    T: SyncTransport + 'static,
    S: LocalStore + 'static,
    D: DeviceBridge + 'static,
{
    let retry = coordinator.config().retry.clone();
    let mut ticker = coordinator.config().sync_interval.map(periodic);
    info!(owner = %session.owner_id, "sync scheduler started");

    loop {
        let trigger = tokio::select! {
            _ = &mut shutdown => break,
            Some(trigger) = triggers.recv() => trigger,
            () = tick(&mut ticker) => SyncTrigger::Interval,
        };

        if !trigger.is_manual() && backoff.lock().blocks(Instant::now()) {
            debug!(?trigger, "backing off; trigger skipped");
            continue;
        }

        let coordinator = Arc::clone(&coordinator);
        let session = session.clone();
        let backoff = Arc::clone(&backoff);
        let retry = retry.clone();
        tokio::spawn(async move {
            let mode = trigger.mode();
            let outcome = tokio::task::spawn_blocking(move || coordinator.run(&session, mode)).await;
            match outcome {
                Ok(Ok(report)) => backoff.lock().record(report.succeeded(), &retry),
                Ok(Err(e)) => debug!(?trigger, error = %e, "trigger dropped"),
                Err(e) => {
                    warn!(error = %e, "sync run panicked");
                    backoff.lock().record(false, &retry);
                }
            }
        });
    }

    info!(owner = %session.owner_id, "sync scheduler stopped");
}

fn periodic(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_modes() {
        assert_eq!(SyncTrigger::Interval.mode(), SyncMode::Delta);
        assert_eq!(SyncTrigger::ContentChanged.mode(), SyncMode::Delta);
        assert_eq!(SyncTrigger::Manual { full: true }.mode(), SyncMode::Full);
        assert_eq!(SyncTrigger::Manual { full: false }.mode(), SyncMode::Delta);
    }

    #[tokio::test]
    async fn backoff_grows_and_resets() {
        let retry = RetryConfig::new(5)
            .with_initial_delay(Duration::from_secs(10))
            .with_jitter(false);
        let mut backoff = Backoff::default();
        assert!(!backoff.blocks(Instant::now()));

        backoff.record(false, &retry);
        assert_eq!(backoff.consecutive_failures, 1);
        assert!(backoff.blocks(Instant::now()));

        backoff.record(false, &retry);
        assert_eq!(backoff.consecutive_failures, 2);

        backoff.record(true, &retry);
        assert_eq!(backoff.consecutive_failures, 0);
        assert!(!backoff.blocks(Instant::now()));
    }
}
