//! Session and per-run context.

use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// An authenticated user session.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    /// The owner all records of this session belong to.
    pub owner_id: String,
    /// Bearer token sent with every request.
    pub token: String,
}

impl Session {
    /// Creates a new session.
    pub fn new(owner_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            token: token.into(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("owner_id", &self.owner_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Cancels an in-flight run.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Creates a new, untriggered handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// State shared by all stages of one run.
///
/// Stages call [`RunContext::check`] before every request and store commit;
/// once the budget is spent or the run is cancelled, no further side
/// effects happen.
#[derive(Debug)]
pub struct RunContext {
    session: Session,
    deadline: Instant,
    retry: RetryConfig,
    cancel: CancelHandle,
}

impl RunContext {
    /// Creates a context whose budget starts now.
    pub fn new(session: Session, budget: Duration, retry: RetryConfig, cancel: CancelHandle) -> Self {
        Self {
            session,
            deadline: Instant::now() + budget,
            retry,
            cancel,
        }
    }

    /// The session of the run.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The owner of the run.
    pub fn owner_id(&self) -> &str {
        &self.session.owner_id
    }

    /// Time left in the budget.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Fails if the run was cancelled or its budget is spent.
    pub fn check(&self) -> SyncResult<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(SyncError::Timeout);
        }
        Ok(())
    }

    /// Runs one remote operation, retrying retryable failures.
    ///
    /// Backoff sleeps never extend past the deadline.
    pub fn call<T>(&self, what: &str, mut op: impl FnMut() -> SyncResult<T>) -> SyncResult<T> {
        let mut attempt = 0u32;
        loop {
            self.check()?;
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    attempt += 1;
                    let delay = self.retry.delay_for_attempt(attempt);
                    if delay >= self.remaining() {
                        return Err(SyncError::Timeout);
                    }
                    debug!(operation = what, attempt, error = %e, ?delay, "retrying");
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn context(budget: Duration, retry: RetryConfig) -> RunContext {
        RunContext::new(Session::new("u1", "t"), budget, retry, CancelHandle::new())
    }

    #[test]
    fn session_debug_redacts_token() {
        let session = Session::new("u1", "secret-token");
        let rendered = format!("{session:?}");
        assert!(rendered.contains("u1"));
        assert!(!rendered.contains("secret-token"));
    }

    #[test]
    fn retries_transient_errors() {
        let ctx = context(
            Duration::from_secs(5),
            RetryConfig::new(3).with_initial_delay(Duration::from_millis(1)),
        );
        let calls = Cell::new(0);
        let value = ctx
            .call("op", || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err(SyncError::network_retryable("flaky"))
                } else {
                    Ok(7)
                }
            })
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let ctx = context(
            Duration::from_secs(5),
            RetryConfig::new(2).with_initial_delay(Duration::from_millis(1)),
        );
        let calls = Cell::new(0);
        let err = ctx
            .call("op", || -> SyncResult<()> {
                calls.set(calls.get() + 1);
                Err(SyncError::network_retryable("down"))
            })
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn does_not_retry_permanent_errors() {
        let ctx = context(Duration::from_secs(5), RetryConfig::new(5));
        let calls = Cell::new(0);
        let err = ctx
            .call("op", || -> SyncResult<()> {
                calls.set(calls.get() + 1);
                Err(SyncError::Auth("expired".into()))
            })
            .unwrap_err();
        assert!(matches!(err, SyncError::Auth(_)));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn spent_budget_times_out() {
        let ctx = context(Duration::ZERO, RetryConfig::no_retry());
        assert!(matches!(ctx.check(), Err(SyncError::Timeout)));
        assert!(matches!(ctx.call("op", || Ok(())), Err(SyncError::Timeout)));
    }

    #[test]
    fn cancellation_wins() {
        let cancel = CancelHandle::new();
        let ctx = RunContext::new(
            Session::new("u1", "t"),
            Duration::from_secs(60),
            RetryConfig::no_retry(),
            cancel.clone(),
        );
        cancel.cancel();
        assert!(matches!(ctx.check(), Err(SyncError::Cancelled)));
    }
}
