//! Configuration for the sync engine.

use crmsync_protocol::MAX_BATCH_SIZE;
use rand::Rng;
use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Server URL.
    pub server_url: String,
    /// Records requested per download page.
    pub page_size: u32,
    /// Records per upload request (never above the protocol cap).
    pub upload_batch_size: usize,
    /// Wall-clock budget of one run.
    pub run_budget: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Retry configuration for transient network errors.
    pub retry: RetryConfig,
    /// Interval for automatic sync.
    pub sync_interval: Option<Duration>,
    /// Ask the server to revive soft-deleted contacts on upload.
    pub force_restore: bool,
    /// Upper bound on pages fetched in one sweep.
    pub max_pages: u32,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            page_size: 100,
            upload_batch_size: 500,
            run_budget: Duration::from_secs(5 * 60),
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            sync_interval: None,
            force_restore: false,
            max_pages: 10_000,
        }
    }

    /// Sets the download page size.
    pub fn with_page_size(mut self, size: u32) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// Sets the upload batch size, clamped to the protocol cap.
    pub fn with_upload_batch_size(mut self, size: usize) -> Self {
        self.upload_batch_size = size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    /// Sets the run budget.
    pub fn with_run_budget(mut self, budget: Duration) -> Self {
        self.run_budget = budget;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the sync interval for automatic sync.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Sets the `force_restore` upload flag.
    pub fn with_force_restore(mut self, force_restore: bool) -> Self {
        self.force_restore = force_restore;
        self
    }

    /// Sets the page cap of one sweep.
    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts per request.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new("https://crm.example.com/api")
            .with_page_size(50)
            .with_upload_batch_size(25)
            .with_run_budget(Duration::from_secs(60))
            .with_force_restore(true);

        assert_eq!(config.server_url, "https://crm.example.com/api");
        assert_eq!(config.page_size, 50);
        assert_eq!(config.upload_batch_size, 25);
        assert_eq!(config.run_budget, Duration::from_secs(60));
        assert!(config.force_restore);
    }

    #[test]
    fn defaults_follow_protocol() {
        let config = SyncConfig::default();
        assert_eq!(config.run_budget, Duration::from_secs(300));
        assert!(config.upload_batch_size <= MAX_BATCH_SIZE);
    }

    #[test]
    fn upload_batch_is_clamped_to_cap() {
        let config = SyncConfig::default().with_upload_batch_size(5000);
        assert_eq!(config.upload_batch_size, MAX_BATCH_SIZE);
        let config = SyncConfig::default().with_upload_batch_size(0);
        assert_eq!(config.upload_batch_size, 1);
    }

    #[test]
    fn retry_config_no_retry() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.delay_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
    }
}
