//! Configuration for the sync engine.

use rand::Rng;
use std::time::Duration;

/// Configuration for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the REST API (e.g., "https://api.example.com/v1").
    pub api_base_url: String,
    /// URL of the event stream endpoint.
    pub stream_url: Option<String>,
    /// Bearer token for both the API and the stream.
    pub credentials: Option<String>,
    /// Reconnect backoff for the event stream.
    pub backoff: BackoffConfig,
    /// Retryable failures tolerated before an operation is marked failed.
    pub max_retries: u32,
    /// Upper bound on operations executing concurrently during a flush.
    pub max_concurrent_operations: usize,
    /// Rows claimed from the queue per batch.
    pub batch_size: usize,
    /// Period of the background flush, if any.
    pub flush_interval: Option<Duration>,
    /// Reconnect when the stream is silent for this long.
    pub heartbeat_timeout: Option<Duration>,
    /// Timeout of a single REST request.
    pub request_timeout: Duration,
    /// Operation journal tuning.
    pub journal: JournalConfig,
}

impl SyncConfig {
    /// Creates a configuration for the given API base URL.
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            stream_url: None,
            credentials: None,
            backoff: BackoffConfig::default(),
            max_retries: 3,
            max_concurrent_operations: 4,
            batch_size: 32,
            flush_interval: Some(Duration::from_secs(60)),
            heartbeat_timeout: None,
            request_timeout: Duration::from_secs(30),
            journal: JournalConfig::default(),
        }
    }

    /// Sets the event stream URL.
    pub fn with_stream_url(mut self, url: impl Into<String>) -> Self {
        self.stream_url = Some(url.into());
        self
    }

    /// Sets the bearer credentials.
    pub fn with_credentials(mut self, token: impl Into<String>) -> Self {
        self.credentials = Some(token.into());
        self
    }

    /// Sets the reconnect backoff.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the retry limit.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the worker pool size.
    pub fn with_max_concurrent_operations(mut self, n: usize) -> Self {
        self.max_concurrent_operations = n.max(1);
        self
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets or disables the periodic flush.
    pub fn with_flush_interval(mut self, interval: Option<Duration>) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Sets the heartbeat timeout.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the journal configuration.
    pub fn with_journal(mut self, journal: JournalConfig) -> Self {
        self.journal = journal;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Reconnect backoff parameters.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First delay after a failed session.
    pub initial_delay: Duration,
    /// Upper bound on any delay, jitter included.
    pub max_delay: Duration,
    /// Growth factor per consecutive failure.
    pub multiplier: f64,
    /// Whether to add up to 25% random jitter.
    pub jitter: bool,
}

impl BackoffConfig {
    /// Creates the default schedule: 1s, doubling, capped at 30s, no jitter.
    pub fn new() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: false,
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

    /// Sets the multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before reconnect attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let max = self.max_delay.as_secs_f64();
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base = (self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent)).min(max);

        let delay = if self.jitter {
            let jitter = base * 0.25 * rand::thread_rng().gen_range(0.0..=1.0);
            (base + jitter).min(max)
        } else {
            base
        };
        Duration::from_secs_f64(delay)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Journal compaction thresholds.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Never compact a journal with fewer records than this.
    pub compact_min_records: usize,
    /// Compact once dead records make up at least this fraction.
    pub compact_dead_ratio: f64,
}

impl JournalConfig {
    /// Creates the default thresholds.
    pub fn new() -> Self {
        Self {
            compact_min_records: 256,
            compact_dead_ratio: 0.5,
        }
    }

    /// Sets the minimum record count.
    pub fn with_compact_min_records(mut self, n: usize) -> Self {
        self.compact_min_records = n;
        self
    }

    /// Sets the dead record ratio.
    pub fn with_compact_dead_ratio(mut self, ratio: f64) -> Self {
        self.compact_dead_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Returns true if a journal holding `records` records of which `live`
    /// are still current should be compacted.
    pub fn should_compact(&self, records: usize, live: usize) -> bool {
        if records < self.compact_min_records || records == 0 {
            return false;
        }
        let dead = records.saturating_sub(live) as f64;
        dead / records as f64 >= self.compact_dead_ratio
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self::new()
    }
}
