//! Runtime configuration for the watchdog pipeline.
//!
//! Every component takes its own typed section; [`WatchdogConfig`] groups
//! them and is built by the CLI from flags and `WATCHDOG_*` variables.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::ConfigError;

/// Log ring buffer settings.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Lines kept per process
    pub capacity: usize,
    /// Lines copied into each alert
    pub context_lines: usize,
    /// Wait before snapshotting context, so trailing stack frames are buffered
    pub context_delay: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            context_lines: 30,
            context_delay: Duration::from_millis(250),
        }
    }
}

/// Error dedup and single-flight settings.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Identical errors within this window are suppressed
    pub debounce_window: Duration,
    /// How long an admitted fingerprint stays in flight after its attempt
    pub release_delay: Duration,
    /// Interval of the stale-fingerprint sweep
    pub sweep_interval: Duration,
    /// Characters of error text that feed the fingerprint
    pub fingerprint_chars: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_secs(5 * 60),
            release_delay: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(60),
            fingerprint_chars: 100,
        }
    }
}

/// Retry queue and dead-letter settings.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Failed retries before an alert is dead-lettered
    pub max_retries: u32,
    pub dead_letter_capacity: usize,
    /// Tick of the retry processor
    pub process_interval: Duration,
    /// Characters of error text that feed the queue key
    pub key_prefix_chars: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(32),
            max_retries: 5,
            dead_letter_capacity: 100,
            process_interval: Duration::from_secs(1),
            key_prefix_chars: 50,
        }
    }
}

/// Process directory cache settings.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub ttl: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
        }
    }
}

/// Rate limits for the HTTP surface.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub sweep_interval: Duration,
    /// Requests per window per client on `/status`
    pub status_max_requests: u32,
    /// Requests per window per client on `/health`
    pub health_max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5 * 60),
            status_max_requests: 30,
            health_max_requests: 60,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 9615)),
        }
    }
}

/// Complete watchdog configuration.
#[derive(Debug, Clone, Default)]
pub struct WatchdogConfig {
    pub buffer: BufferConfig,
    pub dedup: DedupConfig,
    pub retry: RetryConfig,
    pub directory: DirectoryConfig,
    pub rate_limit: RateLimitConfig,
    pub server: ServerConfig,
}

impl WatchdogConfig {
    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer.capacity == 0 {
            return Err(ConfigError::invalid("buffer.capacity", "must be at least 1"));
        }
        if self.dedup.fingerprint_chars == 0 {
            return Err(ConfigError::invalid(
                "dedup.fingerprint_chars",
                "must be at least 1",
            ));
        }
        if self.dedup.sweep_interval.is_zero() {
            return Err(ConfigError::invalid("dedup.sweep_interval", "must be non-zero"));
        }
        if self.retry.max_retries == 0 {
            return Err(ConfigError::invalid("retry.max_retries", "must be at least 1"));
        }
        if self.retry.initial_backoff.is_zero() {
            return Err(ConfigError::invalid("retry.initial_backoff", "must be non-zero"));
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(ConfigError::invalid(
                "retry.initial_backoff",
                "must not exceed retry.max_backoff",
            ));
        }
        if self.retry.dead_letter_capacity == 0 {
            return Err(ConfigError::invalid(
                "retry.dead_letter_capacity",
                "must be at least 1",
            ));
        }
        if self.retry.process_interval.is_zero() {
            return Err(ConfigError::invalid("retry.process_interval", "must be non-zero"));
        }
        if self.rate_limit.window.is_zero() || self.rate_limit.sweep_interval.is_zero() {
            return Err(ConfigError::invalid("rate_limit", "windows must be non-zero"));
        }
        Ok(())
    }
}
