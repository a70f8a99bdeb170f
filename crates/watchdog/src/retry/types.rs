//! Retry queue types.

use chrono::{DateTime, Utc};
use notify::ErrorContext;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RetryConfig;

/// `min(initial * 2^attempt, max)`.
#[must_use]
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    config
        .initial_backoff
        .saturating_mul(factor)
        .min(config.max_backoff)
}

/// An alert waiting for another delivery attempt.
#[derive(Debug, Clone)]
pub struct QueuedAlert {
    pub context: ErrorContext,
    /// Failed retries so far; the initial send does not count
    pub attempts: u32,
    pub next_retry_at: Instant,
    pub created_at: DateTime<Utc>,
    pub last_error: String,
}

/// Read-only view of a queued alert.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedAlertSummary {
    pub key: String,
    pub process_name: String,
    pub attempts: u32,
    pub next_retry_in_ms: u64,
    pub created_at: DateTime<Utc>,
    pub last_error: String,
}

/// An alert that exhausted its retries.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    pub key: String,
    pub context: ErrorContext,
    pub attempts: u32,
    pub last_error: String,
    pub first_failed_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub(crate) fn from_queued(key: String, alert: QueuedAlert) -> Self {
        Self {
            key,
            context: alert.context,
            attempts: alert.attempts,
            last_error: alert.last_error,
            first_failed_at: alert.created_at,
            dead_lettered_at: Utc::now(),
        }
    }
}

/// What [`RetryQueue::queue_alert`](super::RetryQueue::queue_alert) did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    /// New entry scheduled for its first retry
    Queued,
    /// Existing entry refreshed; its attempt count carries over
    Refreshed { attempts: u32 },
    /// Existing entry was already at the ceiling
    DeadLettered,
}

/// Summary of one retry processor pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessReport {
    /// Another pass was still running
    pub skipped: bool,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}
