//! Retry queue and dead-letter store for undelivered alerts.
//!
//! Alerts whose first send failed wait here and are re-sent with
//! exponential backoff. Alerts that keep failing end up in a bounded
//! dead-letter store for inspection. Nothing here survives a restart.

pub mod dead_letter;
pub mod queue;
pub mod types;

pub use dead_letter::DeadLetterStore;
pub use queue::RetryQueue;
pub use types::{backoff_delay, DeadLetterEntry, ProcessReport, QueueOutcome, QueuedAlert, QueuedAlertSummary};
