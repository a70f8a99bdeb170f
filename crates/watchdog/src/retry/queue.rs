//! Retry queue with exponential backoff.

use chrono::Utc;
use notify::ErrorContext;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dead_letter::DeadLetterStore;
use super::types::{
    backoff_delay, DeadLetterEntry, ProcessReport, QueueOutcome, QueuedAlert, QueuedAlertSummary,
};
use crate::config::RetryConfig;
use crate::sender::AlertSender;

/// Clears the in-progress flag when a processor pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Holds undelivered alerts and re-sends them until they succeed or run out
/// of attempts.
///
/// Entries are keyed by process name plus a bounded prefix of the error
/// message, so textually similar errors from one process share an entry.
pub struct RetryQueue {
    config: RetryConfig,
    sender: Arc<dyn AlertSender>,
    queued: Mutex<HashMap<String, QueuedAlert>>,
    dead_letters: Mutex<DeadLetterStore>,
    processing: AtomicBool,
    retries_succeeded: AtomicU64,
    dead_lettered: AtomicU64,
}

impl RetryQueue {
    #[must_use]
    pub fn new(config: RetryConfig, sender: Arc<dyn AlertSender>) -> Self {
        let dead_letters = DeadLetterStore::new(config.dead_letter_capacity);
        Self {
            config,
            sender,
            queued: Mutex::new(HashMap::new()),
            dead_letters: Mutex::new(dead_letters),
            processing: AtomicBool::new(false),
            retries_succeeded: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
        }
    }

    fn queued(&self) -> MutexGuard<'_, HashMap<String, QueuedAlert>> {
        self.queued.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dead_letters(&self) -> MutexGuard<'_, DeadLetterStore> {
        self.dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue key for an alert.
    #[must_use]
    pub fn key_for(&self, ctx: &ErrorContext) -> String {
        let prefix: String = ctx
            .message
            .chars()
            .take(self.config.key_prefix_chars)
            .collect();
        format!("{}:{}", ctx.process_name, prefix)
    }

    /// Queue an alert whose delivery just failed.
    ///
    /// A new key is scheduled for its first retry after the initial backoff.
    /// An existing key keeps its attempt count and schedule; only its context
    /// and last error are refreshed. An existing key already at the retry
    /// ceiling goes straight to the dead-letter store.
    pub fn queue_alert(&self, ctx: ErrorContext, error: &str) -> QueueOutcome {
        let key = self.key_for(&ctx);
        let mut queued = self.queued();

        if let Some(existing) = queued.get_mut(&key) {
            if existing.attempts < self.config.max_retries {
                existing.context = ctx;
                existing.last_error = error.to_string();
                let attempts = existing.attempts;
                debug!(key = %key, attempts, "Refreshed queued alert");
                return QueueOutcome::Refreshed { attempts };
            }

            if let Some(mut alert) = queued.remove(&key) {
                drop(queued);
                alert.context = ctx;
                alert.last_error = error.to_string();
                self.dead_letter(key, alert);
            }
            return QueueOutcome::DeadLettered;
        }

        let next_retry_at = Instant::now() + backoff_delay(&self.config, 0);
        info!(
            key = %key,
            process = %ctx.process_name,
            error,
            "Alert delivery failed, queued for retry"
        );
        queued.insert(
            key,
            QueuedAlert {
                context: ctx,
                attempts: 0,
                next_retry_at,
                created_at: Utc::now(),
                last_error: error.to_string(),
            },
        );
        QueueOutcome::Queued
    }

    fn dead_letter(&self, key: String, alert: QueuedAlert) {
        warn!(
            key = %key,
            attempts = alert.attempts,
            last_error = %alert.last_error,
            "Alert exhausted retries, moved to dead-letter store"
        );
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.dead_letters()
            .push(DeadLetterEntry::from_queued(key, alert));
    }

    /// Re-send every alert whose retry time has passed, one at a time.
    ///
    /// A pass that starts while another is still running does nothing.
    pub async fn process_due(&self) -> ProcessReport {
        if self.processing.swap(true, Ordering::AcqRel) {
            debug!("Retry pass already running, skipping tick");
            return ProcessReport {
                skipped: true,
                ..ProcessReport::default()
            };
        }
        let _guard = PassGuard(&self.processing);

        let now = Instant::now();
        let due: Vec<(String, ErrorContext)> = self
            .queued()
            .iter()
            .filter(|(_, alert)| alert.next_retry_at <= now)
            .map(|(key, alert)| (key.clone(), alert.context.clone()))
            .collect();

        let mut report = ProcessReport::default();

        for (key, ctx) in due {
            report.attempted += 1;
            let result = self.sender.send(&ctx).await;

            let mut queued = self.queued();
            match result {
                Ok(()) => {
                    if let Some(alert) = queued.remove(&key) {
                        info!(key = %key, attempts = alert.attempts, "Queued alert delivered");
                    }
                    self.retries_succeeded.fetch_add(1, Ordering::Relaxed);
                    report.succeeded += 1;
                }
                Err(e) => {
                    report.failed += 1;
                    let Some(alert) = queued.get_mut(&key) else {
                        continue;
                    };
                    alert.attempts += 1;
                    alert.last_error = e.to_string();

                    if alert.attempts >= self.config.max_retries {
                        if let Some(alert) = queued.remove(&key) {
                            drop(queued);
                            self.dead_letter(key, alert);
                            report.dead_lettered += 1;
                        }
                    } else {
                        let delay = backoff_delay(&self.config, alert.attempts);
                        alert.next_retry_at = Instant::now() + delay;
                        debug!(
                            key = %key,
                            attempt = alert.attempts,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error = %e,
                            "Retry failed, backing off"
                        );
                    }
                }
            }
        }

        report
    }

    /// Run [`process_due`](Self::process_due) every `process_interval` until
    /// cancelled. Pending entries stay in memory after cancellation.
    pub fn spawn_processor(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let period = self.config.process_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.process_due().await;
                        if report.attempted > 0 {
                            debug!(
                                attempted = report.attempted,
                                succeeded = report.succeeded,
                                failed = report.failed,
                                dead_lettered = report.dead_lettered,
                                "Retry pass complete"
                            );
                        }
                    }
                }
            }
            info!(pending = self.len(), "Retry processor stopped");
        })
    }

    /// Number of alerts waiting for a retry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queued().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queued().is_empty()
    }

    #[must_use]
    pub fn dead_letter_len(&self) -> usize {
        self.dead_letters().len()
    }

    /// Copy of the dead-letter store, oldest first.
    #[must_use]
    pub fn dead_letter_entries(&self) -> Vec<DeadLetterEntry> {
        self.dead_letters().entries()
    }

    /// Read-only view of queued alerts.
    #[must_use]
    pub fn pending(&self) -> Vec<QueuedAlertSummary> {
        let now = Instant::now();
        self.queued()
            .iter()
            .map(|(key, alert)| QueuedAlertSummary {
                key: key.clone(),
                process_name: alert.context.process_name.clone(),
                attempts: alert.attempts,
                next_retry_in_ms: u64::try_from(
                    alert.next_retry_at.saturating_duration_since(now).as_millis(),
                )
                .unwrap_or(u64::MAX),
                created_at: alert.created_at,
                last_error: alert.last_error.clone(),
            })
            .collect()
    }

    #[must_use]
    pub fn retries_succeeded(&self) -> u64 {
        self.retries_succeeded.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn dead_lettered_total(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use notify::ChannelError;
    use std::time::Duration;

    /// Sender that fails until told otherwise and records when it was called.
    #[derive(Default)]
    struct ScriptedSender {
        succeed: AtomicBool,
        calls: Mutex<Vec<Instant>>,
    }

    impl ScriptedSender {
        fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AlertSender for ScriptedSender {
        async fn send(&self, _ctx: &ErrorContext) -> Result<(), ChannelError> {
            self.calls.lock().unwrap().push(Instant::now());
            if self.succeed.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ChannelError::Other("webhook down".to_string()))
            }
        }
    }

    fn queue(config: RetryConfig) -> (Arc<RetryQueue>, Arc<ScriptedSender>) {
        let sender = Arc::new(ScriptedSender::default());
        let queue = Arc::new(RetryQueue::new(config, sender.clone()));
        (queue, sender)
    }

    fn ctx(message: &str) -> ErrorContext {
        ErrorContext::new(1, "worker-1", message)
    }

    /// Step time in 100ms increments, running a pass at each step.
    async fn drive(queue: &RetryQueue, total: Duration) {
        let step = Duration::from_millis(100);
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            tokio::time::advance(step).await;
            elapsed += step;
            queue.process_due().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_alert_backs_off_then_dead_letters() {
        let (queue, sender) = queue(RetryConfig::default());
        let start = Instant::now();

        assert_eq!(queue.queue_alert(ctx("Error: disk full"), "timeout"), QueueOutcome::Queued);
        drive(&queue, Duration::from_secs(120)).await;

        let offsets: Vec<u64> = sender
            .call_times()
            .iter()
            .map(|t| t.duration_since(start).as_secs())
            .collect();
        // Delays of 1, 2, 4, 8 and 16 seconds between attempts.
        assert_eq!(offsets, [1, 3, 7, 15, 31]);

        assert_eq!(queue.len(), 0);
        assert_eq!(queue.dead_letter_len(), 1);
        let dead = &queue.dead_letter_entries()[0];
        assert_eq!(dead.attempts, 5);
        assert_eq!(dead.last_error, "webhook down");
        assert_eq!(queue.dead_lettered_total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delays_cap_at_max_backoff() {
        let (queue, sender) = queue(RetryConfig {
            max_backoff: Duration::from_secs(4),
            max_retries: 6,
            ..RetryConfig::default()
        });
        let start = Instant::now();

        queue.queue_alert(ctx("Error: x"), "down");
        drive(&queue, Duration::from_secs(60)).await;

        let times = sender.call_times();
        let gaps: Vec<u64> = std::iter::once(start)
            .chain(times.iter().copied())
            .collect::<Vec<_>>()
            .windows(2)
            .map(|w| w[1].duration_since(w[0]).as_secs())
            .collect();
        assert_eq!(gaps, [1, 2, 4, 4, 4, 4]);
        assert_eq!(queue.dead_letter_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_removes_entry() {
        let (queue, sender) = queue(RetryConfig::default());
        queue.queue_alert(ctx("Error: x"), "down");

        drive(&queue, Duration::from_millis(1500)).await;
        assert_eq!(queue.len(), 1);

        sender.succeed.store(true, Ordering::SeqCst);
        drive(&queue, Duration::from_secs(3)).await;

        assert!(queue.is_empty());
        assert_eq!(queue.dead_letter_len(), 0);
        assert_eq!(queue.retries_succeeded(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_keeps_attempt_count() {
        let (queue, _sender) = queue(RetryConfig::default());
        queue.queue_alert(ctx("Error: x"), "first");
        drive(&queue, Duration::from_millis(3100)).await;
        assert_eq!(queue.pending()[0].attempts, 2);

        let outcome = queue.queue_alert(ctx("Error: x"), "again");
        assert_eq!(outcome, QueueOutcome::Refreshed { attempts: 2 });
        let pending = queue.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 2);
        assert_eq!(pending[0].last_error, "again");
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_at_ceiling_dead_letters() {
        let (queue, _sender) = queue(RetryConfig {
            max_retries: 1,
            ..RetryConfig::default()
        });
        let key = queue.key_for(&ctx("Error: x"));
        queue.queue_alert(ctx("Error: x"), "down");
        if let Some(alert) = queue.queued().get_mut(&key) {
            alert.attempts = 1;
        }

        assert_eq!(queue.queue_alert(ctx("Error: x"), "down"), QueueOutcome::DeadLettered);
        assert!(queue.is_empty());
        assert_eq!(queue.dead_letter_len(), 1);
    }

    #[test]
    fn test_key_conflates_shared_prefix() {
        let (queue, _sender) = queue(RetryConfig::default());
        let base = "Error: ".to_string() + &"y".repeat(60);
        let a = queue.key_for(&ctx(&format!("{base} alpha")));
        let b = queue.key_for(&ctx(&format!("{base} beta")));
        assert_eq!(a, b);
        assert!(a.starts_with("worker-1:"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_pass_is_skipped() {
        let (queue, _sender) = queue(RetryConfig::default());
        queue.processing.store(true, Ordering::SeqCst);
        assert!(queue.process_due().await.skipped);

        queue.processing.store(false, Ordering::SeqCst);
        assert!(!queue.process_due().await.skipped);
        assert!(!queue.processing.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_processor_task_retries_and_stops() {
        let (queue, sender) = queue(RetryConfig::default());
        sender.succeed.store(true, Ordering::SeqCst);
        queue.queue_alert(ctx("Error: x"), "down");

        let token = CancellationToken::new();
        let handle = Arc::clone(&queue).spawn_processor(token.clone());
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(queue.is_empty());

        token.cancel();
        handle.await.unwrap();
    }
}
