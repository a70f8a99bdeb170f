//! Error deduplication and single-flight admission.
//!
//! Two tables decide whether an error signal becomes an alert:
//!
//! - **recently seen**: fingerprint -> last admission time. A fingerprint
//!   admitted within the debounce window is suppressed.
//! - **in flight**: `(process id, fingerprint)` pairs currently being turned
//!   into an alert. A pair already in flight is suppressed as a race
//!   duplicate.
//!
//! Both tables sit behind one lock, so checking and recording an admission
//! is a single atomic step even when signals arrive on different tasks.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::DedupConfig;

/// Hex characters kept from the digest.
const FINGERPRINT_LEN: usize = 16;

/// Deterministic digest of a process name and the start of an error message.
#[must_use]
pub fn fingerprint(process_name: &str, message: &str, prefix_chars: usize) -> String {
    let prefix: String = message.trim().chars().take(prefix_chars).collect();
    let mut hasher = Sha256::new();
    hasher.update(process_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(prefix.as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(FINGERPRINT_LEN);
    digest
}

/// Proof of admission. Hand it back through [`ErrorDeduplicator::release`]
/// once the alert has been sent or queued.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "an admission must be released or the fingerprint stays in flight"]
pub struct AdmissionTicket {
    pub process_id: u32,
    pub fingerprint: String,
}

/// Result of offering an error signal to the deduplicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// First occurrence; build and send the alert.
    Admitted(AdmissionTicket),
    /// Seen within the debounce window.
    Debounced { fingerprint: String },
    /// Another task is already alerting on this exact error.
    InFlight { fingerprint: String },
    /// Blank error text; nothing to alert on.
    Empty,
}

#[derive(Default)]
struct DedupState {
    recent: HashMap<String, Instant>,
    in_flight: HashSet<(u32, String)>,
}

/// Debounce and single-flight coordinator.
pub struct ErrorDeduplicator {
    config: DedupConfig,
    state: Mutex<DedupState>,
}

impl ErrorDeduplicator {
    #[must_use]
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            state: Mutex::new(DedupState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DedupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide whether an error signal should become an alert.
    pub fn admit(&self, process_id: u32, process_name: &str, message: &str) -> Admission {
        if message.trim().is_empty() {
            return Admission::Empty;
        }

        let fingerprint = fingerprint(process_name, message, self.config.fingerprint_chars);
        let now = Instant::now();
        let mut state = self.state();

        if let Some(seen) = state.recent.get(&fingerprint) {
            if now.duration_since(*seen) < self.config.debounce_window {
                debug!(
                    process_id,
                    process_name,
                    fingerprint = %fingerprint,
                    "Error debounced"
                );
                return Admission::Debounced { fingerprint };
            }
        }

        let key = (process_id, fingerprint);
        if state.in_flight.contains(&key) {
            debug!(
                process_id,
                process_name,
                fingerprint = %key.1,
                "Error already being processed"
            );
            return Admission::InFlight { fingerprint: key.1 };
        }

        let fingerprint = key.1.clone();
        state.in_flight.insert(key);
        state.recent.insert(fingerprint.clone(), now);

        info!(process_id, process_name, fingerprint = %fingerprint, "Error admitted");
        Admission::Admitted(AdmissionTicket {
            process_id,
            fingerprint,
        })
    }

    /// Clear a ticket from the in-flight set after the configured delay.
    ///
    /// The delay absorbs duplicates that arrive just behind the admitted
    /// signal.
    pub fn release(self: &Arc<Self>, ticket: AdmissionTicket) {
        let delay = self.config.release_delay;
        if delay.is_zero() {
            self.release_now(&ticket);
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.release_now(&ticket);
        });
    }

    /// Drop the debounce entry recorded when `ticket` was admitted.
    ///
    /// For signals whose attempt never reached delivery; a later identical
    /// error is then admitted without waiting out the window.
    pub fn forget(&self, ticket: &AdmissionTicket) {
        self.state().recent.remove(&ticket.fingerprint);
    }

    /// Clear a ticket from the in-flight set immediately.
    pub fn release_now(&self, ticket: &AdmissionTicket) {
        self.state()
            .in_flight
            .remove(&(ticket.process_id, ticket.fingerprint.clone()));
    }

    /// Drop recently-seen entries older than the debounce window.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let window = self.config.debounce_window;
        let mut state = self.state();
        let before = state.recent.len();
        state
            .recent
            .retain(|_, seen| now.duration_since(*seen) < window);
        let removed = before - state.recent.len();
        if removed > 0 {
            debug!(removed, remaining = state.recent.len(), "Swept stale fingerprints");
        }
        removed
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until cancelled.
    pub fn spawn_sweeper(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                }
            }
            debug!("Dedup sweeper stopped");
        })
    }

    #[must_use]
    pub fn recent_len(&self) -> usize {
        self.state().recent.len()
    }

    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.state().in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn dedup(config: DedupConfig) -> Arc<ErrorDeduplicator> {
        Arc::new(ErrorDeduplicator::new(config))
    }

    fn ticket(admission: Admission) -> AdmissionTicket {
        match admission {
            Admission::Admitted(ticket) => ticket,
            other => panic!("expected admission, got {other:?}"),
        }
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = fingerprint("worker-1", "Error: disk full", 100);
        let b = fingerprint("worker-1", "Error: disk full", 100);
        assert_eq!(a, b);
        assert_eq!(a.len(), FINGERPRINT_LEN);
        assert_ne!(a, fingerprint("worker-2", "Error: disk full", 100));
        assert_ne!(a, fingerprint("worker-1", "Error: disk empty", 100));
    }

    #[test]
    fn test_fingerprint_uses_prefix_only() {
        let base = "x".repeat(100);
        assert_eq!(
            fingerprint("api", &format!("{base} tail one"), 100),
            fingerprint("api", &format!("{base} tail two"), 100)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_duplicate_is_debounced() {
        let d = dedup(DedupConfig::default());
        let t = ticket(d.admit(1, "worker-1", "Error: disk full"));
        d.release(t);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(matches!(
            d.admit(1, "worker-1", "Error: disk full"),
            Admission::Debounced { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_admitted_again_after_window() {
        let d = dedup(DedupConfig::default());
        let t = ticket(d.admit(1, "worker-1", "Error: disk full"));
        d.release(t);

        tokio::time::sleep(Duration::from_secs(5 * 60 + 1)).await;
        assert!(matches!(
            d.admit(1, "worker-1", "Error: disk full"),
            Admission::Admitted(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_blocks_until_released() {
        let d = dedup(DedupConfig {
            debounce_window: Duration::ZERO,
            ..DedupConfig::default()
        });

        let t = ticket(d.admit(1, "api", "Error: boom"));
        assert!(matches!(d.admit(1, "api", "Error: boom"), Admission::InFlight { .. }));

        d.release(t);
        // Still held during the release delay.
        assert!(matches!(d.admit(1, "api", "Error: boom"), Admission::InFlight { .. }));

        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert_eq!(d.in_flight_len(), 0);
        assert!(matches!(d.admit(1, "api", "Error: boom"), Admission::Admitted(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forgotten_ticket_is_admitted_after_release() {
        let d = dedup(DedupConfig::default());
        let t = ticket(d.admit(1, "api", "Error: boom"));
        d.forget(&t);
        assert_eq!(d.recent_len(), 0);
        // Forgetting leaves the single-flight guard in place.
        assert!(matches!(d.admit(1, "api", "Error: boom"), Admission::InFlight { .. }));

        d.release(t);
        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert!(matches!(d.admit(1, "api", "Error: boom"), Admission::Admitted(_)));
    }

    #[tokio::test]
    async fn test_concurrent_arrivals_admit_exactly_once() {
        let d = dedup(DedupConfig::default());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let d = Arc::clone(&d);
                tokio::spawn(async move { d.admit(7, "worker-1", "Error: disk full") })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), Admission::Admitted(_)) {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[test]
    fn test_blank_message_skips_tables() {
        let d = ErrorDeduplicator::new(DedupConfig::default());
        assert_eq!(d.admit(1, "api", "   \n"), Admission::Empty);
        assert_eq!(d.recent_len(), 0);
        assert_eq!(d.in_flight_len(), 0);
    }

    #[test]
    fn test_distinct_errors_are_independent() {
        let d = ErrorDeduplicator::new(DedupConfig::default());
        assert!(matches!(d.admit(1, "api", "Error: a"), Admission::Admitted(_)));
        assert!(matches!(d.admit(1, "api", "Error: b"), Admission::Admitted(_)));
        assert!(matches!(d.admit(2, "cron", "Error: a"), Admission::Admitted(_)));
        assert_eq!(d.in_flight_len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_expired_entries() {
        let d = dedup(DedupConfig::default());
        let _ = d.admit(1, "api", "Error: old");
        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        let _ = d.admit(1, "api", "Error: new");
        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(d.sweep(), 1);
        assert_eq!(d.recent_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_runs_and_stops() {
        let d = dedup(DedupConfig::default());
        let _ = d.admit(1, "api", "Error: old");

        let token = CancellationToken::new();
        let handle = Arc::clone(&d).spawn_sweeper(token.clone());

        tokio::time::sleep(Duration::from_secs(6 * 60 + 1)).await;
        assert_eq!(d.recent_len(), 0);

        token.cancel();
        handle.await.unwrap();
    }
}
