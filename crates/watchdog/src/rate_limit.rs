//! Fixed-window request limiter for the HTTP surface.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct WindowCounter {
    count: u32,
    reset_at: Instant,
}

/// Verdict for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Whole seconds until the window resets; set only when rejected
    pub retry_after_secs: Option<u64>,
}

impl RateLimitDecision {
    const ALLOWED: Self = Self {
        allowed: true,
        retry_after_secs: None,
    };
}

/// Per-identifier counters over a fixed window.
///
/// A window starts on the first request from an identifier and resets on
/// the first request after it ends. Expired counters linger until
/// [`sweep`](Self::sweep) removes them.
pub struct RateLimiter {
    window: Duration,
    entries: Mutex<HashMap<String, WindowCounter>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, WindowCounter>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count a request from `identifier` and decide whether it may proceed.
    pub fn check_limit(&self, identifier: &str, max_requests: u32) -> RateLimitDecision {
        let now = Instant::now();
        let mut entries = self.entries();

        let counter = entries
            .entry(identifier.to_string())
            .or_insert_with(|| WindowCounter {
                count: 0,
                reset_at: now + self.window,
            });

        if now >= counter.reset_at {
            counter.count = 0;
            counter.reset_at = now + self.window;
        }

        if counter.count < max_requests {
            counter.count += 1;
            return RateLimitDecision::ALLOWED;
        }

        let remaining_ms = u64::try_from((counter.reset_at - now).as_millis()).unwrap_or(u64::MAX);
        let retry_after = remaining_ms.div_ceil(1000).max(1);
        debug!(identifier, retry_after, "Rate limit exceeded");
        RateLimitDecision {
            allowed: false,
            retry_after_secs: Some(retry_after),
        }
    }

    /// Remove counters whose window has ended.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, counter| counter.reset_at > now);
        before - entries.len()
    }

    /// Tracked identifiers, expired or not.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.entries().len()
    }

    /// Run [`sweep`](Self::sweep) every `interval` until cancelled.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.sweep();
                        if removed > 0 {
                            debug!(removed, "Swept expired rate limit windows");
                        }
                    }
                }
            }
        })
    }
}
