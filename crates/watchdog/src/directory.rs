//! Time-bounded cache over the supervisor's process listing.
//!
//! The whole listing lives in one slot. The slot lock is held across the
//! upstream fetch, so a burst of callers arriving on a cold or expired slot
//! waits for a single fetch instead of issuing one each.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::SupervisorError;
use crate::supervisor::{ProcessRecord, Supervisor};

/// A cached listing and when it was fetched.
struct CachedListing {
    processes: Arc<Vec<ProcessRecord>>,
    fetched_at: Instant,
}

impl CachedListing {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() >= ttl
    }
}

/// Hit, miss and fetch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub fetches: u64,
}

pub struct ProcessDirectory {
    supervisor: Arc<dyn Supervisor>,
    ttl: Duration,
    slot: Mutex<Option<CachedListing>>,
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
}

impl ProcessDirectory {
    #[must_use]
    pub fn new(supervisor: Arc<dyn Supervisor>, ttl: Duration) -> Self {
        Self {
            supervisor,
            ttl,
            slot: Mutex::new(None),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
        }
    }

    /// Current process listing, fetched upstream when the slot is empty or
    /// older than the TTL. A failed fetch is returned to the caller and
    /// leaves the slot untouched.
    pub async fn get(&self) -> Result<Arc<Vec<ProcessRecord>>, SupervisorError> {
        let mut slot = self.slot.lock().await;

        if let Some(cached) = slot.as_ref() {
            if !cached.is_expired(self.ttl) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(processes = cached.processes.len(), "Process directory cache hit");
                return Ok(Arc::clone(&cached.processes));
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.fetch_into(&mut slot).await
    }

    /// Fetch unconditionally and replace the slot.
    pub async fn refresh(&self) -> Result<Arc<Vec<ProcessRecord>>, SupervisorError> {
        let mut slot = self.slot.lock().await;
        self.fetch_into(&mut slot).await
    }

    async fn fetch_into(
        &self,
        slot: &mut Option<CachedListing>,
    ) -> Result<Arc<Vec<ProcessRecord>>, SupervisorError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        match self.supervisor.list_processes().await {
            Ok(processes) => {
                debug!(processes = processes.len(), "Fetched process directory");
                let processes = Arc::new(processes);
                *slot = Some(CachedListing {
                    processes: Arc::clone(&processes),
                    fetched_at: Instant::now(),
                });
                Ok(processes)
            }
            Err(e) => {
                warn!(error = %e, "Failed to fetch process directory");
                Err(e)
            }
        }
    }

    /// Look up one process by id.
    pub async fn find(&self, process_id: u32) -> Result<Option<ProcessRecord>, SupervisorError> {
        let processes = self.get().await?;
        Ok(processes.iter().find(|p| p.id == process_id).cloned())
    }

    /// Drop the cached listing so the next [`get`](Self::get) fetches.
    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
        debug!("Process directory cache invalidated");
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
        }
    }
}
