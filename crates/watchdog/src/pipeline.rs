//! Alert pipeline.
//!
//! ```text
//! supervisor event ─▶ LogBufferStore ─▶ classify ─▶ ErrorDeduplicator
//!                                                        │ admitted
//!                                                        ▼
//!                     RetryQueue ◀─ failure ─ sender ◀─ context ◀─ ProcessDirectory
//! ```
//!
//! Each component owns its state. The pipeline only moves immutable values
//! (`ErrorContext`, process listings) between them.

use notify::{ErrorContext, Severity};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::LogBufferStore;
use crate::classify::{extract_stack_trace, is_error_line};
use crate::config::WatchdogConfig;
use crate::dedup::{Admission, AdmissionTicket, ErrorDeduplicator};
use crate::directory::ProcessDirectory;
use crate::error::SupervisorError;
use crate::metrics::{AlertCounters, MetricsSnapshot};
use crate::repo::RepoResolver;
use crate::retry::{QueueOutcome, RetryQueue};
use crate::sender::AlertSender;
use crate::supervisor::{LifecycleKind, ProcessRecord, ProcessStatus, Supervisor, SupervisorEvent};

/// Message raised when a process exits in the errored state.
pub const ERRORED_EXIT_MESSAGE: &str = "Process exited with errored status";

/// Why an error signal was dropped without alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Blank error text
    EmptyMessage,
    /// Process id absent from the current directory
    UnknownProcess,
}

/// What happened to one error signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertOutcome {
    Sent,
    /// Delivery failed; the alert is now with the retry queue
    Queued(QueueOutcome),
    Debounced,
    InFlight,
    Dropped(DropReason),
}

/// Result of a health probe.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct AlertPipeline {
    context_lines: usize,
    context_delay: Duration,
    buffers: LogBufferStore,
    dedup: Arc<ErrorDeduplicator>,
    directory: ProcessDirectory,
    retry: Arc<RetryQueue>,
    sender: Arc<dyn AlertSender>,
    repos: RepoResolver,
    counters: AlertCounters,
}

impl AlertPipeline {
    /// Build every component from `config`.
    #[must_use]
    pub fn new(
        config: &WatchdogConfig,
        supervisor: Arc<dyn Supervisor>,
        sender: Arc<dyn AlertSender>,
    ) -> Self {
        Self::with_repo_resolver(config, supervisor, sender, RepoResolver::default())
    }

    #[must_use]
    pub fn with_repo_resolver(
        config: &WatchdogConfig,
        supervisor: Arc<dyn Supervisor>,
        sender: Arc<dyn AlertSender>,
        repos: RepoResolver,
    ) -> Self {
        Self {
            context_lines: config.buffer.context_lines,
            context_delay: config.buffer.context_delay,
            buffers: LogBufferStore::new(config.buffer.capacity),
            dedup: Arc::new(ErrorDeduplicator::new(config.dedup.clone())),
            directory: ProcessDirectory::new(supervisor, config.directory.ttl),
            retry: Arc::new(RetryQueue::new(config.retry.clone(), Arc::clone(&sender))),
            sender,
            repos,
            counters: AlertCounters::default(),
        }
    }

    #[must_use]
    pub fn buffers(&self) -> &LogBufferStore {
        &self.buffers
    }

    #[must_use]
    pub fn dedup(&self) -> &Arc<ErrorDeduplicator> {
        &self.dedup
    }

    #[must_use]
    pub fn directory(&self) -> &ProcessDirectory {
        &self.directory
    }

    #[must_use]
    pub fn retry_queue(&self) -> &Arc<RetryQueue> {
        &self.retry
    }

    /// Route one supervisor event.
    ///
    /// Log lines are buffered synchronously. Error lines and lifecycle events
    /// continue on a spawned task, whose handle is returned.
    pub fn handle_event(self: &Arc<Self>, event: SupervisorEvent) -> Option<JoinHandle<()>> {
        match event {
            SupervisorEvent::Log {
                process_id,
                process_name,
                line,
                ..
            } => {
                self.buffers.append(process_id, line.as_str());
                if !is_error_line(&line) {
                    return None;
                }
                let this = Arc::clone(self);
                Some(tokio::spawn(async move {
                    if let Err(e) = this
                        .report_error(process_id, &process_name, &line, Severity::Critical)
                        .await
                    {
                        warn!(process_id, process_name = %process_name, error = %e, "Could not resolve process for error alert");
                    }
                }))
            }
            SupervisorEvent::Lifecycle {
                process_id,
                process_name,
                kind,
            } => {
                let this = Arc::clone(self);
                Some(tokio::spawn(async move {
                    this.handle_lifecycle(process_id, &process_name, kind).await;
                }))
            }
        }
    }

    /// Turn an error signal into an alert unless it is a duplicate.
    ///
    /// A failed directory lookup is returned to the caller and clears the
    /// debounce entry, so the same error alerts once the supervisor is back.
    /// Delivery failures are absorbed by the retry queue.
    pub async fn report_error(
        &self,
        process_id: u32,
        process_name: &str,
        message: &str,
        severity: Severity,
    ) -> Result<AlertOutcome, SupervisorError> {
        let ticket = match self.dedup.admit(process_id, process_name, message) {
            Admission::Admitted(ticket) => ticket,
            Admission::Debounced { .. } => {
                self.counters.debounced();
                return Ok(AlertOutcome::Debounced);
            }
            Admission::InFlight { .. } => {
                self.counters.in_flight_suppressed();
                return Ok(AlertOutcome::InFlight);
            }
            Admission::Empty => {
                self.counters.dropped();
                warn!(process_id, process_name, "Dropped error with empty message");
                return Ok(AlertOutcome::Dropped(DropReason::EmptyMessage));
            }
        };

        let result = self.alert(&ticket, message, severity).await;
        if result.is_err() {
            self.dedup.forget(&ticket);
        }
        self.dedup.release(ticket);
        result
    }

    async fn alert(
        &self,
        ticket: &AdmissionTicket,
        message: &str,
        severity: Severity,
    ) -> Result<AlertOutcome, SupervisorError> {
        let process_id = ticket.process_id;
        let Some(record) = self.directory.find(process_id).await? else {
            self.counters.dropped();
            warn!(process_id, "Dropped error for process missing from directory");
            return Ok(AlertOutcome::Dropped(DropReason::UnknownProcess));
        };

        // Frames of a multi-line error arrive as separate log events.
        if !self.context_delay.is_zero() {
            tokio::time::sleep(self.context_delay).await;
        }
        let ctx = self.build_context(&record, message, severity).await;

        match self.sender.send(&ctx).await {
            Ok(()) => {
                self.counters.sent();
                info!(
                    process_id,
                    process_name = %record.name,
                    fingerprint = %ticket.fingerprint,
                    "Alert sent"
                );
                Ok(AlertOutcome::Sent)
            }
            Err(e) => {
                warn!(
                    process_id,
                    process_name = %record.name,
                    error = %e,
                    "Alert delivery failed"
                );
                let outcome = self.retry.queue_alert(ctx, &e.to_string());
                if outcome == QueueOutcome::Queued {
                    self.counters.queued();
                }
                Ok(AlertOutcome::Queued(outcome))
            }
        }
    }

    async fn build_context(
        &self,
        record: &ProcessRecord,
        message: &str,
        severity: Severity,
    ) -> ErrorContext {
        let recent = self.buffers.tail(record.id, self.context_lines);
        let stack = extract_stack_trace(message, &recent);
        let repo = self.repos.resolve(record.cwd.as_deref()).await;

        ErrorContext::new(record.id, record.name.clone(), message)
            .with_stack(stack)
            .with_recent_logs(recent)
            .with_repository(repo.repository, repo.branch)
            .with_severity(severity)
    }

    /// React to a process lifecycle transition.
    pub async fn handle_lifecycle(&self, process_id: u32, process_name: &str, kind: LifecycleKind) {
        match kind {
            LifecycleKind::Online => {
                debug!(process_id, process_name, "Process online");
            }
            LifecycleKind::Restart => {
                info!(process_id, process_name, "Process restarted");
                self.directory.invalidate().await;
            }
            LifecycleKind::Exit => {
                info!(process_id, process_name, "Process exited");
                let processes = match self.directory.refresh().await {
                    Ok(processes) => processes,
                    Err(e) => {
                        warn!(process_id, error = %e, "Could not refresh directory after exit");
                        return;
                    }
                };

                match processes.iter().find(|p| p.id == process_id) {
                    None => {
                        self.buffers.evict(process_id);
                    }
                    Some(record) if record.status == ProcessStatus::Errored => {
                        if let Err(e) = self
                            .report_error(
                                process_id,
                                &record.name,
                                ERRORED_EXIT_MESSAGE,
                                Severity::Warning,
                            )
                            .await
                        {
                            warn!(process_id, error = %e, "Could not alert on errored exit");
                        }
                    }
                    Some(_) => {}
                }
            }
        }
    }

    /// Consume events until the stream ends or `shutdown` fires.
    ///
    /// Returns [`SupervisorError::StreamClosed`] if the supervisor hung up.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<SupervisorEvent>,
        shutdown: CancellationToken,
    ) -> Result<(), SupervisorError> {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Alert pipeline stopping");
                    return Ok(());
                }
                event = events.recv() => match event {
                    Some(event) => {
                        self.handle_event(event);
                    }
                    None => {
                        warn!("Supervisor event stream closed");
                        return Err(SupervisorError::StreamClosed);
                    }
                }
            }
        }
    }

    /// Current process directory, served from the cache when fresh.
    pub async fn status(&self) -> Result<Arc<Vec<ProcessRecord>>, SupervisorError> {
        self.directory.get().await
    }

    /// Whether the supervisor can currently be listed.
    pub async fn health(&self) -> HealthReport {
        match self.directory.get().await {
            Ok(processes) => HealthReport {
                healthy: true,
                processes: Some(processes.len()),
                error: None,
            },
            Err(e) => HealthReport {
                healthy: false,
                processes: None,
                error: Some(e.to_string()),
            },
        }
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        let cache = self.directory.stats();
        MetricsSnapshot {
            queue_size: self.retry.len(),
            dead_letter_size: self.retry.dead_letter_len(),
            cache_hits: cache.hits,
            cache_misses: cache.misses,
            cache_fetches: cache.fetches,
            retries_succeeded: self.retry.retries_succeeded(),
            dead_lettered: self.retry.dead_lettered_total(),
            buffered_processes: self.buffers.process_count(),
            ..MetricsSnapshot::default()
        }
        .with_alerts(&self.counters)
    }
}
