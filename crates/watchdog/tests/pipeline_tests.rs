//! End-to-end alert flow with in-memory supervisor and sender.

use async_trait::async_trait;
use notify::{ChannelError, ErrorContext};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use watchdog::pipeline::AlertOutcome;
use watchdog::retry::QueueOutcome;
use watchdog::{
    AlertPipeline, AlertSender, LifecycleKind, ProcessRecord, ProcessStatus, StreamKind,
    Supervisor, SupervisorError, SupervisorEvent, WatchdogConfig,
};

struct StaticSupervisor {
    processes: Vec<ProcessRecord>,
    list_calls: AtomicUsize,
}

impl StaticSupervisor {
    fn new(processes: Vec<ProcessRecord>) -> Self {
        Self {
            processes,
            list_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Supervisor for StaticSupervisor {
    async fn connect(&self) -> Result<mpsc::Receiver<SupervisorEvent>, SupervisorError> {
        Err(SupervisorError::NotConnected)
    }

    async fn disconnect(&self) {}

    async fn list_processes(&self) -> Result<Vec<ProcessRecord>, SupervisorError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.processes.clone())
    }
}

#[derive(Default)]
struct CollectingSender {
    fail: AtomicBool,
    attempts: AtomicUsize,
    delivered: Mutex<Vec<ErrorContext>>,
}

#[async_trait]
impl AlertSender for CollectingSender {
    async fn send(&self, ctx: &ErrorContext) -> Result<(), ChannelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ChannelError::Timeout {
                after: Duration::from_secs(10),
            });
        }
        self.delivered.lock().unwrap().push(ctx.clone());
        Ok(())
    }
}

fn worker(id: u32, name: &str) -> ProcessRecord {
    ProcessRecord {
        id,
        name: name.to_string(),
        cwd: None,
        status: ProcessStatus::Online,
        memory_bytes: 64 * 1024 * 1024,
        cpu_percent: 1.5,
        uptime: Duration::from_secs(3600),
    }
}

fn stderr(id: u32, name: &str, line: &str) -> SupervisorEvent {
    SupervisorEvent::Log {
        process_id: id,
        process_name: name.to_string(),
        stream: StreamKind::Stderr,
        line: line.to_string(),
    }
}

fn stdout(id: u32, name: &str, line: &str) -> SupervisorEvent {
    SupervisorEvent::Log {
        process_id: id,
        process_name: name.to_string(),
        stream: StreamKind::Stdout,
        line: line.to_string(),
    }
}

fn setup() -> (Arc<AlertPipeline>, Arc<StaticSupervisor>, Arc<CollectingSender>) {
    let supervisor = Arc::new(StaticSupervisor::new(vec![worker(1, "worker-1")]));
    let sender = Arc::new(CollectingSender::default());
    let pipeline = Arc::new(AlertPipeline::new(
        &WatchdogConfig::default(),
        supervisor.clone(),
        sender.clone(),
    ));
    (pipeline, supervisor, sender)
}

async fn emit(pipeline: &Arc<AlertPipeline>, event: SupervisorEvent) {
    if let Some(handle) = pipeline.handle_event(event) {
        handle.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_disk_full_alerted_once_per_debounce_window() {
    let (pipeline, _supervisor, sender) = setup();

    emit(&pipeline, stderr(1, "worker-1", "writing chunk 41")).await;
    emit(&pipeline, stderr(1, "worker-1", "Error: disk full")).await;

    {
        let delivered = sender.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        let ctx = &delivered[0];
        assert_eq!(ctx.process_id, 1);
        assert_eq!(ctx.process_name, "worker-1");
        assert_eq!(ctx.message, "Error: disk full");
        assert_eq!(ctx.recent_logs, ["writing chunk 41", "Error: disk full"]);
    }

    tokio::time::sleep(Duration::from_secs(10)).await;
    emit(&pipeline, stderr(1, "worker-1", "Error: disk full")).await;
    assert_eq!(sender.delivered.lock().unwrap().len(), 1);
    assert_eq!(pipeline.metrics().alerts_debounced, 1);

    tokio::time::sleep(Duration::from_secs(5 * 60 + 1 - 10)).await;
    emit(&pipeline, stderr(1, "worker-1", "Error: disk full")).await;
    assert_eq!(sender.delivered.lock().unwrap().len(), 2);

    // Every line stays in the buffer whether or not it alerted.
    assert_eq!(pipeline.buffers().snapshot(1).len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_interleaved_duplicates_admit_once() {
    let (pipeline, _supervisor, sender) = setup();

    let handles: Vec<_> = (0..5)
        .filter_map(|_| pipeline.handle_event(stderr(1, "worker-1", "FATAL: out of memory")))
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(sender.delivered.lock().unwrap().len(), 1);
    let metrics = pipeline.metrics();
    assert_eq!(
        metrics.alerts_debounced + metrics.alerts_in_flight_suppressed,
        4
    );
}

#[tokio::test(start_paused = true)]
async fn test_error_storm_fetches_directory_once() {
    let (pipeline, supervisor, _sender) = setup();

    for i in 0..20 {
        emit(&pipeline, stderr(1, "worker-1", &format!("Error: request {i} failed"))).await;
    }
    assert_eq!(supervisor.list_calls.load(Ordering::SeqCst), 1);
    assert_eq!(pipeline.metrics().cache_hits, 19);
}

#[tokio::test(start_paused = true)]
async fn test_failed_delivery_retries_then_dead_letters() {
    let (pipeline, _supervisor, sender) = setup();
    sender.fail.store(true, Ordering::SeqCst);

    let outcome = pipeline
        .report_error(1, "worker-1", "Error: disk full", notify::Severity::Critical)
        .await
        .unwrap();
    assert_eq!(outcome, AlertOutcome::Queued(QueueOutcome::Queued));

    let token = CancellationToken::new();
    let processor = Arc::clone(pipeline.retry_queue()).spawn_processor(token.clone());

    // Retries at 1, 3, 7, 15 and 31 seconds after queueing.
    tokio::time::sleep(Duration::from_secs(32)).await;

    let metrics = pipeline.metrics();
    assert_eq!(sender.attempts.load(Ordering::SeqCst), 1 + 5);
    assert_eq!(metrics.queue_size, 0);
    assert_eq!(metrics.dead_letter_size, 1);
    assert_eq!(metrics.dead_lettered, 1);

    let dead = pipeline.retry_queue().dead_letter_entries();
    assert_eq!(dead[0].context.process_name, "worker-1");
    assert_eq!(dead[0].attempts, 5);

    token.cancel();
    processor.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_recovered_channel_drains_queue() {
    let (pipeline, _supervisor, sender) = setup();
    sender.fail.store(true, Ordering::SeqCst);
    pipeline
        .report_error(1, "worker-1", "Error: disk full", notify::Severity::Critical)
        .await
        .unwrap();

    let token = CancellationToken::new();
    let processor = Arc::clone(pipeline.retry_queue()).spawn_processor(token.clone());
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(pipeline.metrics().queue_size, 1);

    sender.fail.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(2)).await;

    let metrics = pipeline.metrics();
    assert_eq!(metrics.queue_size, 0);
    assert_eq!(metrics.retries_succeeded, 1);
    assert_eq!(sender.delivered.lock().unwrap().len(), 1);

    token.cancel();
    processor.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_run_consumes_stream_until_cancelled() {
    let (pipeline, _supervisor, sender) = setup();
    let (tx, rx) = mpsc::channel(16);
    let token = CancellationToken::new();
    let run = tokio::spawn(Arc::clone(&pipeline).run(rx, token.clone()));

    tx.send(stderr(1, "worker-1", "[ERROR] payment failed"))
        .await
        .unwrap();
    tx.send(SupervisorEvent::Lifecycle {
        process_id: 1,
        process_name: "worker-1".to_string(),
        kind: LifecycleKind::Online,
    })
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(sender.delivered.lock().unwrap().len(), 1);

    token.cancel();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_error_on_stdout_is_alerted() {
    let (pipeline, _supervisor, sender) = setup();

    emit(&pipeline, stdout(1, "worker-1", "request handled")).await;
    emit(&pipeline, stdout(1, "worker-1", "[ERROR] upstream refused connection")).await;

    let delivered = sender.delivered.lock().unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].message, "[ERROR] upstream refused connection");
    assert_eq!(
        delivered[0].recent_logs,
        ["request handled", "[ERROR] upstream refused connection"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_trace_split_across_events_reaches_alert() {
    let (pipeline, _supervisor, sender) = setup();
    let (tx, rx) = mpsc::channel(16);
    let token = CancellationToken::new();
    let run = tokio::spawn(Arc::clone(&pipeline).run(rx, token.clone()));

    tx.send(stderr(1, "worker-1", "Error: boom")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    for frame in ["    at a (x.js:1:1)", "    at b (y.js:2:2)"] {
        tx.send(stderr(1, "worker-1", frame)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    {
        let delivered = sender.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        let stack = delivered[0].stack.as_deref().unwrap();
        assert!(stack.contains("x.js:1:1"));
        assert!(stack.contains("y.js:2:2"));
    }

    token.cancel();
    assert!(run.await.unwrap().is_ok());
}
