//! Starts and stops the pipeline and its background tasks as one unit.

use anyhow::{Context, Result};
use std::future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::WatchdogConfig;
use crate::error::SupervisorError;
use crate::pipeline::AlertPipeline;
use crate::sender::AlertSender;
use crate::server::{run_server, ServerState};
use crate::supervisor::Supervisor;

/// Owns every long-running task of the watchdog.
pub struct WatchdogService {
    config: WatchdogConfig,
    supervisor: Arc<dyn Supervisor>,
    pipeline: Arc<AlertPipeline>,
    shutdown: CancellationToken,
    events: Option<JoinHandle<Result<(), SupervisorError>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl WatchdogService {
    #[must_use]
    pub fn new(
        config: WatchdogConfig,
        supervisor: Arc<dyn Supervisor>,
        sender: Arc<dyn AlertSender>,
    ) -> Self {
        let pipeline = Arc::new(AlertPipeline::new(
            &config,
            Arc::clone(&supervisor),
            sender,
        ));
        Self {
            config,
            supervisor,
            pipeline,
            shutdown: CancellationToken::new(),
            events: None,
            tasks: Vec::new(),
        }
    }

    #[must_use]
    pub fn pipeline(&self) -> &Arc<AlertPipeline> {
        &self.pipeline
    }

    /// Connect to the supervisor, then start the event loop, the dedup
    /// sweeper and the retry processor.
    ///
    /// # Errors
    ///
    /// Returns an error if the supervisor connection fails.
    pub async fn start(&mut self) -> Result<()> {
        let events = self
            .supervisor
            .connect()
            .await
            .context("Failed to connect to process supervisor")?;

        let pipeline = Arc::clone(&self.pipeline);
        self.events = Some(tokio::spawn(pipeline.run(events, self.shutdown.child_token())));

        self.tasks.push(
            Arc::clone(self.pipeline.dedup()).spawn_sweeper(self.shutdown.child_token()),
        );
        self.tasks.push(
            Arc::clone(self.pipeline.retry_queue()).spawn_processor(self.shutdown.child_token()),
        );

        info!(
            buffer_capacity = self.config.buffer.capacity,
            debounce_secs = self.config.dedup.debounce_window.as_secs(),
            max_retries = self.config.retry.max_retries,
            "Watchdog started"
        );
        Ok(())
    }

    /// Start the HTTP status server and its rate limiter sweepers.
    pub fn serve_http(&mut self) {
        let state = Arc::new(ServerState::new(
            Arc::clone(&self.pipeline),
            self.config.rate_limit.clone(),
        ));
        self.tasks.extend(state.spawn_sweepers(&self.shutdown));

        let addr = self.config.server.bind;
        let token = self.shutdown.child_token();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = run_server(state, addr, token).await {
                error!(error = %e, "Status server stopped");
            }
        }));
    }

    /// Wait for the supervisor event stream to end.
    ///
    /// Never completes while the stream is healthy, so it is meant to be
    /// raced against a shutdown signal.
    ///
    /// # Errors
    ///
    /// Returns the reason the stream ended.
    pub async fn closed(&mut self) -> Result<()> {
        let Some(handle) = self.events.as_mut() else {
            return future::pending().await;
        };
        let result = handle.await;
        self.events = None;
        match result {
            Ok(result) => result.context("Supervisor event stream ended"),
            Err(e) => Err(e).context("Event loop task failed"),
        }
    }

    /// Cancel every task and wait for it to finish. Pending retries are
    /// abandoned in memory.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        self.supervisor.disconnect().await;

        if let Some(events) = self.events.take() {
            match events.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Event loop ended with error"),
                Err(e) => warn!(error = %e, "Event loop task failed"),
            }
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task failed");
            }
        }

        info!(
            pending_retries = self.pipeline.retry_queue().len(),
            dead_letters = self.pipeline.retry_queue().dead_letter_len(),
            "Watchdog stopped"
        );
    }
}
