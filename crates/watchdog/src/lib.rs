//! Supervised process watchdog.
//!
//! Watches the log and lifecycle streams of a process supervisor and turns
//! error conditions into alerts:
//!
//! - [`buffer`]: per-process ring buffers of recent output
//! - [`classify`]: error line detection and stack trace extraction
//! - [`dedup`]: debounce window and single-flight admission
//! - [`directory`]: TTL cache over the supervisor's process listing
//! - [`retry`]: retry queue with exponential backoff and a dead-letter store
//! - [`rate_limit`]: fixed-window limiter for the HTTP surface
//! - [`pipeline`]: wires the above together
//!
//! Delivery itself is done by the `notify` crate behind [`AlertSender`].

pub mod buffer;
pub mod classify;
pub mod config;
pub mod dedup;
pub mod directory;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod rate_limit;
pub mod repo;
pub mod retry;
pub mod sender;
pub mod server;
pub mod service;
pub mod supervisor;

pub use config::WatchdogConfig;
pub use error::{ConfigError, SupervisorError};
pub use pipeline::{AlertOutcome, AlertPipeline, DropReason};
pub use sender::AlertSender;
pub use service::WatchdogService;
pub use supervisor::{
    LifecycleKind, Pm2Supervisor, ProcessRecord, ProcessStatus, StreamKind, Supervisor,
    SupervisorEvent,
};
