//! Process supervisor abstraction.
//!
//! The watchdog never manages processes itself. It consumes a supervisor's
//! log and lifecycle events and asks it for point-in-time process listings.

pub mod pm2;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::SupervisorError;

pub use pm2::Pm2Supervisor;

/// Run state reported by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Online,
    Stopped,
    Errored,
    #[serde(other)]
    Unknown,
}

impl ProcessStatus {
    /// Map a supervisor status string.
    #[must_use]
    pub fn parse(status: &str) -> Self {
        match status {
            "online" => Self::Online,
            "stopped" | "stopping" => Self::Stopped,
            "errored" => Self::Errored,
            _ => Self::Unknown,
        }
    }
}

/// One supervised process, as of the listing that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub id: u32,
    pub name: String,
    pub cwd: Option<PathBuf>,
    pub status: ProcessStatus,
    pub memory_bytes: u64,
    pub cpu_percent: f64,
    #[serde(with = "duration_secs")]
    pub uptime: Duration,
}

/// Which output stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Lifecycle transitions the pipeline reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleKind {
    Online,
    Restart,
    Exit,
}

/// An event from the supervisor's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Log {
        process_id: u32,
        process_name: String,
        stream: StreamKind,
        line: String,
    },
    Lifecycle {
        process_id: u32,
        process_name: String,
        kind: LifecycleKind,
    },
}

/// Connection to a process supervisor.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Open the event stream. The receiver yields `None` once the stream ends.
    async fn connect(&self) -> Result<mpsc::Receiver<SupervisorEvent>, SupervisorError>;

    /// Close the event stream. Safe to call when not connected.
    async fn disconnect(&self);

    /// Fetch a fresh listing of every supervised process.
    async fn list_processes(&self) -> Result<Vec<ProcessRecord>, SupervisorError>;
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse() {
        assert_eq!(ProcessStatus::parse("online"), ProcessStatus::Online);
        assert_eq!(ProcessStatus::parse("stopping"), ProcessStatus::Stopped);
        assert_eq!(ProcessStatus::parse("errored"), ProcessStatus::Errored);
        assert_eq!(ProcessStatus::parse("launching"), ProcessStatus::Unknown);
    }

    #[test]
    fn test_record_serializes_uptime_as_seconds() {
        let record = fake::record(2, "api", ProcessStatus::Online);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["uptime"], 60);
        assert_eq!(json["status"], "online");
    }
}
