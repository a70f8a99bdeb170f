//! PM2 supervisor adapter.
//!
//! Listings come from `pm2 jlist`. Events come from a long-running
//! `pm2 logs --json --lines 0`, one JSON object per stdout line.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::{LifecycleKind, ProcessRecord, ProcessStatus, StreamKind, Supervisor, SupervisorEvent};
use crate::error::SupervisorError;

/// Buffered events between the log reader and the pipeline.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Talks to PM2 through its CLI.
pub struct Pm2Supervisor {
    bin: String,
    child: Mutex<Option<Child>>,
}

impl Pm2Supervisor {
    #[must_use]
    pub fn new(bin: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            child: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Supervisor for Pm2Supervisor {
    async fn connect(&self) -> Result<mpsc::Receiver<SupervisorEvent>, SupervisorError> {
        let mut guard = self.child.lock().await;
        if let Some(mut old) = guard.take() {
            if let Err(e) = old.kill().await {
                debug!(error = %e, "Previous PM2 log stream already stopped");
            }
        }

        let command = format!("{} logs --json --lines 0", self.bin);
        let mut child = Command::new(&self.bin)
            .args(["logs", "--json", "--lines", "0"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                command: command.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or(SupervisorError::StreamClosed)?;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        for event in parse_log_line(&line) {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Failed to read PM2 log stream");
                        break;
                    }
                }
            }
            info!("PM2 log stream ended");
        });

        *guard = Some(child);
        info!(command = %command, "Connected to PM2 log stream");
        Ok(rx)
    }

    async fn disconnect(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "PM2 log stream already stopped");
            }
            info!("Disconnected from PM2");
        }
    }

    async fn list_processes(&self) -> Result<Vec<ProcessRecord>, SupervisorError> {
        let command = format!("{} jlist", self.bin);
        let output = Command::new(&self.bin)
            .arg("jlist")
            .output()
            .await
            .map_err(|source| SupervisorError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(SupervisorError::CommandFailed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        parse_jlist(&String::from_utf8_lossy(&output.stdout), now_ms)
    }
}

// =============================================================================
// PM2 JSON formats
// =============================================================================

#[derive(Debug, Deserialize)]
struct JlistEntry {
    pm_id: u32,
    name: String,
    #[serde(default)]
    monit: Option<JlistMonit>,
    #[serde(default)]
    pm2_env: Option<JlistEnv>,
}

#[derive(Debug, Default, Deserialize)]
struct JlistMonit {
    #[serde(default)]
    memory: u64,
    #[serde(default)]
    cpu: f64,
}

#[derive(Debug, Default, Deserialize)]
struct JlistEnv {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    pm_cwd: Option<PathBuf>,
    /// Epoch milliseconds of the last start
    #[serde(default)]
    pm_uptime: Option<i64>,
}

/// Decode `pm2 jlist` output.
///
/// PM2 sometimes prints warnings before the JSON array, so parsing starts at
/// the first `[`.
pub(crate) fn parse_jlist(raw: &str, now_ms: i64) -> Result<Vec<ProcessRecord>, SupervisorError> {
    let json = raw.find('[').map_or(raw, |start| &raw[start..]);
    let entries: Vec<JlistEntry> = serde_json::from_str(json)?;

    Ok(entries
        .into_iter()
        .map(|entry| {
            let monit = entry.monit.unwrap_or_default();
            let env = entry.pm2_env.unwrap_or_default();
            let status = env
                .status
                .as_deref()
                .map_or(ProcessStatus::Unknown, ProcessStatus::parse);
            let uptime = match (status, env.pm_uptime) {
                (ProcessStatus::Online, Some(started)) => {
                    Duration::from_millis(u64::try_from(now_ms - started).unwrap_or(0))
                }
                _ => Duration::ZERO,
            };

            ProcessRecord {
                id: entry.pm_id,
                name: entry.name,
                cwd: env.pm_cwd,
                status,
                memory_bytes: monit.memory,
                cpu_percent: monit.cpu,
                uptime,
            }
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct LogLine {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    process_id: Option<u32>,
    #[serde(default)]
    app_name: Option<String>,
}

/// Decode one line of `pm2 logs --json`.
///
/// A log message spanning several lines yields one event per line. Lines
/// that do not describe a known process are skipped.
pub(crate) fn parse_log_line(raw: &str) -> Vec<SupervisorEvent> {
    let parsed: LogLine = match serde_json::from_str(raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(error = %e, "Skipping undecodable PM2 log line");
            return vec![];
        }
    };

    let (Some(process_id), Some(process_name)) = (parsed.process_id, parsed.app_name) else {
        debug!(kind = %parsed.kind, "Skipping PM2 event without process identity");
        return vec![];
    };

    let stream = match parsed.kind.as_str() {
        "out" => StreamKind::Stdout,
        "err" => StreamKind::Stderr,
        "process_event" => {
            let kind = match parsed.status.as_deref() {
                Some("online") => LifecycleKind::Online,
                Some("restart" | "restart overlimit") => LifecycleKind::Restart,
                Some("exit" | "stop" | "delete") => LifecycleKind::Exit,
                _ => return vec![],
            };
            return vec![SupervisorEvent::Lifecycle {
                process_id,
                process_name,
                kind,
            }];
        }
        _ => return vec![],
    };

    parsed
        .message
        .unwrap_or_default()
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| SupervisorEvent::Log {
            process_id,
            process_name: process_name.clone(),
            stream,
            line: line.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const JLIST: &str = r#"[
        {"pid": 4242, "name": "worker-1", "pm_id": 0,
         "monit": {"memory": 52428800, "cpu": 1.5},
         "pm2_env": {"status": "online", "pm_cwd": "/srv/worker", "pm_uptime": 1000}},
        {"pid": 0, "name": "cron", "pm_id": 1,
         "monit": {"memory": 0, "cpu": 0},
         "pm2_env": {"status": "errored", "pm_uptime": 1000}}
    ]"#;

    #[test]
    fn test_parse_jlist() {
        let records = parse_jlist(JLIST, 61_000).unwrap();
        assert_eq!(records.len(), 2);

        assert_eq!(records[0].id, 0);
        assert_eq!(records[0].name, "worker-1");
        assert_eq!(records[0].status, ProcessStatus::Online);
        assert_eq!(records[0].cwd.as_deref(), Some(std::path::Path::new("/srv/worker")));
        assert_eq!(records[0].memory_bytes, 52_428_800);
        assert_eq!(records[0].uptime, Duration::from_secs(60));

        assert_eq!(records[1].status, ProcessStatus::Errored);
        assert_eq!(records[1].uptime, Duration::ZERO);
        assert!(records[1].cwd.is_none());
    }

    #[test]
    fn test_parse_jlist_skips_preamble() {
        let raw = format!(">>>> In-memory PM2 is out-of-date\n{JLIST}");
        assert_eq!(parse_jlist(&raw, 0).unwrap().len(), 2);
    }

    #[test]
    fn test_parse_jlist_garbage() {
        assert!(matches!(
            parse_jlist("not json", 0),
            Err(SupervisorError::Parse(_))
        ));
    }

    #[test]
    fn test_parse_stderr_line() {
        let events = parse_log_line(
            r#"{"message":"Error: disk full\n","timestamp":"2024-01-01","type":"err","process_id":3,"app_name":"worker-1"}"#,
        );
        assert_eq!(
            events,
            vec![SupervisorEvent::Log {
                process_id: 3,
                process_name: "worker-1".to_string(),
                stream: StreamKind::Stderr,
                line: "Error: disk full".to_string(),
            }]
        );
    }

    #[test]
    fn test_parse_multiline_message() {
        let events = parse_log_line(
            r#"{"message":"Error: boom\n    at main (app.js:1:1)\n","type":"out","process_id":0,"app_name":"api"}"#,
        );
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_parse_process_event() {
        let events = parse_log_line(
            r#"{"type":"process_event","status":"exit","process_id":2,"app_name":"api"}"#,
        );
        assert_eq!(
            events,
            vec![SupervisorEvent::Lifecycle {
                process_id: 2,
                process_name: "api".to_string(),
                kind: LifecycleKind::Exit,
            }]
        );
    }

    #[test]
    fn test_parse_skips_unusable_lines() {
        assert!(parse_log_line("garbage").is_empty());
        assert!(parse_log_line(r#"{"type":"PM2","message":"x","process_id":0,"app_name":"PM2"}"#).is_empty());
        assert!(parse_log_line(r#"{"type":"out","message":"x"}"#).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reconnect_replaces_previous_stream() {
        // `true` ignores its arguments and exits with empty output.
        let supervisor = Pm2Supervisor::new("true");
        let mut first = supervisor.connect().await.unwrap();
        let mut second = supervisor.connect().await.unwrap();

        assert!(first.recv().await.is_none());
        assert!(second.recv().await.is_none());
        assert!(supervisor.child.lock().await.is_some());

        supervisor.disconnect().await;
        assert!(supervisor.child.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_reports_missing_binary() {
        let supervisor = Pm2Supervisor::new("/nonexistent/pm2");
        let err = supervisor.connect().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert!(supervisor.child.lock().await.is_none());
    }
}
