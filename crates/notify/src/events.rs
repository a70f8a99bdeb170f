//! Alert payload types for supervised process errors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity levels for alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational - normal operations
    Info,
    /// Warning - something needs attention
    Warning,
    /// Critical - immediate action required
    Critical,
}

impl Severity {
    /// Get the Discord embed color for this severity.
    #[must_use]
    pub const fn color(&self) -> u32 {
        match self {
            Self::Info => 0x0034_98db,     // Blue
            Self::Warning => 0x00f3_9c12,  // Orange
            Self::Critical => 0x00e7_4c3c, // Red
        }
    }

    /// Get the Slack attachment color for this severity.
    #[must_use]
    pub const fn hex(&self) -> &'static str {
        match self {
            Self::Info => "#3498db",
            Self::Warning => "#f39c12",
            Self::Critical => "#e74c3c",
        }
    }

    /// Get display name for this severity.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "Info",
            Self::Warning => "Warning",
            Self::Critical => "Critical",
        }
    }
}

/// Everything known about one error at the moment it was admitted for alerting.
///
/// Built once by the alert pipeline and never mutated afterwards; channels
/// only ever see it by shared reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Supervisor-assigned process id
    pub process_id: u32,
    /// Process name as registered with the supervisor
    pub process_name: String,
    /// The error text that triggered the alert
    pub message: String,
    /// Best-effort stack trace pulled from the message or recent output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Recent log lines for the process, oldest first
    #[serde(default)]
    pub recent_logs: Vec<String>,
    /// Git remote of the process working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// Checked-out branch of the process working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Alert severity
    pub severity: Severity,
    /// When the error was admitted
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ErrorContext {
    /// Create a critical error context stamped with the current time.
    #[must_use]
    pub fn new(process_id: u32, process_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            process_id,
            process_name: process_name.into(),
            message: message.into(),
            stack: None,
            recent_logs: Vec::new(),
            repository: None,
            branch: None,
            severity: Severity::Critical,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_stack(mut self, stack: Option<String>) -> Self {
        self.stack = stack;
        self
    }

    #[must_use]
    pub fn with_recent_logs(mut self, lines: Vec<String>) -> Self {
        self.recent_logs = lines;
        self
    }

    #[must_use]
    pub fn with_repository(mut self, repository: Option<String>, branch: Option<String>) -> Self {
        self.repository = repository;
        self.branch = branch;
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Short title for this alert.
    #[must_use]
    pub fn title(&self) -> String {
        format!("{} Error: {}", self.severity.as_str(), self.process_name)
    }

    /// The last `n` buffered log lines.
    #[must_use]
    pub fn tail(&self, n: usize) -> &[String] {
        let start = self.recent_logs.len().saturating_sub(n);
        &self.recent_logs[start..]
    }
}
