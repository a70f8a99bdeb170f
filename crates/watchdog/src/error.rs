//! Error types for the watchdog.

use thiserror::Error;

/// Failures talking to the process supervisor.
///
/// These are never retried inside the pipeline; the caller decides.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The supervisor binary could not be started
    #[error("Failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The supervisor command ran but reported failure
    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// The supervisor returned output we could not decode
    #[error("Failed to parse supervisor output: {0}")]
    Parse(#[from] serde_json::Error),

    /// An operation needed a live connection
    #[error("Not connected to the process supervisor")]
    NotConnected,

    /// The event stream ended
    #[error("Supervisor event stream closed")]
    StreamClosed,
}

/// Invalid configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
