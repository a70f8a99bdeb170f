//! Notification delivery for supervised process errors.
//!
//! This crate turns an [`ErrorContext`] into chat messages on Slack,
//! Discord, or any other [`NotifyChannel`]. Delivery reports success or
//! failure to the caller; retrying is the caller's job.
//!
//! # Usage
//!
//! ```no_run
//! use notify::{ErrorContext, Notifier};
//!
//! # async fn run() {
//! let notifier = Notifier::from_env();
//! let ctx = ErrorContext::new(0, "worker-1", "Error: disk full");
//! if let Err(e) = notifier.deliver(&ctx).await {
//!     eprintln!("queue for retry: {e}");
//! }
//! # }
//! ```
//!
//! # Configuration
//!
//! The notifier is configured via environment variables:
//!
//! - `SLACK_WEBHOOK_URL`: Slack webhook URL (enables Slack channel)
//! - `DISCORD_WEBHOOK_URL`: Discord webhook URL (enables Discord channel)
//! - `NOTIFY_TIMEOUT_SECS`: per-channel send timeout (default 10)
//! - `NOTIFY_DISABLED`: Set to "true" to disable all notifications

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channels;
pub mod error;
pub mod events;
pub mod redact;

pub use channels::discord::DiscordChannel;
pub use channels::slack::SlackChannel;
pub use channels::NotifyChannel;
pub use error::ChannelError;
pub use events::{ErrorContext, Severity};

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Environment variable to disable all notifications.
const ENV_NOTIFY_DISABLED: &str = "NOTIFY_DISABLED";

/// Environment variable for the per-send timeout.
const ENV_NOTIFY_TIMEOUT_SECS: &str = "NOTIFY_TIMEOUT_SECS";

/// Default per-send timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Central notification dispatcher.
///
/// The `Notifier` redacts each alert once and sends it to every enabled
/// channel, bounding each send with a timeout.
pub struct Notifier {
    channels: Vec<Arc<dyn NotifyChannel>>,
    disabled: bool,
    timeout: Duration,
}

impl Notifier {
    /// Create a new notifier from environment variables.
    ///
    /// This will auto-detect which channels are configured based on
    /// environment variables and enable them accordingly.
    #[must_use]
    pub fn from_env() -> Self {
        let disabled = std::env::var(ENV_NOTIFY_DISABLED)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);

        let timeout = std::env::var(ENV_NOTIFY_TIMEOUT_SECS)
            .ok()
            .and_then(|v| v.parse().ok())
            .map_or(DEFAULT_TIMEOUT, Duration::from_secs);

        if disabled {
            info!("Notifications disabled via NOTIFY_DISABLED");
            return Self {
                channels: vec![],
                disabled: true,
                timeout,
            };
        }

        let mut channels: Vec<Arc<dyn NotifyChannel>> = vec![];

        let slack = SlackChannel::from_env();
        if slack.enabled() {
            info!("Slack notifications enabled");
            channels.push(Arc::new(slack));
        }

        let discord = DiscordChannel::from_env();
        if discord.enabled() {
            info!("Discord notifications enabled");
            channels.push(Arc::new(discord));
        }

        if channels.is_empty() {
            warn!("No notification channels configured");
        } else {
            info!(
                channel_count = channels.len(),
                timeout_secs = timeout.as_secs(),
                "Notification system initialized"
            );
        }

        Self {
            channels,
            disabled: false,
            timeout,
        }
    }

    /// Create a notifier with specific channels.
    #[must_use]
    pub fn with_channels(channels: Vec<Arc<dyn NotifyChannel>>) -> Self {
        Self {
            channels,
            disabled: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Override the per-send timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Create a disabled notifier (for testing or when notifications are off).
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            channels: vec![],
            disabled: true,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Check if any notification channels are enabled.
    #[must_use]
    pub fn has_channels(&self) -> bool {
        !self.disabled && !self.channels.is_empty()
    }

    /// Get the number of enabled channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        if self.disabled {
            0
        } else {
            self.channels.len()
        }
    }

    /// Send an alert to every enabled channel and wait for the outcome.
    ///
    /// All channels are attempted even if one fails. The first failure is
    /// returned, so a retry re-sends to every channel: delivery is
    /// at-least-once per channel.
    pub async fn deliver(&self, ctx: &ErrorContext) -> Result<(), ChannelError> {
        if !self.has_channels() {
            debug!(process = %ctx.process_name, "No channels configured, skipping alert");
            return Ok(());
        }

        let clean = redact::redact_context(ctx);
        let mut first_error = None;

        for channel in &self.channels {
            let channel_name = channel.name();

            if !channel.enabled() {
                debug!(channel = channel_name, "Channel disabled, skipping");
                continue;
            }

            let result = match tokio::time::timeout(self.timeout, channel.send(&clean)).await {
                Ok(result) => result,
                Err(_) => Err(ChannelError::Timeout {
                    after: self.timeout,
                }),
            };

            match result {
                Ok(()) => debug!(channel = channel_name, "Notification sent"),
                Err(e) => {
                    warn!(channel = channel_name, error = %e, "Failed to send notification");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::from_env()
    }
}
