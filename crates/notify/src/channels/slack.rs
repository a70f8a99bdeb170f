//! Slack webhook notification channel.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use super::{format_fields, format_logs, truncate, NotifyChannel};
use crate::error::ChannelError;
use crate::events::ErrorContext;

/// Environment variable for Slack webhook URL.
const ENV_SLACK_WEBHOOK_URL: &str = "SLACK_WEBHOOK_URL";

/// Slack limits attachment text; stay well under it.
const MAX_TEXT_CHARS: usize = 2900;

/// Slack webhook notification channel.
pub struct SlackChannel {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl SlackChannel {
    /// Create a new Slack channel from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let webhook_url = std::env::var(ENV_SLACK_WEBHOOK_URL)
            .ok()
            .filter(|s| !s.is_empty());

        if webhook_url.is_some() {
            debug!("Slack notifications enabled");
        } else {
            debug!("Slack notifications disabled (SLACK_WEBHOOK_URL not set)");
        }

        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    /// Create a Slack channel with a specific webhook URL.
    #[must_use]
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url: Some(webhook_url),
            client: reqwest::Client::new(),
        }
    }

    /// Format an alert as a Slack webhook payload.
    fn format_payload(ctx: &ErrorContext) -> SlackPayload {
        let fields = format_fields(ctx)
            .into_iter()
            .map(|(title, value)| SlackField {
                title,
                value,
                short: true,
            })
            .collect();

        let attachment = SlackAttachment {
            fallback: ctx.title(),
            color: ctx.severity.hex().to_string(),
            pretext: None,
            author_name: Some("Process Watchdog".to_string()),
            title: ctx.title(),
            text: Self::format_description(ctx),
            fields,
            footer: Some(format!(
                "{} | {}",
                ctx.severity.as_str(),
                ctx.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
            )),
            ts: Some(ctx.timestamp.timestamp()),
        };

        SlackPayload {
            attachments: vec![attachment],
        }
    }

    /// Message, stack and log tail, in that order.
    fn format_description(ctx: &ErrorContext) -> String {
        let mut text = format!("*Error:* `{}`", truncate(&ctx.message, 500));

        if let Some(stack) = &ctx.stack {
            text.push_str("\n*Stack:*\n```\n");
            text.push_str(&truncate(stack, 1000));
            text.push_str("\n```");
        }

        if let Some(logs) = format_logs(ctx, 1200) {
            text.push_str("\n*Recent logs:*\n");
            text.push_str(&logs);
        }

        truncate(&text, MAX_TEXT_CHARS)
    }
}

#[async_trait]
impl NotifyChannel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    fn enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    async fn send(&self, ctx: &ErrorContext) -> Result<(), ChannelError> {
        let webhook_url = self
            .webhook_url
            .as_ref()
            .ok_or_else(|| ChannelError::NotConfigured(ENV_SLACK_WEBHOOK_URL.to_string()))?;

        let payload = Self::format_payload(ctx);

        debug!(channel = "slack", title = %ctx.title(), "Sending notification");

        let response = self.client.post(webhook_url).json(&payload).send().await?;

        if response.status().is_success() {
            debug!(channel = "slack", "Notification sent successfully");
            return Ok(());
        }

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(1);
            return Err(ChannelError::RateLimited { retry_after_secs });
        }

        let body = response.text().await.unwrap_or_default();

        warn!(
            channel = "slack",
            status = %status,
            body = %body,
            "Slack webhook request failed"
        );

        Err(ChannelError::Other(format!(
            "Slack returned {status}: {body}"
        )))
    }
}

// =============================================================================
// Slack API types
// =============================================================================

#[derive(Debug, Serialize)]
struct SlackPayload {
    attachments: Vec<SlackAttachment>,
}

#[derive(Debug, Serialize)]
struct SlackAttachment {
    fallback: String,
    color: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pretext: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    author_name: Option<String>,
    title: String,
    text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<SlackField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    footer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ts: Option<i64>,
}

#[derive(Debug, Serialize)]
struct SlackField {
    title: String,
    value: String,
    short: bool,
}
