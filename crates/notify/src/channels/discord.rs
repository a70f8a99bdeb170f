//! Discord webhook notification channel.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use super::{format_fields, format_logs, truncate, NotifyChannel};
use crate::error::ChannelError;
use crate::events::ErrorContext;

/// Environment variable for Discord webhook URL.
const ENV_DISCORD_WEBHOOK_URL: &str = "DISCORD_WEBHOOK_URL";

/// Discord caps embed descriptions at 4096 characters.
const MAX_DESCRIPTION_CHARS: usize = 4000;

/// Discord webhook notification channel.
pub struct DiscordChannel {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl DiscordChannel {
    /// Create a new Discord channel from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let webhook_url = std::env::var(ENV_DISCORD_WEBHOOK_URL)
            .ok()
            .filter(|s| !s.is_empty());

        if webhook_url.is_none() {
            debug!("Discord notifications disabled (DISCORD_WEBHOOK_URL not set)");
        }

        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    /// Create a Discord channel with a specific webhook URL.
    #[must_use]
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url: Some(webhook_url),
            client: reqwest::Client::new(),
        }
    }

    fn format_payload(ctx: &ErrorContext) -> DiscordPayload {
        let mut description = format!("**Error:** `{}`", truncate(&ctx.message, 500));
        if let Some(stack) = &ctx.stack {
            description.push_str("\n**Stack:**\n```\n");
            description.push_str(&truncate(stack, 1500));
            description.push_str("\n```");
        }
        if let Some(logs) = format_logs(ctx, 1800) {
            description.push_str("\n**Recent logs:**\n");
            description.push_str(&logs);
        }

        let fields = format_fields(ctx)
            .into_iter()
            .map(|(name, value)| DiscordField {
                name,
                value,
                inline: true,
            })
            .collect();

        DiscordPayload {
            username: "Process Watchdog".to_string(),
            embeds: vec![DiscordEmbed {
                title: ctx.title(),
                description: truncate(&description, MAX_DESCRIPTION_CHARS),
                color: ctx.severity.color(),
                fields,
                timestamp: ctx.timestamp.to_rfc3339(),
            }],
        }
    }
}

#[async_trait]
impl NotifyChannel for DiscordChannel {
    fn name(&self) -> &'static str {
        "discord"
    }

    fn enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    async fn send(&self, ctx: &ErrorContext) -> Result<(), ChannelError> {
        let webhook_url = self
            .webhook_url
            .as_ref()
            .ok_or_else(|| ChannelError::NotConfigured(ENV_DISCORD_WEBHOOK_URL.to_string()))?;

        let payload = Self::format_payload(ctx);
        let response = self.client.post(webhook_url).json(&payload).send().await?;

        if response.status().is_success() {
            debug!(channel = "discord", "Notification sent successfully");
            return Ok(());
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        warn!(
            channel = "discord",
            status = %status,
            body = %body,
            "Discord webhook request failed"
        );

        Err(ChannelError::Other(format!(
            "Discord returned {status}: {body}"
        )))
    }
}

#[derive(Debug, Serialize)]
struct DiscordPayload {
    username: String,
    embeds: Vec<DiscordEmbed>,
}

#[derive(Debug, Serialize)]
struct DiscordEmbed {
    title: String,
    description: String,
    color: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<DiscordField>,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct DiscordField {
    name: String,
    value: String,
    inline: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Severity;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_embed_color_follows_severity() {
        let ctx = ErrorContext::new(1, "api", "boom").with_severity(Severity::Warning);
        let payload = DiscordChannel::format_payload(&ctx);
        assert_eq!(payload.embeds[0].color, Severity::Warning.color());
        assert!(payload.embeds[0].description.contains("boom"));
    }

    #[tokio::test]
    async fn test_send_no_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let channel = DiscordChannel::new(server.uri());
        channel
            .send(&ErrorContext::new(1, "api", "boom"))
            .await
            .unwrap();
    }
}
