//! Notification channel implementations.

pub mod discord;
pub mod slack;

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::events::ErrorContext;

/// Trait for notification channels (Discord, Slack, etc.).
#[async_trait]
pub trait NotifyChannel: Send + Sync {
    /// Get the name of this channel.
    fn name(&self) -> &'static str;

    /// Check if this channel is enabled/configured.
    fn enabled(&self) -> bool;

    /// Deliver an alert. The context has already been redacted.
    async fn send(&self, ctx: &ErrorContext) -> Result<(), ChannelError>;
}

/// Number of log lines included in a formatted alert.
pub(crate) const LOG_LINES: usize = 15;

/// Truncate to at most `max` characters, marking the cut.
pub(crate) fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max.saturating_sub(1)).collect();
    cut.push('…');
    cut
}

/// Render the log tail as a fenced code block, newest last.
pub(crate) fn format_logs(ctx: &ErrorContext, max_chars: usize) -> Option<String> {
    let tail = ctx.tail(LOG_LINES);
    if tail.is_empty() {
        return None;
    }
    let body = truncate(&tail.join("\n"), max_chars);
    Some(format!("```\n{body}\n```"))
}

/// Key/value fields shared by all channel formats.
pub(crate) fn format_fields(ctx: &ErrorContext) -> Vec<(String, String)> {
    let mut fields = vec![
        ("Process".to_string(), ctx.process_name.clone()),
        ("Process ID".to_string(), ctx.process_id.to_string()),
        ("Severity".to_string(), ctx.severity.as_str().to_string()),
    ];
    if let Some(repository) = &ctx.repository {
        fields.push(("Repository".to_string(), repository.clone()));
    }
    if let Some(branch) = &ctx.branch {
        fields.push(("Branch".to_string(), branch.clone()));
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 5), "abcd…");
    }

    #[test]
    fn test_format_logs_empty() {
        let ctx = ErrorContext::new(1, "api", "boom");
        assert!(format_logs(&ctx, 100).is_none());
    }

    #[test]
    fn test_format_fields_optional_repo() {
        let ctx = ErrorContext::new(7, "api", "boom");
        assert_eq!(format_fields(&ctx).len(), 3);

        let ctx = ctx.with_repository(Some("git@host:org/api.git".into()), Some("main".into()));
        let fields = format_fields(&ctx);
        assert_eq!(fields.len(), 5);
        assert_eq!(fields[4], ("Branch".to_string(), "main".to_string()));
    }
}
