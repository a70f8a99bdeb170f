//! Seam between the pipeline and the notification transport.

use async_trait::async_trait;
use notify::{ChannelError, ErrorContext, Notifier};

/// Delivers one alert and reports whether it got through.
///
/// Any error means "not delivered"; callers do not distinguish causes.
#[async_trait]
pub trait AlertSender: Send + Sync {
    async fn send(&self, ctx: &ErrorContext) -> Result<(), ChannelError>;
}

#[async_trait]
impl AlertSender for Notifier {
    async fn send(&self, ctx: &ErrorContext) -> Result<(), ChannelError> {
        self.deliver(ctx).await
    }
}
