pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

pub use telegram::TelegramNotifier;

/// Outbound message channel. Delivery is best effort, callers log failures and move on.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn send_notification(&self, text: &str) -> Result<()>;
}

/// Used when no message channel is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_notification(&self, text: &str) -> Result<()> {
        info!(text, "notification");
        Ok(())
    }
}
