pub mod discord;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A message received from the gateway
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Platform-specific user ID
    pub author_id: u64,
    /// Display name of the author
    pub author_name: String,
    /// Set for bot and webhook accounts, including ourselves
    pub author_is_bot: bool,
    /// Channel the message was posted in
    pub channel_id: u64,
    /// The message text
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// A message the bot itself posted, addressable for later edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHandle {
    pub channel_id: u64,
    pub message_id: u64,
}

/// Outbound half of the gateway: what the relay needs to talk back.
#[async_trait]
pub trait ChatChannel: Send + Sync {
    async fn send_message(&self, channel_id: u64, content: &str) -> Result<MessageHandle>;

    async fn edit_message(&self, handle: &MessageHandle, content: &str) -> Result<()>;
}
