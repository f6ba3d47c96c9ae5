use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use futures::FutureExt;
use serenity::all::ShardManager;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::llm::{Completer, CompletionClient};
use crate::platform::{ChatChannel, IncomingMessage};

/// Discord rejects messages longer than this many characters.
pub const MAX_MESSAGE_CHARS: usize = 2000;

pub const THINKING: &str = "💭 Thinking...";
pub const NO_RESPONSE: &str = "❌ Sorry, I couldn't generate a response.";
pub const PROCESSING_FAILED: &str = "❌ An error occurred while processing your message.";

/// Why an inbound message was not relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    FromBot,
    OtherChannel,
    Empty,
}

/// Cut `text` down to Discord's limit, marking the cut with `...`.
pub fn fit_message(text: &str) -> String {
    if text.chars().count() <= MAX_MESSAGE_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(MAX_MESSAGE_CHARS - 3).collect();
    out.push_str("...");
    out
}

/// Run an event callback, logging any error or panic instead of letting it
/// reach the dispatcher.
pub async fn guarded<F>(label: &str, fut: F)
where
    F: Future<Output = Result<()>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(handler = label, "Error in {}: {:#}", label, e),
        Err(_) => error!(handler = label, "Handler {} panicked", label),
    }
}

/// Per-message flow: filter, post a placeholder, complete, edit.
pub struct Relay {
    completer: Arc<dyn Completer>,
    allowed_channel_id: u64,
}

impl Relay {
    pub fn new(completer: Arc<dyn Completer>, allowed_channel_id: u64) -> Self {
        Self {
            completer,
            allowed_channel_id,
        }
    }

    pub fn allowed_channel_id(&self) -> u64 {
        self.allowed_channel_id
    }

    pub fn admit(&self, msg: &IncomingMessage) -> Result<(), Skip> {
        if msg.author_is_bot {
            return Err(Skip::FromBot);
        }
        if msg.channel_id != self.allowed_channel_id {
            return Err(Skip::OtherChannel);
        }
        if msg.text.trim().is_empty() {
            return Err(Skip::Empty);
        }
        Ok(())
    }

    /// Handle one inbound message.
    ///
    /// Returns `Err` only when the placeholder could not be created or both
    /// edits of it failed; completion failures are reported in-channel.
    pub async fn handle_message(
        &self,
        chat: &dyn ChatChannel,
        msg: &IncomingMessage,
    ) -> Result<()> {
        if let Err(skip) = self.admit(msg) {
            debug!(?skip, channel_id = msg.channel_id, "Ignoring message");
            return Ok(());
        }

        let preview: String = msg.text.chars().take(50).collect();
        info!(
            "Processing message from {} ({}) in {} at {}: {}...",
            msg.author_name,
            msg.author_id,
            msg.channel_id,
            msg.timestamp.to_rfc3339(),
            preview
        );

        let placeholder = chat
            .send_message(msg.channel_id, THINKING)
            .await
            .context("Failed to send placeholder")?;

        let content = match self.completer.complete(&msg.text).await {
            Ok(text) if !text.is_empty() => fit_message(&text),
            Ok(_) => {
                warn!(kind = "empty_text", "Completion returned no text");
                NO_RESPONSE.to_string()
            }
            Err(e) => {
                error!(kind = e.kind(), "Completion failed: {}", e);
                NO_RESPONSE.to_string()
            }
        };

        if let Err(e) = chat.edit_message(&placeholder, &content).await {
            error!("Error processing message: {:#}", e);
            chat.edit_message(&placeholder, PROCESSING_FAILED)
                .await
                .context("Failed to report error on placeholder")?;
        }

        Ok(())
    }
}

/// Process-wide state: relay, HTTP client and gateway handle.
///
/// Built once in `main` and shared by the event handler and the command
/// framework.
pub struct Session {
    pub relay: Relay,
    completion: Arc<CompletionClient>,
    shard_manager: Mutex<Option<Arc<ShardManager>>>,
    closed: AtomicBool,
    startup_failure: OnceLock<String>,
}

impl Session {
    pub fn new(config: &Config) -> Self {
        let completion = Arc::new(CompletionClient::new(config.completion.clone()));
        let relay = Relay::new(completion.clone(), config.discord.allowed_channel_id);
        Self {
            relay,
            completion,
            shard_manager: Mutex::new(None),
            closed: AtomicBool::new(false),
            startup_failure: OnceLock::new(),
        }
    }

    pub fn completion(&self) -> &CompletionClient {
        &self.completion
    }

    pub async fn attach_gateway(&self, shard_manager: Arc<ShardManager>) {
        *self.shard_manager.lock().await = Some(shard_manager);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Record why startup could not complete, then shut down. Only the first
    /// reason is kept.
    pub async fn abort_startup(&self, reason: String) {
        error!("Aborting startup: {}", reason);
        let _ = self.startup_failure.set(reason);
        self.shutdown().await;
    }

    pub fn startup_failure(&self) -> Option<&str> {
        self.startup_failure.get().map(String::as_str)
    }

    /// Close the HTTP client, then the gateway. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already performed");
            return;
        }

        self.completion.close().await;

        let shard_manager = self.shard_manager.lock().await.take();
        if let Some(shard_manager) = shard_manager {
            shard_manager.shutdown_all().await;
        }

        info!("Bot shutdown complete");
    }
}
