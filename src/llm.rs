use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::config::CompletionConfig;

/// Why a completion produced no text.
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("HTTP client not initialized")]
    ClientNotReady,

    #[error("timed out after {0:?} waiting for OpenRouter")]
    Timeout(Duration),

    #[error("OpenRouter API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("no choices in OpenRouter response")]
    EmptyChoices,

    #[error("error calling OpenRouter: {0}")]
    Transport(#[source] reqwest::Error),
}

impl CompletionError {
    /// Short label used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            CompletionError::ClientNotReady => "client_not_ready",
            CompletionError::Timeout(_) => "timeout",
            CompletionError::Api { .. } => "api_error",
            CompletionError::EmptyChoices => "empty_choices",
            CompletionError::Transport(_) => "transport_error",
        }
    }
}

/// Anything that can turn user text into generated text.
#[async_trait]
pub trait Completer: Send + Sync {
    async fn complete(&self, user_text: &str) -> Result<String, CompletionError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

/// One-shot client for the OpenRouter chat-completions endpoint.
///
/// The underlying `reqwest::Client` is created by [`open`](Self::open) and
/// dropped by [`close`](Self::close); requests made outside that window fail
/// with [`CompletionError::ClientNotReady`].
pub struct CompletionClient {
    client: RwLock<Option<reqwest::Client>>,
    config: CompletionConfig,
}

impl CompletionClient {
    pub fn new(config: CompletionConfig) -> Self {
        Self {
            client: RwLock::new(None),
            config,
        }
    }

    pub async fn open(&self) -> Result<(), reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(self.config.timeout())
            .build()?;
        *self.client.write().await = Some(client);
        debug!("OpenRouter HTTP client opened");
        Ok(())
    }

    /// Drop the HTTP client. Returns `false` if it was already closed.
    pub async fn close(&self) -> bool {
        let closed = self.client.write().await.take().is_some();
        if closed {
            debug!("OpenRouter HTTP client closed");
        }
        closed
    }

    async fn exchange(
        &self,
        client: reqwest::Client,
        user_text: &str,
    ) -> Result<String, CompletionError> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: Some(user_text.to_string()),
            }],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        debug!("Sending request to OpenRouter: {}", url);

        let response = client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), "OpenRouter API error {}: {}", status, body);
            return Err(CompletionError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let chat_response: ChatResponse = response.json().await.map_err(|e| self.classify(e))?;

        let Some(choice) = chat_response.choices.into_iter().next() else {
            error!("No choices in AI response");
            return Err(CompletionError::EmptyChoices);
        };

        info!("Successfully received AI response");
        Ok(choice
            .message
            .content
            .map(|text| text.trim().to_string())
            .unwrap_or_default())
    }

    fn classify(&self, e: reqwest::Error) -> CompletionError {
        if e.is_timeout() {
            CompletionError::Timeout(self.config.timeout())
        } else {
            CompletionError::Transport(e)
        }
    }
}

#[async_trait]
impl Completer for CompletionClient {
    async fn complete(&self, user_text: &str) -> Result<String, CompletionError> {
        // Clone out of the lock so close() is never blocked by an in-flight request.
        let Some(client) = self.client.read().await.clone() else {
            error!("HTTP session not initialized");
            return Err(CompletionError::ClientNotReady);
        };

        let timeout = self.config.timeout();
        match tokio::time::timeout(timeout, self.exchange(client, user_text)).await {
            Ok(result) => result,
            Err(_) => Err(CompletionError::Timeout(timeout)),
        }
    }
}
