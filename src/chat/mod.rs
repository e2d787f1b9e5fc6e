
pub mod gemini;
pub mod openai;
pub mod sse;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::{ChatConfig, StreamingConfig};
use crate::{RagError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl From<&ChatConfig> for ChatOptions {
    fn from(config: &ChatConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// A finished completion: the full text plus token accounting when the
/// provider reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
    pub usage: Usage,
}

/// A chat completion provider.
///
/// `stream_complete` emits content deltas through `tx` as they arrive and
/// returns the assembled completion. A closed receiver is not an error:
/// providers stop forwarding and return what they have.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, messages: &[ChatMessage], options: &ChatOptions) -> Result<Completion>;

    async fn stream_complete(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        tx: mpsc::Sender<String>,
    ) -> Result<Completion>;
}

/// Build the configured provider.
pub fn create_provider(
    chat: &ChatConfig,
    streaming: &StreamingConfig,
) -> Result<Arc<dyn ChatProvider>> {
    match chat.provider.as_str() {
        "openai" => Ok(Arc::new(openai::OpenAiChatProvider::new(&chat.openai)?)),
        "gemini" => Ok(Arc::new(gemini::GeminiChatProvider::new(
            &chat.gemini,
            Duration::from_millis(streaming.word_delay_ms),
        )?)),
        other => Err(RagError::Config(format!("Unknown chat provider: {other}"))),
    }
}

/// Stream `content` word by word with a fixed delay, preserving the original
/// spacing by re-attaching one space after every word but the last. Stops
/// early when the receiver is gone.
pub async fn stream_words(content: &str, delay: Duration, tx: &mpsc::Sender<String>) {
    let words: Vec<&str> = content.split(' ').collect();
    let last = words.len().saturating_sub(1);
    for (i, word) in words.into_iter().enumerate() {
        let chunk = if i < last {
            format!("{word} ")
        } else {
            word.to_string()
        };
        if tx.send(chunk).await.is_err() {
            return;
        }
        if i < last && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
