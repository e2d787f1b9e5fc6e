
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::sse::SseParser;
use super::{ChatMessage, ChatOptions, ChatProvider, Completion, Usage};
use crate::config::OpenAiChatConfig;
use crate::{RagError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const DONE_SENTINEL: &str = "[DONE]";

/// OpenAI-shaped chat provider with real server-sent-event streaming.
pub struct OpenAiChatProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
}

impl OpenAiChatProvider {
    pub fn new(config: &OpenAiChatConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RagError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    async fn send_request(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            stream,
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| RagError::ProviderUnavailable(format!("OpenAI request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(RagError::Auth(format!(
                "OpenAI rejected credentials (HTTP {})",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RagError::ProviderUnavailable(format!(
                "OpenAI request failed (HTTP {}): {}",
                status.as_u16(),
                body
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl ChatProvider for OpenAiChatProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, messages: &[ChatMessage], options: &ChatOptions) -> Result<Completion> {
        let response = self.send_request(messages, options, false).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| RagError::ProviderUnavailable(format!("OpenAI response parse: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| {
                RagError::ProviderUnavailable("OpenAI response contained no choices".into())
            })?;

        Ok(Completion {
            content,
            usage: parsed.usage,
        })
    }

    async fn stream_complete(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        tx: mpsc::Sender<String>,
    ) -> Result<Completion> {
        let response = self.send_request(messages, options, true).await?;

        let mut parser = SseParser::new();
        let mut content = String::new();
        let mut usage = Usage::default();
        let mut stream = response.bytes_stream();
        let mut receiver_open = true;

        'outer: while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| {
                RagError::ProviderUnavailable(format!("OpenAI stream read failed: {e}"))
            })?;

            for event in parser.feed(&bytes) {
                if event == DONE_SENTINEL {
                    break 'outer;
                }
                let parsed: StreamChunk = match serde_json::from_str(&event) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        warn!("Skipping malformed stream event: {}", e);
                        continue;
                    }
                };

                if let Some(reported) = parsed.usage {
                    usage = reported;
                }
                if let Some(delta) = parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.delta.content)
                {
                    content.push_str(&delta);
                    if receiver_open && tx.send(delta).await.is_err() {
                        // Consumer is gone; keep draining so the completion
                        // is still assembled.
                        receiver_open = false;
                    }
                }
            }
        }

        debug!("OpenAI stream finished ({} chars)", content.len());
        Ok(Completion { content, usage })
    }
}
