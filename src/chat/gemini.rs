use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ChatMessage, ChatOptions, ChatProvider, Completion, Role, Usage, stream_words};
use crate::config::GeminiChatConfig;
use crate::{RagError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Gemini chat provider.
///
/// The generateContent endpoint has no SSE surface here, so streaming is
/// simulated: the full completion is fetched and then emitted word by word
/// with a fixed delay.
pub struct GeminiChatProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    word_delay: Duration,
}

#[derive(Debug, Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default, rename = "usageMetadata")]
    usage_metadata: UsageMetadata,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct UsageMetadata {
    #[serde(default, rename = "promptTokenCount")]
    prompt_token_count: u32,
    #[serde(default, rename = "candidatesTokenCount")]
    candidates_token_count: u32,
    #[serde(default, rename = "totalTokenCount")]
    total_token_count: u32,
}

impl GeminiChatProvider {
    pub fn new(config: &GeminiChatConfig, word_delay: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RagError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            word_delay,
        })
    }

    /// Gemini has no system role; assistant turns map to "model" and
    /// everything else to "user".
    fn convert_messages(messages: &[ChatMessage]) -> Vec<Content> {
        messages
            .iter()
            .map(|message| Content {
                role: match message.role {
                    Role::Assistant => "model",
                    Role::System | Role::User => "user",
                },
                parts: vec![Part {
                    text: message.content.clone(),
                }],
            })
            .collect()
    }
}

#[async_trait]
impl ChatProvider for GeminiChatProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn complete(&self, messages: &[ChatMessage], options: &ChatOptions) -> Result<Completion> {
        let payload = json!({
            "contents": Self::convert_messages(messages),
            "generationConfig": {
                "temperature": options.temperature,
                "maxOutputTokens": options.max_tokens,
            },
        });

        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );
        let response = self
            .client
            .post(url)
            .query(&[("key", self.api_key.as_str())])
            .json(&payload)
            .send()
            .await
            .map_err(|e| RagError::ProviderUnavailable(format!("Gemini request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(RagError::Auth(format!(
                "Gemini rejected credentials (HTTP {})",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RagError::ProviderUnavailable(format!(
                "Gemini request failed (HTTP {}): {}",
                status.as_u16(),
                body
            )));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| RagError::ProviderUnavailable(format!("Gemini response parse: {e}")))?;

        let content = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| {
                RagError::ProviderUnavailable("Gemini response contained no candidates".into())
            })?;

        Ok(Completion {
            content,
            usage: Usage {
                prompt_tokens: parsed.usage_metadata.prompt_token_count,
                completion_tokens: parsed.usage_metadata.candidates_token_count,
                total_tokens: parsed.usage_metadata.total_token_count,
            },
        })
    }

    async fn stream_complete(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        tx: mpsc::Sender<String>,
    ) -> Result<Completion> {
        let completion = self.complete(messages, options).await?;
        if completion.content.is_empty() {
            return Err(RagError::ProviderUnavailable(
                "Gemini returned an empty completion".into(),
            ));
        }

        debug!(
            "Simulating stream for {} chars of Gemini output",
            completion.content.len()
        );
        stream_words(&completion.content, self.word_delay, &tx).await;
        Ok(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_for(server: &MockServer) -> GeminiChatProvider {
        GeminiChatProvider::new(
            &GeminiChatConfig {
                api_key: "g-key".to_string(),
                base_url: server.uri(),
                model: "gemini-1.5-flash".to_string(),
            },
            Duration::ZERO,
        )
        .expect("provider should build")
    }

    fn options() -> ChatOptions {
        ChatOptions {
            temperature: 0.7,
            max_tokens: 256,
        }
    }

    #[tokio::test]
    async fn complete_maps_roles_and_parses_candidates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-1.5-flash:generateContent"))
            .and(query_param("key", "g-key"))
            .and(body_partial_json(json!({
                "contents": [
                    { "role": "user", "parts": [{ "text": "Stay on topic." }] },
                    { "role": "user", "parts": [{ "text": "Hi" }] },
                    { "role": "model", "parts": [{ "text": "Hello!" }] },
                ],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [
                    { "content": { "parts": [{ "text": "All good." }], "role": "model" } }
                ],
                "usageMetadata": { "promptTokenCount": 7, "candidatesTokenCount": 2, "totalTokenCount": 9 },
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let completion = provider
            .complete(
                &[
                    ChatMessage::system("Stay on topic."),
                    ChatMessage::user("Hi"),
                    ChatMessage::assistant("Hello!"),
                ],
                &options(),
            )
            .await
            .expect("completion should succeed");

        assert_eq!(completion.content, "All good.");
        assert_eq!(completion.usage.total_tokens, 9);
    }

    #[tokio::test]
    async fn stream_complete_emits_words() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-1.5-flash:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [
                    { "content": { "parts": [{ "text": "one two three" }] } }
                ],
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let (tx, mut rx) = mpsc::channel(16);
        let completion = provider
            .stream_complete(&[ChatMessage::user("count")], &options(), tx)
            .await
            .expect("stream should succeed");

        assert_eq!(completion.content, "one two three");

        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        assert_eq!(chunks, vec!["one ", "two ", "three"]);
        assert_eq!(chunks.concat(), "one two three");
    }

    #[tokio::test]
    async fn empty_completion_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-1.5-flash:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [
                    { "content": { "parts": [{ "text": "" }] } }
                ],
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let (tx, _rx) = mpsc::channel(16);
        let result = provider
            .stream_complete(&[ChatMessage::user("count")], &options(), tx)
            .await;

        assert!(matches!(result, Err(RagError::ProviderUnavailable(_))));
    }
}
