
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::config::EmbeddingsConfig;
use crate::{RagError, Result};

const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

pub const DEFAULT_EMBEDDING_DIMENSION: u32 = 1536;

/// Source of text embeddings. The production implementation calls an
/// external embeddings endpoint; tests substitute deterministic doubles.
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding vector for `text`.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Expected embedding dimension.
    fn dimension(&self) -> usize;
}

/// Client for an OpenAI-shaped embeddings endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiEmbeddingsClient {
    base_url: Url,
    api_key: String,
    model: String,
    dimension: usize,
    agent: ureq::Agent,
    retry_attempts: u32,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Debug, Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
}

impl OpenAiEmbeddingsClient {
    pub fn new(config: &EmbeddingsConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|_| RagError::Config(format!("Invalid embeddings URL: {}", config.base_url)))?;

        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(DEFAULT_TIMEOUT_SECONDS)))
            .http_status_as_error(false)
            .build()
            .into();

        Ok(Self {
            base_url,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            dimension: config.dimension as usize,
            agent,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
        })
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    fn request_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let url = self
            .base_url
            .join("/v1/embeddings")
            .map_err(|e| RagError::Config(format!("Failed to build embeddings URL: {e}")))?;

        let request = EmbedRequest {
            model: &self.model,
            input: text,
        };
        let body = serde_json::to_string(&request)
            .map_err(|e| RagError::Embedding(format!("Failed to serialize request: {e}")))?;

        let mut last_error = None;

        for attempt in 1..=self.retry_attempts {
            debug!(
                "Embedding request attempt {}/{} ({} chars)",
                attempt,
                self.retry_attempts,
                text.len()
            );

            let sent = self
                .agent
                .post(url.as_str())
                .header("Authorization", &format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .send(&body);

            match sent {
                Ok(mut resp) => {
                    let status = resp.status().as_u16();
                    let text_body = resp
                        .body_mut()
                        .read_to_string()
                        .map_err(|e| RagError::Embedding(format!("Failed to read response: {e}")))?;

                    if (200..300).contains(&status) {
                        let parsed: EmbedResponse =
                            serde_json::from_str(&text_body).map_err(|e| {
                                RagError::Embedding(format!("Failed to parse response: {e}"))
                            })?;
                        let embedding = parsed
                            .data
                            .into_iter()
                            .next()
                            .map(|d| d.embedding)
                            .ok_or_else(|| {
                                RagError::Embedding("Response contained no embedding".into())
                            })?;
                        return Ok(embedding);
                    }

                    if status == 401 || status == 403 {
                        return Err(RagError::Auth(format!(
                            "Embeddings endpoint rejected credentials (HTTP {status})"
                        )));
                    }

                    if status < 500 {
                        return Err(RagError::Embedding(format!(
                            "Embeddings request failed (HTTP {status}): {text_body}"
                        )));
                    }

                    warn!(
                        "Embeddings server error (HTTP {}), attempt {}/{}",
                        status, attempt, self.retry_attempts
                    );
                    last_error = Some(RagError::Embedding(format!(
                        "Embeddings request failed (HTTP {status})"
                    )));
                }
                Err(error) => {
                    warn!(
                        "Embeddings transport error: {}, attempt {}/{}",
                        error, attempt, self.retry_attempts
                    );
                    last_error = Some(RagError::Embedding(format!("Transport error: {error}")));
                }
            }

            // Exponential backoff: 1s, 2s, 4s.
            if attempt < self.retry_attempts {
                std::thread::sleep(Duration::from_secs(1 << (attempt - 1)));
            }
        }

        Err(last_error
            .unwrap_or_else(|| RagError::Embedding("Embedding request failed after retries".into())))
    }
}

impl EmbeddingProvider for OpenAiEmbeddingsClient {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embedding = self.request_embedding(text)?;

        if embedding.len() != self.dimension {
            return Err(RagError::Embedding(format!(
                "Expected {} dimensions, got {}",
                self.dimension,
                embedding.len()
            )));
        }

        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
