#[cfg(test)]
mod tests;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::chunking::ChunkingConfig;
use crate::embeddings::DEFAULT_EMBEDDING_DIMENSION;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub embeddings: EmbeddingsConfig,
    pub chat: ChatConfig,
    pub chunking: ChunkingConfig,
    pub vector_store: VectorStoreConfig,
    pub relevance: RelevanceConfig,
    pub streaming: StreamingConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            embeddings: EmbeddingsConfig::default(),
            chat: ChatConfig::default(),
            chunking: ChunkingConfig::default(),
            vector_store: VectorStoreConfig::default(),
            relevance: RelevanceConfig::default(),
            streaming: StreamingConfig::default(),
            base_dir: PathBuf::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingsConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub dimension: u32,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com".to_string(),
            model: "text-embedding-ada-002".to_string(),
            dimension: DEFAULT_EMBEDDING_DIMENSION,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChatConfig {
    /// Which completion provider to use: "openai" or "gemini".
    pub provider: String,
    pub openai: OpenAiChatConfig,
    pub gemini: GeminiChatConfig,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            openai: OpenAiChatConfig::default(),
            gemini: GeminiChatConfig::default(),
            temperature: 0.7,
            max_tokens: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OpenAiChatConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

impl Default for OpenAiChatConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com".to_string(),
            model: "gpt-4o-mini".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeminiChatConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

impl Default for GeminiChatConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            model: "gemini-1.5-flash".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VectorStoreConfig {
    /// Collection (or index) name shared across backends.
    pub collection: String,
    /// How long a backend selection stays cached, in seconds.
    pub cache_ttl_secs: u64,
    pub chroma: ChromaConfig,
    pub pinecone: PineconeConfig,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            collection: "course_documents".to_string(),
            cache_ttl_secs: 600,
            chroma: ChromaConfig::default(),
            pinecone: PineconeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChromaConfig {
    pub url: String,
}

impl Default for ChromaConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PineconeConfig {
    pub api_key: String,
    pub environment: String,
    /// Full endpoint override; when unset the URL is derived from the
    /// environment name.
    pub base_url: Option<String>,
}

impl Default for PineconeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            environment: "us-east-1".to_string(),
            base_url: None,
        }
    }
}

impl PineconeConfig {
    pub fn endpoint_base(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| format!("https://{}.pinecone.io", self.environment))
    }

    /// Pinecone is only probed when credentials are present.
    pub fn is_configured(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelevanceConfig {
    pub min_avg_score: f32,
    pub min_max_score: f32,
    pub high_score_threshold: f32,
    pub min_high_chunks: usize,
    /// Number of passages fetched per query.
    pub max_results: usize,
}

impl Default for RelevanceConfig {
    fn default() -> Self {
        Self {
            min_avg_score: 0.70,
            min_max_score: 0.75,
            high_score_threshold: 0.75,
            min_high_chunks: 1,
            max_results: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamingConfig {
    /// Delay between words when streaming is simulated.
    pub word_delay_ms: u64,
    /// Active sessions idle longer than this are reaped.
    pub session_timeout_minutes: i64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            word_delay_ms: 30,
            session_timeout_minutes: 30,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid model name: {0} (cannot be empty)")]
    InvalidModel(String),
    #[error("Invalid chat provider: {0} (must be 'openai' or 'gemini')")]
    InvalidProvider(String),
    #[error("Invalid embedding dimension: {0} (must be between 64 and 4096)")]
    InvalidEmbeddingDimension(u32),
    #[error("Invalid chunk size: {0} (must be between 100 and 8192)")]
    InvalidChunkSize(usize),
    #[error("Invalid overlap size: {0} (must be smaller than the chunk size)")]
    InvalidOverlapSize(usize),
    #[error("Invalid relevance threshold: {0} (must be between 0.0 and 1.0)")]
    InvalidThreshold(f32),
    #[error("Invalid max results: {0} (must be between 1 and 100)")]
    InvalidMaxResults(usize),
    #[error("Invalid session timeout: {0} (must be at least 1 minute)")]
    InvalidSessionTimeout(i64),
    #[error("Invalid cache TTL: {0} (must be at least 1 second)")]
    InvalidCacheTtl(u64),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Config {
    /// Load configuration from `config.toml` in `config_dir`, falling back to
    /// defaults when the file does not exist, then apply environment variable
    /// overrides.
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_path = config_dir.as_ref().join("config.toml");

        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
            let config: Config = toml::from_str(&content).with_context(|| {
                format!("Failed to parse config file: {}", config_path.display())
            })?;
            config
        } else {
            Config::default()
        };
        config.base_dir = config_dir.as_ref().to_path_buf();

        config.apply_env_overrides();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        fs::create_dir_all(&self.base_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                self.base_dir.display()
            )
        })?;

        let config_path = self.base_dir.join("config.toml");
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    /// Environment variables take precedence over file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    fn apply_overrides_from(&mut self, source: impl Fn(&str) -> Option<String>) {
        let lookup = |name: &str| source(name).filter(|v| !v.trim().is_empty());
        if let Some(key) = lookup("OPENAI_API_KEY") {
            self.embeddings.api_key = key.clone();
            self.chat.openai.api_key = key;
        }
        if let Some(key) = lookup("GEMINI_API_KEY") {
            self.chat.gemini.api_key = key;
        }
        if let Some(provider) = lookup("CHAT_PROVIDER") {
            self.chat.provider = provider.to_lowercase();
        }
        if let Some(url) = lookup("CHROMA_HOST") {
            self.vector_store.chroma.url = url;
        }
        if let Some(key) = lookup("PINECONE_API_KEY") {
            self.vector_store.pinecone.api_key = key;
        }
        if let Some(environment) = lookup("PINECONE_ENVIRONMENT") {
            self.vector_store.pinecone.environment = environment;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        Url::parse(&self.embeddings.base_url)
            .map_err(|_| ConfigError::InvalidUrl(self.embeddings.base_url.clone()))?;
        Url::parse(&self.vector_store.chroma.url)
            .map_err(|_| ConfigError::InvalidUrl(self.vector_store.chroma.url.clone()))?;

        if self.embeddings.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.embeddings.model.clone()));
        }
        if !(64..=4096).contains(&self.embeddings.dimension) {
            return Err(ConfigError::InvalidEmbeddingDimension(
                self.embeddings.dimension,
            ));
        }

        if self.chat.provider != "openai" && self.chat.provider != "gemini" {
            return Err(ConfigError::InvalidProvider(self.chat.provider.clone()));
        }

        if !(100..=8192).contains(&self.chunking.chunk_size) {
            return Err(ConfigError::InvalidChunkSize(self.chunking.chunk_size));
        }
        if self.chunking.overlap_size >= self.chunking.chunk_size {
            return Err(ConfigError::InvalidOverlapSize(self.chunking.overlap_size));
        }

        for threshold in [
            self.relevance.min_avg_score,
            self.relevance.min_max_score,
            self.relevance.high_score_threshold,
        ] {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ConfigError::InvalidThreshold(threshold));
            }
        }
        if self.relevance.max_results == 0 || self.relevance.max_results > 100 {
            return Err(ConfigError::InvalidMaxResults(self.relevance.max_results));
        }

        if self.streaming.session_timeout_minutes < 1 {
            return Err(ConfigError::InvalidSessionTimeout(
                self.streaming.session_timeout_minutes,
            ));
        }
        if self.vector_store.cache_ttl_secs == 0 {
            return Err(ConfigError::InvalidCacheTtl(self.vector_store.cache_ttl_secs));
        }

        Ok(())
    }

    /// Default config directory under the platform config root.
    pub fn default_base_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("course-rag"))
            .context("Could not determine a configuration directory")
    }

    /// Path for the SQLite database holding messages and sessions.
    pub fn database_path(&self) -> PathBuf {
        self.base_dir.join("chat.db")
    }

    /// Path for the local vector store directory.
    pub fn vector_storage_path(&self) -> PathBuf {
        self.base_dir.join("vectors")
    }
}
