use super::*;
use std::collections::HashMap;
use tempfile::TempDir;

#[test]
fn default_config_is_valid() {
    let config = Config::default();
    assert!(config.validate().is_ok());
}

#[test]
fn missing_file_falls_back_to_defaults() {
    let temp_dir = TempDir::new().expect("temp dir should be created");
    let config = Config::load(temp_dir.path()).expect("load should succeed");

    assert_eq!(config.vector_store.collection, "course_documents");
    assert_eq!(config.base_dir, temp_dir.path());
}

#[test]
fn save_and_load_roundtrip() {
    let temp_dir = TempDir::new().expect("temp dir should be created");

    let mut config = Config {
        base_dir: temp_dir.path().to_path_buf(),
        ..Config::default()
    };
    config.vector_store.collection = "history_course".to_string();
    config.chunking.chunk_size = 500;
    config.chunking.overlap_size = 100;
    config.save().expect("save should succeed");

    let loaded = Config::load(temp_dir.path()).expect("load should succeed");
    assert_eq!(loaded.vector_store.collection, "history_course");
    assert_eq!(loaded.chunking.chunk_size, 500);
    assert_eq!(loaded.chunking.overlap_size, 100);
}

#[test]
fn partial_file_uses_defaults_for_missing_sections() {
    let temp_dir = TempDir::new().expect("temp dir should be created");
    std::fs::write(
        temp_dir.path().join("config.toml"),
        "[vector_store]\ncollection = \"biology\"\n",
    )
    .expect("config file should be written");

    let config = Config::load(temp_dir.path()).expect("load should succeed");
    assert_eq!(config.vector_store.collection, "biology");
    assert_eq!(config.chunking, ChunkingConfig::default());
    assert_eq!(config.streaming.session_timeout_minutes, 30);
}

#[test]
fn invalid_provider_is_rejected() {
    let mut config = Config::default();
    config.chat.provider = "claude".to_string();
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidProvider(_))
    ));
}

#[test]
fn overlap_must_be_smaller_than_chunk_size() {
    let mut config = Config::default();
    config.chunking.chunk_size = 200;
    config.chunking.overlap_size = 200;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidOverlapSize(200))
    ));
}

#[test]
fn out_of_range_threshold_is_rejected() {
    let mut config = Config::default();
    config.relevance.min_max_score = 1.5;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidThreshold(_))
    ));
}

#[test]
fn env_overrides_take_precedence() {
    let vars: HashMap<&str, &str> = HashMap::from([
        ("OPENAI_API_KEY", "sk-live"),
        ("CHAT_PROVIDER", "Gemini"),
        ("CHROMA_HOST", "http://chroma.internal:9000"),
        ("PINECONE_API_KEY", "pc-key"),
    ]);

    let mut config = Config::default();
    config.apply_overrides_from(|name| vars.get(name).map(|v| (*v).to_string()));

    assert_eq!(config.embeddings.api_key, "sk-live");
    assert_eq!(config.chat.openai.api_key, "sk-live");
    assert_eq!(config.chat.provider, "gemini");
    assert_eq!(config.vector_store.chroma.url, "http://chroma.internal:9000");
    assert_eq!(config.vector_store.pinecone.api_key, "pc-key");
}

#[test]
fn blank_env_values_are_ignored() {
    let mut config = Config::default();
    config.chat.provider = "openai".to_string();
    config.apply_overrides_from(|name| {
        if name == "CHAT_PROVIDER" {
            Some("   ".to_string())
        } else {
            None
        }
    });

    assert_eq!(config.chat.provider, "openai");
}

#[test]
fn pinecone_endpoint_base() {
    let mut pinecone = PineconeConfig {
        environment: "eu-west-1".to_string(),
        ..PineconeConfig::default()
    };
    assert_eq!(pinecone.endpoint_base(), "https://eu-west-1.pinecone.io");

    pinecone.base_url = Some("http://localhost:1234".to_string());
    assert_eq!(pinecone.endpoint_base(), "http://localhost:1234");

    assert!(!pinecone.is_configured());
    pinecone.api_key = "pc-key".to_string();
    assert!(pinecone.is_configured());
}
