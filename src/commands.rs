use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::info;

use crate::chat::create_provider;
use crate::config::Config;
use crate::database::{Database, SessionService};
use crate::embeddings::OpenAiEmbeddingsClient;
use crate::pipeline::DocumentPipeline;
use crate::retrieval::{RelevanceGate, search_relevant_content};
use crate::streaming::{StreamOutcome, StreamingChatService};
use crate::vector_store::router::VectorStoreRouter;
use crate::{RagError, Result};

fn load_config() -> Result<Config> {
    Ok(Config::load(Config::default_base_dir()?)?)
}

fn build_stores(config: &Config) -> Result<(Arc<DocumentPipeline>, Arc<VectorStoreRouter>)> {
    let embedder = Arc::new(OpenAiEmbeddingsClient::new(&config.embeddings)?);
    let router = Arc::new(VectorStoreRouter::from_config(config)?);
    let pipeline = Arc::new(DocumentPipeline::new(embedder, Arc::clone(&router), config));
    Ok((pipeline, router))
}

async fn open_database(config: &Config) -> Result<Database> {
    fs::create_dir_all(&config.base_dir)?;
    Database::connect(&config.database_path()).await
}

/// Print the effective configuration.
pub fn show_config() -> Result<()> {
    let config = load_config()?;
    let rendered =
        toml::to_string_pretty(&config).context("Failed to render the configuration")?;
    println!("{rendered}");
    Ok(())
}

/// Write a default configuration file the user can edit.
pub fn init_config() -> Result<()> {
    let mut config = Config::default();
    config.base_dir = Config::default_base_dir()?;
    config.save()?;
    println!(
        "Wrote default configuration to {}",
        config.base_dir.join("config.toml").display()
    );
    Ok(())
}

/// Ingest a course document into the vector store under `namespace`.
pub async fn ingest_document(file: &Path, namespace: &str) -> Result<()> {
    let config = load_config()?;
    let content = fs::read_to_string(file)
        .with_context(|| format!("Failed to read document: {}", file.display()))?;

    info!("Ingesting {} into namespace {namespace}", file.display());
    let (pipeline, _) = build_stores(&config)?;
    let namespace = namespace.to_string();
    let metadata = BTreeMap::from([(
        "source_file".to_string(),
        json!(file.display().to_string()),
    )]);

    let result =
        tokio::task::spawn_blocking(move || pipeline.ingest(&content, &namespace, &metadata))
            .await
            .map_err(|e| RagError::Other(anyhow::anyhow!("Ingest task panicked: {e}")))??;

    println!(
        "Ingested {}/{} chunks",
        result.chunks_processed, result.total_chunks
    );
    if result.chunks_processed < result.total_chunks {
        println!(
            "Warning: {} chunks failed to embed and were skipped",
            result.total_chunks - result.chunks_processed
        );
    }
    Ok(())
}

/// Query the vector store and show the passages with their gate verdict.
pub async fn search(query: &str, namespaces: Vec<String>, top_k: Option<usize>) -> Result<()> {
    let config = load_config()?;
    let (pipeline, _) = build_stores(&config)?;
    let gate = RelevanceGate::new(&config.relevance);
    let top_k = top_k.unwrap_or(config.relevance.max_results);
    let query = query.to_string();

    let context = tokio::task::spawn_blocking(move || {
        search_relevant_content(&pipeline, &gate, &query, &namespaces, top_k)
    })
    .await
    .map_err(|e| RagError::Other(anyhow::anyhow!("Search task panicked: {e}")))??;

    println!(
        "Relevance: {} (avg {:.3}, max {:.3}, {} high-scoring)",
        if context.report.is_relevant {
            "relevant"
        } else {
            "not relevant"
        },
        context.report.avg_score,
        context.report.max_score,
        context.report.high_score_count
    );

    if context.passages.is_empty() {
        println!("No passages to show.");
        return Ok(());
    }
    for (i, passage) in context.passages.iter().enumerate() {
        println!();
        println!("[{}] score {:.3} ({})", i + 1, passage.score, passage.id);
        println!("{}", passage.content);
    }
    Ok(())
}

/// Ask a question and stream the answer to stdout.
pub async fn ask(
    chat_id: i64,
    user_id: i64,
    message: &str,
    namespaces: Vec<String>,
) -> Result<()> {
    let config = load_config()?;
    let provider = create_provider(&config.chat, &config.streaming)?;
    let (pipeline, _) = build_stores(&config)?;
    let db = open_database(&config).await?;
    let service = StreamingChatService::new(provider, pipeline, SessionService::new(db), &config);

    let (tx, mut rx) = mpsc::channel::<String>(32);
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(chunk) = rx.recv().await {
            let _ = write!(stdout, "{chunk}");
            let _ = stdout.flush();
        }
    });

    let outcome = service
        .stream_message(chat_id, user_id, message, &namespaces, tx)
        .await;
    let _ = printer.await;
    println!();

    match outcome? {
        StreamOutcome::Completed(_) => Ok(()),
        StreamOutcome::Stopped => {
            println!("[stream stopped]");
            Ok(())
        }
    }
}

/// Remove every vector stored under `namespace`.
pub async fn purge(namespace: &str) -> Result<()> {
    let config = load_config()?;
    let (pipeline, _) = build_stores(&config)?;
    let namespace = namespace.to_string();

    let removed = tokio::task::spawn_blocking(move || pipeline.purge_namespace(&namespace))
        .await
        .map_err(|e| RagError::Other(anyhow::anyhow!("Purge task panicked: {e}")))??;

    println!("Removed {removed} vectors");
    Ok(())
}

/// Show which vector backend is active and its collection statistics.
pub async fn show_status() -> Result<()> {
    let config = load_config()?;
    let (_, router) = build_stores(&config)?;
    let collection = config.vector_store.collection.clone();

    let (active, stats) = tokio::task::spawn_blocking(move || {
        router.refresh_connection_status();
        let active = router.active_backend(&collection);
        let stats = router.stats(&collection);
        (active, stats)
    })
    .await
    .map_err(|e| RagError::Other(anyhow::anyhow!("Status task panicked: {e}")))?;

    println!("Active backend: {active}");
    match stats {
        Ok(stats) => {
            println!("Vectors: {}", stats.vector_count);
            println!("Storage: {}", stats.storage_size);
            println!("Writable: {}", if stats.writable { "yes" } else { "no" });
        }
        Err(e) => println!("Statistics unavailable: {e}"),
    }

    let db_path = config.database_path();
    if db_path.exists() {
        println!("Chat database: {}", db_path.display());
    } else {
        println!("Chat database: not created yet");
    }
    Ok(())
}

/// Sweep streaming sessions that were abandoned mid-stream.
pub async fn reap_sessions() -> Result<()> {
    let config = load_config()?;
    let db = open_database(&config).await?;
    let sessions = SessionService::new(db);

    let reaped = sessions
        .reap_abandoned(config.streaming.session_timeout_minutes)
        .await?;
    println!("Reaped {reaped} abandoned streaming sessions");
    Ok(())
}
