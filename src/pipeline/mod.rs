
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, error, info};

use crate::chunking::{Chunk, ChunkingConfig, chunk_document};
use crate::config::Config;
use crate::embeddings::EmbeddingProvider;
use crate::vector_store::router::VectorStoreRouter;
use crate::vector_store::{Filter, VectorRecord};
use crate::{RagError, Result};

/// Vectors are written through the router in batches of this size.
const BATCH_SIZE: usize = 100;

/// Outcome of a document ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestResult {
    /// Chunks successfully embedded and stored.
    pub chunks_processed: usize,
    /// Chunks the document was split into.
    pub total_chunks: usize,
}

/// A retrieved passage with its similarity score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPassage {
    pub id: String,
    pub score: f32,
    pub content: String,
    pub metadata: BTreeMap<String, Value>,
}

/// Turns course documents into stored vectors and queries them back.
pub struct DocumentPipeline {
    embedder: Arc<dyn EmbeddingProvider>,
    router: Arc<VectorStoreRouter>,
    chunking: ChunkingConfig,
    collection: String,
}

impl DocumentPipeline {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        router: Arc<VectorStoreRouter>,
        config: &Config,
    ) -> Self {
        Self {
            embedder,
            router,
            chunking: config.chunking.clone(),
            collection: config.vector_store.collection.clone(),
        }
    }

    /// Ingest a document under `namespace`.
    ///
    /// The namespace is purged first so re-ingesting the same document never
    /// duplicates vectors. Individual chunks that fail to embed are skipped;
    /// the ingest fails only when nothing could be stored.
    pub fn ingest(
        &self,
        content: &str,
        namespace: &str,
        metadata: &BTreeMap<String, Value>,
    ) -> Result<IngestResult> {
        if content.trim().is_empty() {
            return Err(RagError::Validation("Document content is empty".into()));
        }
        if namespace.trim().is_empty() {
            return Err(RagError::Validation("Namespace is empty".into()));
        }

        self.purge_namespace(namespace)?;

        let chunks = chunk_document(content, &self.chunking);
        let total_chunks = chunks.len();
        if total_chunks == 0 {
            return Err(RagError::Validation(
                "Document produced no usable chunks".into(),
            ));
        }

        let mut records = Vec::with_capacity(total_chunks);
        for chunk in &chunks {
            match self.embedder.embed(&chunk.text) {
                Ok(embedding) => {
                    records.push(self.build_record(chunk, embedding, namespace, metadata));
                }
                Err(err) => {
                    error!(
                        "Failed to embed chunk {} of namespace {}: {}",
                        chunk.index, namespace, err
                    );
                }
            }
        }

        let chunks_processed = records.len();
        if chunks_processed == 0 {
            return Err(RagError::Embedding(format!(
                "No chunks could be embedded for namespace {namespace}"
            )));
        }

        for batch in records.chunks(BATCH_SIZE) {
            self.router.upsert(&self.collection, batch)?;
            debug!(
                "Stored batch of {} vectors for namespace {}",
                batch.len(),
                namespace
            );
        }

        info!(
            "Ingested {}/{} chunks for namespace {}",
            chunks_processed, total_chunks, namespace
        );
        Ok(IngestResult {
            chunks_processed,
            total_chunks,
        })
    }

    /// Embed `text` and return the closest passages, optionally restricted to
    /// a set of namespaces. An embedding failure aborts the query.
    pub fn query(
        &self,
        text: &str,
        namespaces: &[String],
        top_k: usize,
    ) -> Result<Vec<ScoredPassage>> {
        let embedding = self.embedder.embed(text)?;

        let filter = if namespaces.is_empty() {
            None
        } else {
            Some(Filter::any_of("course_namespace", namespaces.to_vec()))
        };

        let results = self
            .router
            .search(&self.collection, &embedding, top_k, filter.as_ref())?;

        Ok(results
            .into_iter()
            .map(|result| {
                let content = result
                    .metadata
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                ScoredPassage {
                    id: result.id,
                    score: result.score,
                    content,
                    metadata: result.metadata,
                }
            })
            .collect())
    }

    /// Remove every vector stored under `namespace`.
    pub fn purge_namespace(&self, namespace: &str) -> Result<usize> {
        if namespace.trim().is_empty() {
            return Err(RagError::Validation("Namespace is empty".into()));
        }
        let filter = Filter::eq("course_namespace", namespace);
        let removed = self.router.delete(&self.collection, &[], Some(&filter))?;
        debug!("Purged namespace {} ({} records)", namespace, removed);
        Ok(removed)
    }

    fn build_record(
        &self,
        chunk: &Chunk,
        embedding: Vec<f32>,
        namespace: &str,
        metadata: &BTreeMap<String, Value>,
    ) -> VectorRecord {
        let mut merged = metadata.clone();
        merged.insert("content".to_string(), Value::String(chunk.text.clone()));
        merged.insert(
            "course_namespace".to_string(),
            Value::String(namespace.to_string()),
        );
        merged.insert("chunk_index".to_string(), json!(chunk.index));
        merged.insert("chunk_count".to_string(), json!(chunk.total_chunks));
        merged.insert(
            "processed_at".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );

        VectorRecord {
            id: generate_vector_id(namespace, chunk.index),
            embedding,
            metadata: merged,
            namespace: namespace.to_string(),
        }
    }
}

/// Unique vector id: namespace, timestamp, chunk index and a random suffix.
fn generate_vector_id(namespace: &str, chunk_index: usize) -> String {
    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    let suffix: String = uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(8)
        .collect();
    format!("{namespace}_{timestamp}_{chunk_index}_{suffix}")
}
