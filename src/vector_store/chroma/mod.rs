
use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{
    BackendStats, Filter, FilterClause, SearchResult, VectorBackend, VectorRecord, ensure_success,
    format_bytes, http_agent, read_json, send_with_retry,
};
use crate::config::ChromaConfig;
use crate::{RagError, Result};

const WRITE_TIMEOUT: Duration = Duration::from_secs(60);
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Chroma-style vector backend, reached through an HTTP bridge.
///
/// Chroma reports L2 distances; they are converted to similarity scores via
/// `1 / (1 + distance)` so every backend speaks the same [0, 1] scale.
pub struct ChromaBackend {
    base_url: String,
    dimension: u32,
    write_agent: ureq::Agent,
    query_agent: ureq::Agent,
}

#[derive(Debug, Serialize)]
struct AddPayload {
    ids: Vec<String>,
    embeddings: Vec<Vec<f32>>,
    metadatas: Vec<BTreeMap<String, Value>>,
    documents: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CollectionInfo {
    #[serde(default)]
    count: usize,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    ids: Vec<Vec<String>>,
    #[serde(default)]
    distances: Vec<Vec<f32>>,
    #[serde(default)]
    metadatas: Vec<Vec<BTreeMap<String, Value>>>,
    #[serde(default)]
    documents: Vec<Vec<String>>,
}

impl ChromaBackend {
    pub fn new(config: &ChromaConfig, dimension: u32) -> Self {
        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            dimension,
            write_agent: http_agent(WRITE_TIMEOUT),
            query_agent: http_agent(QUERY_TIMEOUT),
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    fn post_json(&self, agent: &ureq::Agent, url: &str, body: &str) -> Result<ureq::http::Response<ureq::Body>> {
        let resp = send_with_retry("chroma", || {
            agent
                .post(url)
                .header("Content-Type", "application/json")
                .send(body)
        })?;
        ensure_success("chroma", resp)
    }

    fn translate_filter(filter: &Filter) -> Value {
        match &filter.clause {
            FilterClause::Eq(value) => json!({ filter.field.clone(): value }),
            FilterClause::In(values) => json!({ filter.field.clone(): { "$in": values } }),
        }
    }
}

impl VectorBackend for ChromaBackend {
    fn name(&self) -> &str {
        "chroma"
    }

    fn ensure_collection(&self, collection: &str) -> Result<()> {
        let url = self.url(&format!("/collections/{collection}"));
        let resp = send_with_retry("chroma", || self.query_agent.get(&url).call())?;
        if resp.status().is_success() {
            return Ok(());
        }

        let payload = json!({
            "name": collection,
            "metadata": {
                "description": "course document vector storage",
                "dimension": self.dimension,
            }
        })
        .to_string();
        self.post_json(&self.write_agent, &url, &payload)?;

        info!("Created Chroma collection {}", collection);
        Ok(())
    }

    fn upsert(&self, collection: &str, records: &[VectorRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        // Chroma stores the passage text as the document; strip it from the
        // metadata so it is not duplicated.
        let mut payload = AddPayload {
            ids: Vec::with_capacity(records.len()),
            embeddings: Vec::with_capacity(records.len()),
            metadatas: Vec::with_capacity(records.len()),
            documents: Vec::with_capacity(records.len()),
        };
        for record in records {
            let mut metadata = record.metadata.clone();
            let document = metadata
                .remove("content")
                .and_then(|v| v.as_str().map(ToOwned::to_owned))
                .unwrap_or_default();
            metadata
                .entry("course_namespace".to_string())
                .or_insert_with(|| Value::String(record.namespace.clone()));

            payload.ids.push(record.id.clone());
            payload.embeddings.push(record.embedding.clone());
            payload.metadatas.push(metadata);
            payload.documents.push(document);
        }

        let url = self.url(&format!("/collections/{collection}/add"));
        let body = serde_json::to_string(&payload)
            .map_err(|e| RagError::TransientBackend(format!("chroma payload: {e}")))?;
        self.post_json(&self.write_agent, &url, &body)?;

        debug!(
            "Added {} vectors to Chroma collection {}",
            records.len(),
            collection
        );
        Ok(records.len())
    }

    fn search(
        &self,
        collection: &str,
        query: &[f32],
        top_k: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<SearchResult>> {
        let mut payload = json!({
            "query_embeddings": [query],
            "n_results": top_k,
            "include": ["metadatas", "documents", "distances"],
        });
        if let Some(filter) = filter
            && let Some(obj) = payload.as_object_mut()
        {
            obj.insert("where".to_string(), Self::translate_filter(filter));
        }

        let url = self.url(&format!("/collections/{collection}/query"));
        let mut resp = self.post_json(&self.query_agent, &url, &payload.to_string())?;
        let parsed: QueryResponse = read_json("chroma", &mut resp)?;

        let ids = parsed.ids.into_iter().next().unwrap_or_default();
        let distances = parsed.distances.into_iter().next().unwrap_or_default();
        let metadatas = parsed.metadatas.into_iter().next().unwrap_or_default();
        let documents = parsed.documents.into_iter().next().unwrap_or_default();

        let results = ids
            .into_iter()
            .enumerate()
            .map(|(i, id)| {
                let distance = distances.get(i).copied().unwrap_or(1.0);
                let mut metadata = metadatas.get(i).cloned().unwrap_or_default();
                if let Some(document) = documents.get(i) {
                    metadata.insert("content".to_string(), Value::String(document.clone()));
                }
                SearchResult {
                    id,
                    score: 1.0 / (1.0 + distance),
                    metadata,
                }
            })
            .collect();

        Ok(results)
    }

    fn delete(&self, collection: &str, ids: &[String], filter: Option<&Filter>) -> Result<usize> {
        let mut payload = serde_json::Map::new();
        if !ids.is_empty() {
            payload.insert("ids".to_string(), json!(ids));
        }
        if let Some(filter) = filter {
            payload.insert("where".to_string(), Self::translate_filter(filter));
        }
        if payload.is_empty() {
            return Err(RagError::Validation(
                "Deletion requires ids or a filter".into(),
            ));
        }

        let url = self.url(&format!("/collections/{collection}/delete"));
        self.post_json(&self.write_agent, &url, &Value::Object(payload).to_string())?;

        // Chroma does not report how many records the delete touched.
        Ok(ids.len())
    }

    fn stats(&self, collection: &str) -> Result<BackendStats> {
        let url = self.url(&format!("/collections/{collection}"));
        let resp = send_with_retry("chroma", || self.query_agent.get(&url).call())?;
        let mut resp = ensure_success("chroma", resp)?;

        let info: CollectionInfo = read_json("chroma", &mut resp)?;
        Ok(BackendStats {
            backend: "chroma".to_string(),
            vector_count: info.count,
            storage_size: format_bytes((info.count * self.dimension as usize * 4) as u64),
            writable: true,
        })
    }

    fn health_check(&self) -> bool {
        let url = self.url("/health");
        match self.query_agent.get(&url).call() {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}
