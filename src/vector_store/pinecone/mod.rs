
use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{
    BackendStats, Filter, FilterClause, SearchResult, VectorBackend, VectorRecord, ensure_success,
    format_bytes, http_agent, read_json, send_with_retry,
};
use crate::config::PineconeConfig;
use crate::{RagError, Result};

const WRITE_TIMEOUT: Duration = Duration::from_secs(60);
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Pinecone-style vector backend. Scores arrive on a cosine scale already
/// and are clamped to [0, 1].
pub struct PineconeBackend {
    base_url: String,
    api_key: String,
    dimension: u32,
    write_agent: ureq::Agent,
    query_agent: ureq::Agent,
}

#[derive(Debug, Serialize)]
struct UpsertVector<'a> {
    id: &'a str,
    values: &'a [f32],
    metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Debug, Deserialize)]
struct QueryMatch {
    id: String,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    #[serde(default, rename = "totalVectorCount")]
    total_vector_count: usize,
}

impl PineconeBackend {
    pub fn new(config: &PineconeConfig, dimension: u32) -> Self {
        Self {
            base_url: config.endpoint_base().trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            dimension,
            write_agent: http_agent(WRITE_TIMEOUT),
            query_agent: http_agent(QUERY_TIMEOUT),
        }
    }

    fn post_json(
        &self,
        agent: &ureq::Agent,
        endpoint: &str,
        body: &str,
    ) -> Result<ureq::http::Response<ureq::Body>> {
        let url = format!("{}{}", self.base_url, endpoint);
        let resp = send_with_retry("pinecone", || {
            agent
                .post(&url)
                .header("Api-Key", &self.api_key)
                .header("Content-Type", "application/json")
                .send(body)
        })?;
        ensure_success("pinecone", resp)
    }

    fn get(&self, endpoint: &str) -> Result<ureq::http::Response<ureq::Body>> {
        let url = format!("{}{}", self.base_url, endpoint);
        send_with_retry("pinecone", || {
            self.query_agent
                .get(&url)
                .header("Api-Key", &self.api_key)
                .call()
        })
    }

    fn translate_filter(filter: &Filter) -> Value {
        match &filter.clause {
            FilterClause::Eq(value) => json!({ filter.field.clone(): { "$eq": value } }),
            FilterClause::In(values) => json!({ filter.field.clone(): { "$in": values } }),
        }
    }
}

impl VectorBackend for PineconeBackend {
    fn name(&self) -> &str {
        "pinecone"
    }

    fn ensure_collection(&self, collection: &str) -> Result<()> {
        let resp = self.get(&format!("/databases/{collection}"))?;
        if resp.status().is_success() {
            return Ok(());
        }

        let payload = json!({
            "name": collection,
            "dimension": self.dimension,
            "metric": "cosine",
            "pods": 1,
            "replicas": 1,
            "pod_type": "p1.x1",
        })
        .to_string();
        self.post_json(&self.write_agent, "/databases", &payload)?;

        info!("Created Pinecone index {}", collection);
        Ok(())
    }

    fn upsert(&self, collection: &str, records: &[VectorRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let vectors: Vec<UpsertVector<'_>> = records
            .iter()
            .map(|record| {
                let mut metadata = record.metadata.clone();
                metadata
                    .entry("course_namespace".to_string())
                    .or_insert_with(|| Value::String(record.namespace.clone()));
                UpsertVector {
                    id: &record.id,
                    values: &record.embedding,
                    metadata,
                }
            })
            .collect();

        let body = serde_json::to_string(&json!({ "vectors": vectors }))
            .map_err(|e| RagError::TransientBackend(format!("pinecone payload: {e}")))?;
        self.post_json(
            &self.write_agent,
            &format!("/databases/{collection}/vectors/upsert"),
            &body,
        )?;

        debug!(
            "Upserted {} vectors to Pinecone index {}",
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
            "vector": query,
            "topK": top_k,
            "includeMetadata": true,
            "includeValues": false,
        });
        if let Some(filter) = filter
            && let Some(obj) = payload.as_object_mut()
        {
            obj.insert("filter".to_string(), Self::translate_filter(filter));
        }

        let mut resp = self.post_json(
            &self.query_agent,
            &format!("/databases/{collection}/vectors/query"),
            &payload.to_string(),
        )?;
        let parsed: QueryResponse = read_json("pinecone", &mut resp)?;

        Ok(parsed
            .matches
            .into_iter()
            .map(|m| SearchResult {
                id: m.id,
                score: m.score.clamp(0.0, 1.0),
                metadata: m.metadata,
            })
            .collect())
    }

    fn delete(&self, collection: &str, ids: &[String], filter: Option<&Filter>) -> Result<usize> {
        let mut payload = serde_json::Map::new();
        if !ids.is_empty() {
            payload.insert("ids".to_string(), json!(ids));
        }
        if let Some(filter) = filter {
            payload.insert("filter".to_string(), Self::translate_filter(filter));
        }
        if payload.is_empty() {
            return Err(RagError::Validation(
                "Deletion requires ids or a filter".into(),
            ));
        }

        self.post_json(
            &self.write_agent,
            &format!("/databases/{collection}/vectors/delete"),
            &Value::Object(payload).to_string(),
        )?;
        Ok(ids.len())
    }

    fn stats(&self, collection: &str) -> Result<BackendStats> {
        let resp = self.get(&format!("/databases/{collection}/stats"))?;
        let mut resp = ensure_success("pinecone", resp)?;
        let parsed: StatsResponse = read_json("pinecone", &mut resp)?;

        Ok(BackendStats {
            backend: "pinecone".to_string(),
            vector_count: parsed.total_vector_count,
            storage_size: format_bytes(
                (parsed.total_vector_count * self.dimension as usize * 4) as u64,
            ),
            writable: true,
        })
    }

    fn health_check(&self) -> bool {
        let url = format!("{}/databases", self.base_url);
        let result = self
            .query_agent
            .get(&url)
            .header("Api-Key", &self.api_key)
            .call();
        match result {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}
