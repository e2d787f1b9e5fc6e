#[cfg(test)]
mod tests;

pub mod chroma;
pub mod local;
pub mod pinecone;
pub mod router;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::{RagError, Result};

/// A vector plus its metadata, ready to store in a backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    pub metadata: BTreeMap<String, Value>,
    pub namespace: String,
}

/// A scored search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub id: String,
    pub score: f32,
    pub metadata: BTreeMap<String, Value>,
}

/// Storage statistics reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendStats {
    pub backend: String,
    pub vector_count: usize,
    pub storage_size: String,
    pub writable: bool,
}

/// Metadata filter with a uniform vocabulary translated by each backend:
/// exact match on a field, or membership in a value set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub field: String,
    pub clause: FilterClause,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterClause {
    Eq(String),
    In(Vec<String>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            clause: FilterClause::Eq(value.into()),
        }
    }

    pub fn any_of(field: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            field: field.into(),
            clause: FilterClause::In(values),
        }
    }

    /// Whether `metadata` satisfies this filter.
    pub fn matches(&self, metadata: &BTreeMap<String, Value>) -> bool {
        let Some(value) = metadata.get(&self.field).and_then(Value::as_str) else {
            return false;
        };
        match &self.clause {
            FilterClause::Eq(expected) => value == expected,
            FilterClause::In(allowed) => allowed.iter().any(|v| v == value),
        }
    }
}

/// Uniform interface over the vector storage backends.
pub trait VectorBackend: Send + Sync {
    /// Human-readable backend name for logs and stats.
    fn name(&self) -> &str;

    /// Create the collection if the backend requires one. Idempotent.
    fn ensure_collection(&self, collection: &str) -> Result<()>;

    /// Insert or replace records by id. Returns the number stored.
    fn upsert(&self, collection: &str, records: &[VectorRecord]) -> Result<usize>;

    /// Nearest-neighbor search, optionally filtered by metadata.
    fn search(
        &self,
        collection: &str,
        query: &[f32],
        top_k: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<SearchResult>>;

    /// Delete by explicit ids and/or metadata filter. Returns a best-effort
    /// count of removed records.
    fn delete(&self, collection: &str, ids: &[String], filter: Option<&Filter>) -> Result<usize>;

    /// Storage statistics.
    fn stats(&self, collection: &str) -> Result<BackendStats>;

    /// Cheap reachability probe.
    fn health_check(&self) -> bool;
}

/// Cosine similarity of two vectors. Returns 0.0 when either vector has zero
/// norm or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}

const RETRY_ATTEMPTS: u32 = 3;

/// Build a blocking HTTP agent with a global timeout and manual status
/// handling, shared by the remote backends.
pub(crate) fn http_agent(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .http_status_as_error(false)
        .build()
        .into()
}

/// Issue a request up to [`RETRY_ATTEMPTS`] times with exponential backoff.
///
/// 429 responses honor `Retry-After` when present (capped at 30s), falling
/// back to `2^attempt` seconds; 5xx responses retry after 1s, 2s, 4s; other
/// statuses are returned to the caller as-is.
pub(crate) fn send_with_retry<F>(
    backend: &str,
    mut request: F,
) -> Result<ureq::http::Response<ureq::Body>>
where
    F: FnMut() -> std::result::Result<ureq::http::Response<ureq::Body>, ureq::Error>,
{
    let mut last_error = None;

    for attempt in 1..=RETRY_ATTEMPTS {
        match request() {
            Ok(resp) => {
                let status = resp.status().as_u16();

                if status == 429 {
                    let delay = retry_after_seconds(&resp).unwrap_or(1 << attempt).min(30);
                    warn!(
                        "{} rate limited (429), attempt {}/{}, waiting {}s",
                        backend, attempt, RETRY_ATTEMPTS, delay
                    );
                    last_error = Some(RagError::TransientBackend(format!(
                        "{backend} rate limited (HTTP 429)"
                    )));
                    if attempt < RETRY_ATTEMPTS {
                        std::thread::sleep(Duration::from_secs(delay));
                    }
                    continue;
                }

                if status >= 500 {
                    warn!(
                        "{} server error (HTTP {}), attempt {}/{}",
                        backend, status, attempt, RETRY_ATTEMPTS
                    );
                    last_error = Some(RagError::TransientBackend(format!(
                        "{backend} request failed (HTTP {status})"
                    )));
                    if attempt < RETRY_ATTEMPTS {
                        std::thread::sleep(Duration::from_secs(1 << (attempt - 1)));
                    }
                    continue;
                }

                return Ok(resp);
            }
            Err(error) => {
                warn!(
                    "{} transport error: {}, attempt {}/{}",
                    backend, error, attempt, RETRY_ATTEMPTS
                );
                last_error = Some(RagError::TransientBackend(format!(
                    "{backend} transport error: {error}"
                )));
                if attempt < RETRY_ATTEMPTS {
                    std::thread::sleep(Duration::from_secs(1 << (attempt - 1)));
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        RagError::TransientBackend(format!("{backend} request failed after retries"))
    }))
}

fn retry_after_seconds(resp: &ureq::http::Response<ureq::Body>) -> Option<u64> {
    resp.headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Read a response body and deserialize it, mapping failures onto
/// [`RagError::TransientBackend`].
pub(crate) fn read_json<T: serde::de::DeserializeOwned>(
    backend: &str,
    resp: &mut ureq::http::Response<ureq::Body>,
) -> Result<T> {
    let body = resp
        .body_mut()
        .read_to_string()
        .map_err(|e| RagError::TransientBackend(format!("{backend} response read failed: {e}")))?;
    serde_json::from_str(&body)
        .map_err(|e| RagError::TransientBackend(format!("{backend} response parse failed: {e}")))
}

/// Pass a successful response through, otherwise read the body and map the
/// status onto the error taxonomy.
pub(crate) fn ensure_success(
    backend: &str,
    mut resp: ureq::http::Response<ureq::Body>,
) -> Result<ureq::http::Response<ureq::Body>> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.body_mut().read_to_string().unwrap_or_default();
    Err(status_error(backend, status, &body))
}

/// Map a non-success status onto the error taxonomy.
pub(crate) fn status_error(backend: &str, status: u16, body: &str) -> RagError {
    match status {
        401 | 403 => RagError::Auth(format!("{backend} rejected credentials (HTTP {status})")),
        404 => RagError::NotFound(format!("{backend} resource missing (HTTP {status})")),
        _ => RagError::TransientBackend(format!(
            "{backend} request failed (HTTP {status}): {body}"
        )),
    }
}
