
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{BackendStats, Filter, SearchResult, VectorBackend, VectorRecord, cosine_similarity, format_bytes};
use crate::{RagError, Result};

const VECTORS_FILE: &str = "vectors.json";
const METADATA_FILE: &str = "metadata.json";

/// File-backed similarity index used when no remote backend is reachable.
///
/// Embeddings live in `vectors.json` and per-record metadata in
/// `metadata.json`; both are rewritten after every mutation. A mutex
/// serializes load-mutate-persist cycles.
pub struct LocalVectorStore {
    storage_dir: PathBuf,
    data: Mutex<StoreData>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    vectors: BTreeMap<String, Vec<f32>>,
    metadata: BTreeMap<String, StoredMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMetadata {
    namespace: String,
    #[serde(flatten)]
    fields: BTreeMap<String, Value>,
}

impl LocalVectorStore {
    pub fn new<P: AsRef<Path>>(storage_dir: P) -> Result<Self> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        fs::create_dir_all(&storage_dir).with_context(|| {
            format!("Failed to create storage directory: {}", storage_dir.display())
        })?;

        let data = Self::load_from(&storage_dir)?;
        Ok(Self {
            storage_dir,
            data: Mutex::new(data),
        })
    }

    fn load_from(dir: &Path) -> Result<StoreData> {
        let vectors_path = dir.join(VECTORS_FILE);
        let metadata_path = dir.join(METADATA_FILE);

        let vectors = if vectors_path.exists() {
            let content = fs::read_to_string(&vectors_path)?;
            serde_json::from_str(&content)
                .map_err(|e| RagError::Database(format!("Corrupt vector file: {e}")))?
        } else {
            BTreeMap::new()
        };

        let metadata = if metadata_path.exists() {
            let content = fs::read_to_string(&metadata_path)?;
            serde_json::from_str(&content)
                .map_err(|e| RagError::Database(format!("Corrupt metadata file: {e}")))?
        } else {
            BTreeMap::new()
        };

        Ok(StoreData { vectors, metadata })
    }

    fn persist(&self, data: &StoreData) -> Result<()> {
        let vectors = serde_json::to_string(&data.vectors)
            .map_err(|e| RagError::Database(format!("Failed to serialize vectors: {e}")))?;
        let metadata = serde_json::to_string(&data.metadata)
            .map_err(|e| RagError::Database(format!("Failed to serialize metadata: {e}")))?;

        fs::write(self.storage_dir.join(VECTORS_FILE), vectors)?;
        fs::write(self.storage_dir.join(METADATA_FILE), metadata)?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, StoreData>> {
        self.data
            .lock()
            .map_err(|_| RagError::Database("Local store lock poisoned".into()))
    }

    fn storage_size(&self) -> u64 {
        [VECTORS_FILE, METADATA_FILE]
            .iter()
            .filter_map(|name| fs::metadata(self.storage_dir.join(name)).ok())
            .map(|m| m.len())
            .sum()
    }
}

impl VectorBackend for LocalVectorStore {
    fn name(&self) -> &str {
        "local"
    }

    fn ensure_collection(&self, _collection: &str) -> Result<()> {
        // A single flat index; collections need no setup.
        Ok(())
    }

    fn upsert(&self, _collection: &str, records: &[VectorRecord]) -> Result<usize> {
        let mut data = self.lock()?;

        for record in records {
            data.vectors.insert(record.id.clone(), record.embedding.clone());
            data.metadata.insert(
                record.id.clone(),
                StoredMetadata {
                    namespace: record.namespace.clone(),
                    fields: record.metadata.clone(),
                },
            );
        }

        self.persist(&data)?;
        debug!("Stored {} vectors locally ({} total)", records.len(), data.vectors.len());
        Ok(records.len())
    }

    fn search(
        &self,
        _collection: &str,
        query: &[f32],
        top_k: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<SearchResult>> {
        let data = self.lock()?;

        let mut results: Vec<SearchResult> = data
            .vectors
            .iter()
            .filter_map(|(id, embedding)| {
                let meta = data.metadata.get(id)?;
                let fields = meta.full_fields();
                if let Some(filter) = filter
                    && !filter.matches(&fields)
                {
                    return None;
                }
                Some(SearchResult {
                    id: id.clone(),
                    score: cosine_similarity(query, embedding),
                    metadata: fields,
                })
            })
            .collect();

        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        results.truncate(top_k);
        Ok(results)
    }

    fn delete(&self, _collection: &str, ids: &[String], filter: Option<&Filter>) -> Result<usize> {
        let mut data = self.lock()?;

        let mut doomed: Vec<String> = ids
            .iter()
            .filter(|id| data.vectors.contains_key(*id))
            .cloned()
            .collect();

        if let Some(filter) = filter {
            doomed.extend(
                data.metadata
                    .iter()
                    .filter(|(_, meta)| filter.matches(&meta.full_fields()))
                    .map(|(id, _)| id.clone()),
            );
        }

        doomed.sort();
        doomed.dedup();

        for id in &doomed {
            data.vectors.remove(id);
            data.metadata.remove(id);
        }

        if !doomed.is_empty() {
            self.persist(&data)?;
        }
        Ok(doomed.len())
    }

    fn stats(&self, _collection: &str) -> Result<BackendStats> {
        let data = self.lock()?;
        let writable = fs::metadata(&self.storage_dir)
            .map(|m| !m.permissions().readonly())
            .unwrap_or(false);

        Ok(BackendStats {
            backend: "local".to_string(),
            vector_count: data.vectors.len(),
            storage_size: format_bytes(self.storage_size()),
            writable,
        })
    }

    fn health_check(&self) -> bool {
        true
    }
}

impl StoredMetadata {
    /// Metadata fields with the namespace projected in, so namespace filters
    /// work uniformly.
    fn full_fields(&self) -> BTreeMap<String, Value> {
        let mut fields = self.fields.clone();
        fields
            .entry("course_namespace".to_string())
            .or_insert_with(|| Value::String(self.namespace.clone()));
        fields
    }
}
