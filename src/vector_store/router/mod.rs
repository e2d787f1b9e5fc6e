#[cfg(test)]
mod tests;

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::chroma::ChromaBackend;
use super::local::LocalVectorStore;
use super::pinecone::PineconeBackend;
use super::{BackendStats, Filter, SearchResult, VectorBackend, VectorRecord};
use crate::Result;
use crate::config::Config;

/// Routes vector operations to the first healthy backend.
///
/// Remotes are probed in registration order; the local store is the fallback
/// of last resort and always healthy. The probe result is cached for the
/// configured TTL. When a selected remote fails at runtime the router pins
/// itself to the local store for the rest of the process and retries the
/// failed operation there once.
pub struct VectorStoreRouter {
    remotes: Vec<Box<dyn VectorBackend>>,
    local: LocalVectorStore,
    cache_ttl: Duration,
    state: Mutex<RouterState>,
}

#[derive(Debug, Default)]
struct RouterState {
    selection: Option<Selection>,
    checked_at: Option<Instant>,
    pinned_local: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selection {
    Remote(usize),
    Local,
}

impl VectorStoreRouter {
    pub fn new(
        remotes: Vec<Box<dyn VectorBackend>>,
        local: LocalVectorStore,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            remotes,
            local,
            cache_ttl,
            state: Mutex::new(RouterState::default()),
        }
    }

    /// Build the router from configuration: Chroma, then Pinecone when
    /// credentials are present, then the local store.
    pub fn from_config(config: &Config) -> Result<Self> {
        let dimension = config.embeddings.dimension;

        let mut remotes: Vec<Box<dyn VectorBackend>> = Vec::new();
        remotes.push(Box::new(ChromaBackend::new(
            &config.vector_store.chroma,
            dimension,
        )));
        if config.vector_store.pinecone.is_configured() {
            remotes.push(Box::new(PineconeBackend::new(
                &config.vector_store.pinecone,
                dimension,
            )));
        }

        let local = LocalVectorStore::new(config.vector_storage_path())?;
        Ok(Self::new(
            remotes,
            local,
            Duration::from_secs(config.vector_store.cache_ttl_secs),
        ))
    }

    /// Name of the backend that would serve the next operation.
    pub fn active_backend(&self, collection: &str) -> String {
        match self.select(collection) {
            Selection::Remote(i) => self.remotes[i].name().to_string(),
            Selection::Local => self.local.name().to_string(),
        }
    }

    /// Drop the cached selection (and any local pin) so the next operation
    /// re-probes the backends.
    pub fn refresh_connection_status(&self) {
        let mut state = self.state_lock();
        state.selection = None;
        state.checked_at = None;
        state.pinned_local = false;
        info!("Vector backend selection cache cleared");
    }

    pub fn upsert(&self, collection: &str, records: &[VectorRecord]) -> Result<usize> {
        self.execute(collection, |backend| backend.upsert(collection, records))
    }

    pub fn search(
        &self,
        collection: &str,
        query: &[f32],
        top_k: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<SearchResult>> {
        self.execute(collection, |backend| {
            backend.search(collection, query, top_k, filter)
        })
    }

    pub fn delete(
        &self,
        collection: &str,
        ids: &[String],
        filter: Option<&Filter>,
    ) -> Result<usize> {
        self.execute(collection, |backend| backend.delete(collection, ids, filter))
    }

    pub fn stats(&self, collection: &str) -> Result<BackendStats> {
        self.execute(collection, |backend| backend.stats(collection))
    }

    fn execute<T>(
        &self,
        collection: &str,
        op: impl Fn(&dyn VectorBackend) -> Result<T>,
    ) -> Result<T> {
        match self.select(collection) {
            Selection::Local => op(&self.local),
            Selection::Remote(i) => {
                let remote = &self.remotes[i];
                match op(remote.as_ref()) {
                    Ok(value) => Ok(value),
                    Err(error) => {
                        warn!(
                            "{} operation failed ({}), pinning to local storage",
                            remote.name(),
                            error
                        );
                        self.pin_local();
                        op(&self.local)
                    }
                }
            }
        }
    }

    fn select(&self, collection: &str) -> Selection {
        let mut state = self.state_lock();

        if state.pinned_local {
            return Selection::Local;
        }

        let fresh = state
            .checked_at
            .is_some_and(|at| at.elapsed() < self.cache_ttl);
        if fresh && let Some(selection) = state.selection {
            return selection;
        }

        let selection = self.probe(collection);
        state.selection = Some(selection);
        state.checked_at = Some(Instant::now());
        selection
    }

    fn probe(&self, collection: &str) -> Selection {
        for (i, remote) in self.remotes.iter().enumerate() {
            if !remote.health_check() {
                debug!("{} backend unhealthy, trying next", remote.name());
                continue;
            }
            if let Err(error) = remote.ensure_collection(collection) {
                warn!(
                    "{} healthy but collection setup failed: {}",
                    remote.name(),
                    error
                );
                continue;
            }
            info!("Selected {} vector backend", remote.name());
            return Selection::Remote(i);
        }

        info!("No remote vector backend available, using local storage");
        Selection::Local
    }

    fn pin_local(&self) {
        let mut state = self.state_lock();
        state.pinned_local = true;
        state.selection = Some(Selection::Local);
    }

    fn state_lock(&self) -> std::sync::MutexGuard<'_, RouterState> {
        // Lock poisoning means a panic mid-probe; recover the state rather
        // than propagating the poison.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
