use super::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

/// Scriptable in-memory backend for router tests.
struct FakeBackend {
    name: String,
    healthy: bool,
    fail_operations: bool,
    health_calls: Arc<AtomicUsize>,
    operation_calls: Arc<AtomicUsize>,
}

impl FakeBackend {
    fn new(name: &str, healthy: bool, fail_operations: bool) -> Self {
        Self {
            name: name.to_string(),
            healthy,
            fail_operations,
            health_calls: Arc::new(AtomicUsize::new(0)),
            operation_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn fail(&self) -> crate::RagError {
        crate::RagError::TransientBackend(format!("{} is broken", self.name))
    }
}

impl VectorBackend for FakeBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn ensure_collection(&self, _collection: &str) -> Result<()> {
        Ok(())
    }

    fn upsert(&self, _collection: &str, records: &[VectorRecord]) -> Result<usize> {
        self.operation_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_operations {
            return Err(self.fail());
        }
        Ok(records.len())
    }

    fn search(
        &self,
        _collection: &str,
        _query: &[f32],
        _top_k: usize,
        _filter: Option<&Filter>,
    ) -> Result<Vec<SearchResult>> {
        self.operation_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_operations {
            return Err(self.fail());
        }
        Ok(vec![])
    }

    fn delete(&self, _collection: &str, ids: &[String], _filter: Option<&Filter>) -> Result<usize> {
        self.operation_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_operations {
            return Err(self.fail());
        }
        Ok(ids.len())
    }

    fn stats(&self, _collection: &str) -> Result<BackendStats> {
        if self.fail_operations {
            return Err(self.fail());
        }
        Ok(BackendStats {
            backend: self.name.clone(),
            vector_count: 0,
            storage_size: "0 B".to_string(),
            writable: true,
        })
    }

    fn health_check(&self) -> bool {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        self.healthy
    }
}

fn record(id: &str) -> VectorRecord {
    VectorRecord {
        id: id.to_string(),
        embedding: vec![1.0, 0.0],
        metadata: std::collections::BTreeMap::new(),
        namespace: "test".to_string(),
    }
}

fn router_with(
    remotes: Vec<FakeBackend>,
    temp_dir: &TempDir,
    ttl: Duration,
) -> VectorStoreRouter {
    let local = LocalVectorStore::new(temp_dir.path()).expect("local store should open");
    let remotes: Vec<Box<dyn VectorBackend>> = remotes
        .into_iter()
        .map(|b| Box::new(b) as Box<dyn VectorBackend>)
        .collect();
    VectorStoreRouter::new(remotes, local, ttl)
}

#[test]
fn healthy_remote_is_preferred() {
    let temp_dir = TempDir::new().expect("temp dir should be created");
    let remote = FakeBackend::new("remote", true, false);
    let operation_calls = Arc::clone(&remote.operation_calls);

    let router = router_with(vec![remote], &temp_dir, Duration::from_secs(600));

    assert_eq!(router.active_backend("test"), "remote");
    router
        .upsert("test", &[record("a")])
        .expect("upsert should succeed");
    assert_eq!(operation_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn unhealthy_remote_falls_through_to_local() {
    let temp_dir = TempDir::new().expect("temp dir should be created");
    let remote = FakeBackend::new("remote", false, false);
    let operation_calls = Arc::clone(&remote.operation_calls);

    let router = router_with(vec![remote], &temp_dir, Duration::from_secs(600));

    assert_eq!(router.active_backend("test"), "local");
    router
        .upsert("test", &[record("a")])
        .expect("upsert should succeed");
    assert_eq!(operation_calls.load(Ordering::SeqCst), 0);

    let stats = router.stats("test").expect("stats should succeed");
    assert_eq!(stats.backend, "local");
    assert_eq!(stats.vector_count, 1);
}

#[test]
fn probe_order_prefers_earlier_backends() {
    let temp_dir = TempDir::new().expect("temp dir should be created");
    let first = FakeBackend::new("first", false, false);
    let second = FakeBackend::new("second", true, false);

    let router = router_with(vec![first, second], &temp_dir, Duration::from_secs(600));
    assert_eq!(router.active_backend("test"), "second");
}

#[test]
fn runtime_failure_pins_to_local_and_retries() {
    let temp_dir = TempDir::new().expect("temp dir should be created");
    let remote = FakeBackend::new("remote", true, true);
    let operation_calls = Arc::clone(&remote.operation_calls);
    let health_calls = Arc::clone(&remote.health_calls);

    let router = router_with(vec![remote], &temp_dir, Duration::from_secs(600));

    // The failed upsert is retried against the local store and succeeds.
    let stored = router
        .upsert("test", &[record("a")])
        .expect("fallback upsert should succeed");
    assert_eq!(stored, 1);
    assert_eq!(operation_calls.load(Ordering::SeqCst), 1);

    // Later operations go straight to local without touching the remote.
    router
        .search("test", &[1.0, 0.0], 5, None)
        .expect("search should succeed");
    assert_eq!(operation_calls.load(Ordering::SeqCst), 1);
    assert_eq!(router.active_backend("test"), "local");
    assert_eq!(health_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn selection_is_cached_within_ttl() {
    let temp_dir = TempDir::new().expect("temp dir should be created");
    let remote = FakeBackend::new("remote", true, false);
    let health_calls = Arc::clone(&remote.health_calls);

    let router = router_with(vec![remote], &temp_dir, Duration::from_secs(600));

    router
        .upsert("test", &[record("a")])
        .expect("upsert should succeed");
    router
        .search("test", &[1.0, 0.0], 5, None)
        .expect("search should succeed");
    router.stats("test").expect("stats should succeed");

    assert_eq!(health_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn expired_ttl_triggers_a_new_probe() {
    let temp_dir = TempDir::new().expect("temp dir should be created");
    let remote = FakeBackend::new("remote", true, false);
    let health_calls = Arc::clone(&remote.health_calls);

    let router = router_with(vec![remote], &temp_dir, Duration::from_millis(10));

    router
        .upsert("test", &[record("a")])
        .expect("upsert should succeed");
    std::thread::sleep(Duration::from_millis(20));
    router
        .search("test", &[1.0, 0.0], 5, None)
        .expect("search should succeed");

    assert_eq!(health_calls.load(Ordering::SeqCst), 2);
}

#[test]
fn refresh_clears_cache_and_pin() {
    let temp_dir = TempDir::new().expect("temp dir should be created");
    let remote = FakeBackend::new("remote", true, true);
    let health_calls = Arc::clone(&remote.health_calls);

    let router = router_with(vec![remote], &temp_dir, Duration::from_secs(600));

    router
        .upsert("test", &[record("a")])
        .expect("fallback upsert should succeed");
    assert_eq!(router.active_backend("test"), "local");

    router.refresh_connection_status();
    // The remote is probed again after the refresh.
    assert_eq!(router.active_backend("test"), "remote");
    assert_eq!(health_calls.load(Ordering::SeqCst), 2);
}

#[test]
fn no_remotes_means_local() {
    let temp_dir = TempDir::new().expect("temp dir should be created");
    let router = router_with(vec![], &temp_dir, Duration::from_secs(600));

    assert_eq!(router.active_backend("test"), "local");
    router
        .upsert("test", &[record("a")])
        .expect("upsert should succeed");
}
