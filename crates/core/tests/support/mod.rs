//! In-memory collaborators for driving the coordinator without a browser

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use gantry_core::{
    ArtifactSink, BoxError, ExecutionCoordinator, ResourceConfig, ResourceFactory, ResultsSink,
    TestOutcome,
};

/// A fake browser session
#[derive(Debug)]
pub struct FakeSession {
    pub id: u64,
    pub kind: String,
}

#[derive(Default)]
pub struct FakeFactory {
    pub next: AtomicU64,
    pub live: Mutex<HashSet<u64>>,
    pub created: AtomicU64,
    pub destroyed: Mutex<Vec<u64>>,
    pub fail_create: bool,
    pub fail_capture: bool,
    /// Session ids whose destroy call errors
    pub fail_destroy: HashSet<u64>,
}

#[async_trait]
impl ResourceFactory for FakeFactory {
    type Resource = FakeSession;

    async fn create(&self, config: &ResourceConfig) -> Result<FakeSession, BoxError> {
        if self.fail_create {
            return Err("browser binary missing".into());
        }
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        self.created.fetch_add(1, Ordering::SeqCst);
        self.live.lock().insert(id);
        Ok(FakeSession {
            id,
            kind: config.kind.clone(),
        })
    }

    async fn destroy(&self, session: &FakeSession) -> Result<(), BoxError> {
        self.live.lock().remove(&session.id);
        self.destroyed.lock().push(session.id);
        if self.fail_destroy.contains(&session.id) {
            return Err(format!("session {} refused to close", session.id).into());
        }
        Ok(())
    }

    async fn capture(&self, session: &FakeSession) -> Result<Vec<u8>, BoxError> {
        if self.fail_capture {
            return Err("page crashed".into());
        }
        Ok(format!("snapshot-{}", session.id).into_bytes())
    }
}

#[derive(Default)]
pub struct MemoryArtifacts {
    pub stored: Mutex<Vec<(String, Vec<u8>, String)>>,
    pub fail_store: bool,
    pub panic_store: bool,
}

#[async_trait]
impl ArtifactSink for MemoryArtifacts {
    async fn store(&self, name: &str, bytes: Vec<u8>, kind: &str) -> Result<String, BoxError> {
        if self.panic_store {
            panic!("artifact store poisoned");
        }
        if self.fail_store {
            return Err("artifact bucket unreachable".into());
        }
        self.stored.lock().push((name.to_string(), bytes, kind.to_string()));
        Ok(format!("memory://{}", name))
    }
}

#[derive(Default)]
pub struct MemoryResults {
    pub appended: Mutex<Vec<TestOutcome>>,
    pub flushed: Mutex<Vec<(String, Vec<TestOutcome>)>>,
    pub fail_append: bool,
    pub panic_append: bool,
    pub fail_flush: bool,
}

#[async_trait]
impl ResultsSink for MemoryResults {
    async fn append(&self, outcome: &TestOutcome) -> Result<(), BoxError> {
        if self.panic_append {
            panic!("results writer poisoned");
        }
        if self.fail_append {
            return Err("results disk full".into());
        }
        self.appended.lock().push(outcome.clone());
        Ok(())
    }

    async fn flush_suite(
        &self,
        suite: &str,
        _total_duration_ms: u64,
        records: &[TestOutcome],
    ) -> Result<String, BoxError> {
        if self.fail_flush {
            return Err("results directory read-only".into());
        }
        self.flushed.lock().push((suite.to_string(), records.to_vec()));
        Ok(format!("memory://{}-results", suite))
    }
}

pub struct Harness {
    pub coordinator: Arc<ExecutionCoordinator<FakeFactory>>,
    pub artifacts: Arc<MemoryArtifacts>,
    pub results: Arc<MemoryResults>,
}

pub fn harness(factory: FakeFactory) -> Harness {
    harness_with_results(factory, MemoryResults::default())
}

pub fn harness_with_results(factory: FakeFactory, results: MemoryResults) -> Harness {
    harness_with(factory, MemoryArtifacts::default(), results)
}

pub fn harness_with(
    factory: FakeFactory,
    artifacts: MemoryArtifacts,
    results: MemoryResults,
) -> Harness {
    let artifacts = Arc::new(artifacts);
    let results = Arc::new(results);
    let coordinator = Arc::new(ExecutionCoordinator::new(
        "suite",
        factory,
        ResourceConfig::default(),
        artifacts.clone(),
        results.clone(),
    ));
    Harness {
        coordinator,
        artifacts,
        results,
    }
}
