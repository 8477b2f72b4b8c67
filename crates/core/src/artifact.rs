//! Failure artifact capture

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{BoxError, CoordinatorError};
use crate::resource::{ResourceFactory, ResourceLifecycleManager};
use crate::retry::TestFailure;
use crate::worker::WorkerId;

/// Artifact kind used for visual snapshots
pub const ARTIFACT_KIND_IMAGE: &str = "image";

/// Accepts named diagnostic artifacts and returns where they were stored
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn store(&self, name: &str, bytes: Vec<u8>, kind: &str) -> Result<String, BoxError>;
}

/// Captures an artifact from the failing worker's live resource
pub struct ArtifactCapture<F: ResourceFactory> {
    resources: Arc<ResourceLifecycleManager<F>>,
    sink: Arc<dyn ArtifactSink>,
}

impl<F: ResourceFactory> ArtifactCapture<F> {
    pub fn new(resources: Arc<ResourceLifecycleManager<F>>, sink: Arc<dyn ArtifactSink>) -> Self {
        Self { resources, sink }
    }

    /// Capture and store an artifact for a failed test.
    ///
    /// No-op when the worker holds no resource. Capture or store errors are
    /// logged and yield `None`; they never replace `failure`.
    pub async fn on_failure(
        &self,
        worker: WorkerId,
        test_name: &str,
        failure: &TestFailure,
    ) -> Option<String> {
        let Some(handle) = self.resources.current(worker) else {
            debug!("No live resource on {}; skipping artifact for '{}'", worker, test_name);
            return None;
        };

        debug!("Capturing artifact for '{}' ({:?}: {})", test_name, failure.kind, failure);

        let bytes = match self.resources.factory().capture(handle.resource()).await {
            Ok(bytes) => bytes,
            Err(source) => {
                let err = CoordinatorError::ArtifactCapture {
                    test: test_name.to_string(),
                    source,
                };
                warn!("{}", err);
                return None;
            }
        };

        let name = sanitize_name(test_name);
        match self.sink.store(&name, bytes, ARTIFACT_KIND_IMAGE).await {
            Ok(location) => {
                info!("Failure artifact for '{}' saved to {}", test_name, location);
                Some(location)
            }
            Err(source) => {
                warn!("{}", CoordinatorError::ArtifactStore { name, source });
                None
            }
        }
    }
}

/// Make a test name safe to use as an artifact file stem
pub fn sanitize_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.is_empty() {
        "unnamed".to_string()
    } else {
        sanitized
    }
}
