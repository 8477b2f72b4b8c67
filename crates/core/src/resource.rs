//! Resource lifecycle management - one live external resource per worker

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{BoxError, CoordinatorError, CoordinatorResult};
use crate::worker::WorkerId;

/// Creates and destroys the external resource a test drives.
///
/// Implemented outside the core, e.g. by a browser-session launcher.
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Send + Sync + 'static;

    /// Create one resource instance
    async fn create(&self, config: &ResourceConfig) -> Result<Self::Resource, BoxError>;

    /// Destroy an instance previously returned by `create`
    async fn destroy(&self, resource: &Self::Resource) -> Result<(), BoxError>;

    /// Extract a diagnostic artifact (e.g. a screenshot) from a live instance
    async fn capture(&self, resource: &Self::Resource) -> Result<Vec<u8>, BoxError>;
}

/// Configuration passed to the factory on every acquisition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Resource kind selector (e.g. "chromium", "firefox")
    #[serde(default = "default_kind")]
    pub kind: String,

    /// Run without a visible window
    #[serde(default = "default_headless")]
    pub headless: bool,

    /// Factory-specific options
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

fn default_kind() -> String {
    "chromium".to_string()
}

fn default_headless() -> bool {
    true
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            headless: default_headless(),
            options: BTreeMap::new(),
        }
    }
}

/// A live resource registered against its owning worker
#[derive(Debug)]
pub struct ResourceHandle<R> {
    owner: WorkerId,
    live_since: DateTime<Utc>,
    resource: Arc<R>,
}

// Manual impl: cloning a handle never requires `R: Clone`.
impl<R> Clone for ResourceHandle<R> {
    fn clone(&self) -> Self {
        Self {
            owner: self.owner,
            live_since: self.live_since,
            resource: Arc::clone(&self.resource),
        }
    }
}

impl<R> ResourceHandle<R> {
    pub fn owner(&self) -> WorkerId {
        self.owner
    }

    pub fn live_since(&self) -> DateTime<Utc> {
        self.live_since
    }

    pub fn resource(&self) -> &Arc<R> {
        &self.resource
    }
}

/// Outcome of a `release_all` sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Handles destroyed cleanly
    pub destroyed: usize,
    /// Handles whose destroy call failed, with the error text
    pub failed: Vec<(WorkerId, String)>,
}

/// Owns the registry of live resources, keyed by worker.
///
/// At most one handle per worker is live at any instant. Registry guards are
/// never held across an `.await`.
pub struct ResourceLifecycleManager<F: ResourceFactory> {
    factory: F,
    registry: DashMap<WorkerId, ResourceHandle<F::Resource>>,
}

impl<F: ResourceFactory> ResourceLifecycleManager<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            registry: DashMap::new(),
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Acquire a fresh resource for `worker`.
    ///
    /// Any handle the worker still holds is released first. On factory failure
    /// nothing is registered.
    pub async fn acquire(
        &self,
        worker: WorkerId,
        config: &ResourceConfig,
    ) -> CoordinatorResult<ResourceHandle<F::Resource>> {
        if self.registry.contains_key(&worker) {
            warn!("{} still holds a resource; releasing it before re-acquiring", worker);
            self.release(worker).await;
        }

        let resource = self
            .factory
            .create(config)
            .await
            .map_err(|source| CoordinatorError::ResourceCreation { worker, source })?;

        let handle = ResourceHandle {
            owner: worker,
            live_since: Utc::now(),
            resource: Arc::new(resource),
        };
        self.registry.insert(worker, handle.clone());

        debug!("Acquired {} resource for {}", config.kind, worker);
        Ok(handle)
    }

    /// Release the worker's resource, if any.
    ///
    /// Idempotent. Destroy failures are logged and swallowed. Returns whether a
    /// handle was held.
    pub async fn release(&self, worker: WorkerId) -> bool {
        let Some((_, handle)) = self.registry.remove(&worker) else {
            return false;
        };

        if let Err(e) = self.destroy(handle).await {
            warn!("{}", e);
        } else {
            debug!("Released resource for {}", worker);
        }
        true
    }

    /// The calling worker's live handle
    pub fn current(&self, worker: WorkerId) -> Option<ResourceHandle<F::Resource>> {
        self.registry.get(&worker).map(|entry| entry.value().clone())
    }

    /// Number of workers currently holding a live resource
    pub fn live_count(&self) -> usize {
        self.registry.len()
    }

    /// Destroy every live handle.
    ///
    /// Each destroy runs independently; one failure never stops the sweep. The
    /// registry is empty when this returns.
    pub async fn release_all(&self) -> SweepReport {
        let mut report = SweepReport::default();

        loop {
            let workers: Vec<WorkerId> = self.registry.iter().map(|e| *e.key()).collect();
            if workers.is_empty() {
                break;
            }

            let handles: Vec<_> = workers
                .into_iter()
                .filter_map(|w| self.registry.remove(&w).map(|(_, h)| h))
                .collect();

            for result in join_all(handles.into_iter().map(|h| self.destroy(h))).await {
                match result {
                    Ok(()) => report.destroyed += 1,
                    Err(e) => {
                        warn!("{}", e);
                        if let CoordinatorError::ResourceDestroy { worker, source } = e {
                            report.failed.push((worker, source.to_string()));
                        }
                    }
                }
            }
        }

        info!(
            "Resource sweep complete: {} destroyed, {} failed",
            report.destroyed,
            report.failed.len()
        );
        report
    }

    async fn destroy(&self, handle: ResourceHandle<F::Resource>) -> CoordinatorResult<()> {
        let worker = handle.owner;
        self.factory
            .destroy(&handle.resource)
            .await
            .map_err(|source| CoordinatorError::ResourceDestroy { worker, source })
    }
}
