//! Error types for the coordinator

use thiserror::Error;

use crate::worker::WorkerId;

/// Boxed error returned by external collaborators (factories and sinks)
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by the coordinator machinery itself.
///
/// These never describe a test body failure; those are [`crate::TestFailure`].
/// Only `ResourceCreation` ever reaches a test outcome. The rest are
/// side-channel failures that get logged and swallowed.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Resource creation failed for {worker}: {source}")]
    ResourceCreation {
        worker: WorkerId,
        #[source]
        source: BoxError,
    },

    #[error("Resource destroy failed for {worker}: {source}")]
    ResourceDestroy {
        worker: WorkerId,
        #[source]
        source: BoxError,
    },

    #[error("Artifact capture failed for '{test}': {source}")]
    ArtifactCapture {
        test: String,
        #[source]
        source: BoxError,
    },

    #[error("Artifact store failed for '{name}': {source}")]
    ArtifactStore {
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("Results sink error: {0}")]
    ResultsSink(#[source] BoxError),
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
