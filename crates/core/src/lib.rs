//! Gantry coordinator core
//!
//! Coordinates test cases running concurrently across a pool of workers. Each
//! worker gets:
//! - an isolated key/value scratch context
//! - at most one live external resource (typically a browser session)
//! - failure artifacts captured from that resource
//! - bounded, policy-driven in-place retries of a failing test body
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  ExecutionCoordinator<F>                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  before_test(worker, name) -> TestScope                     │
//! │    ├── ExecutionContext (owned by the Worker)               │
//! │    └── ResourceLifecycleManager::acquire(worker)            │
//! │  run_test(worker, case) -> TestOutcome                      │
//! │    ├── RetryCoordinator::run(policy, body)                  │
//! │    ├── ArtifactCapture::on_failure (failed runs only)       │
//! │    └── OutcomeBuffer::record -> ResultsSink::append         │
//! │  after_test(worker, scope)    release + clear, always       │
//! │  after_suite() -> SuiteSummary                              │
//! │    ├── ResourceLifecycleManager::release_all                │
//! │    └── ResultsSink::flush_suite                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The only state shared between workers is the resource registry and the
//! outcome buffer. Everything else is owned by a [`Worker`].

pub mod artifact;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod outcome;
pub mod resource;
pub mod retry;
pub mod worker;

pub use artifact::{sanitize_name, ArtifactCapture, ArtifactSink, ARTIFACT_KIND_IMAGE};
pub use context::ExecutionContext;
pub use coordinator::{ExecutionCoordinator, TestBody, TestCase, TestScope};
pub use error::{BoxError, CoordinatorError, CoordinatorResult};
pub use outcome::{OutcomeBuffer, ResultsSink, SuiteSummary, TestOutcome};
pub use resource::{
    ResourceConfig, ResourceFactory, ResourceHandle, ResourceLifecycleManager, SweepReport,
};
pub use retry::{
    should_retry, FailureKind, RetryCoordinator, RetryPolicy, RetryRun, RetryState, TestFailure,
};
pub use worker::{Worker, WorkerId};
