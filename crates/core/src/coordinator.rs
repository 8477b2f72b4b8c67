//! Lifecycle hooks a test runner calls around each test and each suite

use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifact::{ArtifactCapture, ArtifactSink};
use crate::context::ExecutionContext;
use crate::error::CoordinatorError;
use crate::outcome::{OutcomeBuffer, ResultsSink, SuiteSummary, TestOutcome};
use crate::resource::{ResourceConfig, ResourceFactory, ResourceLifecycleManager};
use crate::retry::{FailureKind, RetryCoordinator, RetryPolicy, TestFailure};
use crate::worker::{Worker, WorkerId};

/// A test body. Called once per attempt with the same scope every time.
pub type TestBody<R> =
    Box<dyn for<'a> FnMut(&'a mut TestScope<R>) -> BoxFuture<'a, Result<(), TestFailure>> + Send>;

/// A named test with an optional retry policy
pub struct TestCase<R> {
    pub name: String,
    pub tags: Vec<String>,
    pub retry: Option<RetryPolicy>,
    body: TestBody<R>,
}

impl<R> TestCase<R> {
    pub fn new<B>(name: impl Into<String>, body: B) -> Self
    where
        B: for<'a> FnMut(&'a mut TestScope<R>) -> BoxFuture<'a, Result<(), TestFailure>>
            + Send
            + 'static,
    {
        Self {
            name: name.into(),
            tags: Vec::new(),
            retry: None,
            body: Box::new(body),
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

impl<R> std::fmt::Debug for TestCase<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestCase")
            .field("name", &self.name)
            .field("tags", &self.tags)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Everything a running test may touch: its worker's context and resource
pub struct TestScope<R> {
    worker: WorkerId,
    test_name: String,
    context: ExecutionContext,
    resource: Arc<R>,
    started: Instant,
}

impl<R> TestScope<R> {
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ExecutionContext {
        &mut self.context
    }

    pub fn resource(&self) -> &R {
        &self.resource
    }

    /// Borrow the resource and the mutable context together
    pub fn parts_mut(&mut self) -> (&R, &mut ExecutionContext) {
        (&self.resource, &mut self.context)
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Composes per-worker contexts, the resource registry, artifact capture and
/// retries into one test lifecycle.
pub struct ExecutionCoordinator<F: ResourceFactory> {
    suite_name: String,
    resource_config: ResourceConfig,
    resources: Arc<ResourceLifecycleManager<F>>,
    capture: ArtifactCapture<F>,
    retry: RetryCoordinator,
    outcomes: OutcomeBuffer,
    results: Arc<dyn ResultsSink>,
    cancel: CancellationToken,
    suite_started: Mutex<Instant>,
}

impl<F: ResourceFactory> ExecutionCoordinator<F> {
    pub fn new(
        suite_name: impl Into<String>,
        factory: F,
        resource_config: ResourceConfig,
        artifacts: Arc<dyn ArtifactSink>,
        results: Arc<dyn ResultsSink>,
    ) -> Self {
        let resources = Arc::new(ResourceLifecycleManager::new(factory));
        let cancel = CancellationToken::new();

        Self {
            suite_name: suite_name.into(),
            resource_config,
            capture: ArtifactCapture::new(Arc::clone(&resources), artifacts),
            resources,
            retry: RetryCoordinator::new(cancel.clone()),
            outcomes: OutcomeBuffer::new(),
            results,
            cancel,
            suite_started: Mutex::new(Instant::now()),
        }
    }

    pub fn suite_name(&self) -> &str {
        &self.suite_name
    }

    pub fn resources(&self) -> &ResourceLifecycleManager<F> {
        &self.resources
    }

    /// Token that interrupts retry waits and stops queued tests from starting
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Mint a worker with a process-unique identity
    pub fn new_worker(&self) -> Worker {
        Worker::new(WorkerId::next())
    }

    /// Outcomes recorded so far and not yet flushed
    pub fn pending_outcomes(&self) -> usize {
        self.outcomes.len()
    }

    pub fn before_suite(&self) {
        *self.suite_started.lock() = Instant::now();
        info!("Starting suite '{}'", self.suite_name);
    }

    /// Prepare `worker` for a test: context and a fresh resource.
    ///
    /// If the resource cannot be created the worker is left clean and the
    /// creation error is returned as a terminal failure.
    pub async fn before_test(
        &self,
        worker: &mut Worker,
        test_name: &str,
    ) -> Result<TestScope<F::Resource>, TestFailure> {
        let started = Instant::now();
        let mut context = worker.take_context();
        context.set_test_name(test_name);
        debug!("{} starting '{}'", worker.id(), test_name);

        match self.resources.acquire(worker.id(), &self.resource_config).await {
            Ok(handle) => Ok(TestScope {
                worker: worker.id(),
                test_name: test_name.to_string(),
                context,
                resource: Arc::clone(handle.resource()),
                started,
            }),
            Err(err) => {
                error!("{}", err);
                worker.restore_context(context);
                Err(err.into())
            }
        }
    }

    /// Release the worker's resource and clear its context. Never fails.
    pub async fn after_test(&self, worker: &mut Worker, scope: TestScope<F::Resource>) {
        debug_assert_eq!(scope.worker, worker.id());
        let elapsed_ms = scope.elapsed_ms();
        let TestScope {
            test_name,
            context,
            resource,
            ..
        } = scope;

        drop(resource);
        self.resources.release(worker.id()).await;
        worker.restore_context(context);
        debug!("{} finished '{}' in {} ms", worker.id(), test_name, elapsed_ms);
    }

    /// Run one test through the full lifecycle and record its outcome.
    ///
    /// The worker's resource is released on every exit path. A panic inside
    /// artifact capture or result recording is logged and does not skip
    /// cleanup. If this future is dropped mid-test the release is handed to
    /// the runtime and the worker builds a fresh context on its next test.
    pub async fn run_test(
        &self,
        worker: &mut Worker,
        case: &mut TestCase<F::Resource>,
    ) -> TestOutcome {
        let started = Instant::now();
        let mut guard = ReleaseGuard::new(worker.id(), Arc::clone(&self.resources));

        let mut scope = match self.before_test(worker, &case.name).await {
            Ok(scope) => scope,
            Err(failure) => {
                let artifact = self.capture_artifact(worker.id(), &case.name, &failure).await;
                let outcome = TestOutcome::failed(
                    case.name.clone(),
                    worker.id(),
                    started.elapsed().as_millis() as u64,
                    1,
                    &failure,
                    artifact,
                );
                self.resources.release(worker.id()).await;
                guard.disarm();
                self.record(outcome.clone()).await;
                return outcome;
            }
        };

        let body = &mut case.body;
        let run = self
            .retry
            .run(case.retry.as_ref(), &mut scope, |scope| {
                AssertUnwindSafe(body(scope))
                    .catch_unwind()
                    .map(|result| result.unwrap_or_else(|panic| Err(panic_failure(panic))))
                    .boxed()
            })
            .await;

        let duration_ms = started.elapsed().as_millis() as u64;
        let outcome = match run.result {
            Ok(()) => {
                TestOutcome::passed(case.name.clone(), worker.id(), duration_ms, run.attempts)
            }
            Err(failure) => {
                let artifact = self.capture_artifact(worker.id(), &case.name, &failure).await;
                TestOutcome::failed(
                    case.name.clone(),
                    worker.id(),
                    duration_ms,
                    run.attempts,
                    &failure,
                    artifact,
                )
            }
        };

        self.record(outcome.clone()).await;
        self.after_test(worker, scope).await;
        guard.disarm();
        outcome
    }

    /// Sweep leftover resources, flush outcomes and summarize the suite
    pub async fn after_suite(&self) -> SuiteSummary {
        self.finish_suite(0).await
    }

    /// Run `cases` on a pool of `workers` concurrent workers, then `after_suite`.
    ///
    /// Each worker runs its tests one at a time. Once the cancellation token
    /// fires, queued tests are not started and count as skipped.
    pub async fn run_suite(
        self: &Arc<Self>,
        cases: Vec<TestCase<F::Resource>>,
        workers: usize,
    ) -> SuiteSummary {
        self.before_suite();

        let workers = workers.clamp(1, cases.len().max(1));
        info!("Running {} test(s) on {} worker(s)", cases.len(), workers);

        let queue = Arc::new(Mutex::new(VecDeque::from(cases)));
        let mut tasks = JoinSet::new();

        for _ in 0..workers {
            let coordinator = Arc::clone(self);
            let queue = Arc::clone(&queue);
            let mut worker = self.new_worker();

            tasks.spawn(async move {
                loop {
                    if coordinator.cancel.is_cancelled() {
                        break;
                    }
                    let next = queue.lock().pop_front();
                    let Some(mut case) = next else {
                        break;
                    };
                    coordinator.run_test(&mut worker, &mut case).await;
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Worker task failed: {}", e);
            }
        }

        let skipped = queue.lock().len();
        if skipped > 0 {
            warn!("Suite cancelled; {} queued test(s) not started", skipped);
        }
        self.finish_suite(skipped).await
    }

    /// Capture a failure artifact; a panicking capture or sink counts as no artifact
    async fn capture_artifact(
        &self,
        worker: WorkerId,
        test_name: &str,
        failure: &TestFailure,
    ) -> Option<String> {
        AssertUnwindSafe(self.capture.on_failure(worker, test_name, failure))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                warn!(
                    "Artifact capture for '{}' panicked: {}",
                    test_name,
                    panic_failure(panic)
                );
                None
            })
    }

    async fn record(&self, outcome: TestOutcome) {
        if outcome.passed {
            info!(
                "✓ {} ({} ms, {} attempt(s))",
                outcome.test_name, outcome.duration_ms, outcome.attempts
            );
        } else {
            error!(
                "✗ {} - {}",
                outcome.test_name,
                outcome.error_message.as_deref().unwrap_or("unknown error")
            );
        }

        match AssertUnwindSafe(self.results.append(&outcome)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{}", CoordinatorError::ResultsSink(e)),
            Err(panic) => warn!("Results sink panicked: {}", panic_failure(panic)),
        }
        self.outcomes.push(outcome);
    }

    async fn finish_suite(&self, skipped: usize) -> SuiteSummary {
        let sweep = self.resources.release_all().await;
        let records = self.outcomes.drain();
        let duration_ms = self.suite_started.lock().elapsed().as_millis() as u64;

        let location = match self
            .results
            .flush_suite(&self.suite_name, duration_ms, &records)
            .await
        {
            Ok(location) => Some(location),
            Err(e) => {
                warn!("{}", CoordinatorError::ResultsSink(e));
                None
            }
        };

        let mut summary =
            SuiteSummary::new(&self.suite_name, duration_ms, records, sweep, location);
        summary.skipped = skipped;

        info!(
            "Suite '{}': {} passed, {} failed, {} skipped ({:.1}% pass rate, {} ms)",
            summary.suite,
            summary.passed,
            summary.failed,
            summary.skipped,
            summary.pass_rate,
            summary.duration_ms
        );
        summary
    }
}

/// Releases a worker's resource if a test is abandoned before `after_test`
struct ReleaseGuard<F: ResourceFactory> {
    worker: WorkerId,
    resources: Arc<ResourceLifecycleManager<F>>,
    armed: bool,
}

impl<F: ResourceFactory> ReleaseGuard<F> {
    fn new(worker: WorkerId, resources: Arc<ResourceLifecycleManager<F>>) -> Self {
        Self {
            worker,
            resources,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<F: ResourceFactory> Drop for ReleaseGuard<F> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let worker = self.worker;
        let resources = Arc::clone(&self.resources);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("{} abandoned its test; releasing its resource", worker);
                handle.spawn(async move {
                    resources.release(worker).await;
                });
            }
            Err(_) => error!(
                "{} abandoned its test outside a runtime; resource left for the sweep",
                worker
            ),
        }
    }
}

fn panic_failure(panic: Box<dyn Any + Send>) -> TestFailure {
    let message = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "test body panicked".to_string()
    };
    TestFailure::new(FailureKind::Panic, message)
}
