//! Test outcome records, the shared append buffer and suite summaries

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::BoxError;
use crate::resource::SweepReport;
use crate::retry::{FailureKind, TestFailure};
use crate::worker::WorkerId;

/// Result of one test, including all its attempts. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub test_name: String,
    pub passed: bool,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub failure_kind: Option<FailureKind>,
    /// Body invocations, retries included
    pub attempts: u32,
    pub worker: WorkerId,
    /// Location of the failure artifact, if one was captured
    pub artifact: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TestOutcome {
    pub fn passed(
        test_name: impl Into<String>,
        worker: WorkerId,
        duration_ms: u64,
        attempts: u32,
    ) -> Self {
        Self {
            test_name: test_name.into(),
            passed: true,
            duration_ms,
            error_message: None,
            failure_kind: None,
            attempts,
            worker,
            artifact: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(
        test_name: impl Into<String>,
        worker: WorkerId,
        duration_ms: u64,
        attempts: u32,
        failure: &TestFailure,
        artifact: Option<String>,
    ) -> Self {
        Self {
            test_name: test_name.into(),
            passed: false,
            duration_ms,
            error_message: Some(failure.message.clone()),
            failure_kind: Some(failure.kind),
            attempts,
            worker,
            artifact,
            timestamp: Utc::now(),
        }
    }
}

/// Receives outcomes as they happen and the whole suite once it ends
#[async_trait]
pub trait ResultsSink: Send + Sync {
    async fn append(&self, outcome: &TestOutcome) -> Result<(), BoxError>;

    /// Persist the suite's records. Returns where they were written.
    async fn flush_suite(
        &self,
        suite: &str,
        total_duration_ms: u64,
        records: &[TestOutcome],
    ) -> Result<String, BoxError>;
}

/// Append buffer shared by all workers, drained once at suite end
#[derive(Debug, Default)]
pub struct OutcomeBuffer {
    records: Mutex<Vec<TestOutcome>>,
}

impl OutcomeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, outcome: TestOutcome) {
        self.records.lock().push(outcome);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn drain(&self) -> Vec<TestOutcome> {
        std::mem::take(&mut *self.records.lock())
    }
}

/// Aggregate result of a suite
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteSummary {
    pub suite: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Queued tests never started because the suite was cancelled
    pub skipped: usize,
    /// Passed over total, 0.0 - 100.0
    pub pass_rate: f64,
    pub duration_ms: u64,
    pub report_location: Option<String>,
    pub sweep: SweepReport,
    pub results: Vec<TestOutcome>,
}

impl SuiteSummary {
    pub fn new(
        suite: impl Into<String>,
        duration_ms: u64,
        results: Vec<TestOutcome>,
        sweep: SweepReport,
        report_location: Option<String>,
    ) -> Self {
        let total = results.len();
        let passed = results.iter().filter(|r| r.passed).count();
        let pass_rate = if total == 0 {
            0.0
        } else {
            passed as f64 / total as f64 * 100.0
        };

        Self {
            suite: suite.into(),
            total,
            passed,
            failed: total - passed,
            skipped: 0,
            pass_rate,
            duration_ms,
            report_location,
            sweep,
            results,
        }
    }

    pub fn success(&self) -> bool {
        self.failed == 0
    }
}
