//! Filesystem sinks for failure artifacts and suite results

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::{
    sanitize_name, ArtifactSink, BoxError, ResultsSink, TestOutcome, ARTIFACT_KIND_IMAGE,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// Writes artifacts as `<dir>/<name>-<sha256 prefix>.<ext>`.
///
/// The content hash keeps artifacts from different workers or retries of the
/// same test from overwriting each other.
#[derive(Debug, Clone)]
pub struct FsArtifactSink {
    dir: PathBuf,
}

impl FsArtifactSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

fn extension_for(kind: &str) -> &'static str {
    match kind {
        ARTIFACT_KIND_IMAGE => "png",
        "html" => "html",
        "log" => "log",
        _ => "bin",
    }
}

#[async_trait]
impl ArtifactSink for FsArtifactSink {
    async fn store(&self, name: &str, bytes: Vec<u8>, kind: &str) -> Result<String, BoxError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let digest = hex::encode(Sha256::digest(&bytes));
        let path = self.dir.join(format!(
            "{}-{}.{}",
            sanitize_name(name),
            &digest[..12],
            extension_for(kind)
        ));
        tokio::fs::write(&path, &bytes).await?;

        debug!("Stored {} artifact ({} bytes) at {}", kind, bytes.len(), path.display());
        Ok(path.display().to_string())
    }
}

/// Suite report as written to disk
#[derive(Debug, Serialize)]
struct SuiteReport<'a> {
    suite: &'a str,
    generated_at: DateTime<Utc>,
    total: usize,
    passed: usize,
    failed: usize,
    duration_ms: u64,
    results: &'a [TestOutcome],
}

/// Writes one `<suite>-results.json` per suite
#[derive(Debug, Clone)]
pub struct JsonResultsSink {
    output_dir: PathBuf,
}

impl JsonResultsSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn report_path(&self, suite: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}-results.json", sanitize_name(suite)))
    }
}

#[async_trait]
impl ResultsSink for JsonResultsSink {
    async fn append(&self, outcome: &TestOutcome) -> Result<(), BoxError> {
        debug!(
            test = %outcome.test_name,
            passed = outcome.passed,
            attempts = outcome.attempts,
            worker = %outcome.worker,
            "Outcome recorded"
        );
        Ok(())
    }

    async fn flush_suite(
        &self,
        suite: &str,
        total_duration_ms: u64,
        records: &[TestOutcome],
    ) -> Result<String, BoxError> {
        tokio::fs::create_dir_all(&self.output_dir).await?;

        let passed = records.iter().filter(|r| r.passed).count();
        let report = SuiteReport {
            suite,
            generated_at: Utc::now(),
            total: records.len(),
            passed,
            failed: records.len() - passed,
            duration_ms: total_duration_ms,
            results: records,
        };

        let path = self.report_path(suite);
        let json = serde_json::to_string_pretty(&report)?;
        tokio::fs::write(&path, json).await?;

        info!("Results written to: {}", path.display());
        Ok(path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::{TestFailure, WorkerId};

    #[tokio::test]
    async fn test_artifact_written_with_hash_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsArtifactSink::new(dir.path().join("artifacts"));

        let location = sink.store("login_page", b"png-bytes".to_vec(), "image").await.unwrap();

        let path = PathBuf::from(&location);
        assert!(path.exists());
        let file_name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(file_name.starts_with("login_page-"));
        assert!(file_name.ends_with(".png"));
        assert_eq!(std::fs::read(&path).unwrap(), b"png-bytes");
    }

    #[tokio::test]
    async fn test_distinct_bytes_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsArtifactSink::new(dir.path());

        let a = sink.store("same", b"one".to_vec(), "image").await.unwrap();
        let b = sink.store("same", b"two".to_vec(), "image").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_flush_writes_suite_json() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonResultsSink::new(dir.path());
        let w = WorkerId::new(0);
        let records = vec![
            TestOutcome::passed("a", w, 10, 1),
            TestOutcome::failed("b", w, 20, 3, &TestFailure::timeout("slow"), None),
        ];

        let location = sink.flush_suite("nightly smoke", 30, &records).await.unwrap();

        assert!(location.ends_with("nightly_smoke-results.json"));
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&location).unwrap()).unwrap();
        assert_eq!(json["total"], 2);
        assert_eq!(json["failed"], 1);
        assert_eq!(json["results"][1]["error_message"], "slow");
        assert_eq!(json["results"][1]["attempts"], 3);
    }
}
