//! Suite runner: turns YAML specs into coordinated parallel browser tests

use std::sync::Arc;

use futures::FutureExt;
use gantry_core::{ExecutionCoordinator, SuiteSummary, TestCase, TestFailure, TestScope};
use tracing::{info, warn};

use crate::browser::{BrowserFactory, BrowserSession};
use crate::config::HarnessConfig;
use crate::error::{E2eError, E2eResult};
use crate::sinks::{FsArtifactSink, JsonResultsSink};
use crate::spec::{TestSpec, TestStep, Viewport};

/// Main E2E suite runner
pub struct SuiteRunner {
    config: HarnessConfig,
    /// Run only specs carrying this tag
    tag: Option<String>,
    /// Run only the test with this name
    name: Option<String>,
}

impl SuiteRunner {
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            config,
            tag: None,
            name: None,
        }
    }

    pub fn with_tag(mut self, tag: Option<String>) -> Self {
        self.tag = tag;
        self
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Load specs from the configured directory and apply tag/name filters
    pub fn load_specs(&self) -> E2eResult<Vec<TestSpec>> {
        let specs = TestSpec::load_all(&self.config.specs_dir)?;

        let selected: Vec<TestSpec> = specs
            .into_iter()
            .filter(|s| self.tag.as_deref().map_or(true, |t| s.has_tag(t)))
            .filter(|s| self.name.as_deref().map_or(true, |n| s.name == n))
            .collect();

        if let Some(name) = &self.name {
            if selected.is_empty() {
                return Err(E2eError::TestNotFound(name.clone()));
            }
        }
        Ok(selected)
    }

    /// Wrap a spec as a coordinator test case.
    ///
    /// The spec's own retry policy wins over the configured default.
    pub fn to_case(&self, spec: TestSpec) -> TestCase<BrowserSession> {
        let retry = spec
            .retry
            .clone()
            .or_else(|| self.config.default_retry.clone());
        let name = spec.name.clone();
        let tags = spec.tags.clone();
        let viewport = self.config.viewport;
        let spec = Arc::new(spec);

        let mut case = TestCase::new(name, move |scope| {
            let spec = Arc::clone(&spec);
            async move { execute_spec(&spec, viewport, scope).await }.boxed()
        })
        .with_tags(tags);
        case.retry = retry;
        case
    }

    /// Run every selected spec across the configured worker pool
    pub async fn run(&self) -> E2eResult<SuiteSummary> {
        self.config.validate()?;
        let specs = self.load_specs()?;
        info!(
            "Loaded {} spec(s) from {}",
            specs.len(),
            self.config.specs_dir.display()
        );

        let cases: Vec<_> = specs.into_iter().map(|s| self.to_case(s)).collect();

        let factory = BrowserFactory::new(
            self.config.base_url.clone(),
            self.config.viewport,
            self.config.screenshot_dir.clone(),
        );
        let coordinator = Arc::new(ExecutionCoordinator::new(
            self.config.suite_name.clone(),
            factory,
            self.config.resource.clone(),
            Arc::new(FsArtifactSink::new(self.config.artifact_dir.clone())),
            Arc::new(JsonResultsSink::new(self.config.output_dir.clone())),
        ));

        let cancel = coordinator.cancellation_token();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; no new tests will start");
                cancel.cancel();
            }
        });

        let summary = coordinator.run_suite(cases, self.config.workers).await;
        interrupt.abort();

        Ok(summary)
    }
}

/// Drive one spec's steps against the worker's session and context
async fn execute_spec(
    spec: &TestSpec,
    default_viewport: Viewport,
    scope: &mut TestScope<BrowserSession>,
) -> Result<(), TestFailure> {
    let (session, ctx) = scope.parts_mut();

    // Retries land here again with the same live page and context
    session
        .set_viewport(spec.viewport.unwrap_or(default_viewport))
        .await?;

    for step in &spec.steps {
        let step = step.resolve(ctx)?;
        match &step {
            TestStep::Remember { key, value } => ctx.set(key.clone(), value.clone()),
            TestStep::Log { message } => info!("[TEST LOG] {}", message),
            _ => {
                session.execute(&step).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::RetryPolicy;
    use std::path::Path;

    fn write_spec(dir: &Path, file: &str, body: &str) {
        std::fs::write(dir.join(file), body).unwrap();
    }

    fn runner_with_specs() -> (tempfile::TempDir, HarnessConfig) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("auth")).unwrap();
        write_spec(
            &dir.path().join("auth"),
            "login.yaml",
            concat!(
                "name: login\ntags: [smoke, auth]\nretry:\n  max_retries: 1\n",
                "steps:\n  - action: navigate\n    url: /login\n",
            ),
        );
        write_spec(
            dir.path(),
            "search.yml",
            "name: search\ntags: [smoke]\nsteps:\n  - action: navigate\n    url: /search\n",
        );
        write_spec(
            dir.path(),
            "billing.yaml",
            "name: billing\nsteps:\n  - action: log\n    message: hi\n",
        );
        write_spec(dir.path(), "README.md", "not a spec");

        let config = HarnessConfig {
            specs_dir: dir.path().to_path_buf(),
            default_retry: Some(RetryPolicy::new(4)),
            ..Default::default()
        };
        (dir, config)
    }

    #[test]
    fn test_load_all_specs() {
        let (_dir, config) = runner_with_specs();
        let specs = SuiteRunner::new(config).load_specs().unwrap();
        let names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["login", "billing", "search"]);
    }

    #[test]
    fn test_filter_by_tag() {
        let (_dir, config) = runner_with_specs();
        let specs = SuiteRunner::new(config)
            .with_tag(Some("auth".to_string()))
            .load_specs()
            .unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "login");
    }

    #[test]
    fn test_unknown_name_is_an_error() {
        let (_dir, config) = runner_with_specs();
        let err = SuiteRunner::new(config)
            .with_name(Some("nope".to_string()))
            .load_specs()
            .unwrap_err();
        assert!(matches!(err, E2eError::TestNotFound(n) if n == "nope"));
    }

    #[test]
    fn test_spec_retry_overrides_default() {
        let (_dir, config) = runner_with_specs();
        let runner = SuiteRunner::new(config);
        let mut specs = runner.load_specs().unwrap().into_iter();

        let login = runner.to_case(specs.next().unwrap());
        assert_eq!(login.retry.as_ref().map(|r| r.max_retries), Some(1));
        assert_eq!(login.tags, vec!["smoke", "auth"]);

        let billing = runner.to_case(specs.next().unwrap());
        assert_eq!(billing.retry.as_ref().map(|r| r.max_retries), Some(4));
    }
}
