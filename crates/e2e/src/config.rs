//! Harness configuration: TOML file, then environment, then CLI flags

use std::path::{Path, PathBuf};

use gantry_core::{ResourceConfig, RetryPolicy};
use serde::{Deserialize, Serialize};

use crate::browser::Browser;
use crate::error::{E2eError, E2eResult};
use crate::spec::Viewport;

/// Harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Name used for logs and the results file
    pub suite_name: String,

    /// Directory searched recursively for YAML specs
    pub specs_dir: PathBuf,

    /// Where suite results are written
    pub output_dir: PathBuf,

    /// Where failure artifacts are written
    pub artifact_dir: PathBuf,

    /// Where screenshot steps write their images
    pub screenshot_dir: PathBuf,

    /// Number of concurrent workers
    pub workers: usize,

    /// Base URL every `navigate` step is relative to
    pub base_url: String,

    /// Browser session settings
    pub resource: ResourceConfig,

    /// Default viewport; specs may override it
    pub viewport: Viewport,

    /// Retry policy for specs that declare none
    pub default_retry: Option<RetryPolicy>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            suite_name: "e2e".to_string(),
            specs_dir: PathBuf::from("tests/e2e/specs"),
            output_dir: PathBuf::from("test-results"),
            artifact_dir: PathBuf::from("test-results/failures"),
            screenshot_dir: PathBuf::from("test-results/screenshots"),
            workers: default_workers(),
            base_url: "http://127.0.0.1:8080".to_string(),
            resource: ResourceConfig::default(),
            viewport: Viewport::default(),
            default_retry: None,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().min(4))
        .unwrap_or(1)
}

impl HarnessConfig {
    /// Load configuration from file; defaults when the file does not exist
    pub fn load(path: &Path) -> E2eResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply `GANTRY_*` environment overrides
    pub fn apply_env(&mut self) -> E2eResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub(crate) fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> E2eResult<()> {
        if let Some(workers) = lookup("GANTRY_WORKERS") {
            self.workers = workers.parse().map_err(|_| {
                E2eError::Config(format!("GANTRY_WORKERS must be a number, got '{}'", workers))
            })?;
        }
        if let Some(browser) = lookup("GANTRY_BROWSER") {
            self.resource.kind = browser;
        }
        if let Some(headless) = lookup("GANTRY_HEADLESS") {
            self.resource.headless = match headless.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                other => {
                    return Err(E2eError::Config(format!(
                        "GANTRY_HEADLESS must be true or false, got '{}'",
                        other
                    )))
                }
            };
        }
        if let Some(url) = lookup("GANTRY_BASE_URL") {
            self.base_url = url;
        }
        Ok(())
    }

    /// Reject settings the runner cannot work with
    pub fn validate(&self) -> E2eResult<()> {
        if self.workers == 0 {
            return Err(E2eError::Config("workers must be at least 1".to_string()));
        }
        if self.base_url.is_empty() {
            return Err(E2eError::Config("base_url must not be empty".to_string()));
        }
        self.resource.kind.parse::<Browser>()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = HarnessConfig::load(Path::new("/nonexistent/gantry.toml")).unwrap();
        assert_eq!(config.suite_name, "e2e");
        assert!(config.workers >= 1);
        assert!(config.default_retry.is_none());
    }

    #[test]
    fn test_load_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gantry.toml");
        std::fs::write(
            &path,
            r#"
suite_name = "checkout"
workers = 8

[resource]
kind = "webkit"
headless = false

[default_retry]
max_retries = 2
retryable_kinds = ["timeout"]
delay_ms = 1000
"#,
        )
        .unwrap();

        let config = HarnessConfig::load(&path).unwrap();
        assert_eq!(config.suite_name, "checkout");
        assert_eq!(config.workers, 8);
        assert_eq!(config.resource.kind, "webkit");
        assert!(!config.resource.headless);
        assert_eq!(config.base_url, "http://127.0.0.1:8080");
        let retry = config.default_retry.unwrap();
        assert_eq!(retry.max_retries, 2);
        assert_eq!(retry.delay, Duration::from_secs(1));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("GANTRY_WORKERS", "3"),
            ("GANTRY_BROWSER", "firefox"),
            ("GANTRY_HEADLESS", "0"),
            ("GANTRY_BASE_URL", "http://staging.local"),
        ]);
        let mut config = HarnessConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.workers, 3);
        assert_eq!(config.resource.kind, "firefox");
        assert!(!config.resource.headless);
        assert_eq!(config.base_url, "http://staging.local");
    }

    #[test]
    fn test_bad_env_value_rejected() {
        let mut config = HarnessConfig::default();
        let err = config
            .apply_overrides(|k| (k == "GANTRY_WORKERS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, E2eError::Config(_)));
    }

    #[test]
    fn test_validate() {
        let mut config = HarnessConfig::default();
        assert!(config.validate().is_ok());
        config.resource.kind = "netscape".to_string();
        assert!(matches!(config.validate(), Err(E2eError::UnsupportedBrowser(_))));
        config.resource.kind = "chromium".to_string();
        config.workers = 0;
        assert!(config.validate().is_err());
    }
}
