//! Declarative YAML test specification

use std::path::Path;

use gantry_core::{ExecutionContext, FailureKind, RetryPolicy, TestFailure};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::error::{E2eError, E2eResult};

/// A complete test specification parsed from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSpec {
    /// Unique name for this test
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Tags for filtering tests
    #[serde(default)]
    pub tags: Vec<String>,

    /// Viewport override; the harness default applies when absent
    #[serde(default)]
    pub viewport: Option<Viewport>,

    /// Retry policy; overrides the harness default
    #[serde(default)]
    pub retry: Option<RetryPolicy>,

    /// Steps to execute in order
    pub steps: Vec<TestStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Viewport { width: 1280, height: 720 }
    }
}

/// A single step in a test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TestStep {
    /// Navigate to a URL (relative to base)
    Navigate {
        url: String,
        #[serde(default)]
        wait_for_selector: Option<String>,
    },

    Click {
        selector: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    Fill {
        selector: String,
        value: String,
    },

    /// Press a key, on an element or the page
    Press {
        #[serde(default)]
        selector: Option<String>,
        key: String,
    },

    /// Wait for an element to reach a state
    Wait {
        selector: String,
        #[serde(default = "default_wait_timeout")]
        timeout_ms: u64,
        #[serde(default)]
        state: WaitState,
    },

    /// Assert something about an element
    Assert {
        selector: String,
        #[serde(default)]
        visible: Option<bool>,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        text_contains: Option<String>,
        #[serde(default)]
        count: Option<usize>,
    },

    Screenshot {
        name: String,
        #[serde(default)]
        full_page: bool,
    },

    /// Store a value in the execution context for later `${ctx.KEY}` use
    Remember {
        key: String,
        value: String,
    },

    /// Log a message (for debugging)
    Log {
        message: String,
    },
}

fn default_wait_timeout() -> u64 {
    5000
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitState {
    #[default]
    Visible,
    Hidden,
    Attached,
    Detached,
}

impl WaitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitState::Visible => "visible",
            WaitState::Hidden => "hidden",
            WaitState::Attached => "attached",
            WaitState::Detached => "detached",
        }
    }
}

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{(unique|ctx\.([A-Za-z0-9_.\-]+))\}").expect("valid placeholder regex")
});

/// Expand `${unique}` and `${ctx.KEY}` against the worker's context.
///
/// Every `${unique}` within one template expands to the same id.
pub fn interpolate(template: &str, ctx: &mut ExecutionContext) -> Result<String, TestFailure> {
    if !template.contains("${") {
        return Ok(template.to_string());
    }

    let mut unique: Option<String> = None;
    let mut missing: Option<String> = None;

    let expanded = PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| {
        match caps.get(2) {
            None => unique.get_or_insert_with(|| ctx.unique_id()).clone(),
            Some(key) => match ctx.get(key.as_str()) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => {
                    missing.get_or_insert_with(|| key.as_str().to_string());
                    String::new()
                }
            },
        }
    });

    match missing {
        Some(key) => Err(TestFailure::new(
            FailureKind::Script,
            format!("unknown context key '{}' in \"{}\"", key, template),
        )),
        None => Ok(expanded.into_owned()),
    }
}

impl TestStep {
    /// Short label used in logs and generated scripts
    pub fn name(&self) -> String {
        match self {
            TestStep::Navigate { url, .. } => format!("navigate:{}", url),
            TestStep::Click { selector, .. } => format!("click:{}", selector),
            TestStep::Fill { selector, .. } => format!("fill:{}", selector),
            TestStep::Press { key, .. } => format!("press:{}", key),
            TestStep::Wait { selector, .. } => format!("wait:{}", selector),
            TestStep::Assert { selector, .. } => format!("assert:{}", selector),
            TestStep::Screenshot { name, .. } => format!("screenshot:{}", name),
            TestStep::Remember { key, .. } => format!("remember:{}", key),
            TestStep::Log { message } => {
                format!("log:{}", message.chars().take(30).collect::<String>())
            }
        }
    }

    /// Whether the step is sent to the browser; `remember` and `log` are not
    pub fn needs_browser(&self) -> bool {
        !matches!(self, TestStep::Remember { .. } | TestStep::Log { .. })
    }

    /// Copy of this step with every placeholder expanded
    pub fn resolve(&self, ctx: &mut ExecutionContext) -> Result<TestStep, TestFailure> {
        let mut step = self.clone();
        match &mut step {
            TestStep::Navigate { url, wait_for_selector } => {
                *url = interpolate(url, ctx)?;
                if let Some(sel) = wait_for_selector {
                    *sel = interpolate(sel, ctx)?;
                }
            }
            TestStep::Click { selector, .. } | TestStep::Wait { selector, .. } => {
                *selector = interpolate(selector, ctx)?;
            }
            TestStep::Fill { selector, value } => {
                *selector = interpolate(selector, ctx)?;
                *value = interpolate(value, ctx)?;
            }
            TestStep::Press { selector, .. } => {
                if let Some(sel) = selector {
                    *sel = interpolate(sel, ctx)?;
                }
            }
            TestStep::Assert {
                selector,
                text,
                text_contains,
                ..
            } => {
                *selector = interpolate(selector, ctx)?;
                if let Some(t) = text {
                    *t = interpolate(t, ctx)?;
                }
                if let Some(t) = text_contains {
                    *t = interpolate(t, ctx)?;
                }
            }
            TestStep::Screenshot { name, .. } => *name = interpolate(name, ctx)?,
            TestStep::Remember { value, .. } => *value = interpolate(value, ctx)?,
            TestStep::Log { message } => *message = interpolate(message, ctx)?,
        }
        Ok(step)
    }
}

impl TestSpec {
    /// Parse a test spec from YAML string
    pub fn from_yaml(yaml: &str) -> E2eResult<Self> {
        serde_yaml::from_str(yaml).map_err(E2eError::from)
    }

    /// Parse a test spec from a YAML file
    pub fn from_file(path: &Path) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content).map_err(|e| E2eError::SpecParse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Load all test specs under a directory, ordered by path
    pub fn load_all(dir: &Path) -> E2eResult<Vec<Self>> {
        let mut paths: Vec<_> = walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
            .map(|e| e.into_path())
            .collect();
        paths.sort();

        paths.iter().map(|p| Self::from_file(p)).collect()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::WorkerId;
    use std::time::Duration;

    #[test]
    fn test_parse_simple_spec() {
        let yaml = r#"
name: login-flow
description: Test the TOTP login flow
tags:
  - auth
  - smoke
steps:
  - action: navigate
    url: /login
    wait_for_selector: '[data-testid="login-page"]'
  - action: fill
    selector: '[data-testid="login-identifier-input"]'
    value: testuser
  - action: screenshot
    name: login-form
"#;
        let spec = TestSpec::from_yaml(yaml).unwrap();
        assert_eq!(spec.name, "login-flow");
        assert_eq!(spec.steps.len(), 3);
        assert!(spec.has_tag("smoke"));
        assert!(spec.retry.is_none());
        assert!(spec.viewport.is_none());
    }

    #[test]
    fn test_parse_retry_and_viewport() {
        let yaml = r#"
name: flaky-search
viewport:
  width: 1920
  height: 1080
retry:
  max_retries: 2
  retryable_kinds: [timeout, element_not_found]
  delay_ms: 500
steps:
  - action: wait
    selector: '#results'
"#;
        let spec = TestSpec::from_yaml(yaml).unwrap();
        let retry = spec.retry.unwrap();
        assert_eq!(retry.max_retries, 2);
        assert_eq!(retry.delay, Duration::from_millis(500));
        assert!(retry.retryable_kinds.contains(&FailureKind::Timeout));
        assert_eq!(spec.viewport, Some(Viewport { width: 1920, height: 1080 }));
        assert!(matches!(
            spec.steps[0],
            TestStep::Wait { timeout_ms: 5000, state: WaitState::Visible, .. }
        ));
    }

    #[test]
    fn test_interpolate_unique_is_stable_within_template() {
        let mut ctx = ExecutionContext::new(WorkerId::new(3));
        let out = interpolate("user-${unique}@example.com/${unique}", &mut ctx).unwrap();
        let (left, right) = out.split_once('/').unwrap();
        let id = left.trim_start_matches("user-").trim_end_matches("@example.com");
        assert_eq!(id, right);
        assert!(id.starts_with("3-"));
    }

    #[test]
    fn test_interpolate_context_values() {
        let mut ctx = ExecutionContext::new(WorkerId::new(0));
        ctx.set("user", "alice");
        ctx.set("age", 31);
        let out = interpolate("${ctx.user} is ${ctx.age}", &mut ctx).unwrap();
        assert_eq!(out, "alice is 31");
    }

    #[test]
    fn test_interpolate_missing_key_fails() {
        let mut ctx = ExecutionContext::new(WorkerId::new(0));
        let err = interpolate("hello ${ctx.nobody}", &mut ctx).unwrap_err();
        assert_eq!(err.kind, FailureKind::Script);
        assert!(err.message.contains("nobody"));
    }

    #[test]
    fn test_resolve_fill_step() {
        let mut ctx = ExecutionContext::new(WorkerId::new(0));
        ctx.set("email", "bob@example.com");
        let step = TestStep::Fill {
            selector: "#email".to_string(),
            value: "${ctx.email}".to_string(),
        };
        let resolved = step.resolve(&mut ctx).unwrap();
        assert_eq!(
            resolved,
            TestStep::Fill {
                selector: "#email".to_string(),
                value: "bob@example.com".to_string(),
            }
        );
        assert!(resolved.needs_browser());
    }
}
