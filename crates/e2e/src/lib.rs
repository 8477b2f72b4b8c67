//! Gantry E2E runner
//!
//! Runs declarative YAML browser tests in parallel on top of `gantry-core`:
//! - Each worker owns one Playwright browser session at a time
//! - A failing test is retried in place when its spec declares a policy
//! - Failures leave a screenshot behind via the filesystem artifact sink
//! - Suite results are written as JSON
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   E2E Suite Runner (Rust)                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SuiteRunner                                                │
//! │    ├── load_specs() -> Vec<TestSpec>                        │
//! │    ├── to_case(spec) -> TestCase<BrowserSession>            │
//! │    └── run() -> SuiteSummary                                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ExecutionCoordinator<BrowserFactory>   (gantry-core)       │
//! │    ├── BrowserFactory   create / destroy / capture          │
//! │    ├── FsArtifactSink   <artifact_dir>/<name>-<sha>.png     │
//! │    └── JsonResultsSink  <output_dir>/<suite>-results.json   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  TestSpec (YAML)                                            │
//! │    ├── name, description, tags, viewport                    │
//! │    ├── retry: { max_retries, retryable_kinds, delay_ms }    │
//! │    └── steps: navigate | click | fill | press | wait |      │
//! │               assert | screenshot | remember | log          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod browser;
pub mod config;
pub mod error;
pub mod runner;
pub mod sinks;
pub mod spec;

pub use browser::{Browser, BrowserFactory, BrowserSession, SessionOptions};
pub use config::HarnessConfig;
pub use error::{E2eError, E2eResult};
pub use runner::SuiteRunner;
pub use sinks::{FsArtifactSink, JsonResultsSink};
pub use spec::{TestSpec, TestStep};
