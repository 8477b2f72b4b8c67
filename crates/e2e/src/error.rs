//! Error types for the E2E runner

use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Playwright not found. Install with: npx playwright install")]
    PlaywrightNotFound,

    #[error("Playwright error: {0}")]
    Playwright(String),

    #[error("Playwright driver did not answer within {0:?}")]
    DriverTimeout(std::time::Duration),

    #[error("Unsupported browser: {0} (expected chromium, firefox or webkit)")]
    UnsupportedBrowser(String),

    #[error("Test spec parse error in {path}: {reason}")]
    SpecParse { path: String, reason: String },

    #[error("Test not found: {0}")]
    TestNotFound(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type E2eResult<T> = Result<T, E2eError>;
