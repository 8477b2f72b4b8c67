//! Playwright browser sessions as coordinator resources

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use gantry_core::{BoxError, FailureKind, ResourceConfig, ResourceFactory, TestFailure};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{E2eError, E2eResult};
use crate::spec::{TestStep, Viewport};

/// Option key in `ResourceConfig::options` pointing node at a Playwright install
pub const NODE_PATH_OPTION: &str = "node_path";

/// How long a browser gets to launch before the session is given up
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on one step; Playwright's own step timeouts fire well before it
const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    pub fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }
}

impl FromStr for Browser {
    type Err = E2eError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chromium" | "chrome" => Ok(Browser::Chromium),
            "firefox" => Ok(Browser::Firefox),
            "webkit" | "safari" => Ok(Browser::Webkit),
            other => Err(E2eError::UnsupportedBrowser(other.to_string())),
        }
    }
}

/// Settings one browser session is launched with
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub browser: Browser,
    pub headless: bool,
    pub base_url: String,
    pub viewport: Viewport,
    pub screenshot_dir: PathBuf,
    /// Program that runs the driver script
    pub node_binary: String,
    /// Exported as `NODE_PATH` to the driver
    pub node_path: Option<PathBuf>,
}

/// Launches one `BrowserSession` per worker
pub struct BrowserFactory {
    base_url: String,
    viewport: Viewport,
    screenshot_dir: PathBuf,
    node_binary: String,
    playwright_checked: OnceCell<bool>,
}

impl BrowserFactory {
    pub fn new(
        base_url: impl Into<String>,
        viewport: Viewport,
        screenshot_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            viewport,
            screenshot_dir: screenshot_dir.into(),
            node_binary: "node".to_string(),
            playwright_checked: OnceCell::new(),
        }
    }

    pub fn with_node_binary(mut self, node: impl Into<String>) -> Self {
        self.node_binary = node.into();
        self
    }

    fn session_options(&self, config: &ResourceConfig) -> E2eResult<SessionOptions> {
        Ok(SessionOptions {
            browser: config.kind.parse()?,
            headless: config.headless,
            base_url: self.base_url.clone(),
            viewport: self.viewport,
            screenshot_dir: self.screenshot_dir.clone(),
            node_binary: self.node_binary.clone(),
            node_path: config.options.get(NODE_PATH_OPTION).map(PathBuf::from),
        })
    }

    /// Check once per factory whether Playwright is installed
    async fn playwright_available(&self) -> bool {
        *self
            .playwright_checked
            .get_or_init(|| async {
                Command::new("npx")
                    .args(["playwright", "--version"])
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await
                    .map(|s| s.success())
                    .unwrap_or(false)
            })
            .await
    }
}

#[async_trait]
impl ResourceFactory for BrowserFactory {
    type Resource = BrowserSession;

    async fn create(&self, config: &ResourceConfig) -> Result<BrowserSession, BoxError> {
        let options = self.session_options(config)?;
        if !self.playwright_available().await {
            return Err(Box::new(E2eError::PlaywrightNotFound));
        }

        let browser = options.browser;
        let session = BrowserSession::launch(options).await?;
        info!("Launched {} session {}", browser.as_str(), session.id);
        Ok(session)
    }

    async fn destroy(&self, session: &BrowserSession) -> Result<(), BoxError> {
        session.close().await?;
        debug!("Closed session {}", session.id);
        Ok(())
    }

    async fn capture(&self, session: &BrowserSession) -> Result<Vec<u8>, BoxError> {
        Ok(session.capture_png().await?)
    }
}

/// One live browser owned by one worker.
///
/// A long-running node process holds the browser and a single page. Each step
/// is sent to it as one JSON line and answered with one JSON line, so page
/// state carries over from step to step and across retries.
pub struct BrowserSession {
    id: Uuid,
    browser: Browser,
    screenshot_dir: PathBuf,
    workdir: TempDir,
    driver: Mutex<Option<Driver>>,
    captures: AtomicU64,
}

impl BrowserSession {
    /// Start the driver process and wait until its browser is up
    pub async fn launch(options: SessionOptions) -> E2eResult<Self> {
        let id = Uuid::new_v4();
        let workdir = tempfile::Builder::new().prefix("gantry-session-").tempdir()?;
        let driver_path = workdir.path().join("driver.js");
        tokio::fs::write(&driver_path, DRIVER_SCRIPT).await?;
        tokio::fs::create_dir_all(&options.screenshot_dir).await?;

        let launch = serde_json::json!({
            "browser": options.browser.as_str(),
            "headless": options.headless,
            "viewport": options.viewport,
            "baseUrl": options.base_url.trim_end_matches('/'),
        });

        let mut cmd = Command::new(&options.node_binary);
        cmd.arg(&driver_path)
            .arg(launch.to_string())
            .current_dir(workdir.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(node_path) = &options.node_path {
            cmd.env("NODE_PATH", node_path);
        }

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(id, stderr));
        }
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            return Err(E2eError::Playwright("driver pipes unavailable".to_string()));
        };

        let mut driver = Driver {
            child,
            stdin,
            replies: BufReader::new(stdout).lines(),
        };

        let ready = match tokio::time::timeout(LAUNCH_TIMEOUT, driver.read_reply()).await {
            Ok(reply) => reply,
            Err(_) => Err(E2eError::DriverTimeout(LAUNCH_TIMEOUT)),
        };
        match ready {
            Ok(reply) if reply.ok => {}
            Ok(reply) => {
                driver.kill().await;
                return Err(E2eError::Playwright(reply.error));
            }
            Err(e) => {
                driver.kill().await;
                return Err(e);
            }
        }

        Ok(Self {
            id,
            browser: options.browser,
            screenshot_dir: options.screenshot_dir,
            workdir,
            driver: Mutex::new(Some(driver)),
            captures: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn browser(&self) -> Browser {
        self.browser
    }

    /// Resize the live page
    pub async fn set_viewport(&self, viewport: Viewport) -> Result<(), TestFailure> {
        self.request(DriverCommand::Viewport {
            width: viewport.width,
            height: viewport.height,
        })
        .await
        .map_err(driver_failure)?
        .into_result()
    }

    /// Execute one browser step. Returns the screenshot path for screenshot steps.
    ///
    /// `remember` and `log` steps need no browser and are no-ops here.
    pub async fn execute(&self, step: &TestStep) -> Result<Option<PathBuf>, TestFailure> {
        if !step.needs_browser() {
            return Ok(None);
        }

        let code = step_to_js(step, &self.screenshot_dir, &self.tag());
        debug!("Session {} executing {}", self.id, step.name());
        self.request(DriverCommand::Run { code: &code })
            .await
            .map_err(driver_failure)?
            .into_result()?;

        Ok(match step {
            TestStep::Screenshot { name, .. } => {
                Some(screenshot_path(&self.screenshot_dir, &self.tag(), name))
            }
            _ => None,
        })
    }

    /// Full-page PNG of the page as it is right now
    pub async fn capture_png(&self) -> E2eResult<Vec<u8>> {
        let n = self.captures.fetch_add(1, Ordering::Relaxed);
        let path = self.workdir.path().join(format!("capture-{}.png", n));

        let reply = self.request(DriverCommand::Capture { path: &path }).await?;
        if !reply.ok {
            return Err(E2eError::Playwright(reply.error));
        }
        Ok(tokio::fs::read(&path).await?)
    }

    /// Close the browser and stop the driver. Safe to call twice.
    pub async fn close(&self) -> E2eResult<()> {
        let Some(mut driver) = self.driver.lock().await.take() else {
            return Ok(());
        };

        let asked = tokio::time::timeout(CLOSE_TIMEOUT, driver.send(&DriverCommand::Close)).await;
        if !matches!(asked, Ok(Ok(_))) {
            warn!("Session {} did not close cleanly; killing driver", self.id);
            driver.kill().await;
            return Ok(());
        }

        let exited = tokio::time::timeout(CLOSE_TIMEOUT, driver.child.wait()).await;
        match exited {
            Ok(status) => {
                status?;
            }
            Err(_) => driver.kill().await,
        }
        Ok(())
    }

    async fn request(&self, command: DriverCommand<'_>) -> E2eResult<DriverReply> {
        let mut slot = self.driver.lock().await;
        let driver = slot
            .as_mut()
            .ok_or_else(|| E2eError::Playwright(format!("session {} is closed", self.id)))?;

        let answered = tokio::time::timeout(COMMAND_TIMEOUT, driver.send(&command)).await;
        match answered {
            Ok(reply) => reply,
            Err(_) => {
                // A wedged driver cannot be resynchronized
                if let Some(mut driver) = slot.take() {
                    driver.kill().await;
                }
                Err(E2eError::DriverTimeout(COMMAND_TIMEOUT))
            }
        }
    }

    fn tag(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }
}

/// The node side of a session: stdin carries commands, stdout carries replies
struct Driver {
    child: Child,
    stdin: ChildStdin,
    replies: Lines<BufReader<ChildStdout>>,
}

impl Driver {
    async fn send(&mut self, command: &DriverCommand<'_>) -> E2eResult<DriverReply> {
        let mut line = serde_json::to_string(command)?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        self.read_reply().await
    }

    /// Next reply line; anything else the page prints to stdout is skipped
    async fn read_reply(&mut self) -> E2eResult<DriverReply> {
        while let Some(line) = self.replies.next_line().await? {
            match serde_json::from_str::<DriverReply>(line.trim()) {
                Ok(reply) => return Ok(reply),
                Err(_) => debug!("driver: {}", line),
            }
        }
        Err(E2eError::Playwright("driver exited".to_string()))
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!("Driver already gone: {}", e);
        }
    }
}

async fn forward_stderr(session: Uuid, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("session {} stderr: {}", session, line);
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum DriverCommand<'a> {
    Run { code: &'a str },
    Viewport { width: u32, height: u32 },
    Capture { path: &'a Path },
    Close,
}

#[derive(Debug, Deserialize)]
struct DriverReply {
    ok: bool,
    #[serde(default)]
    name: String,
    #[serde(default)]
    error: String,
}

impl DriverReply {
    fn into_result(self) -> Result<(), TestFailure> {
        if self.ok {
            Ok(())
        } else {
            Err(TestFailure::new(classify(&self.name, &self.error), self.error))
        }
    }
}

fn driver_failure(err: E2eError) -> TestFailure {
    let kind = match err {
        E2eError::DriverTimeout(_) => FailureKind::Timeout,
        _ => FailureKind::Resource,
    };
    TestFailure::new(kind, err.to_string())
}

/// Long-running Playwright driver. Reads one JSON command per stdin line and
/// writes one JSON reply per stdout line.
const DRIVER_SCRIPT: &str = r#"
const readline = require('readline');
const playwright = require('playwright');
const { expect } = require('@playwright/test');

const AsyncFunction = Object.getPrototypeOf(async function () {}).constructor;
const config = JSON.parse(process.argv[2]);
const reply = (msg) => process.stdout.write(JSON.stringify(msg) + '\n');
const failure = (error) => ({ ok: false, name: error.name, error: error.message });

(async () => {
  let browser;
  let page;
  try {
    browser = await playwright[config.browser].launch({ headless: config.headless });
    const context = await browser.newContext({ viewport: config.viewport });
    page = await context.newPage();
  } catch (error) {
    reply(failure(error));
    process.exit(1);
  }
  reply({ ok: true });

  const baseUrl = config.baseUrl;
  const input = readline.createInterface({ input: process.stdin });
  for await (const line of input) {
    const cmd = JSON.parse(line);
    try {
      switch (cmd.op) {
        case 'run':
          await new AsyncFunction('page', 'expect', 'baseUrl', cmd.code)(page, expect, baseUrl);
          break;
        case 'viewport':
          await page.setViewportSize({ width: cmd.width, height: cmd.height });
          break;
        case 'capture':
          await page.screenshot({ path: cmd.path, fullPage: true });
          break;
        case 'close':
          await browser.close();
          reply({ ok: true });
          process.exit(0);
      }
      reply({ ok: true });
    } catch (error) {
      reply(failure(error));
    }
  }
  await browser.close();
})();
"#;

/// Playwright code for one step, run against the session's live `page`
pub fn step_to_js(step: &TestStep, screenshot_dir: &Path, session_tag: &str) -> String {
    match step {
        TestStep::Navigate {
            url,
            wait_for_selector,
        } => {
            let wait = wait_for_selector
                .as_ref()
                .map(|s| format!("\nawait page.waitForSelector({});", js_str(s)))
                .unwrap_or_default();
            format!("await page.goto(baseUrl + {});{}", js_str(url), wait)
        }
        TestStep::Click {
            selector,
            timeout_ms,
        } => format!(
            "await page.click({}, {{ timeout: {} }});",
            js_str(selector),
            timeout_ms.unwrap_or(5000)
        ),
        TestStep::Fill { selector, value } => {
            format!("await page.fill({}, {});", js_str(selector), js_str(value))
        }
        TestStep::Press { selector, key } => match selector {
            Some(sel) => format!(
                "await page.locator({}).press({});",
                js_str(sel),
                js_str(key)
            ),
            None => format!("await page.keyboard.press({});", js_str(key)),
        },
        TestStep::Wait {
            selector,
            timeout_ms,
            state,
        } => format!(
            "await page.waitForSelector({}, {{ state: '{}', timeout: {} }});",
            js_str(selector),
            state.as_str(),
            timeout_ms
        ),
        TestStep::Assert {
            selector,
            visible,
            text,
            text_contains,
            count,
        } => {
            let locator = format!("page.locator({})", js_str(selector));
            let mut assertions = Vec::new();

            match visible {
                Some(true) => assertions.push(format!("await expect({}).toBeVisible();", locator)),
                Some(false) => assertions.push(format!("await expect({}).toBeHidden();", locator)),
                None => {}
            }
            if let Some(t) = text {
                assertions.push(format!(
                    "await expect({}).toHaveText({});",
                    locator,
                    js_str(t)
                ));
            }
            if let Some(t) = text_contains {
                assertions.push(format!(
                    "await expect({}).toContainText({});",
                    locator,
                    js_str(t)
                ));
            }
            if let Some(c) = count {
                assertions.push(format!("await expect({}).toHaveCount({});", locator, c));
            }
            assertions.join("\n")
        }
        TestStep::Screenshot { name, full_page } => format!(
            "await page.screenshot({{ path: {}, fullPage: {} }});",
            js_str(&screenshot_path(screenshot_dir, session_tag, name).to_string_lossy()),
            full_page
        ),
        TestStep::Remember { .. } => String::new(),
        TestStep::Log { message } => format!("console.log({});", js_str(message)),
    }
}

fn screenshot_path(dir: &Path, session_tag: &str, name: &str) -> PathBuf {
    dir.join(format!("{}-{}.png", gantry_core::sanitize_name(name), session_tag))
}

/// Quote a string as a JavaScript literal
fn js_str(s: &str) -> String {
    serde_json::Value::from(s).to_string()
}

static ASSERTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"expect\(|\.to(Have|Be|Contain)\w*\(").expect("valid assertion regex")
});
static ELEMENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)waiting for (locator|selector)|resolved to 0 elements|no element")
        .expect("valid element regex")
});
static TIMEOUT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)timeout \d+ms exceeded").expect("valid timeout regex"));
static NETWORK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"net::ERR_|ECONNREFUSED|ECONNRESET|NS_ERROR_").expect("valid network regex")
});

/// Map a Playwright error name and message to a failure kind
pub fn classify(name: &str, message: &str) -> FailureKind {
    if ASSERTION_RE.is_match(message) {
        FailureKind::Assertion
    } else if ELEMENT_RE.is_match(message) {
        FailureKind::ElementNotFound
    } else if name == "TimeoutError" || TIMEOUT_RE.is_match(message) {
        FailureKind::Timeout
    } else if NETWORK_RE.is_match(message) {
        FailureKind::Network
    } else {
        FailureKind::Script
    }
}
