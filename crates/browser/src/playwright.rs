//! Playwright browser automation
//!
//! A small Node.js driver process owns the browser. Requests and responses
//! travel as JSON lines over its stdin/stdout, tagged with an id; a reader
//! task hands each response to the caller waiting on that id.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command as TokioCommand};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use storysnap_common::bridge::{DiscoveryBridge, EvalScript, Page, PageOptions};
use storysnap_common::PreviewDocument;

use crate::error::{BrowserError, BrowserResult};
use crate::preview::{fetch_preview_document, PreviewWait};

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

impl std::str::FromStr for Browser {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chromium" | "chrome" => Ok(Browser::Chromium),
            "firefox" => Ok(Browser::Firefox),
            "webkit" | "safari" => Ok(Browser::Webkit),
            other => Err(format!("unknown browser '{}'", other)),
        }
    }
}

/// Configuration for launching the driver
#[derive(Debug, Clone)]
pub struct PlaywrightConfig {
    /// Browser type
    pub browser: Browser,

    pub headless: bool,

    /// `node_modules` directory holding the `playwright` package
    pub node_modules: PathBuf,

    /// Upper bound for a single driver call
    pub call_timeout: Duration,

    pub preview_wait: PreviewWait,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            browser: Browser::Chromium,
            headless: true,
            node_modules: PathBuf::from("node_modules"),
            call_timeout: Duration::from_secs(60),
            preview_wait: PreviewWait::default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Request<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct Response {
    id: u64,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<DriverError>,
}

#[derive(Debug, Deserialize)]
struct DriverError {
    message: String,
    #[serde(default)]
    crashed: bool,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

/// The running driver process
struct Driver {
    stdin: tokio::sync::Mutex<ChildStdin>,
    pending: Pending,
    next_id: AtomicU64,
    child: Mutex<Child>,
    call_timeout: Duration,
    // Holds the staged driver script for the life of the process
    _script_dir: tempfile::TempDir,
}

impl Driver {
    async fn spawn(config: &PlaywrightConfig) -> BrowserResult<Self> {
        let node_modules = std::env::current_dir()?.join(&config.node_modules);
        Self::check_playwright_installed(&node_modules).await?;

        let script_dir = tempfile::tempdir()?;
        let script_path = script_dir.path().join("storysnap-driver.js");
        std::fs::write(&script_path, DRIVER_JS)?;

        let mut child = TokioCommand::new("node")
            .arg(&script_path)
            .arg(config.browser.as_str())
            .arg(if config.headless { "headless" } else { "headed" })
            .env("NODE_PATH", &node_modules)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BrowserError::DriverExited(format!("failed to spawn node: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BrowserError::DriverExited("driver stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BrowserError::DriverExited("driver stdout unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[driver] {}", line);
                }
            });
        }

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let dispatch = pending.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<Response>(&line) {
                    Ok(response) => {
                        if let Some(tx) = dispatch.lock().remove(&response.id) {
                            let _ = tx.send(response);
                        }
                    }
                    Err(_) => debug!("[driver] {}", line),
                }
            }
            // Driver gone; dropping the senders fails every waiting call
            dispatch.lock().clear();
        });

        info!("Launched {} driver", config.browser.as_str());
        Ok(Self {
            stdin: tokio::sync::Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            child: Mutex::new(child),
            call_timeout: config.call_timeout,
            _script_dir: script_dir,
        })
    }

    /// Check if Playwright is installed
    async fn check_playwright_installed(node_modules: &std::path::Path) -> BrowserResult<()> {
        let status = TokioCommand::new("node")
            .args(["-e", "require.resolve('playwright')"])
            .env("NODE_PATH", node_modules)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => Ok(()),
            _ => Err(BrowserError::PlaywrightNotFound),
        }
    }

    async fn call(&self, method: &str, params: Value) -> BrowserResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let mut line = serde_json::to_string(&Request { id, method, params })?;
        line.push('\n');
        {
            let mut stdin = self.stdin.lock().await;
            let written = match stdin.write_all(line.as_bytes()).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                self.pending.lock().remove(&id);
                return Err(BrowserError::DriverExited(e.to_string()));
            }
        }

        let response = match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(BrowserError::DriverExited(format!(
                    "driver closed while handling {}",
                    method
                )))
            }
            Err(_) => {
                self.pending.lock().remove(&id);
                return Err(BrowserError::Timeout {
                    method: method.to_string(),
                    seconds: self.call_timeout.as_secs(),
                });
            }
        };

        match response.error {
            Some(error) if error.crashed => Err(BrowserError::PageCrashed(error.message)),
            Some(error) => Err(BrowserError::Page(error.message)),
            None => Ok(response.result),
        }
    }
}

/// Browser bridge backed by a Playwright driver process
pub struct PlaywrightBridge {
    driver: Arc<Driver>,
    http: reqwest::Client,
    preview_wait: PreviewWait,
}

impl PlaywrightBridge {
    /// Spawn the driver and launch the browser
    pub async fn launch(config: PlaywrightConfig) -> BrowserResult<Self> {
        let driver = Driver::spawn(&config).await?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            driver: Arc::new(driver),
            http,
            preview_wait: config.preview_wait,
        })
    }

    /// Close the browser and wait for the driver to exit
    pub async fn shutdown(&self) -> BrowserResult<()> {
        if let Err(e) = self.driver.call("shutdown", Value::Null).await {
            debug!("driver shutdown: {}", e);
        }
        let mut child = self.driver.child.lock();
        match child.try_wait()? {
            Some(status) => debug!("driver exited with {}", status),
            None => {
                warn!("driver still running, killing it");
                child.start_kill()?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DiscoveryBridge for PlaywrightBridge {
    async fn fetch_preview_document(&self, url: &str) -> storysnap_common::Result<PreviewDocument> {
        Ok(fetch_preview_document(&self.http, url, &self.preview_wait).await?)
    }

    async fn page(&self, options: &PageOptions) -> storysnap_common::Result<Box<dyn Page>> {
        let id = self
            .driver
            .call("newPage", json!({ "width": options.width, "height": options.height }))
            .await?
            .as_u64()
            .ok_or_else(|| BrowserError::Page("driver returned no page id".into()))?;

        Ok(Box::new(PlaywrightPage {
            driver: self.driver.clone(),
            id,
            closed: false,
        }))
    }
}

/// One page of the driver's browser
pub struct PlaywrightPage {
    driver: Arc<Driver>,
    id: u64,
    closed: bool,
}

#[async_trait]
impl Page for PlaywrightPage {
    async fn goto(&mut self, url: &str) -> storysnap_common::Result<()> {
        debug!("page {} -> {}", self.id, url);
        self.driver
            .call("goto", json!({ "page": self.id, "url": url }))
            .await?;
        Ok(())
    }

    async fn eval(&mut self, script: &EvalScript) -> storysnap_common::Result<Value> {
        Ok(self
            .driver
            .call("evaluate", json!({ "page": self.id, "expression": script.render() }))
            .await?)
    }

    async fn close(&mut self) -> storysnap_common::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.driver
            .call("closePage", json!({ "page": self.id }))
            .await?;
        Ok(())
    }
}

/// Driver process source
const DRIVER_JS: &str = r#"
const readline = require('readline');
const playwright = require('playwright');

const browserType = process.argv[2] || 'chromium';
const headless = process.argv[3] !== 'headed';
const browserPromise = playwright[browserType].launch({ headless });

const pages = new Map();
const crashed = new Set();
let nextPage = 1;

const send = (message) => process.stdout.write(JSON.stringify(message) + '\n');

function getPage(id) {
  if (crashed.has(id)) throw Object.assign(new Error(`page ${id} crashed`), { crashed: true });
  const page = pages.get(id);
  if (!page) throw new Error(`no page ${id}`);
  return page;
}

async function handle({ method, params }) {
  const browser = await browserPromise;
  switch (method) {
    case 'newPage': {
      const context = await browser.newContext({
        viewport: { width: params.width, height: params.height },
      });
      const page = await context.newPage();
      const id = nextPage++;
      page.on('crash', () => crashed.add(id));
      pages.set(id, page);
      return id;
    }
    case 'goto':
      await getPage(params.page).goto(params.url, { waitUntil: 'load' });
      return null;
    case 'evaluate':
      return await getPage(params.page).evaluate(params.expression);
    case 'closePage': {
      const page = pages.get(params.page);
      pages.delete(params.page);
      crashed.delete(params.page);
      if (page) await page.context().close().catch(() => {});
      return null;
    }
    case 'shutdown':
      await browser.close();
      setImmediate(() => process.exit(0));
      return null;
    default:
      throw new Error(`unknown method ${method}`);
  }
}

const CRASH_RE = /crash|Target closed|has been closed/i;

readline.createInterface({ input: process.stdin }).on('line', async (line) => {
  let request;
  try {
    request = JSON.parse(line);
  } catch (error) {
    console.error(`invalid request: ${line}`);
    return;
  }
  try {
    const result = await handle(request);
    send({ id: request.id, result: result === undefined ? null : result });
  } catch (error) {
    const message = String((error && error.message) || error);
    const page = request.params && request.params.page;
    send({
      id: request.id,
      error: { message, crashed: Boolean(error.crashed || crashed.has(page) || CRASH_RE.test(message)) },
    });
  }
});
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("chromium", Browser::Chromium ; "chromium")]
    #[test_case("Firefox", Browser::Firefox ; "case insensitive")]
    #[test_case("safari", Browser::Webkit ; "alias")]
    fn test_browser_from_str(input: &str, expected: Browser) {
        assert_eq!(input.parse::<Browser>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_browser() {
        assert!("lynx".parse::<Browser>().is_err());
    }

    #[test]
    fn test_response_parsing() {
        let ok: Response = serde_json::from_str(r#"{"id":7,"result":3}"#).unwrap();
        assert_eq!(ok.id, 7);
        assert_eq!(ok.result, json!(3));
        assert!(ok.error.is_none());

        let crash: Response =
            serde_json::from_str(r#"{"id":8,"error":{"message":"Target closed","crashed":true}}"#)
                .unwrap();
        assert!(crash.error.map(|e| e.crashed).unwrap_or(false));
    }

    #[test]
    fn test_request_is_one_json_line() {
        let line = serde_json::to_string(&Request {
            id: 1,
            method: "goto",
            params: json!({ "page": 1, "url": "http://localhost/iframe.html?id=a--b" }),
        })
        .unwrap();
        assert!(!line.contains('\n'));
        assert!(line.starts_with(r#"{"id":1,"method":"goto""#));
    }

    #[test]
    fn test_driver_script_handles_every_method() {
        for method in ["newPage", "goto", "evaluate", "closePage", "shutdown"] {
            assert!(DRIVER_JS.contains(&format!("'{}'", method)), "missing {}", method);
        }
    }
}
