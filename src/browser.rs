//! Scoped browser acquisition, parameterized by a [`BrowserProfile`].
//!
//! The engine is abstracted behind the [`BrowserLauncher`] / [`BrowserSession`]
//! / [`PageDriver`] traits so the capture pipeline and its tests never talk
//! to Chromium directly. The production implementation drives Chromium over
//! CDP via `chromiumoxide`.
//!
//! Acquisition is strictly nested: session outer, page inner. Page close
//! precedes session close on every exit path; callers own that ordering
//! because Rust has no async drop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::input::{DispatchKeyEventParams, DispatchKeyEventType};
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, EventResponseReceived, ResourceType,
};
use chromiumoxide::cdp::browser_protocol::page::PrintToPdfParams;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::models::{BrowserProfile, HeadlessKind, WaitStrategy};

/// Launch flags that blunt the usual automation fingerprints.
const STEALTH_ARGS: &[&str] = &[
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-dev-shm-usage",
    "--disable-accelerated-2d-canvas",
    "--disable-gpu",
    "--disable-blink-features=AutomationControlled",
    "--disable-features=IsolateOrigins,site-per-process",
    "--lang=en-US,en",
    "--disable-extensions",
    "--disable-default-apps",
    "--disable-component-update",
];

/// Injected before any site script runs: hides `navigator.webdriver` and
/// gives the page plausible plugin and language lists.
const STEALTH_INIT_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
const originalQuery = window.navigator.permissions.query;
window.navigator.permissions.query = (parameters) => (
    parameters.name === 'notifications'
        ? Promise.resolve({ state: Notification.permission })
        : originalQuery(parameters)
);
"#;

/// Returned by a navigation that produced a main-document response.
#[derive(Debug, Clone)]
pub struct PageResponse {
    pub status: u16,
    pub final_url: String,
    /// Header names lowercased.
    pub headers: HashMap<String, String>,
}

/// A cookie injected before navigation. Pass-through; the engine does not
/// decide cookie policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieSpec {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

/// Marker error for navigations cut off by their deadline. The pipeline
/// downcasts to this to classify the outcome as `timeout`.
#[derive(Debug, Error)]
#[error("navigation timed out after {0} ms")]
pub struct NavigationTimeout(pub u64);

/// Launches browser sessions for a profile.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, profile: &BrowserProfile) -> Result<Box<dyn BrowserSession>>;
}

/// One live browser. Not shared across concurrent jobs.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn new_page(&self) -> Result<Box<dyn PageDriver>>;
    /// Closes every page, the browser, and any runtime it owns.
    async fn close(&mut self) -> Result<()>;
}

/// One live page (tab) inside a session.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Navigates and waits per `wait`, bounded by `timeout_ms`.
    ///
    /// `Ok(None)` means the navigation completed but produced no response
    /// object (rare; the pipeline treats it as `error`).
    async fn navigate(
        &mut self,
        url: &str,
        wait: WaitStrategy,
        timeout_ms: u64,
    ) -> Result<Option<PageResponse>>;

    /// Evaluates a script in the page, returning its JSON value.
    async fn eval(&self, script: &str) -> Result<serde_json::Value>;

    async fn title(&self) -> Result<Option<String>>;
    async fn html(&self) -> Result<String>;
    async fn screenshot_png(&self) -> Result<Vec<u8>>;
    async fn pdf(&self) -> Result<Vec<u8>>;
    async fn set_cookies(&self, cookies: &[CookieSpec]) -> Result<()>;
    async fn cookie_names(&self) -> Result<Vec<String>>;
    /// Sends an Escape keypress (modal dismissal).
    async fn press_escape(&self) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Finds a Chromium binary: `NT_CHROMIUM_PATH`, then well-known locations,
/// then `PATH`.
pub fn find_chromium() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("NT_CHROMIUM_PATH") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    let fixed = [
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    ];
    for candidate in fixed {
        let path = PathBuf::from(candidate);
        if path.exists() {
            return Some(path);
        }
    }

    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            for name in ["google-chrome", "chromium", "chromium-browser"] {
                let candidate = dir.join(name);
                if candidate.exists() {
                    return Some(candidate);
                }
            }
        }
    }

    None
}

/// Production launcher backed by a local Chromium binary.
pub struct ChromiumLauncher {
    chrome_path: PathBuf,
}

impl ChromiumLauncher {
    /// Locates Chromium or fails with a pointer at `NT_CHROMIUM_PATH`.
    pub fn discover() -> Result<Self> {
        let chrome_path = find_chromium()
            .context("Chromium not found; install it or set NT_CHROMIUM_PATH")?;
        Ok(ChromiumLauncher { chrome_path })
    }

    pub fn with_path(chrome_path: PathBuf) -> Self {
        ChromiumLauncher { chrome_path }
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self, profile: &BrowserProfile) -> Result<Box<dyn BrowserSession>> {
        let mut builder = BrowserConfig::builder()
            .chrome_executable(&self.chrome_path)
            .window_size(profile.viewport_width, profile.viewport_height);

        builder = match profile.headless {
            HeadlessKind::Shell => builder.arg("--headless"),
            HeadlessKind::NewHeadless => builder.arg("--headless=new"),
            HeadlessKind::LegacyHeadless => builder.arg("--headless=old"),
            HeadlessKind::Visible => builder.with_head(),
        };

        if profile.stealth {
            for arg in STEALTH_ARGS {
                builder = builder.arg(*arg);
            }
        } else {
            builder = builder.arg("--no-sandbox").arg("--disable-gpu");
        }

        let config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("Failed to launch Chromium")?;

        // Drain CDP events for the life of the browser.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
        });

        log::debug!(
            "Launched Chromium ({}) for profile {}",
            profile.headless,
            profile.name
        );

        Ok(Box::new(ChromiumSession {
            browser,
            handler_task,
            profile: profile.clone(),
        }))
    }
}

struct ChromiumSession {
    browser: Browser,
    handler_task: JoinHandle<()>,
    profile: BrowserProfile,
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn new_page(&self) -> Result<Box<dyn PageDriver>> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .context("Failed to open page")?;

        page.set_user_agent(self.profile.user_agent.as_str())
            .await
            .context("Failed to set user agent")?;

        if self.profile.stealth {
            page.evaluate_on_new_document(STEALTH_INIT_SCRIPT.to_string())
                .await
                .context("Failed to install stealth script")?;
        }

        Ok(Box::new(ChromiumPage { page }))
    }

    async fn close(&mut self) -> Result<()> {
        if let Err(e) = self.browser.close().await {
            log::warn!("Browser close reported: {e}");
        }
        let _ = self.browser.wait().await;
        self.handler_task.abort();
        Ok(())
    }
}

struct ChromiumPage {
    page: Page,
}

impl ChromiumPage {
    /// Polls `document.readyState` until the wait strategy is satisfied.
    /// NetworkIdle is approximated by a quiet period after `complete`;
    /// CDP has no first-class idle signal.
    async fn wait_for_ready(&self, wait: WaitStrategy) {
        let target_complete = !matches!(wait, WaitStrategy::DomContentLoaded);
        for _ in 0..600 {
            let state = self
                .page
                .evaluate("document.readyState")
                .await
                .ok()
                .and_then(|v| v.into_value::<String>().ok())
                .unwrap_or_default();
            let ready = if target_complete {
                state == "complete"
            } else {
                state == "interactive" || state == "complete"
            };
            if ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if matches!(wait, WaitStrategy::NetworkIdle) {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

#[async_trait]
impl PageDriver for ChromiumPage {
    async fn navigate(
        &mut self,
        url: &str,
        wait: WaitStrategy,
        timeout_ms: u64,
    ) -> Result<Option<PageResponse>> {
        // Listen before navigating so the main document response is not
        // missed.
        let mut responses = self
            .page
            .event_listener::<EventResponseReceived>()
            .await
            .context("Failed to subscribe to network events")?;

        let navigation = async {
            self.page
                .goto(url)
                .await
                .context("Navigation failed")?;
            self.wait_for_ready(wait).await;
            Ok::<(), anyhow::Error>(())
        };

        match tokio::time::timeout(Duration::from_millis(timeout_ms), navigation).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(NavigationTimeout(timeout_ms).into()),
        }

        // The last document response in the buffer reflects the final hop
        // of any redirect chain.
        let mut main_response: Option<PageResponse> = None;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(200), responses.next()).await
        {
            if event.r#type == ResourceType::Document {
                let headers = serde_json::to_value(&event.response.headers)
                    .ok()
                    .and_then(|v| v.as_object().cloned())
                    .map(|map| {
                        map.into_iter()
                            .map(|(k, v)| {
                                (
                                    k.to_lowercase(),
                                    v.as_str().unwrap_or_default().to_string(),
                                )
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                main_response = Some(PageResponse {
                    status: event.response.status as u16,
                    final_url: event.response.url.clone(),
                    headers,
                });
            }
        }

        Ok(main_response)
    }

    async fn eval(&self, script: &str) -> Result<serde_json::Value> {
        let result = self
            .page
            .evaluate(script)
            .await
            .context("Script evaluation failed")?;
        Ok(result.into_value().unwrap_or(serde_json::Value::Null))
    }

    async fn title(&self) -> Result<Option<String>> {
        self.page.get_title().await.context("Failed to read title")
    }

    async fn html(&self) -> Result<String> {
        self.page.content().await.context("Failed to read page HTML")
    }

    async fn screenshot_png(&self) -> Result<Vec<u8>> {
        self.page
            .screenshot(
                ScreenshotParams::builder()
                    .full_page(true)
                    .build(),
            )
            .await
            .context("Screenshot failed")
    }

    async fn pdf(&self) -> Result<Vec<u8>> {
        self.page
            .pdf(PrintToPdfParams::default())
            .await
            .context("PDF render failed")
    }

    async fn set_cookies(&self, cookies: &[CookieSpec]) -> Result<()> {
        if cookies.is_empty() {
            return Ok(());
        }
        let params: Vec<CookieParam> = cookies
            .iter()
            .map(|c| {
                CookieParam::builder()
                    .name(&c.name)
                    .value(&c.value)
                    .domain(&c.domain)
                    .path(&c.path)
                    .secure(c.secure)
                    .http_only(c.http_only)
                    .build()
                    .map_err(|e| anyhow::anyhow!("Invalid cookie {}: {e}", c.name))
            })
            .collect::<Result<_>>()?;
        self.page
            .set_cookies(params)
            .await
            .context("Failed to inject cookies")?;
        Ok(())
    }

    async fn cookie_names(&self) -> Result<Vec<String>> {
        let cookies = self
            .page
            .get_cookies()
            .await
            .context("Failed to read cookies")?;
        Ok(cookies.into_iter().map(|c| c.name).collect())
    }

    async fn press_escape(&self) -> Result<()> {
        for kind in [DispatchKeyEventType::KeyDown, DispatchKeyEventType::KeyUp] {
            let event = DispatchKeyEventParams::builder()
                .r#type(kind)
                .key("Escape")
                .windows_virtual_key_code(27)
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to build key event: {e}"))?;
            self.page
                .execute(event)
                .await
                .context("Failed to dispatch Escape")?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.page.clone().close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stealth_args_disable_the_automation_flag() {
        assert!(STEALTH_ARGS
            .iter()
            .any(|a| a.contains("AutomationControlled")));
    }

    #[test]
    fn cookie_spec_defaults_fill_in() {
        let cookie: CookieSpec =
            serde_json::from_str(r#"{"name":"sid","value":"x","domain":".example.com"}"#).unwrap();
        assert_eq!(cookie.path, "/");
        assert!(!cookie.secure);
    }
}
