// Shared test helpers for database setup and browser stubs.
//
// This module provides common utilities used across multiple test files to
// reduce duplication.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;

use national_treasure::browser::{
    BrowserLauncher, BrowserSession, CookieSpec, PageDriver, PageResponse,
};
use national_treasure::models::{BrowserProfile, HeadlessKind, WaitStrategy};
use national_treasure::{run_migrations, seed_default_profiles};

/// Creates a test database pool with migrations applied.
/// Uses an in-memory database for fast test execution.
#[allow(dead_code)] // Used by other test files
pub async fn create_test_pool() -> SqlitePool {
    let pool = SqlitePool::connect("sqlite::memory:")
        .await
        .expect("Failed to create test database pool");
    run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

/// Creates a test pool with the default profile catalog seeded.
#[allow(dead_code)]
pub async fn create_seeded_pool() -> SqlitePool {
    let pool = create_test_pool().await;
    seed_default_profiles(&pool)
        .await
        .expect("Failed to seed profiles");
    pool
}

/// A profile usable without a catalog lookup.
#[allow(dead_code)]
pub fn test_profile(id: &str) -> BrowserProfile {
    BrowserProfile {
        id: id.to_string(),
        name: format!("test-{id}"),
        headless: HeadlessKind::Shell,
        viewport_width: 1280,
        viewport_height: 800,
        user_agent: "test-agent".to_string(),
        stealth: true,
        wait_strategy: WaitStrategy::Load,
        timeout_ms: 5_000,
        attempts: 0,
        successes: 0,
        last_success: None,
        last_failure: None,
    }
}

/// Scripted page behavior shared by [`StubPage`] instances.
#[derive(Clone)]
#[allow(dead_code)]
pub struct StubPageScript {
    /// What `navigate` returns; `None` models "completed with no response".
    pub response: Option<PageResponse>,
    pub navigate_error: Option<String>,
    pub navigate_delay: Duration,
    pub html: String,
    pub body_text: String,
    pub title: Option<String>,
    pub cookies: Vec<String>,
    pub fail_screenshot: bool,
    pub fail_pdf: bool,
    pub fail_eval: bool,
}

#[allow(dead_code)]
impl StubPageScript {
    pub fn ok_page(body: &str) -> Self {
        StubPageScript {
            response: Some(PageResponse {
                status: 200,
                final_url: "https://site.test/page".to_string(),
                headers: HashMap::new(),
            }),
            navigate_error: None,
            navigate_delay: Duration::ZERO,
            html: format!("<html><head><title>Stub</title></head><body>{body}</body></html>"),
            body_text: body.to_string(),
            title: Some("Stub".to_string()),
            cookies: Vec::new(),
            fail_screenshot: false,
            fail_pdf: false,
            fail_eval: false,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        if let Some(response) = &mut self.response {
            response.status = status;
        }
        self
    }
}

#[allow(dead_code)] // Used by the capture and engine test files
pub struct StubPage {
    script: StubPageScript,
    closed: Arc<AtomicBool>,
    pub eval_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl PageDriver for StubPage {
    async fn navigate(
        &mut self,
        _url: &str,
        _wait: WaitStrategy,
        _timeout_ms: u64,
    ) -> Result<Option<PageResponse>> {
        if !self.script.navigate_delay.is_zero() {
            tokio::time::sleep(self.script.navigate_delay).await;
        }
        if let Some(error) = &self.script.navigate_error {
            anyhow::bail!("{error}");
        }
        Ok(self.script.response.clone())
    }

    async fn eval(&self, script: &str) -> Result<serde_json::Value> {
        self.eval_calls.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_eval {
            anyhow::bail!("scripted eval failure");
        }
        if script.contains("innerText") {
            return Ok(serde_json::json!(self.script.body_text));
        }
        if script.contains("scrollBy") {
            // Height stable and bottom reached: scrolling stops quickly.
            return Ok(serde_json::json!([100, 100]));
        }
        if script.contains("querySelectorAll('*')") {
            return Ok(serde_json::json!(10));
        }
        if script.contains("meta[name") {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::json!(0))
    }

    async fn title(&self) -> Result<Option<String>> {
        Ok(self.script.title.clone())
    }

    async fn html(&self) -> Result<String> {
        Ok(self.script.html.clone())
    }

    async fn screenshot_png(&self) -> Result<Vec<u8>> {
        if self.script.fail_screenshot {
            anyhow::bail!("scripted screenshot failure");
        }
        Ok(b"\x89PNG-stub".to_vec())
    }

    async fn pdf(&self) -> Result<Vec<u8>> {
        if self.script.fail_pdf {
            anyhow::bail!("scripted pdf failure");
        }
        Ok(b"%PDF-stub".to_vec())
    }

    async fn set_cookies(&self, _cookies: &[CookieSpec]) -> Result<()> {
        Ok(())
    }

    async fn cookie_names(&self) -> Result<Vec<String>> {
        Ok(self.script.cookies.clone())
    }

    async fn press_escape(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A browser session that hands out scripted pages.
#[allow(dead_code)] // Used by the capture and engine test files
pub struct StubSession {
    script: StubPageScript,
    pub page_closed: Arc<AtomicBool>,
    pub session_closed: Arc<AtomicBool>,
    pub eval_calls: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl StubSession {
    pub fn new(script: StubPageScript) -> Self {
        StubSession {
            script,
            page_closed: Arc::new(AtomicBool::new(false)),
            session_closed: Arc::new(AtomicBool::new(false)),
            eval_calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl BrowserSession for StubSession {
    async fn new_page(&self) -> Result<Box<dyn PageDriver>> {
        Ok(Box::new(StubPage {
            script: self.script.clone(),
            closed: Arc::clone(&self.page_closed),
            eval_calls: Arc::clone(&self.eval_calls),
        }))
    }

    async fn close(&mut self) -> Result<()> {
        self.session_closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Launcher returning stub sessions; lets worker-level tests run without a
/// browser.
#[allow(dead_code)]
pub struct StubLauncher {
    pub script: StubPageScript,
}

#[async_trait]
impl BrowserLauncher for StubLauncher {
    async fn launch(&self, _profile: &BrowserProfile) -> Result<Box<dyn BrowserSession>> {
        Ok(Box::new(StubSession::new(self.script.clone())))
    }
}
