//! One-shot page capture: session → navigate → validate → behaviors →
//! artifact emission.
//!
//! Artifact paths derive from a stable fingerprint of the URL, so
//! re-capturing a page overwrites the same files. Every artifact is written
//! to a temp path and renamed into place; readers see either the old file
//! or the new one, never a torn write.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use scraper::{Html, Selector};
use sha2::{Digest, Sha256};
use url::Url;

use crate::behaviors::{BehaviorOptions, BehaviorRunner};
use crate::browser::{BrowserSession, CookieSpec, NavigationTimeout, PageDriver, PageResponse};
use crate::config::{EngineConfig, BODY_TEXT_CAP};
use crate::models::{ArtifactKind, BrowserProfile, CaptureResult, OutcomeKind, SCHEMA_VERSION};
use crate::validator::{PageSnapshot, ResponseValidator, Verdict};

static TITLE_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("title").expect("static selector"));

/// What to capture and how.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub url: String,
    pub artifacts: Vec<ArtifactKind>,
    pub behaviors_enabled: bool,
    /// Injected before navigation; policy belongs to the caller.
    pub cookies: Vec<CookieSpec>,
}

impl CaptureRequest {
    pub fn new(url: &str) -> Self {
        CaptureRequest {
            url: url.to_string(),
            artifacts: vec![ArtifactKind::Screenshot, ArtifactKind::Html],
            behaviors_enabled: true,
            cookies: Vec::new(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<ArtifactKind>) -> Self {
        self.artifacts = artifacts;
        self
    }
}

/// Orchestrates one capture against an already-launched browser session.
pub struct CapturePipeline {
    validator: ResponseValidator,
    behavior_options: BehaviorOptions,
    archive_dir: PathBuf,
    navigation_timeout_ms: u64,
    overall_timeout_ms: u64,
}

impl CapturePipeline {
    pub fn new(config: &EngineConfig) -> Self {
        let behavior_options = BehaviorOptions {
            max_behavior_ms: config.behavior_timeout_ms,
            ..BehaviorOptions::default()
        };

        CapturePipeline {
            validator: ResponseValidator::new(
                crate::validator::default_patterns(),
                config.min_content_length,
            ),
            behavior_options,
            archive_dir: config.archive_dir.clone(),
            navigation_timeout_ms: config.navigation_timeout_ms,
            overall_timeout_ms: config.overall_timeout_ms,
        }
    }

    /// Replaces the block-signature table (operators ship their own).
    pub fn with_validator(mut self, validator: ResponseValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Directory this URL's artifacts land in: `<archive>/<host>/<fp>`,
    /// where `fp` is a stable fingerprint of the full URL.
    pub fn artifact_dir(&self, url: &str) -> PathBuf {
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.replace(':', "_")))
            .unwrap_or_else(|| "unknown".to_string());
        self.archive_dir.join(host).join(url_fingerprint(url))
    }

    /// Runs the full capture. Always returns a structured result; the
    /// overall deadline cancels whatever phase is in flight.
    pub async fn capture(
        &self,
        session: &dyn BrowserSession,
        profile: &BrowserProfile,
        request: &CaptureRequest,
    ) -> CaptureResult {
        let start = Instant::now();
        let mut result = CaptureResult {
            schema_version: SCHEMA_VERSION,
            success: false,
            url: request.url.clone(),
            outcome: OutcomeKind::Error,
            block_service: None,
            artifacts: BTreeMap::new(),
            page_title: None,
            page_description: None,
            http_status: None,
            content_length: 0,
            duration_ms: 0,
            behavior_stats: None,
            error: None,
        };

        let mut page = match session.new_page().await {
            Ok(page) => page,
            Err(e) => {
                result.error = Some(format!("Failed to open page: {e:#}"));
                result.duration_ms = start.elapsed().as_millis() as u64;
                return result;
            }
        };

        let deadline = Duration::from_millis(self.overall_timeout_ms);
        let phases = self.run_phases(page.as_mut(), profile, request, &mut result);
        if tokio::time::timeout(deadline, phases).await.is_err() {
            result.outcome = OutcomeKind::Timeout;
            result.success = false;
            result.error = Some(format!(
                "Overall capture deadline of {} ms exceeded",
                self.overall_timeout_ms
            ));
        }

        // Page scope closes before the caller releases the session.
        if let Err(e) = page.close().await {
            log::debug!("Page close reported: {e:#}");
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        result
    }

    async fn run_phases(
        &self,
        page: &mut dyn PageDriver,
        profile: &BrowserProfile,
        request: &CaptureRequest,
        result: &mut CaptureResult,
    ) {
        if !request.cookies.is_empty() {
            if let Err(e) = page.set_cookies(&request.cookies).await {
                log::warn!("Cookie injection failed for {}: {e:#}", request.url);
            }
        }

        // The profile's timeout governs navigation; the engine default
        // covers profiles that do not set one.
        let nav_timeout = if profile.timeout_ms > 0 {
            profile.timeout_ms
        } else {
            self.navigation_timeout_ms
        };
        let response = match page
            .navigate(&request.url, profile.wait_strategy, nav_timeout)
            .await
        {
            Ok(response) => response,
            Err(e) if e.downcast_ref::<NavigationTimeout>().is_some() => {
                result.outcome = OutcomeKind::Timeout;
                result.error = Some(e.to_string());
                return;
            }
            Err(e) => {
                result.outcome = OutcomeKind::Error;
                result.error = Some(format!("{e:#}"));
                return;
            }
        };

        let Some(response) = response else {
            result.outcome = OutcomeKind::Error;
            result.error = Some("Navigation returned no response object".to_string());
            return;
        };
        result.http_status = Some(response.status);

        let html = match page.html().await {
            Ok(html) => html,
            Err(e) => {
                result.outcome = OutcomeKind::Error;
                result.error = Some(format!("{e:#}"));
                return;
            }
        };
        result.content_length = html.len() as u64;

        let title = match page.title().await {
            Ok(Some(title)) if !title.is_empty() => Some(title),
            _ => extract_title(&html),
        };
        result.page_title = title.clone();
        result.page_description = self.meta_description(page).await;

        let snapshot = self
            .snapshot(page, &response, title.unwrap_or_default())
            .await;
        let verdict = self.validator.classify(&snapshot);
        result.outcome = verdict.outcome_kind();
        result.block_service = verdict.block_service().map(str::to_string);

        if !verdict.is_ok() {
            result.error = Some(match &verdict {
                Verdict::Empty => "Page content below minimum length".to_string(),
                v => format!(
                    "Blocked by {}",
                    v.block_service().unwrap_or("unknown service")
                ),
            });
            return;
        }

        let html = if request.behaviors_enabled {
            let runner = BehaviorRunner::new(self.behavior_options.clone());
            let stats = runner.run_all(page).await;
            log::debug!(
                "Behaviors for {}: {} overlays, {} scroll passes, {} expanded in {} ms",
                request.url,
                stats.overlays_dismissed,
                stats.scroll_passes,
                stats.elements_expanded,
                stats.duration_ms
            );
            result.behavior_stats = Some(stats);
            // Re-read: behaviors exist to grow the DOM.
            match page.html().await {
                Ok(expanded) => {
                    result.content_length = expanded.len() as u64;
                    expanded
                }
                Err(_) => html,
            }
        } else {
            html
        };

        let mut failures = Vec::new();
        let dir = self.artifact_dir(&request.url);
        for kind in &request.artifacts {
            match self
                .emit_artifact(page, *kind, &dir, &request.url, &html, response.status)
                .await
            {
                Ok(path) => {
                    result.artifacts.insert(*kind, path);
                }
                Err(e) => {
                    log::warn!("Artifact {kind} failed for {}: {e:#}", request.url);
                    failures.push(format!("{kind}: {e:#}"));
                }
            }
        }

        if failures.is_empty() {
            result.success = true;
        } else {
            result.error = Some(format!("Partial artifact set: {}", failures.join("; ")));
        }
    }

    async fn snapshot(
        &self,
        page: &dyn PageDriver,
        response: &PageResponse,
        title: String,
    ) -> PageSnapshot {
        let mut body_text = page
            .eval("document.body ? document.body.innerText : ''")
            .await
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
            .to_lowercase();
        body_text.truncate(BODY_TEXT_CAP);

        let cookies = page.cookie_names().await.unwrap_or_default();

        PageSnapshot {
            http_status: Some(response.status),
            final_url: response.final_url.clone(),
            title,
            body_text,
            headers: response.headers.clone(),
            cookies,
        }
    }

    async fn meta_description(&self, page: &dyn PageDriver) -> Option<String> {
        let value = page
            .eval(
                "(() => { const m = document.querySelector('meta[name=\"description\"]'); \
                 return m ? m.getAttribute('content') : null; })()",
            )
            .await
            .ok()?;
        value.as_str().map(str::to_string)
    }

    async fn emit_artifact(
        &self,
        page: &dyn PageDriver,
        kind: ArtifactKind,
        dir: &Path,
        url: &str,
        html: &str,
        status: u16,
    ) -> Result<PathBuf> {
        let bytes = match kind {
            ArtifactKind::Screenshot => page.screenshot_png().await?,
            ArtifactKind::Pdf => page.pdf().await?,
            ArtifactKind::Html => html.as_bytes().to_vec(),
            ArtifactKind::Warc => build_warc(url, html, status),
        };
        write_atomic(dir, kind.file_name(), &bytes).await
    }
}

/// Stable hex fingerprint of a URL, used to address artifact directories.
pub fn url_fingerprint(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    hex_string(&digest[..8])
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Writes `bytes` to `dir/name` via a temp file and rename in the same
/// directory, so a concurrent reader never sees a partial file.
async fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let tmp = dir.join(format!(".tmp-{name}"));
    let target = dir.join(name);
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, &target)
        .await
        .with_context(|| format!("Failed to move {} into place", target.display()))?;
    Ok(target)
}

/// Builds a minimal WARC/1.1 file: a warcinfo record plus a response record
/// wrapping the rendered DOM snapshot.
fn build_warc(url: &str, html: &str, status: u16) -> Vec<u8> {
    let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let info_body = format!("software: national-treasure/{}\r\nformat: WARC/1.1\r\n", env!("CARGO_PKG_VERSION"));

    let mut out = Vec::new();
    out.extend_from_slice(&warc_record(
        "warcinfo",
        &format!("urn:sha256:{}", url_fingerprint(&format!("{url}#warcinfo"))),
        &timestamp,
        url,
        "application/warc-fields",
        info_body.as_bytes(),
    ));

    let response_body = format!(
        "HTTP/1.1 {status} \r\nContent-Type: text/html; charset=utf-8\r\n\r\n{html}"
    );
    out.extend_from_slice(&warc_record(
        "response",
        &format!("urn:sha256:{}", url_fingerprint(&format!("{url}#response"))),
        &timestamp,
        url,
        "application/http;msgtype=response",
        response_body.as_bytes(),
    ));
    out
}

fn warc_record(
    record_type: &str,
    record_id: &str,
    timestamp: &str,
    target_uri: &str,
    content_type: &str,
    body: &[u8],
) -> Vec<u8> {
    let header = format!(
        "WARC/1.1\r\n\
         WARC-Type: {record_type}\r\n\
         WARC-Record-ID: <{record_id}>\r\n\
         WARC-Date: {timestamp}\r\n\
         WARC-Target-URI: {target_uri}\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {}\r\n\r\n",
        body.len()
    );
    let mut record = header.into_bytes();
    record.extend_from_slice(body);
    record.extend_from_slice(b"\r\n\r\n");
    record
}

fn extract_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    document
        .select(&TITLE_SELECTOR)
        .next()
        .map(|el| el.inner_html().trim().to_string())
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_url_sensitive() {
        let a = url_fingerprint("https://example.com/page");
        let b = url_fingerprint("https://example.com/page");
        let c = url_fingerprint("https://example.com/other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn warc_records_are_framed_with_crlf_blocks() {
        let warc = build_warc("https://example.com/", "<html><body>hi</body></html>", 200);
        let text = String::from_utf8_lossy(&warc);
        assert!(text.starts_with("WARC/1.1\r\n"));
        assert!(text.contains("WARC-Type: warcinfo"));
        assert!(text.contains("WARC-Type: response"));
        assert!(text.contains("WARC-Target-URI: https://example.com/"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn title_extraction_from_html_fallback() {
        assert_eq!(
            extract_title("<html><head><title> Hello </title></head></html>"),
            Some("Hello".to_string())
        );
        assert_eq!(extract_title("<html><head></head></html>"), None);
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_atomic(dir.path(), "page.html", b"<html></html>")
            .await
            .unwrap();
        assert!(path.exists());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
