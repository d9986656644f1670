//! Core data model: browser profiles, domain records, attempt outcomes,
//! queue jobs, and capture results.
//!
//! Every record that crosses a persistence or payload boundary carries a
//! `schema_version`; readers reject versions they do not understand rather
//! than silently degrading.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use strum_macros::{Display, EnumIter, EnumString};

/// Version stamped into serialized payloads (job payloads, outcome details,
/// capture results).
pub const SCHEMA_VERSION: u32 = 1;

/// Generates a unique id: epoch-millis hex + process-local counter.
pub fn generate_id(prefix: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let ts = Utc::now().timestamp_millis();
    format!("{prefix}_{ts:x}-{n}")
}

/// How the browser is headless (or not).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, EnumIter)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum HeadlessKind {
    /// Chrome's headless shell (hardest to fingerprint on 129+).
    Shell,
    /// `--headless=new`.
    NewHeadless,
    /// `--headless=old`.
    LegacyHeadless,
    /// Full windowed browser.
    Visible,
}

/// What "the page finished loading" means for navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum WaitStrategy {
    NetworkIdle,
    DomContentLoaded,
    Load,
}

/// Classification of one finished attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutcomeKind {
    Ok,
    Blocked,
    Captcha,
    Timeout,
    RateLimited,
    Empty,
    Error,
}

impl OutcomeKind {
    /// Whether this outcome counts as a success for the bandit.
    pub fn is_success(self) -> bool {
        matches!(self, OutcomeKind::Ok)
    }
}

/// A named bundle of browser tunables. Immutable except for the aggregate
/// counters, which only ever grow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserProfile {
    pub id: String,
    pub name: String,
    pub headless: HeadlessKind,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub user_agent: String,
    pub stealth: bool,
    pub wait_strategy: WaitStrategy,
    pub timeout_ms: u64,

    // Aggregate counters, maintained by the outcome store.
    pub attempts: u64,
    pub successes: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

impl BrowserProfile {
    /// Fraction of attempts that succeeded. Zero attempts yields 0.0.
    pub fn success_rate(&self) -> f64 {
        self.successes as f64 / (self.attempts.max(1)) as f64
    }
}

/// Learned state for one registrable domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainRecord {
    pub domain: String,
    pub best_profile_id: Option<String>,
    /// Posterior mean of the best arm, in [0, 1].
    pub confidence: f64,
    pub min_delay_ms: u64,
    pub max_per_minute: u32,
    pub block_indicators: Vec<String>,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub sample_count: u64,
}

impl DomainRecord {
    pub fn new(domain: &str) -> Self {
        let now = Utc::now();
        DomainRecord {
            domain: domain.to_string(),
            best_profile_id: None,
            confidence: 0.5,
            min_delay_ms: 1000,
            max_per_minute: 10,
            block_indicators: Vec::new(),
            first_seen: now,
            last_updated: now,
            sample_count: 0,
        }
    }
}

/// One appended row per completed attempt. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub schema_version: u32,
    pub ts: DateTime<Utc>,
    pub domain: String,
    pub url: String,
    pub profile_id: String,
    pub result: OutcomeKind,
    /// Which anti-bot service (or `http_<status>`) blocked us, when known.
    pub block_service: Option<String>,
    pub http_status: Option<u16>,
    pub response_ms: u64,
    pub content_length: u64,
    pub page_title: Option<String>,
    /// Local hour of day when the request was made, 0-23.
    pub hour: u8,
    /// Weekday, 0 = Monday.
    pub weekday: u8,
    /// Requests made against this domain in the preceding minute.
    pub recent_rate: u32,
}

/// How two domains are considered similar for cold start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SimilarityKind {
    Tld,
    Technology,
    Behavior,
}

/// A weighted similarity edge between two domains. Advisory only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityEdge {
    pub domain_a: String,
    pub domain_b: String,
    pub score: f64,
    pub kind: SimilarityKind,
}

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
    Dead,
}

/// Closed set of work the queue dispatches.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobType {
    Capture,
    Scrape,
}

/// A durable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub priority: i64,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lease_deadline: Option<DateTime<Utc>>,
    pub depends_on: Option<String>,
}

/// Snapshot of a job whose attempts ran out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterJob {
    pub id: i64,
    pub job_id: String,
    pub queue: String,
    pub payload: serde_json::Value,
    pub error: String,
    pub attempts: u32,
    pub died_at: DateTime<Utc>,
    /// Set when the job was copied back into the queue via revival.
    pub revived_at: Option<DateTime<Utc>>,
}

/// Payload of a `capture` job. Versioned: readers reject unknown versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturePayload {
    pub schema_version: u32,
    pub url: String,
    #[serde(default = "default_artifacts")]
    pub artifacts: Vec<ArtifactKind>,
    #[serde(default = "default_true")]
    pub behaviors_enabled: bool,
}

fn default_artifacts() -> Vec<ArtifactKind> {
    vec![ArtifactKind::Screenshot, ArtifactKind::Html]
}

fn default_true() -> bool {
    true
}

impl CapturePayload {
    pub fn new(url: &str) -> Self {
        CapturePayload {
            schema_version: SCHEMA_VERSION,
            url: url.to_string(),
            artifacts: default_artifacts(),
            behaviors_enabled: true,
        }
    }
}

/// Output formats a capture can emit.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ArtifactKind {
    Screenshot,
    Pdf,
    Html,
    Warc,
}

impl ArtifactKind {
    /// File name inside the capture directory.
    pub fn file_name(self) -> &'static str {
        match self {
            ArtifactKind::Screenshot => "screenshot.png",
            ArtifactKind::Pdf => "document.pdf",
            ArtifactKind::Html => "page.html",
            ArtifactKind::Warc => "capture.warc",
        }
    }
}

/// Structured result of one capture run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureResult {
    pub schema_version: u32,
    pub success: bool,
    pub url: String,
    pub outcome: OutcomeKind,
    pub block_service: Option<String>,
    /// Artifact kind to the final (renamed) path, for the kinds that were
    /// written successfully.
    pub artifacts: BTreeMap<ArtifactKind, PathBuf>,
    pub page_title: Option<String>,
    pub page_description: Option<String>,
    pub http_status: Option<u16>,
    pub content_length: u64,
    pub duration_ms: u64,
    pub behavior_stats: Option<BehaviorStats>,
    pub error: Option<String>,
}

/// Per-behavior effect counts from one behavior-runner pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BehaviorStats {
    pub overlays_dismissed: u64,
    pub scroll_passes: u64,
    pub elements_expanded: u64,
    pub tabs_clicked: u64,
    pub carousel_slides: u64,
    pub comments_loaded: u64,
    pub infinite_scroll_pages: u64,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_handles_zero_attempts() {
        let profile = BrowserProfile {
            id: "p1".into(),
            name: "default".into(),
            headless: HeadlessKind::Shell,
            viewport_width: 1920,
            viewport_height: 1080,
            user_agent: "ua".into(),
            stealth: true,
            wait_strategy: WaitStrategy::NetworkIdle,
            timeout_ms: 30_000,
            attempts: 0,
            successes: 0,
            last_success: None,
            last_failure: None,
        };
        assert_eq!(profile.success_rate(), 0.0);
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = generate_id("job");
        let b = generate_id("job");
        assert_ne!(a, b);
        assert!(a.starts_with("job_"));
    }

    #[test]
    fn outcome_kind_round_trips_through_strings() {
        use std::str::FromStr;
        for kind in [
            OutcomeKind::Ok,
            OutcomeKind::Blocked,
            OutcomeKind::Captcha,
            OutcomeKind::Timeout,
            OutcomeKind::RateLimited,
            OutcomeKind::Empty,
            OutcomeKind::Error,
        ] {
            let s = kind.to_string();
            assert_eq!(OutcomeKind::from_str(&s).unwrap(), kind);
        }
        assert_eq!(OutcomeKind::RateLimited.to_string(), "rate_limited");
    }

    #[test]
    fn capture_payload_defaults() {
        let payload: CapturePayload =
            serde_json::from_str(r#"{"schema_version":1,"url":"https://example.com/"}"#).unwrap();
        assert_eq!(payload.schema_version, SCHEMA_VERSION);
        assert!(payload.behaviors_enabled);
        assert_eq!(
            payload.artifacts,
            vec![ArtifactKind::Screenshot, ArtifactKind::Html]
        );
    }
}
