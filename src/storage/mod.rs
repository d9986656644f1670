//! Durable storage: one SQLite pool backs the outcome store and the job
//! queue.
//!
//! The database handle is an explicit [`SqlitePool`] threaded through
//! constructors; there is no process-wide singleton. Migrations are
//! idempotent DDL run at startup, and a `schema_meta` row pins the schema
//! version so an incompatible database fails fast instead of being
//! silently reinterpreted.
//!
//! All database operations use SQLite with WAL mode enabled for concurrent
//! access.

pub mod outcomes;

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::models::{BrowserProfile, HeadlessKind, WaitStrategy};

pub use outcomes::OutcomeStore;

/// Version of the on-disk schema. Bumped on incompatible DDL changes.
pub const STORE_SCHEMA_VERSION: i64 = 1;

const SCHEMA_DDL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS configurations (
        id TEXT PRIMARY KEY,
        name TEXT UNIQUE NOT NULL,
        headless TEXT NOT NULL DEFAULT 'shell',
        viewport_w INTEGER NOT NULL DEFAULT 1920,
        viewport_h INTEGER NOT NULL DEFAULT 1080,
        user_agent TEXT NOT NULL,
        stealth INTEGER NOT NULL DEFAULT 1,
        wait_strategy TEXT NOT NULL DEFAULT 'networkidle',
        timeout_ms INTEGER NOT NULL DEFAULT 30000,
        attempts INTEGER NOT NULL DEFAULT 0,
        successes INTEGER NOT NULL DEFAULT 0,
        last_success INTEGER,
        last_failure INTEGER
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS domains (
        domain TEXT PRIMARY KEY,
        best_profile_id TEXT,
        confidence REAL NOT NULL DEFAULT 0.5,
        min_delay_ms INTEGER NOT NULL DEFAULT 1000,
        max_per_minute INTEGER NOT NULL DEFAULT 10,
        block_indicators TEXT NOT NULL DEFAULT '[]',
        first_seen INTEGER NOT NULL,
        last_updated INTEGER NOT NULL,
        sample_count INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS outcomes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        schema_version INTEGER NOT NULL,
        ts INTEGER NOT NULL,
        domain TEXT NOT NULL,
        url TEXT NOT NULL,
        profile_id TEXT NOT NULL,
        result TEXT NOT NULL,
        block_service TEXT,
        http_status INTEGER,
        response_ms INTEGER NOT NULL DEFAULT 0,
        content_length INTEGER NOT NULL DEFAULT 0,
        page_title TEXT,
        hour INTEGER NOT NULL DEFAULT 0,
        weekday INTEGER NOT NULL DEFAULT 0,
        recent_rate INTEGER NOT NULL DEFAULT 0
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_outcomes_domain ON outcomes(domain)",
    "CREATE INDEX IF NOT EXISTS idx_outcomes_profile ON outcomes(profile_id)",
    r#"
    CREATE TABLE IF NOT EXISTS similarity (
        domain_a TEXT NOT NULL,
        domain_b TEXT NOT NULL,
        score REAL NOT NULL,
        kind TEXT NOT NULL,
        PRIMARY KEY (domain_a, domain_b)
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        queue TEXT NOT NULL DEFAULT 'default',
        job_type TEXT NOT NULL,
        payload TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending',
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL DEFAULT 3,
        last_error TEXT,
        result TEXT,
        created_at INTEGER NOT NULL,
        available_at INTEGER NOT NULL,
        started_at INTEGER,
        completed_at INTEGER,
        locked_by TEXT,
        locked_at INTEGER,
        lease_deadline INTEGER,
        depends_on TEXT
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(status, priority DESC, available_at ASC)",
    r#"
    CREATE TABLE IF NOT EXISTS dead_letter (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL,
        queue TEXT NOT NULL,
        payload TEXT NOT NULL,
        error TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        died_at INTEGER NOT NULL,
        revived_at INTEGER
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_dead_letter_job ON dead_letter(job_id)",
    r#"
    CREATE TABLE IF NOT EXISTS schema_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )"#,
];

/// Initializes and returns a database connection pool with an explicit path.
///
/// Creates the database file if it doesn't exist and enables WAL mode for
/// better concurrent access. The busy timeout keeps short row-level
/// transactions from failing under writer contention.
pub async fn init_db_pool_with_path(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(std::time::Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .acquire_timeout(std::time::Duration::from_secs(5))
        .connect_with(options)
        .await
        .context("Failed to open SQLite database")?;

    Ok(pool)
}

/// Runs idempotent migrations and pins the schema version.
///
/// # Errors
///
/// Fails if the database was written by a different schema version. That is
/// an operator problem (wrong file, wrong build) and is never silently
/// recovered.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for ddl in SCHEMA_DDL {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .context("Failed to apply schema DDL")?;
    }

    let existing: Option<String> =
        sqlx::query_scalar("SELECT value FROM schema_meta WHERE key = 'version'")
            .fetch_optional(pool)
            .await?;

    match existing {
        None => {
            sqlx::query("INSERT INTO schema_meta (key, value) VALUES ('version', ?)")
                .bind(STORE_SCHEMA_VERSION.to_string())
                .execute(pool)
                .await?;
        }
        Some(v) if v == STORE_SCHEMA_VERSION.to_string() => {}
        Some(v) => {
            bail!(
                "Database schema version mismatch: found {}, this build expects {}",
                v,
                STORE_SCHEMA_VERSION
            );
        }
    }

    Ok(())
}

// Curated launch profiles the bandit starts from. User agents cover the
// browsers anti-bot systems most commonly see real traffic from.
const UA_CHROME_MAC: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";
const UA_CHROME_WIN: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";
const UA_FIREFOX_MAC: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:133.0) Gecko/20100101 Firefox/133.0";
const UA_SAFARI_MAC: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.2 Safari/605.1.15";

fn default_profiles() -> Vec<BrowserProfile> {
    let base = |id: &str, name: &str, headless, user_agent: &str, wait_strategy| BrowserProfile {
        id: id.to_string(),
        name: name.to_string(),
        headless,
        viewport_width: 1920,
        viewport_height: 1080,
        user_agent: user_agent.to_string(),
        stealth: true,
        wait_strategy,
        timeout_ms: 30_000,
        attempts: 0,
        successes: 0,
        last_success: None,
        last_failure: None,
    };

    vec![
        base(
            "cfg_shell_chrome_mac",
            "shell-chrome-mac",
            HeadlessKind::Shell,
            UA_CHROME_MAC,
            WaitStrategy::NetworkIdle,
        ),
        base(
            "cfg_shell_chrome_win",
            "shell-chrome-win",
            HeadlessKind::Shell,
            UA_CHROME_WIN,
            WaitStrategy::NetworkIdle,
        ),
        base(
            "cfg_new_firefox_mac",
            "new-firefox-mac",
            HeadlessKind::NewHeadless,
            UA_FIREFOX_MAC,
            WaitStrategy::DomContentLoaded,
        ),
        base(
            "cfg_new_safari_mac",
            "new-safari-mac",
            HeadlessKind::NewHeadless,
            UA_SAFARI_MAC,
            WaitStrategy::Load,
        ),
        base(
            "cfg_visible_chrome_mac",
            "visible-chrome-mac",
            HeadlessKind::Visible,
            UA_CHROME_MAC,
            WaitStrategy::NetworkIdle,
        ),
    ]
}

/// Inserts the default profile catalog when the `configurations` table is
/// empty, so a fresh database can serve arms immediately.
pub async fn seed_default_profiles(pool: &SqlitePool) -> Result<()> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM configurations")
        .fetch_one(pool)
        .await?;
    if count > 0 {
        return Ok(());
    }

    let profiles = default_profiles();
    for profile in &profiles {
        sqlx::query(
            "INSERT INTO configurations (
                id, name, headless, viewport_w, viewport_h, user_agent,
                stealth, wait_strategy, timeout_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&profile.id)
        .bind(&profile.name)
        .bind(profile.headless.to_string())
        .bind(profile.viewport_width as i64)
        .bind(profile.viewport_height as i64)
        .bind(&profile.user_agent)
        .bind(profile.stealth)
        .bind(profile.wait_strategy.to_string())
        .bind(profile.timeout_ms as i64)
        .execute(pool)
        .await
        .context("Failed to seed default profile")?;
    }

    log::info!("Seeded {} default browser profiles", profiles.len());
    Ok(())
}

/// Epoch milliseconds for storage columns.
pub(crate) fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Converts a storage timestamp back; out-of-range values clamp to epoch.
pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap())
}

pub(crate) fn from_ms_opt(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_ms)
}
