//! Append-only record of per-domain, per-profile attempts.
//!
//! `record` is the single write path: it appends the outcome row, bumps the
//! profile's aggregate counters, and refreshes the domain record in one
//! transaction, so a reader never observes a partial attempt. A failed write
//! surfaces to the caller and the attempt counts as unrecorded; callers must
//! not re-record unless the underlying work is redone.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use super::{from_ms, from_ms_opt, to_ms};
use crate::models::{
    BrowserProfile, DomainRecord, HeadlessKind, Outcome, OutcomeKind, SimilarityEdge, WaitStrategy,
};

/// Raw success/failure tallies for one arm of a domain's bandit.
#[derive(Debug, Clone)]
pub struct ArmCounts {
    pub profile_id: String,
    pub successes: u64,
    pub failures: u64,
    pub last_success: Option<DateTime<Utc>>,
}

/// One historical attempt, reduced to what decay weighting needs.
#[derive(Debug, Clone)]
pub struct ArmSample {
    pub profile_id: String,
    pub ok: bool,
    pub ts: DateTime<Utc>,
}

/// Durable store of attempts and aggregates, keyed by domain and profile.
#[derive(Clone)]
pub struct OutcomeStore {
    pool: SqlitePool,
}

impl OutcomeStore {
    pub fn new(pool: SqlitePool) -> Self {
        OutcomeStore { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Appends an outcome and updates profile and domain aggregates in a
    /// single transaction.
    pub async fn record(&self, outcome: &Outcome) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin outcome tx")?;

        sqlx::query(
            "INSERT INTO outcomes (
                schema_version, ts, domain, url, profile_id, result,
                block_service, http_status, response_ms, content_length,
                page_title, hour, weekday, recent_rate
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(outcome.schema_version as i64)
        .bind(to_ms(outcome.ts))
        .bind(&outcome.domain)
        .bind(&outcome.url)
        .bind(&outcome.profile_id)
        .bind(outcome.result.to_string())
        .bind(&outcome.block_service)
        .bind(outcome.http_status.map(|s| s as i64))
        .bind(outcome.response_ms as i64)
        .bind(outcome.content_length as i64)
        .bind(&outcome.page_title)
        .bind(outcome.hour as i64)
        .bind(outcome.weekday as i64)
        .bind(outcome.recent_rate as i64)
        .execute(&mut *tx)
        .await
        .context("Failed to append outcome")?;

        if outcome.result.is_success() {
            sqlx::query(
                "UPDATE configurations
                 SET attempts = attempts + 1, successes = successes + 1, last_success = ?
                 WHERE id = ?",
            )
            .bind(to_ms(outcome.ts))
            .bind(&outcome.profile_id)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE configurations
                 SET attempts = attempts + 1, last_failure = ?
                 WHERE id = ?",
            )
            .bind(to_ms(outcome.ts))
            .bind(&outcome.profile_id)
            .execute(&mut *tx)
            .await?;
        }

        let now_ms = to_ms(outcome.ts);
        sqlx::query(
            "INSERT INTO domains (domain, first_seen, last_updated, sample_count)
             VALUES (?, ?, ?, 1)
             ON CONFLICT(domain) DO UPDATE SET
                 sample_count = sample_count + 1,
                 last_updated = excluded.last_updated",
        )
        .bind(&outcome.domain)
        .bind(now_ms)
        .bind(now_ms)
        .execute(&mut *tx)
        .await?;

        // Remember a block service the first time it shows up for the domain.
        if let Some(service) = &outcome.block_service {
            let indicators: String =
                sqlx::query_scalar("SELECT block_indicators FROM domains WHERE domain = ?")
                    .bind(&outcome.domain)
                    .fetch_one(&mut *tx)
                    .await?;
            let mut list: Vec<String> = serde_json::from_str(&indicators).unwrap_or_default();
            if !list.iter().any(|s| s == service) {
                list.push(service.clone());
                sqlx::query("UPDATE domains SET block_indicators = ? WHERE domain = ?")
                    .bind(serde_json::to_string(&list)?)
                    .bind(&outcome.domain)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await.context("Failed to commit outcome")?;
        Ok(())
    }

    /// Raw per-arm tallies for a domain.
    pub async fn arm_stats(&self, domain: &str) -> Result<Vec<ArmCounts>> {
        let rows = sqlx::query(
            "SELECT profile_id,
                    SUM(CASE WHEN result = 'ok' THEN 1 ELSE 0 END) AS successes,
                    SUM(CASE WHEN result = 'ok' THEN 0 ELSE 1 END) AS failures,
                    MAX(CASE WHEN result = 'ok' THEN ts ELSE NULL END) AS last_success
             FROM outcomes
             WHERE domain = ?
             GROUP BY profile_id",
        )
        .bind(domain)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ArmCounts {
                profile_id: row.get("profile_id"),
                successes: row.get::<i64, _>("successes") as u64,
                failures: row.get::<i64, _>("failures") as u64,
                last_success: from_ms_opt(row.get::<Option<i64>, _>("last_success")),
            })
            .collect())
    }

    /// Per-attempt samples for decay weighting, most recent first, capped.
    pub async fn arm_samples(&self, domain: &str, limit: u32) -> Result<Vec<ArmSample>> {
        let rows = sqlx::query(
            "SELECT profile_id, result, ts FROM outcomes
             WHERE domain = ?
             ORDER BY ts DESC, id DESC
             LIMIT ?",
        )
        .bind(domain)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ArmSample {
                profile_id: row.get("profile_id"),
                ok: row.get::<String, _>("result") == "ok",
                ts: from_ms(row.get("ts")),
            })
            .collect())
    }

    /// The most recent `n` outcomes for a domain, newest first.
    pub async fn recent(&self, domain: &str, n: u32) -> Result<Vec<Outcome>> {
        let rows = sqlx::query(
            "SELECT * FROM outcomes
             WHERE domain = ?
             ORDER BY ts DESC, id DESC
             LIMIT ?",
        )
        .bind(domain)
        .bind(n as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_outcome).collect()
    }

    /// Success rate over everything older than the `recent_window` most
    /// recent outcomes. `None` when no older outcomes exist.
    pub async fn historical_success_rate(
        &self,
        domain: &str,
        recent_window: u32,
    ) -> Result<Option<f64>> {
        let rate: Option<f64> = sqlx::query_scalar(
            "SELECT AVG(CASE WHEN result = 'ok' THEN 1.0 ELSE 0.0 END)
             FROM outcomes
             WHERE domain = ?1 AND id NOT IN (
                 SELECT id FROM outcomes WHERE domain = ?1
                 ORDER BY ts DESC, id DESC LIMIT ?2
             )",
        )
        .bind(domain)
        .bind(recent_window as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(rate)
    }

    /// Block services observed outside the `recent_window` most recent rows.
    pub async fn historical_block_services(
        &self,
        domain: &str,
        recent_window: u32,
    ) -> Result<Vec<String>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT block_service
             FROM outcomes
             WHERE domain = ?1 AND block_service IS NOT NULL AND id NOT IN (
                 SELECT id FROM outcomes WHERE domain = ?1
                 ORDER BY ts DESC, id DESC LIMIT ?2
             )",
        )
        .bind(domain)
        .bind(recent_window as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn profile(&self, id: &str) -> Result<Option<BrowserProfile>> {
        let row = sqlx::query("SELECT * FROM configurations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_profile).transpose()
    }

    pub async fn profiles(&self) -> Result<Vec<BrowserProfile>> {
        let rows = sqlx::query("SELECT * FROM configurations ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_profile).collect()
    }

    /// The profile with the best overall success rate; ties go to the most
    /// exercised one. Used as the cold-start fallback.
    pub async fn global_best_profile(&self) -> Result<Option<BrowserProfile>> {
        let row = sqlx::query(
            "SELECT * FROM configurations
             ORDER BY CAST(successes AS REAL) / MAX(attempts, 1) DESC, attempts DESC
             LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_profile).transpose()
    }

    pub async fn insert_profile(&self, profile: &BrowserProfile) -> Result<()> {
        sqlx::query(
            "INSERT INTO configurations (
                id, name, headless, viewport_w, viewport_h, user_agent,
                stealth, wait_strategy, timeout_ms, attempts, successes,
                last_success, last_failure
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
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
        .bind(profile.attempts as i64)
        .bind(profile.successes as i64)
        .bind(profile.last_success.map(to_ms))
        .bind(profile.last_failure.map(to_ms))
        .execute(&self.pool)
        .await
        .context("Failed to insert profile")?;
        Ok(())
    }

    pub async fn domain_record(&self, domain: &str) -> Result<Option<DomainRecord>> {
        let row = sqlx::query("SELECT * FROM domains WHERE domain = ?")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_domain).transpose()
    }

    /// Points the domain at a new best profile with the given confidence.
    pub async fn update_best_profile(
        &self,
        domain: &str,
        profile_id: &str,
        confidence: f64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE domains
             SET best_profile_id = ?, confidence = ?, last_updated = ?
             WHERE domain = ?",
        )
        .bind(profile_id)
        .bind(confidence)
        .bind(to_ms(Utc::now()))
        .bind(domain)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Neighbors by similarity score, best first, capped at `k`.
    pub async fn similar_domains(&self, domain: &str, k: u32) -> Result<Vec<(String, f64)>> {
        let rows = sqlx::query(
            "SELECT domain_b, score FROM similarity
             WHERE domain_a = ?
             ORDER BY score DESC
             LIMIT ?",
        )
        .bind(domain)
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("domain_b"), row.get("score")))
            .collect())
    }

    pub async fn add_similarity(&self, edge: &SimilarityEdge) -> Result<()> {
        sqlx::query(
            "INSERT INTO similarity (domain_a, domain_b, score, kind)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(domain_a, domain_b) DO UPDATE SET
                 score = excluded.score, kind = excluded.kind",
        )
        .bind(&edge.domain_a)
        .bind(&edge.domain_b)
        .bind(edge.score)
        .bind(edge.kind.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Timestamp of the domain's most recent attempt.
    pub async fn last_attempt_at(&self, domain: &str) -> Result<Option<DateTime<Utc>>> {
        let ms: Option<i64> = sqlx::query_scalar("SELECT MAX(ts) FROM outcomes WHERE domain = ?")
            .bind(domain)
            .fetch_one(&self.pool)
            .await?;
        Ok(from_ms_opt(ms))
    }

    /// Timestamp of the oldest attempt at or after `since`; bounds how long
    /// a caller must wait for the per-minute window to free up.
    pub async fn oldest_attempt_since(
        &self,
        domain: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let ms: Option<i64> =
            sqlx::query_scalar("SELECT MIN(ts) FROM outcomes WHERE domain = ? AND ts >= ?")
                .bind(domain)
                .bind(to_ms(since))
                .fetch_one(&self.pool)
                .await?;
        Ok(from_ms_opt(ms))
    }

    /// Attempts against the domain at or after `since`.
    pub async fn attempts_since(&self, domain: &str, since: DateTime<Utc>) -> Result<u32> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM outcomes WHERE domain = ? AND ts >= ?")
                .bind(domain)
                .bind(to_ms(since))
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u32)
    }

    /// Global learning summary: (domains seen, total outcomes, overall rate).
    pub async fn global_stats(&self) -> Result<(u64, u64, f64)> {
        let row = sqlx::query(
            "SELECT COUNT(DISTINCT domain) AS domains,
                    COUNT(*) AS total,
                    COALESCE(AVG(CASE WHEN result = 'ok' THEN 1.0 ELSE 0.0 END), 0.0) AS rate
             FROM outcomes",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok((
            row.get::<i64, _>("domains") as u64,
            row.get::<i64, _>("total") as u64,
            row.get::<f64, _>("rate"),
        ))
    }
}

fn row_to_profile(row: sqlx::sqlite::SqliteRow) -> Result<BrowserProfile> {
    let headless: String = row.get("headless");
    let wait: String = row.get("wait_strategy");
    Ok(BrowserProfile {
        id: row.get("id"),
        name: row.get("name"),
        headless: HeadlessKind::from_str(&headless)
            .with_context(|| format!("Unknown headless kind: {headless}"))?,
        viewport_width: row.get::<i64, _>("viewport_w") as u32,
        viewport_height: row.get::<i64, _>("viewport_h") as u32,
        user_agent: row.get("user_agent"),
        stealth: row.get("stealth"),
        wait_strategy: WaitStrategy::from_str(&wait)
            .with_context(|| format!("Unknown wait strategy: {wait}"))?,
        timeout_ms: row.get::<i64, _>("timeout_ms") as u64,
        attempts: row.get::<i64, _>("attempts") as u64,
        successes: row.get::<i64, _>("successes") as u64,
        last_success: from_ms_opt(row.get("last_success")),
        last_failure: from_ms_opt(row.get("last_failure")),
    })
}

fn row_to_domain(row: sqlx::sqlite::SqliteRow) -> Result<DomainRecord> {
    let indicators: String = row.get("block_indicators");
    Ok(DomainRecord {
        domain: row.get("domain"),
        best_profile_id: row.get("best_profile_id"),
        confidence: row.get("confidence"),
        min_delay_ms: row.get::<i64, _>("min_delay_ms") as u64,
        max_per_minute: row.get::<i64, _>("max_per_minute") as u32,
        block_indicators: serde_json::from_str(&indicators).unwrap_or_default(),
        first_seen: from_ms(row.get("first_seen")),
        last_updated: from_ms(row.get("last_updated")),
        sample_count: row.get::<i64, _>("sample_count") as u64,
    })
}

fn row_to_outcome(row: sqlx::sqlite::SqliteRow) -> Result<Outcome> {
    let result: String = row.get("result");
    Ok(Outcome {
        schema_version: row.get::<i64, _>("schema_version") as u32,
        ts: from_ms(row.get("ts")),
        domain: row.get("domain"),
        url: row.get("url"),
        profile_id: row.get("profile_id"),
        result: OutcomeKind::from_str(&result)
            .with_context(|| format!("Unknown outcome kind: {result}"))?,
        block_service: row.get("block_service"),
        http_status: row.get::<Option<i64>, _>("http_status").map(|s| s as u16),
        response_ms: row.get::<i64, _>("response_ms") as u64,
        content_length: row.get::<i64, _>("content_length") as u64,
        page_title: row.get("page_title"),
        hour: row.get::<i64, _>("hour") as u8,
        weekday: row.get::<i64, _>("weekday") as u8,
        recent_rate: row.get::<i64, _>("recent_rate") as u32,
    })
}
