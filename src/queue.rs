//! Durable job queue: priority dispatch with dependencies, lease-based
//! ownership, exponential-backoff retry, and a dead-letter sink.
//!
//! All state lives in the shared SQLite store. `claim` is a single
//! `UPDATE ... RETURNING` statement, so two workers can never take the same
//! job; every other mutating operation verifies `locked_by` and fails with
//! [`QueueError::OwnershipMismatch`] when a worker touches a job it no
//! longer owns.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use strum::IntoEnumIterator;
use thiserror::Error;

use crate::config::EngineConfig;
use crate::models::{generate_id, DeadLetterJob, Job, JobStatus, JobType};
use crate::storage::{from_ms, from_ms_opt, to_ms};

#[derive(Debug, Error)]
pub enum QueueError {
    /// The pending cap was hit; producers must back off.
    #[error("queue is full ({0} jobs pending)")]
    Full(u64),

    #[error("job {0} not found")]
    NotFound(String),

    /// A worker tried to mutate a job it does not own. Invariant
    /// violation: surfaced, never silently recovered.
    #[error("job {job_id} is not owned by worker {worker_id}")]
    OwnershipMismatch { job_id: String, worker_id: String },

    #[error("job {0} cannot be cancelled in its current state")]
    NotCancellable(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Payload(#[from] serde_json::Error),
}

/// Handle to one named queue in the shared store.
#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    queue: String,
    max_attempts: u32,
    max_pending: u64,
    retry_base: Duration,
    retry_cap: Duration,
}

impl JobQueue {
    pub fn new(pool: SqlitePool, config: &EngineConfig) -> Self {
        JobQueue {
            pool,
            queue: crate::config::DEFAULT_QUEUE.to_string(),
            max_attempts: config.max_attempts,
            max_pending: config.max_pending,
            retry_base: config.retry_base,
            retry_cap: config.retry_cap,
        }
    }

    pub fn with_queue_name(mut self, name: &str) -> Self {
        self.queue = name.to_string();
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Delay before retry `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << (attempt.saturating_sub(1)).min(20);
        self.retry_base.saturating_mul(factor).min(self.retry_cap)
    }

    /// Adds a job. Fails fast when the pending cap is reached or the
    /// dependency target does not exist.
    pub async fn enqueue(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        priority: i64,
        depends_on: Option<&str>,
    ) -> Result<String, QueueError> {
        let pending = self.pending_depth().await?;
        if pending >= self.max_pending {
            return Err(QueueError::Full(pending));
        }

        if let Some(parent) = depends_on {
            let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE id = ?")
                .bind(parent)
                .fetch_one(&self.pool)
                .await?;
            if exists == 0 {
                return Err(QueueError::NotFound(parent.to_string()));
            }
        }

        let id = generate_id("job");
        let now = to_ms(Utc::now());
        sqlx::query(
            "INSERT INTO jobs (
                id, queue, job_type, payload, priority, status, attempts,
                max_attempts, created_at, available_at, depends_on
            ) VALUES (?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&self.queue)
        .bind(job_type.to_string())
        .bind(payload.to_string())
        .bind(priority)
        .bind(self.max_attempts as i64)
        .bind(now)
        .bind(now)
        .bind(depends_on)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Adds several jobs in one transaction.
    pub async fn enqueue_batch(
        &self,
        jobs: Vec<(JobType, serde_json::Value)>,
        priority: i64,
    ) -> Result<Vec<String>, QueueError> {
        let pending = self.pending_depth().await?;
        if pending + jobs.len() as u64 > self.max_pending {
            return Err(QueueError::Full(pending));
        }

        let now = to_ms(Utc::now());
        let mut ids = Vec::with_capacity(jobs.len());
        let mut tx = self.pool.begin().await?;
        for (job_type, payload) in jobs {
            let id = generate_id("job");
            sqlx::query(
                "INSERT INTO jobs (
                    id, queue, job_type, payload, priority, status, attempts,
                    max_attempts, created_at, available_at
                ) VALUES (?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?)",
            )
            .bind(&id)
            .bind(&self.queue)
            .bind(job_type.to_string())
            .bind(payload.to_string())
            .bind(priority)
            .bind(self.max_attempts as i64)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            ids.push(id);
        }
        tx.commit().await?;
        Ok(ids)
    }

    /// Atomically claims the best eligible job for `worker_id`, or returns
    /// `None` when nothing is ready. Eligible means pending, available, and
    /// with any dependency already done; best means highest priority, then
    /// oldest.
    pub async fn claim(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Job>, QueueError> {
        let now = Utc::now();
        let row = sqlx::query(
            "UPDATE jobs SET
                status = 'running',
                locked_by = ?1,
                locked_at = ?2,
                lease_deadline = ?3,
                started_at = COALESCE(started_at, ?2)
             WHERE id = (
                 SELECT j.id FROM jobs j
                 WHERE j.queue = ?4
                   AND j.status = 'pending'
                   AND j.available_at <= ?2
                   AND (j.depends_on IS NULL OR EXISTS (
                       SELECT 1 FROM jobs dep
                       WHERE dep.id = j.depends_on AND dep.status = 'done'))
                 ORDER BY j.priority DESC, j.created_at ASC
                 LIMIT 1
             )
             RETURNING *",
        )
        .bind(worker_id)
        .bind(to_ms(now))
        .bind(to_ms(now) + lease.as_millis() as i64)
        .bind(&self.queue)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_job).transpose()
    }

    /// Extends the lease. Succeeds only while the worker still owns the
    /// job.
    pub async fn heartbeat(
        &self,
        job_id: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<(), QueueError> {
        let now = Utc::now();
        let updated = sqlx::query(
            "UPDATE jobs SET lease_deadline = ?
             WHERE id = ? AND locked_by = ? AND status = 'running'",
        )
        .bind(to_ms(now) + lease.as_millis() as i64)
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(QueueError::OwnershipMismatch {
                job_id: job_id.to_string(),
                worker_id: worker_id.to_string(),
            });
        }
        Ok(())
    }

    /// Transitions the job to `done` and stores its result.
    pub async fn succeed(
        &self,
        job_id: &str,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<(), QueueError> {
        let updated = sqlx::query(
            "UPDATE jobs SET
                status = 'done', result = ?, completed_at = ?,
                locked_by = NULL, locked_at = NULL, lease_deadline = NULL
             WHERE id = ? AND locked_by = ? AND status = 'running'",
        )
        .bind(result.to_string())
        .bind(to_ms(Utc::now()))
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(QueueError::OwnershipMismatch {
                job_id: job_id.to_string(),
                worker_id: worker_id.to_string(),
            });
        }
        Ok(())
    }

    /// Records a failure: schedules a retry with exponential backoff while
    /// attempts remain, otherwise snapshots into the dead letter. Returns
    /// the job's resulting status.
    pub async fn fail(
        &self,
        job_id: &str,
        worker_id: &str,
        error: &str,
    ) -> Result<JobStatus, QueueError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT * FROM jobs WHERE id = ? AND locked_by = ? AND status = 'running'",
        )
        .bind(job_id)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(QueueError::OwnershipMismatch {
                job_id: job_id.to_string(),
                worker_id: worker_id.to_string(),
            });
        };
        let job = row_to_job(row)?;

        let attempts = job.attempts + 1;
        let now = Utc::now();
        let status = if attempts < job.max_attempts {
            let available = now
                + chrono::Duration::from_std(self.backoff(attempts)).unwrap_or_default();
            sqlx::query(
                "UPDATE jobs SET
                    status = 'pending', attempts = ?, last_error = ?,
                    available_at = ?, locked_by = NULL, locked_at = NULL,
                    lease_deadline = NULL
                 WHERE id = ?",
            )
            .bind(attempts as i64)
            .bind(error)
            .bind(to_ms(available))
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
            JobStatus::Pending
        } else {
            self.bury(&mut tx, &job, attempts, error, now).await?;
            JobStatus::Dead
        };

        tx.commit().await?;
        Ok(status)
    }

    /// Dead-letters immediately, bypassing retries. For input-validation
    /// failures that no retry can fix; sets `attempts = max_attempts` so
    /// the dead-state invariant holds.
    pub async fn fail_permanent(
        &self,
        job_id: &str,
        worker_id: &str,
        error: &str,
    ) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT * FROM jobs WHERE id = ? AND locked_by = ? AND status = 'running'",
        )
        .bind(job_id)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(QueueError::OwnershipMismatch {
                job_id: job_id.to_string(),
                worker_id: worker_id.to_string(),
            });
        };
        let job = row_to_job(row)?;

        self.bury(&mut tx, &job, job.max_attempts, error, Utc::now())
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn bury(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        job: &Job,
        attempts: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE jobs SET
                status = 'dead', attempts = ?, last_error = ?, completed_at = ?,
                locked_by = NULL, locked_at = NULL, lease_deadline = NULL
             WHERE id = ?",
        )
        .bind(attempts as i64)
        .bind(error)
        .bind(to_ms(now))
        .bind(&job.id)
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            "INSERT INTO dead_letter (job_id, queue, payload, error, attempts, died_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.id)
        .bind(&job.queue)
        .bind(job.payload.to_string())
        .bind(error)
        .bind(attempts as i64)
        .bind(to_ms(now))
        .execute(&mut **tx)
        .await?;

        log::warn!(
            "Job {} dead-lettered after {} attempts: {}",
            job.id,
            attempts,
            error
        );
        Ok(())
    }

    /// Returns expired `running` jobs to `pending` (or the dead letter when
    /// their attempts run out), consuming one attempt each. Run at startup
    /// and periodically.
    pub async fn recover_stale(&self, now: DateTime<Utc>) -> Result<Vec<String>, QueueError> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "SELECT * FROM jobs
             WHERE queue = ? AND status = 'running' AND lease_deadline < ?",
        )
        .bind(&self.queue)
        .bind(to_ms(now))
        .fetch_all(&mut *tx)
        .await?;

        let mut recovered = Vec::new();
        for row in rows {
            let job = row_to_job(row)?;
            let attempts = job.attempts + 1;
            if attempts < job.max_attempts {
                sqlx::query(
                    "UPDATE jobs SET
                        status = 'pending', attempts = ?, available_at = ?,
                        last_error = ?, locked_by = NULL, locked_at = NULL,
                        lease_deadline = NULL
                     WHERE id = ?",
                )
                .bind(attempts as i64)
                .bind(to_ms(now))
                .bind(format!(
                    "lease expired (was held by {})",
                    job.locked_by.as_deref().unwrap_or("unknown")
                ))
                .bind(&job.id)
                .execute(&mut *tx)
                .await?;
                log::info!("Recovered stale job {} (attempt {})", job.id, attempts);
                recovered.push(job.id);
            } else {
                self.bury(&mut tx, &job, attempts, "lease expired with no attempts left", now)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(recovered)
    }

    /// Copies a dead-lettered job back into the queue as fresh `pending`
    /// work, keeping its original id. Attempts reset to zero; the
    /// dead-letter row is stamped `revived_at` and retained for the trail.
    pub async fn retry_dead_letter(&self, job_id: &str) -> Result<String, QueueError> {
        let mut tx = self.pool.begin().await?;

        let dead: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM dead_letter
             WHERE job_id = ? AND revived_at IS NULL
             ORDER BY died_at DESC LIMIT 1",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(dead_id) = dead else {
            return Err(QueueError::NotFound(job_id.to_string()));
        };

        let now = to_ms(Utc::now());
        let updated = sqlx::query(
            "UPDATE jobs SET
                status = 'pending', attempts = 0, last_error = NULL,
                result = NULL, available_at = ?, started_at = NULL,
                completed_at = NULL, locked_by = NULL, locked_at = NULL,
                lease_deadline = NULL
             WHERE id = ? AND status = 'dead'",
        )
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(QueueError::NotFound(job_id.to_string()));
        }

        sqlx::query("UPDATE dead_letter SET revived_at = ? WHERE id = ?")
            .bind(now)
            .bind(dead_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        log::info!("Revived dead-lettered job {job_id}");
        Ok(job_id.to_string())
    }

    /// Cancels a job that has not started. A cancelled job is buried like
    /// any other terminally-dead job: attempts pinned to the cap and a
    /// dead-letter snapshot recording the cancellation.
    pub async fn cancel(&self, job_id: &str) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM jobs WHERE id = ? AND status = 'pending'")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Err(QueueError::NotCancellable(job_id.to_string()));
        };
        let job = row_to_job(row)?;

        self.bury(&mut tx, &job, job.max_attempts, "cancelled", Utc::now())
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn job(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_job).transpose()
    }

    /// Queue depth per status; statuses with no jobs report zero.
    pub async fn depth_by_status(&self) -> Result<BTreeMap<String, u64>, QueueError> {
        let mut depths: BTreeMap<String, u64> =
            JobStatus::iter().map(|s| (s.to_string(), 0)).collect();
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM jobs WHERE queue = ? GROUP BY status",
        )
        .bind(&self.queue)
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            depths.insert(row.get("status"), row.get::<i64, _>("n") as u64);
        }
        Ok(depths)
    }

    pub async fn dead_letters(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<DeadLetterJob>, QueueError> {
        let rows = sqlx::query(
            "SELECT * FROM dead_letter ORDER BY died_at DESC LIMIT ? OFFSET ?",
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(DeadLetterJob {
                    id: row.get("id"),
                    job_id: row.get("job_id"),
                    queue: row.get("queue"),
                    payload: serde_json::from_str(row.get::<String, _>("payload").as_str())?,
                    error: row.get("error"),
                    attempts: row.get::<i64, _>("attempts") as u32,
                    died_at: from_ms(row.get("died_at")),
                    revived_at: from_ms_opt(row.get("revived_at")),
                })
            })
            .collect()
    }

    async fn pending_depth(&self) -> Result<u64, QueueError> {
        let n: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE queue = ? AND status = 'pending'")
                .bind(&self.queue)
                .fetch_one(&self.pool)
                .await?;
        Ok(n as u64)
    }
}

fn row_to_job(row: sqlx::sqlite::SqliteRow) -> Result<Job, QueueError> {
    let job_type: String = row.get("job_type");
    let status: String = row.get("status");
    let payload: String = row.get("payload");
    let result: Option<String> = row.get("result");

    Ok(Job {
        id: row.get("id"),
        queue: row.get("queue"),
        job_type: JobType::from_str(&job_type)
            .map_err(|_| QueueError::NotFound(format!("unknown job type {job_type}")))?,
        payload: serde_json::from_str(&payload)?,
        priority: row.get("priority"),
        status: JobStatus::from_str(&status)
            .map_err(|_| QueueError::NotFound(format!("unknown status {status}")))?,
        attempts: row.get::<i64, _>("attempts") as u32,
        max_attempts: row.get::<i64, _>("max_attempts") as u32,
        last_error: row.get("last_error"),
        result: result.map(|r| serde_json::from_str(&r)).transpose()?,
        created_at: from_ms(row.get("created_at")),
        available_at: from_ms(row.get("available_at")),
        started_at: from_ms_opt(row.get("started_at")),
        completed_at: from_ms_opt(row.get("completed_at")),
        locked_by: row.get("locked_by"),
        locked_at: from_ms_opt(row.get("locked_at")),
        lease_deadline: from_ms_opt(row.get("lease_deadline")),
        depends_on: row.get("depends_on"),
    })
}
