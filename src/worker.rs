//! Bounded worker pool that drains the job queue.
//!
//! Each worker owns at most one in-flight job, heartbeats its lease while
//! the handler runs, and reports the terminal state back to the queue.
//! Shutdown is cooperative: on cancellation workers stop claiming, finish
//! their current job, commit, and exit; anything uncommitted is recovered
//! by lease expiry after restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use log::{debug, info, warn};
use publicsuffix::List;
use tokio_util::sync::CancellationToken;

use crate::browser::BrowserLauncher;
use crate::capture::{CapturePipeline, CaptureRequest};
use crate::config::{EngineConfig, HEARTBEAT_INTERVAL, WORKER_IDLE_POLL};
use crate::domain::registrable_domain;
use crate::learner::{DomainLearner, OutcomeDetails};
use crate::models::{CapturePayload, Job, JobType, SCHEMA_VERSION};
use crate::queue::JobQueue;

/// Terminal states a handler can report.
pub enum HandlerResult {
    /// Work finished; the value is stored as the job result.
    Success(serde_json::Value),
    /// Transient failure; the queue schedules a retry with backoff.
    Retry(String),
    /// Input-validation failure no retry can fix; dead-letter immediately.
    Fatal(String),
}

/// Processes one claimed job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &Job) -> HandlerResult;
}

/// Built-in handler for `capture` jobs: rate discipline → profile
/// selection → scoped browser session → pipeline → outcome ingestion.
pub struct CaptureHandler {
    learner: Arc<DomainLearner>,
    pipeline: Arc<CapturePipeline>,
    launcher: Arc<dyn BrowserLauncher>,
    suffixes: Arc<List>,
}

impl CaptureHandler {
    pub fn new(
        learner: Arc<DomainLearner>,
        pipeline: Arc<CapturePipeline>,
        launcher: Arc<dyn BrowserLauncher>,
    ) -> Self {
        CaptureHandler {
            learner,
            pipeline,
            launcher,
            suffixes: Arc::new(List::new()),
        }
    }
}

#[async_trait]
impl JobHandler for CaptureHandler {
    async fn run(&self, job: &Job) -> HandlerResult {
        let payload: CapturePayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => return HandlerResult::Fatal(format!("Malformed capture payload: {e}")),
        };
        if payload.schema_version != SCHEMA_VERSION {
            return HandlerResult::Fatal(format!(
                "Unsupported payload schema_version {} (expected {})",
                payload.schema_version, SCHEMA_VERSION
            ));
        }
        let domain = match registrable_domain(&self.suffixes, &payload.url) {
            Ok(domain) => domain,
            Err(e) => return HandlerResult::Fatal(format!("Malformed URL: {e}")),
        };

        // Rate discipline comes before asking for a configuration.
        match self.learner.should_wait(&domain).await {
            Ok(wait) if !wait.is_zero() => {
                debug!("Honoring rate discipline for {domain}: waiting {wait:?}");
                tokio::time::sleep(wait).await;
            }
            Ok(_) => {}
            Err(e) => warn!("Rate discipline lookup failed for {domain}: {e:#}"),
        }

        let profile = match self.learner.select(&domain).await {
            Ok(profile) => profile,
            Err(e) => return HandlerResult::Retry(format!("Profile selection failed: {e:#}")),
        };
        debug!("Selected profile {} for {domain}", profile.name);

        let mut session = match self.launcher.launch(&profile).await {
            Ok(session) => session,
            Err(e) => return HandlerResult::Retry(format!("Browser launch failed: {e:#}")),
        };

        let mut request = CaptureRequest::new(&payload.url)
            .with_artifacts(payload.artifacts.clone());
        request.behaviors_enabled = payload.behaviors_enabled;

        let result = self
            .pipeline
            .capture(session.as_ref(), &profile, &request)
            .await;

        // Session release happens on every path, after the page scope.
        if let Err(e) = session.close().await {
            warn!("Browser session close failed: {e:#}");
        }

        let details = OutcomeDetails {
            url: payload.url.clone(),
            block_service: result.block_service.clone(),
            http_status: result.http_status,
            response_ms: result.duration_ms,
            content_length: result.content_length,
            page_title: result.page_title.clone(),
        };
        if let Err(e) = self
            .learner
            .record(&domain, &profile, result.outcome, details)
            .await
        {
            // The attempt is unrecorded; the retry will redo the work, which
            // keeps the append-once-per-attempt contract.
            warn!("Failed to record outcome for {domain}: {e:#}");
        }

        if let Ok(signals) = self.learner.check_drift(&domain).await {
            for signal in signals {
                info!("Drift signal for {domain}: {signal:?}");
            }
        }

        if result.success {
            match serde_json::to_value(&result) {
                Ok(value) => HandlerResult::Success(value),
                Err(e) => HandlerResult::Retry(format!("Result serialization failed: {e}")),
            }
        } else {
            HandlerResult::Retry(
                result
                    .error
                    .unwrap_or_else(|| format!("Capture outcome: {}", result.outcome)),
            )
        }
    }
}

/// Runs `pool_size` workers against one queue until cancelled.
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
    lease: Duration,
    pool_size: usize,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(queue: Arc<JobQueue>, config: &EngineConfig) -> Self {
        WorkerPool {
            queue,
            handlers: HashMap::new(),
            lease: config.default_lease,
            pool_size: config.worker_pool_size,
            cancel: CancellationToken::new(),
        }
    }

    pub fn register_handler(&mut self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type, handler);
    }

    /// Token that triggers graceful drain when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs until the cancellation token fires and every worker has
    /// finished its current job.
    pub async fn run(&self) -> Result<()> {
        // Jobs orphaned by a previous crash become claimable immediately.
        let recovered = self.queue.recover_stale(Utc::now()).await?;
        if !recovered.is_empty() {
            info!("Recovered {} stale jobs at startup", recovered.len());
        }

        let recovery_queue = Arc::clone(&self.queue);
        let recovery_cancel = self.cancel.child_token();
        let recovery = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = recovery_queue.recover_stale(Utc::now()).await {
                            warn!("Stale-job recovery failed: {e}");
                        }
                    }
                    _ = recovery_cancel.cancelled() => break,
                }
            }
        });

        let mut workers = FuturesUnordered::new();
        for i in 0..self.pool_size {
            workers.push(self.worker_loop(i));
        }
        while workers.next().await.is_some() {}

        recovery.abort();
        info!("Worker pool drained");
        Ok(())
    }

    async fn worker_loop(&self, index: usize) {
        let worker_id = format!("worker-{}-{index}", std::process::id());
        info!("{worker_id} started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let job = match self.queue.claim(&worker_id, self.lease).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(WORKER_IDLE_POLL) => continue,
                        _ = self.cancel.cancelled() => break,
                    }
                }
                Err(e) => {
                    warn!("{worker_id}: claim failed: {e}");
                    tokio::time::sleep(WORKER_IDLE_POLL).await;
                    continue;
                }
            };

            self.process(&worker_id, job).await;
        }

        info!("{worker_id} stopped");
    }

    async fn process(&self, worker_id: &str, job: Job) {
        debug!(
            "{worker_id}: processing {} job {} (attempt {})",
            job.job_type,
            job.id,
            job.attempts + 1
        );

        // Keep the lease alive while the handler runs.
        let hb_queue = Arc::clone(&self.queue);
        let hb_job = job.id.clone();
        let hb_worker = worker_id.to_string();
        let hb_lease = self.lease;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await; // immediate tick is a no-op
            loop {
                ticker.tick().await;
                if let Err(e) = hb_queue.heartbeat(&hb_job, &hb_worker, hb_lease).await {
                    warn!("Heartbeat for {hb_job} failed: {e}");
                    break;
                }
            }
        });

        let outcome = match self.handlers.get(&job.job_type) {
            Some(handler) => handler.run(&job).await,
            None => HandlerResult::Fatal(format!("No handler registered for {}", job.job_type)),
        };

        heartbeat.abort();

        let report = match outcome {
            HandlerResult::Success(result) => self.queue.succeed(&job.id, worker_id, result).await,
            HandlerResult::Retry(error) => {
                self.queue.fail(&job.id, worker_id, &error).await.map(|_| ())
            }
            HandlerResult::Fatal(error) => {
                self.queue.fail_permanent(&job.id, worker_id, &error).await
            }
        };
        if let Err(e) = report {
            // Ownership mismatches mean the lease expired under us; the job
            // was or will be re-run elsewhere.
            warn!("{worker_id}: failed to report job {}: {e}", job.id);
        }
    }
}
