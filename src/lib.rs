//! national_treasure library: adaptive web capture engine
//!
//! This library captures web pages through a real browser while learning,
//! per registrable domain, which browser configuration gets through. Three
//! subsystems cooperate:
//!
//! - a **domain learner** that runs Thompson sampling over browser profiles
//!   as bandit arms, with time decay, similarity-based cold start, and
//!   drift detection;
//! - a **durable job queue** with priorities, dependencies, lease-based
//!   worker ownership, exponential-backoff retry, and a dead-letter sink;
//! - a **capture pipeline** that navigates, validates the response against
//!   anti-bot signatures, expands hidden content, and writes artifacts
//!   atomically under content-derived paths.
//!
//! # Example
//!
//! ```no_run
//! use national_treasure::{Engine, EngineConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::open(EngineConfig::default()).await?;
//! let job_id = engine.enqueue_capture("https://example.com/", 0, None).await?;
//! println!("queued {job_id}");
//! # Ok(())
//! # }
//! ```
//!
//! # Requirements
//!
//! This library requires a Tokio runtime, and a local Chromium binary for
//! actual captures (see `NT_CHROMIUM_PATH`).

pub mod behaviors;
pub mod browser;
pub mod capture;
pub mod config;
mod domain;
mod error_handling;
pub mod initialization;
pub mod learner;
pub mod models;
pub mod queue;
pub mod storage;
pub mod validator;
pub mod worker;

// Re-export public API
pub use capture::{CapturePipeline, CaptureRequest};
pub use config::{Command, EngineConfig, LogFormat, LogLevel, Opt};
pub use domain::registrable_domain;
pub use engine::Engine;
pub use error_handling::InitializationError;
pub use learner::{DomainLearner, DriftSignal};
pub use models::{
    ArtifactKind, BrowserProfile, CapturePayload, CaptureResult, Job, JobStatus, JobType,
    OutcomeKind, SCHEMA_VERSION,
};
pub use queue::{JobQueue, QueueError};
pub use storage::{init_db_pool_with_path, run_migrations, seed_default_profiles, OutcomeStore};
pub use validator::{PageSnapshot, ResponseValidator, Verdict};
pub use worker::{CaptureHandler, WorkerPool};

// Internal engine module (wires the subsystems together)
mod engine {
    use std::sync::Arc;

    use anyhow::{Context, Result};
    use sqlx::SqlitePool;

    use crate::browser::{BrowserLauncher, ChromiumLauncher};
    use crate::capture::{CapturePipeline, CaptureRequest};
    use crate::config::EngineConfig;
    use crate::learner::{DomainLearner, OutcomeDetails};
    use crate::models::{ArtifactKind, CapturePayload, CaptureResult, JobType};
    use crate::queue::JobQueue;
    use crate::storage::{
        init_db_pool_with_path, run_migrations, seed_default_profiles, OutcomeStore,
    };
    use crate::worker::{CaptureHandler, WorkerPool};

    /// One opened engine: a database, the learner, the queue, and a capture
    /// pipeline, all sharing the same store.
    pub struct Engine {
        config: EngineConfig,
        pool: SqlitePool,
        store: OutcomeStore,
        learner: Arc<DomainLearner>,
        queue: Arc<JobQueue>,
        pipeline: Arc<CapturePipeline>,
    }

    impl Engine {
        /// Opens (creating and migrating if necessary) the engine's backing
        /// store and wires the subsystems.
        pub async fn open(config: EngineConfig) -> Result<Self> {
            let pool = init_db_pool_with_path(&config.database_path)
                .await
                .context("Failed to initialize database pool")?;
            run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            seed_default_profiles(&pool)
                .await
                .context("Failed to seed browser profiles")?;

            let store = OutcomeStore::new(pool.clone());
            let learner = Arc::new(DomainLearner::new(
                store.clone(),
                config.exploration_threshold,
                config.exploration_bonus,
                config.decay_half_life_days,
            ));
            let queue = Arc::new(JobQueue::new(pool.clone(), &config));
            let pipeline = Arc::new(CapturePipeline::new(&config));

            Ok(Engine {
                config,
                pool,
                store,
                learner,
                queue,
                pipeline,
            })
        }

        pub fn config(&self) -> &EngineConfig {
            &self.config
        }

        pub fn pool(&self) -> &SqlitePool {
            &self.pool
        }

        pub fn store(&self) -> &OutcomeStore {
            &self.store
        }

        pub fn learner(&self) -> Arc<DomainLearner> {
            Arc::clone(&self.learner)
        }

        pub fn queue(&self) -> Arc<JobQueue> {
            Arc::clone(&self.queue)
        }

        pub fn pipeline(&self) -> Arc<CapturePipeline> {
            Arc::clone(&self.pipeline)
        }

        /// Queues a capture job for `url`.
        pub async fn enqueue_capture(
            &self,
            url: &str,
            priority: i64,
            depends_on: Option<&str>,
        ) -> Result<String> {
            let payload = CapturePayload::new(url);
            let id = self
                .queue
                .enqueue(
                    JobType::Capture,
                    serde_json::to_value(payload)?,
                    priority,
                    depends_on,
                )
                .await?;
            Ok(id)
        }

        /// Builds a worker pool with the capture handler registered.
        pub fn workers(&self, launcher: Arc<dyn BrowserLauncher>) -> WorkerPool {
            let mut pool = WorkerPool::new(Arc::clone(&self.queue), &self.config);
            pool.register_handler(
                JobType::Capture,
                Arc::new(CaptureHandler::new(
                    Arc::clone(&self.learner),
                    Arc::clone(&self.pipeline),
                    launcher,
                )),
            );
            pool
        }

        /// Captures one URL immediately, bypassing the queue but still
        /// feeding the learner.
        pub async fn capture_once(
            &self,
            url: &str,
            artifacts: Vec<ArtifactKind>,
            behaviors_enabled: bool,
        ) -> Result<CaptureResult> {
            let suffixes = publicsuffix::List::new();
            let domain = crate::domain::registrable_domain(&suffixes, url)?;

            let wait = self.learner.should_wait(&domain).await?;
            if !wait.is_zero() {
                log::info!("Waiting {wait:?} before hitting {domain}");
                tokio::time::sleep(wait).await;
            }

            let profile = self.learner.select(&domain).await?;
            log::info!("Capturing {url} with profile {}", profile.name);

            let launcher = ChromiumLauncher::discover()?;
            let mut session = launcher.launch(&profile).await?;

            let mut request = CaptureRequest::new(url).with_artifacts(artifacts);
            request.behaviors_enabled = behaviors_enabled;
            let result = self.pipeline.capture(session.as_ref(), &profile, &request).await;

            session.close().await.context("Failed to close browser")?;

            self.learner
                .record(
                    &domain,
                    &profile,
                    result.outcome,
                    OutcomeDetails {
                        url: url.to_string(),
                        block_service: result.block_service.clone(),
                        http_status: result.http_status,
                        response_ms: result.duration_ms,
                        content_length: result.content_length,
                        page_title: result.page_title.clone(),
                    },
                )
                .await?;

            Ok(result)
        }
    }
}
