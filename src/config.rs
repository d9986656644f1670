use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use crate::models::ArtifactKind;

// constants (used as defaults)
pub const DEFAULT_DB_PATH: &str = "./national-treasure.db";
pub const DEFAULT_ARCHIVE_DIR: &str = "./archive";
pub const DEFAULT_QUEUE: &str = "default";
/// How long an idle worker sleeps before polling the queue again.
pub const WORKER_IDLE_POLL: Duration = Duration::from_millis(500);
/// How often a worker refreshes the lease on its in-flight job.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
/// Body text passed to the validator is capped at this many bytes.
pub const BODY_TEXT_CAP: usize = 64 * 1024;

#[derive(Clone, Debug, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(l: LogLevel) -> Self {
        match l {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

#[derive(Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Plain,
    Json,
}

/// Tunables for the engine. Every field has a default; the CLI and library
/// callers override what they need.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_path: PathBuf,
    pub archive_dir: PathBuf,

    pub worker_pool_size: usize,
    pub default_lease: Duration,

    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub max_attempts: u32,
    /// Enqueues are rejected once `pending` reaches this depth.
    pub max_pending: u64,

    pub navigation_timeout_ms: u64,
    pub behavior_timeout_ms: u64,
    pub overall_timeout_ms: u64,

    pub min_content_length: usize,

    pub exploration_threshold: u32,
    pub exploration_bonus: f64,
    pub decay_half_life_days: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            database_path: PathBuf::from(DEFAULT_DB_PATH),
            archive_dir: PathBuf::from(DEFAULT_ARCHIVE_DIR),
            worker_pool_size: 3,
            default_lease: Duration::from_secs(1800),
            retry_base: Duration::from_secs(30),
            retry_cap: Duration::from_secs(3600),
            max_attempts: 3,
            max_pending: 10_000,
            navigation_timeout_ms: 30_000,
            behavior_timeout_ms: 30_000,
            overall_timeout_ms: 120_000,
            min_content_length: 500,
            exploration_threshold: 10,
            exploration_bonus: 0.1,
            decay_half_life_days: 30.0,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "national-treasure",
    about = "Captures web pages while learning which browser configuration works per domain."
)]
pub struct Opt {
    /// Log level: error|warn|info|debug|trace
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Log format: plain|json
    #[arg(long, value_enum, default_value_t = LogFormat::Plain)]
    pub log_format: LogFormat,

    /// Database path (SQLite file)
    #[arg(long, value_parser, default_value = DEFAULT_DB_PATH)]
    pub db_path: PathBuf,

    /// Directory capture artifacts are written under
    #[arg(long, value_parser, default_value = DEFAULT_ARCHIVE_DIR)]
    pub archive_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Add a capture job to the queue
    Enqueue {
        /// URL to capture
        url: String,

        /// Higher priority is claimed first
        #[arg(long, default_value_t = 0)]
        priority: i64,

        /// Job id this job depends on
        #[arg(long)]
        depends_on: Option<String>,

        /// Artifacts to emit: screenshot|pdf|html|warc
        #[arg(long, value_enum, value_delimiter = ',', default_values_t = vec![ArtifactKind::Screenshot, ArtifactKind::Html])]
        artifacts: Vec<ArtifactKind>,
    },

    /// Run the worker pool until interrupted
    Work {
        /// Number of concurrent workers
        #[arg(long, default_value_t = 3)]
        workers: usize,
    },

    /// Capture a single URL immediately, bypassing the queue
    Capture {
        /// URL to capture
        url: String,

        /// Artifacts to emit: screenshot|pdf|html|warc
        #[arg(long, value_enum, value_delimiter = ',', default_values_t = vec![ArtifactKind::Screenshot, ArtifactKind::Html])]
        artifacts: Vec<ArtifactKind>,

        /// Skip content-expansion behaviors
        #[arg(long)]
        no_behaviors: bool,
    },

    /// Show queue depth and learning statistics
    Stats,

    /// List dead-lettered jobs
    DeadLetter {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// Copy a dead-lettered job back into the queue
    Retry {
        /// Job id from the dead-letter list
        job_id: String,
    },
}

impl clap::ValueEnum for ArtifactKind {
    fn value_variants<'a>() -> &'a [Self] {
        &[
            ArtifactKind::Screenshot,
            ArtifactKind::Pdf,
            ArtifactKind::Html,
            ArtifactKind::Warc,
        ]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(clap::builder::PossibleValue::new(match self {
            ArtifactKind::Screenshot => "screenshot",
            ArtifactKind::Pdf => "pdf",
            ArtifactKind::Html => "html",
            ArtifactKind::Warc => "warc",
        }))
    }
}
