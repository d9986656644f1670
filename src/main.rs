use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use national_treasure::browser::ChromiumLauncher;
use national_treasure::{Command, Engine, EngineConfig, Opt};

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    national_treasure::initialization::init_logger_with(
        opt.log_level.clone().into(),
        opt.log_format.clone(),
    )
    .context("Failed to initialize logger")?;

    let config = EngineConfig {
        database_path: opt.db_path.clone(),
        archive_dir: opt.archive_dir.clone(),
        ..EngineConfig::default()
    };

    match opt.command {
        Command::Enqueue {
            url,
            priority,
            depends_on,
            artifacts,
        } => {
            let engine = Engine::open(config).await?;
            let payload = {
                let mut p = national_treasure::CapturePayload::new(&url);
                p.artifacts = artifacts;
                p
            };
            let id = engine
                .queue()
                .enqueue(
                    national_treasure::JobType::Capture,
                    serde_json::to_value(payload)?,
                    priority,
                    depends_on.as_deref(),
                )
                .await?;
            println!("{id}");
        }

        Command::Work { workers } => {
            let config = EngineConfig {
                worker_pool_size: workers,
                ..config
            };
            let engine = Engine::open(config).await?;
            let launcher =
                Arc::new(ChromiumLauncher::discover().context("No Chromium available")?);
            let pool = engine.workers(launcher);

            let cancel = pool.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown requested; draining workers");
                    cancel.cancel();
                }
            });

            pool.run().await?;
        }

        Command::Capture {
            url,
            artifacts,
            no_behaviors,
        } => {
            let engine = Engine::open(config).await?;
            let result = engine.capture_once(&url, artifacts, !no_behaviors).await?;
            if result.success {
                println!("captured {url} ({} ms)", result.duration_ms);
                for (kind, path) in &result.artifacts {
                    println!("  {kind}: {}", path.display());
                }
            } else {
                println!(
                    "capture failed: {} ({})",
                    result.outcome,
                    result.error.as_deref().unwrap_or("no detail")
                );
                std::process::exit(1);
            }
        }

        Command::Stats => {
            let engine = Engine::open(config).await?;
            let depths = engine.queue().depth_by_status().await?;
            println!("queue:");
            for (status, count) in depths {
                println!("  {status}: {count}");
            }
            let (domains, outcomes, rate) = engine.store().global_stats().await?;
            println!("learning:");
            println!("  domains seen: {domains}");
            println!("  outcomes recorded: {outcomes}");
            println!("  overall success rate: {:.1}%", rate * 100.0);
        }

        Command::DeadLetter { limit } => {
            let engine = Engine::open(config).await?;
            let records = engine.queue().dead_letters(limit, 0).await?;
            if records.is_empty() {
                println!("dead letter is empty");
            }
            for record in records {
                println!(
                    "{}  attempts={}  died={}  revived={}  error={}",
                    record.job_id,
                    record.attempts,
                    record.died_at.to_rfc3339(),
                    record
                        .revived_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".into()),
                    record.error
                );
            }
        }

        Command::Retry { job_id } => {
            let engine = Engine::open(config).await?;
            let id = engine.queue().retry_dead_letter(&job_id).await?;
            println!("revived {id}");
        }
    }

    Ok(())
}
