use anyhow::{anyhow, Result};
use autopost::config;
use autopost::db;
use autopost::jobs::{DailyBatchJob, JobPayload};
use autopost::queue::{EnqueueOptions, JobQueue, RetryPolicy};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Parser)]
#[command(author, version, about = "Enqueue a daily batch now, outside the schedule")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Only this group (default: every configured group)
    #[arg(long)]
    group: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let queue = JobQueue::new(
        pool,
        RetryPolicy {
            max_attempts: cfg.queue.max_attempts,
            backoff_base: Duration::from_millis(cfg.queue.backoff_base_ms),
        },
    );

    let groups = match &args.group {
        Some(name) => vec![cfg
            .group(name)
            .cloned()
            .ok_or_else(|| anyhow!("group {} is not configured", name))?],
        None => cfg.groups.clone(),
    };

    let now = Utc::now();
    for group in groups {
        let job_id = format!("manual:{}:{}", group.name, now.timestamp_millis());
        let payload = JobPayload::DailyBatch(DailyBatchJob { group });
        let opts = EnqueueOptions {
            job_id: Some(job_id.clone()),
            ..Default::default()
        };
        match queue.enqueue(&payload, opts, now).await? {
            Some(id) => info!(job_id = %id, group = %payload.group().name, "daily batch enqueued"),
            None => info!(job_id = %job_id, "already enqueued"),
        }
    }
    Ok(())
}
