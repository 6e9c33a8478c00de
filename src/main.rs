use anyhow::Result;
use autopost::batch_state::{BatchTypeStore, SqliteKvStore};
use autopost::config;
use autopost::db;
use autopost::generator::OpenAiGenerator;
use autopost::pipeline::{Pipeline, PipelineSettings, Services};
use autopost::publisher::PostBridgeClient;
use autopost::queue::{JobQueue, RetryPolicy};
use autopost::render::{video, FfmpegRenderer};
use autopost::scheduler::{self, TriggerSettings};
use autopost::selector::{ContentSelector, RestTableClient};
use autopost::storage::SupabaseStorage;
use autopost::worker::{WorkerPool, WorkerSettings};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// ffmpeg binary used for rendering and video conversion
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: PathBuf,
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

    if let Err(err) = video::ensure_ffmpeg_available(&args.ffmpeg).await {
        warn!(%err, "ffmpeg missing; slides will use the fallback renderer and stay stills");
    }

    let queue = JobQueue::new(
        pool.clone(),
        RetryPolicy {
            max_attempts: cfg.queue.max_attempts,
            backoff_base: Duration::from_millis(cfg.queue.backoff_base_ms),
        },
    );

    let services = Services {
        batch_types: BatchTypeStore::new(Arc::new(SqliteKvStore::new(pool.clone()))),
        selector: ContentSelector::new(
            Arc::new(RestTableClient::new(&cfg.supabase.url, cfg.supabase.key.clone())?),
            cfg.content.items_per_page,
        ),
        generator: Arc::new(OpenAiGenerator::new(
            cfg.generator.api_key.clone(),
            cfg.generator.model.clone(),
            &cfg.generator.base_url,
        )?),
        renderer: Arc::new(FfmpegRenderer::new(args.ffmpeg.clone())),
        storage: Arc::new(SupabaseStorage::new(
            &cfg.supabase.url,
            cfg.supabase.key.clone(),
            cfg.supabase.bucket.clone(),
        )?),
        publisher: Arc::new(PostBridgeClient::new(
            cfg.publisher.token.clone(),
            cfg.publisher.uploads_url.clone(),
            cfg.publisher.posts_url.clone(),
        )?),
    };
    let pipeline = Pipeline::new(PipelineSettings::from_config(&cfg), services);

    let trigger_settings = TriggerSettings {
        tick: Duration::from_secs(1),
        maintenance_every: Duration::from_secs(60),
        stall_timeout: Duration::from_secs(cfg.queue.stall_timeout_secs),
        keep_completed: cfg.queue.keep_completed,
        keep_failed: cfg.queue.keep_failed,
    };
    scheduler::run_maintenance(&queue, &trigger_settings, Utc::now()).await?;
    let registered =
        scheduler::sync_recurring_triggers(&queue, &cfg.groups, &cfg.schedule.daily_cron, Utc::now()).await?;
    info!(registered, "recurring triggers registered");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = WorkerPool::spawn(
        queue.clone(),
        pipeline,
        WorkerSettings {
            concurrency: cfg.queue.concurrency,
            poll_interval: Duration::from_millis(cfg.queue.poll_interval_ms),
            job_timeout: Duration::from_secs(cfg.queue.job_timeout_secs),
        },
        shutdown_rx.clone(),
    );
    let trigger = tokio::spawn(scheduler::run_trigger_loop(queue, trigger_settings, shutdown_rx));
    info!(slots = workers.len(), "autopost running");

    tokio::signal::ctrl_c().await?;
    info!("shutting down; waiting for in-flight jobs");
    let _ = shutdown_tx.send(true);
    workers.join().await;
    let _ = trigger.await;
    Ok(())
}
