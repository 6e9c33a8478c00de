use anyhow::{anyhow, Result};
use autopost::config;
use autopost::db::{self, JobStatus};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(author, version, about = "Inspect and repair the job queue")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Job counts per status and registered triggers
    Summary,
    /// List recent jobs
    List {
        /// waiting, active, completed or failed
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value = "20")]
        limit: i64,
    },
    /// Print one job with its payload and last error
    Show { id: String },
    /// Put a failed job back in the queue with a fresh attempt budget
    Retry { id: String },
    /// Delete finished jobs beyond the configured retention
    Prune,
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
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    match args.command {
        Command::Summary => {
            for status in [JobStatus::Waiting, JobStatus::Active, JobStatus::Completed, JobStatus::Failed] {
                println!("{:<10} {}", status.as_str(), db::count_jobs(&pool, status).await?);
            }
            for rec in db::list_recurring(&pool).await? {
                println!("trigger {} cron={} next={}", rec.key, rec.cron, rec.next_run_at);
            }
        }
        Command::List { status, limit } => {
            let status = match status.as_deref() {
                Some(s) => Some(JobStatus::parse_status(s).ok_or_else(|| anyhow!("unknown status {}", s))?),
                None => None,
            };
            for job in db::list_jobs(&pool, status, limit).await? {
                println!(
                    "{}  {:<16} {:<9} attempts={}/{} run_at={}{}",
                    job.id,
                    job.stage,
                    job.status.as_str(),
                    job.attempts,
                    job.max_attempts,
                    job.run_at,
                    job.last_error.map(|e| format!("  error: {}", e)).unwrap_or_default()
                );
            }
        }
        Command::Show { id } => {
            let job = db::get_job(&pool, &id)
                .await?
                .ok_or_else(|| anyhow!("no job {}", id))?;
            let payload: serde_json::Value = serde_json::from_str(&job.payload)?;
            println!("id:         {}", job.id);
            println!("stage:      {}", job.stage);
            println!("status:     {}", job.status.as_str());
            println!("attempts:   {}/{}", job.attempts, job.max_attempts);
            println!("created_at: {}", job.created_at);
            println!("run_at:     {}", job.run_at);
            if let Some(err) = &job.last_error {
                println!("last_error: {}", err);
            }
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        Command::Retry { id } => {
            if db::requeue_failed_job(&pool, &id, Utc::now()).await? {
                println!("requeued {}", id);
            } else {
                return Err(anyhow!("{} is not a failed job", id));
            }
        }
        Command::Prune => {
            let completed = db::prune_finished_jobs(&pool, JobStatus::Completed, cfg.queue.keep_completed).await?;
            let failed = db::prune_finished_jobs(&pool, JobStatus::Failed, cfg.queue.keep_failed).await?;
            println!("pruned {} completed and {} failed jobs", completed, failed);
        }
    }
    Ok(())
}
