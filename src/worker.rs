use crate::pipeline::Pipeline;
use crate::queue::{ClaimedJob, FailureOutcome, JobQueue};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

/// Claim and execute one due job. Returns whether a job was processed.
#[instrument(skip_all)]
pub async fn process_next_job(
    queue: &JobQueue,
    pipeline: &Pipeline,
    job_timeout: Duration,
    now: DateTime<Utc>,
) -> Result<bool> {
    let Some(job) = queue.claim(now).await? else {
        return Ok(false);
    };

    let outcome = match tokio::time::timeout(job_timeout, pipeline.run_stage(&job.payload, now)).await {
        Ok(res) => res,
        Err(_) => Err(anyhow!("job timed out after {:?}", job_timeout)),
    };

    let successors = match outcome {
        Ok(successors) => successors,
        Err(err) => {
            report_failure(queue, &job, err).await?;
            return Ok(true);
        }
    };
    // a successor that cannot be enqueued fails this job, it must not stay active
    match queue.complete(&job, &successors, Utc::now()).await {
        Ok(ids) => info!(
            job_id = %job.id,
            stage = %job.payload.stage(),
            group = %job.payload.group().name,
            hour = ?job.payload.hour(),
            attempt = job.attempts,
            next = ids.len(),
            "job completed"
        ),
        Err(err) => report_failure(queue, &job, err).await?,
    }
    Ok(true)
}

async fn report_failure(queue: &JobQueue, job: &ClaimedJob, err: anyhow::Error) -> Result<()> {
    match queue.fail(job, &err, Utc::now()).await? {
        FailureOutcome::Retrying { run_at } => warn!(
            job_id = %job.id,
            stage = %job.payload.stage(),
            group = %job.payload.group().name,
            hour = ?job.payload.hour(),
            attempt = job.attempts,
            %run_at,
            error = %format!("{:#}", err),
            "job failed; retrying"
        ),
        FailureOutcome::Exhausted => error!(
            job_id = %job.id,
            stage = %job.payload.stage(),
            group = %job.payload.group().name,
            hour = ?job.payload.hour(),
            attempt = job.attempts,
            error = %format!("{:#}", err),
            "job failed"
        ),
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
}

/// Fixed number of worker slots draining the queue until shutdown.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        queue: JobQueue,
        pipeline: Pipeline,
        settings: WorkerSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let handles = (0..settings.concurrency.max(1))
            .map(|slot| {
                let queue = queue.clone();
                let pipeline = pipeline.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(run_slot(slot, queue, pipeline, settings, shutdown))
            })
            .collect();
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every slot to finish its current job and exit.
    pub async fn join(self) {
        for res in join_all(self.handles).await {
            if let Err(err) = res {
                error!(?err, "worker slot panicked");
            }
        }
    }
}

async fn run_slot(
    slot: usize,
    queue: JobQueue,
    pipeline: Pipeline,
    settings: WorkerSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(slot, "worker slot started");
    while !*shutdown.borrow() {
        let idle = match process_next_job(&queue, &pipeline, settings.job_timeout, Utc::now()).await {
            Ok(processed) => !processed,
            Err(err) => {
                error!(slot, ?err, "worker error");
                true
            }
        };
        if idle {
            tokio::select! {
                _ = tokio::time::sleep(settings.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }
    info!(slot, "worker slot stopped");
}
