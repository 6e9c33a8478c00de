//! Durable job queue over SQLite: typed enqueue, atomic claim, retry with
//! exponential backoff, and recurring (cron) triggers.
use crate::db::{self, JobStatus, NewJob, Pool, RecurringRecord};
use crate::jobs::JobPayload;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Attempt ceiling and backoff base for failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(5_000),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next try after `attempts` failed tries: base * 2^(attempts-1).
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(20);
        self.backoff_base.saturating_mul(1_u32 << exp)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Explicit id; enqueueing an id that already exists is a no-op.
    pub job_id: Option<String>,
    pub delay: Option<Duration>,
    pub max_attempts: Option<u32>,
}

/// A job claimed by a worker slot.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub payload: JobPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying { run_at: DateTime<Utc> },
    Exhausted,
}

#[derive(Clone)]
pub struct JobQueue {
    pool: Pool,
    policy: RetryPolicy,
}

fn chrono_delay(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

fn next_fire(cron_expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let schedule = Schedule::from_str(cron_expr)
        .map_err(|e| anyhow!("invalid cron expression {:?}: {}", cron_expr, e))?;
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| anyhow!("cron expression {:?} never fires", cron_expr))
}

impl JobQueue {
    pub fn new(pool: Pool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Validate and enqueue a job. Returns the id, or `None` for a duplicate id.
    #[instrument(skip_all, fields(stage = %payload.stage()))]
    pub async fn enqueue(
        &self,
        payload: &JobPayload,
        opts: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Result<Option<String>> {
        payload.validate().context("refusing to enqueue invalid payload")?;
        let id = opts.job_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let json = payload.to_json()?;
        let run_at = now + chrono_delay(opts.delay.unwrap_or_default());
        let job = NewJob {
            id: &id,
            stage: payload.stage().as_str(),
            payload: &json,
            max_attempts: opts.max_attempts.unwrap_or(self.policy.max_attempts),
            run_at,
        };
        let inserted = db::insert_job(&self.pool, &job, now).await?;
        if !inserted {
            info!(job_id = %id, "job id already queued; skipping");
            return Ok(None);
        }
        Ok(Some(id))
    }

    /// Claim the next due job. Rows whose payload no longer decodes are
    /// failed on the spot and skipped.
    #[instrument(skip_all)]
    pub async fn claim(&self, now: DateTime<Utc>) -> Result<Option<ClaimedJob>> {
        loop {
            let Some(rec) = db::claim_next_job(&self.pool, now).await? else {
                return Ok(None);
            };
            match JobPayload::from_stored(&rec.stage, &rec.payload) {
                Ok(payload) => {
                    return Ok(Some(ClaimedJob {
                        id: rec.id,
                        attempts: rec.attempts,
                        max_attempts: rec.max_attempts,
                        payload,
                    }))
                }
                Err(err) => {
                    warn!(job_id = %rec.id, stage = %rec.stage, ?err, "undecodable job payload");
                    db::mark_job_failed(&self.pool, &rec.id, now, &format!("{:#}", err)).await?;
                }
            }
        }
    }

    /// Mark a job completed and enqueue its successors in one transaction.
    #[instrument(skip_all, fields(job_id = %job.id))]
    pub async fn complete(
        &self,
        job: &ClaimedJob,
        successors: &[JobPayload],
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let mut encoded = Vec::with_capacity(successors.len());
        for next in successors {
            next.validate()
                .with_context(|| format!("invalid {} payload from {}", next.stage(), job.id))?;
            encoded.push((Uuid::new_v4().to_string(), next.stage(), next.to_json()?));
        }

        let mut tx = self.pool.begin().await?;
        for (id, stage, json) in &encoded {
            let row = NewJob {
                id,
                stage: stage.as_str(),
                payload: json,
                max_attempts: self.policy.max_attempts,
                run_at: now,
            };
            db::insert_job_tx(&mut tx, &row, now).await?;
        }
        db::complete_job_tx(&mut tx, &job.id, now).await?;
        tx.commit().await?;
        Ok(encoded.into_iter().map(|(id, _, _)| id).collect())
    }

    /// Record a failed attempt: back off and retry, or fail terminally.
    #[instrument(skip_all, fields(job_id = %job.id, attempt = job.attempts))]
    pub async fn fail(
        &self,
        job: &ClaimedJob,
        error: &anyhow::Error,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome> {
        let message = format!("{:#}", error);
        if job.attempts >= job.max_attempts {
            db::mark_job_failed(&self.pool, &job.id, now, &message).await?;
            return Ok(FailureOutcome::Exhausted);
        }
        let run_at = now + chrono_delay(self.policy.delay_for(job.attempts));
        db::reschedule_job(&self.pool, &job.id, run_at, &message).await?;
        Ok(FailureOutcome::Retrying { run_at })
    }

    pub async fn release_stalled(&self, stall_timeout: Duration, now: DateTime<Utc>) -> Result<u64> {
        db::release_stalled_jobs(&self.pool, now - chrono_delay(stall_timeout), now).await
    }

    /// Drop old finished jobs beyond the retention counts.
    pub async fn prune(&self, keep_completed: u32, keep_failed: u32) -> Result<u64> {
        let completed = db::prune_finished_jobs(&self.pool, JobStatus::Completed, keep_completed).await?;
        let failed = db::prune_finished_jobs(&self.pool, JobStatus::Failed, keep_failed).await?;
        Ok(completed + failed)
    }

    /// Register (or replace) the recurring trigger stored under `key`.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn add_recurring(
        &self,
        key: &str,
        payload: &JobPayload,
        cron_expr: &str,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        payload.validate()?;
        let next_run_at = next_fire(cron_expr, now)?;
        let rec = RecurringRecord {
            key: key.to_string(),
            stage: payload.stage().as_str().to_string(),
            payload: payload.to_json()?,
            cron: cron_expr.to_string(),
            next_run_at,
        };
        db::upsert_recurring(&self.pool, &rec, now).await?;
        Ok(next_run_at)
    }

    pub async fn remove_recurring(&self, key: &str) -> Result<bool> {
        db::delete_recurring(&self.pool, key).await
    }

    pub async fn recurring(&self) -> Result<Vec<RecurringRecord>> {
        db::list_recurring(&self.pool).await
    }

    /// Enqueue one job per due recurring trigger and advance its next fire time.
    /// Missed firings collapse into a single job.
    #[instrument(skip_all)]
    pub async fn fire_due_recurring(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut fired = Vec::new();
        for rec in db::due_recurring(&self.pool, now).await? {
            let decoded = JobPayload::from_stored(&rec.stage, &rec.payload)
                .with_context(|| format!("recurring trigger {} has a bad payload", rec.key))
                .and_then(|payload| Ok((payload, next_fire(&rec.cron, now)?)));
            let (payload, next) = match decoded {
                Ok(decoded) => decoded,
                Err(err) => {
                    warn!(key = %rec.key, error = %format!("{:#}", err), "skipping broken recurring trigger");
                    continue;
                }
            };
            let id = format!("{}:{}", rec.key, rec.next_run_at.timestamp_millis());
            let json = payload.to_json()?;

            let mut tx = self.pool.begin().await?;
            if !db::advance_recurring_tx(&mut tx, &rec.key, rec.next_run_at, next).await? {
                continue;
            }
            let job = NewJob {
                id: &id,
                stage: payload.stage().as_str(),
                payload: &json,
                max_attempts: self.policy.max_attempts,
                run_at: now,
            };
            let inserted = db::insert_job_tx(&mut tx, &job, now).await?;
            tx.commit().await?;
            if inserted {
                info!(key = %rec.key, job_id = %id, next = %next, "recurring trigger fired");
                fired.push(id);
            }
        }
        Ok(fired)
    }
}
