use super::model::{from_millis, to_millis, JobRecord, JobStatus, RecurringRecord};
use super::repo::Pool;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use tracing::instrument;

const JOB_COLUMNS: &str =
    "id, stage, payload, status, attempts, max_attempts, run_at, last_error, created_at";

/// Insert parameters for a new job row.
#[derive(Debug, Clone)]
pub struct NewJob<'a> {
    pub id: &'a str,
    pub stage: &'a str,
    pub payload: &'a str,
    pub max_attempts: u32,
    pub run_at: DateTime<Utc>,
}

fn job_from_row(row: &SqliteRow) -> Result<JobRecord> {
    let status: String = row.get("status");
    let status = JobStatus::parse_status(&status)
        .ok_or_else(|| anyhow!("job has unknown status {}", status))?;
    Ok(JobRecord {
        id: row.get("id"),
        stage: row.get("stage"),
        payload: row.get("payload"),
        status,
        attempts: row.get::<i64, _>("attempts") as u32,
        max_attempts: row.get::<i64, _>("max_attempts") as u32,
        run_at: from_millis(row.get("run_at")),
        last_error: row.try_get::<Option<String>, _>("last_error").ok().flatten(),
        created_at: from_millis(row.get("created_at")),
    })
}

/// Insert a job. A duplicate id is ignored and reported as `false`.
pub async fn insert_job_tx(
    tx: &mut Transaction<'_, Sqlite>,
    job: &NewJob<'_>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "INSERT INTO jobs (id, stage, payload, status, attempts, max_attempts, run_at, created_at) \
         VALUES (?, ?, ?, 'waiting', 0, ?, ?, ?) ON CONFLICT(id) DO NOTHING",
    )
    .bind(job.id)
    .bind(job.stage)
    .bind(job.payload)
    .bind(job.max_attempts as i64)
    .bind(to_millis(job.run_at))
    .bind(to_millis(now))
    .execute(&mut **tx)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn insert_job(pool: &Pool, job: &NewJob<'_>, now: DateTime<Utc>) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let inserted = insert_job_tx(&mut tx, job, now).await?;
    tx.commit().await?;
    Ok(inserted)
}

/// Atomically move the oldest due waiting job to `active` and bump its attempt count.
#[instrument(skip_all)]
pub async fn claim_next_job(pool: &Pool, now: DateTime<Utc>) -> Result<Option<JobRecord>> {
    let now_ms = to_millis(now);
    let sql = format!(
        "UPDATE jobs SET status = 'active', attempts = attempts + 1, locked_at = ? \
         WHERE id = (SELECT id FROM jobs WHERE status = 'waiting' AND run_at <= ? \
                     ORDER BY run_at ASC, created_at ASC LIMIT 1) \
         RETURNING {}",
        JOB_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(now_ms)
        .bind(now_ms)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(job_from_row).transpose()
}

pub async fn complete_job_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE jobs SET status = 'completed', locked_at = NULL, finished_at = ? WHERE id = ?",
    )
    .bind(to_millis(now))
    .bind(id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Put an active job back to `waiting` with a later `run_at`.
#[instrument(skip_all)]
pub async fn reschedule_job(
    pool: &Pool,
    id: &str,
    run_at: DateTime<Utc>,
    error: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE jobs SET status = 'waiting', locked_at = NULL, run_at = ?, last_error = ? WHERE id = ?",
    )
    .bind(to_millis(run_at))
    .bind(error)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_job_failed(pool: &Pool, id: &str, now: DateTime<Utc>, error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE jobs SET status = 'failed', locked_at = NULL, finished_at = ?, last_error = ? WHERE id = ?",
    )
    .bind(to_millis(now))
    .bind(error)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Release jobs that have been `active` since before `stalled_before`.
/// Jobs with attempts left go back to `waiting`; the rest become `failed`.
#[instrument(skip_all)]
pub async fn release_stalled_jobs(
    pool: &Pool,
    stalled_before: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let now_ms = to_millis(now);
    let res = sqlx::query(
        "UPDATE jobs SET \
            status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'waiting' END, \
            finished_at = CASE WHEN attempts >= max_attempts THEN ? ELSE NULL END, \
            run_at = ?, locked_at = NULL, last_error = 'job stalled' \
         WHERE status = 'active' AND locked_at < ?",
    )
    .bind(now_ms)
    .bind(now_ms)
    .bind(to_millis(stalled_before))
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn get_job(pool: &Pool, id: &str) -> Result<Option<JobRecord>> {
    let sql = format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS);
    let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(job_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list_jobs(pool: &Pool, status: Option<JobStatus>, limit: i64) -> Result<Vec<JobRecord>> {
    let rows = match status {
        Some(status) => {
            let sql = format!(
                "SELECT {} FROM jobs WHERE status = ? ORDER BY created_at DESC LIMIT ?",
                JOB_COLUMNS
            );
            sqlx::query(&sql)
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(pool)
                .await?
        }
        None => {
            let sql = format!("SELECT {} FROM jobs ORDER BY created_at DESC LIMIT ?", JOB_COLUMNS);
            sqlx::query(&sql).bind(limit).fetch_all(pool).await?
        }
    };
    rows.iter().map(job_from_row).collect()
}

#[instrument(skip_all)]
pub async fn count_jobs(pool: &Pool, status: JobStatus) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = ?")
        .bind(status.as_str())
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Operator retry: a failed job gets a fresh attempt budget.
#[instrument(skip_all)]
pub async fn requeue_failed_job(pool: &Pool, id: &str, now: DateTime<Utc>) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE jobs SET status = 'waiting', attempts = 0, run_at = ?, finished_at = NULL \
         WHERE id = ? AND status = 'failed'",
    )
    .bind(to_millis(now))
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Keep only the newest `keep` jobs with a finished `status`.
#[instrument(skip_all)]
pub async fn prune_finished_jobs(pool: &Pool, status: JobStatus, keep: u32) -> Result<u64> {
    if !matches!(status, JobStatus::Completed | JobStatus::Failed) {
        return Err(anyhow!("only finished jobs can be pruned"));
    }
    let res = sqlx::query(
        "DELETE FROM jobs WHERE status = ? AND id NOT IN \
         (SELECT id FROM jobs WHERE status = ? ORDER BY finished_at DESC, created_at DESC LIMIT ?)",
    )
    .bind(status.as_str())
    .bind(status.as_str())
    .bind(keep as i64)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

fn recurring_from_row(row: &SqliteRow) -> RecurringRecord {
    RecurringRecord {
        key: row.get("key"),
        stage: row.get("stage"),
        payload: row.get("payload"),
        cron: row.get("cron"),
        next_run_at: from_millis(row.get("next_run_at")),
    }
}

#[instrument(skip_all)]
pub async fn upsert_recurring(pool: &Pool, rec: &RecurringRecord, now: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        "INSERT INTO recurring_jobs (key, stage, payload, cron, next_run_at, created_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT(key) DO UPDATE SET stage = excluded.stage, payload = excluded.payload, \
            cron = excluded.cron, next_run_at = excluded.next_run_at",
    )
    .bind(&rec.key)
    .bind(&rec.stage)
    .bind(&rec.payload)
    .bind(&rec.cron)
    .bind(to_millis(rec.next_run_at))
    .bind(to_millis(now))
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn delete_recurring(pool: &Pool, key: &str) -> Result<bool> {
    let res = sqlx::query("DELETE FROM recurring_jobs WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn list_recurring(pool: &Pool) -> Result<Vec<RecurringRecord>> {
    let rows = sqlx::query(
        "SELECT key, stage, payload, cron, next_run_at FROM recurring_jobs ORDER BY key",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(recurring_from_row).collect())
}

#[instrument(skip_all)]
pub async fn due_recurring(pool: &Pool, now: DateTime<Utc>) -> Result<Vec<RecurringRecord>> {
    let rows = sqlx::query(
        "SELECT key, stage, payload, cron, next_run_at FROM recurring_jobs \
         WHERE next_run_at <= ? ORDER BY next_run_at ASC",
    )
    .bind(to_millis(now))
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(recurring_from_row).collect())
}

/// Move a recurring trigger forward, only if it still has the expected
/// `next_run_at` (another process may have fired it already).
pub async fn advance_recurring_tx(
    tx: &mut Transaction<'_, Sqlite>,
    key: &str,
    expected: DateTime<Utc>,
    next: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE recurring_jobs SET next_run_at = ? WHERE key = ? AND next_run_at = ?",
    )
    .bind(to_millis(next))
    .bind(key)
    .bind(to_millis(expected))
    .execute(&mut **tx)
    .await?;
    Ok(res.rows_affected() == 1)
}
