use anyhow::anyhow;
use autopost::db::{self, JobStatus};
use autopost::jobs::{DailyBatchJob, GenerateContentJob, JobPayload};
use autopost::model::{ContentSource, Group};
use autopost::queue::{EnqueueOptions, FailureOutcome, JobQueue, RetryPolicy};
use autopost::scheduler::sync_recurring_triggers;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use std::time::Duration;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn group(name: &str) -> Group {
    Group {
        name: name.into(),
        account_ids: vec![1],
        content: ContentSource::Table("articles".into()),
    }
}

fn daily(name: &str) -> JobPayload {
    JobPayload::DailyBatch(DailyBatchJob { group: group(name) })
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 5, 0, 0).unwrap()
}

fn secs(n: i64) -> ChronoDuration {
    ChronoDuration::seconds(n)
}

#[tokio::test]
async fn failed_job_backs_off_then_fails_after_three_attempts() {
    let pool = setup_pool().await;
    let queue = JobQueue::new(pool.clone(), RetryPolicy::default());
    let id = queue
        .enqueue(&daily("FOOTBALL"), EnqueueOptions::default(), t0())
        .await
        .unwrap()
        .unwrap();

    let job = queue.claim(t0()).await.unwrap().unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.attempts, 1);
    let outcome = queue.fail(&job, &anyhow!("boom"), t0()).await.unwrap();
    assert_eq!(outcome, FailureOutcome::Retrying { run_at: t0() + secs(5) });

    assert!(queue.claim(t0() + secs(4)).await.unwrap().is_none());
    let job = queue.claim(t0() + secs(5)).await.unwrap().unwrap();
    assert_eq!(job.attempts, 2);
    let outcome = queue.fail(&job, &anyhow!("boom"), t0() + secs(5)).await.unwrap();
    assert_eq!(outcome, FailureOutcome::Retrying { run_at: t0() + secs(15) });

    let job = queue.claim(t0() + secs(15)).await.unwrap().unwrap();
    assert_eq!(job.attempts, 3);
    let outcome = queue.fail(&job, &anyhow!("still boom"), t0() + secs(15)).await.unwrap();
    assert_eq!(outcome, FailureOutcome::Exhausted);

    let record = db::get_job(&pool, &id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.attempts, 3);
    assert!(record.last_error.unwrap().contains("still boom"));
    assert!(queue.claim(t0() + secs(3600)).await.unwrap().is_none());
}

#[tokio::test]
async fn completion_enqueues_successors() {
    let pool = setup_pool().await;
    let queue = JobQueue::new(pool.clone(), RetryPolicy::default());
    queue
        .enqueue(&daily("GYM"), EnqueueOptions::default(), t0())
        .await
        .unwrap();
    let job = queue.claim(t0()).await.unwrap().unwrap();

    let next: Vec<JobPayload> = [9, 18]
        .iter()
        .map(|hour| {
            JobPayload::GenerateContent(GenerateContentJob {
                group: group("GYM"),
                hour: *hour,
            })
        })
        .collect();
    let ids = queue.complete(&job, &next, t0()).await.unwrap();
    assert_eq!(ids.len(), 2);
    assert_eq!(db::count_jobs(&pool, JobStatus::Completed).await.unwrap(), 1);
    assert_eq!(db::count_jobs(&pool, JobStatus::Waiting).await.unwrap(), 2);

    let mut hours = Vec::new();
    while let Some(job) = queue.claim(t0()).await.unwrap() {
        assert_eq!(job.payload.group().name, "GYM");
        hours.extend(job.payload.hour());
    }
    hours.sort();
    assert_eq!(hours, vec![9, 18]);
}

#[tokio::test]
async fn invalid_successor_is_refused() {
    let pool = setup_pool().await;
    let queue = JobQueue::new(pool.clone(), RetryPolicy::default());
    queue
        .enqueue(&daily("GYM"), EnqueueOptions::default(), t0())
        .await
        .unwrap();
    let job = queue.claim(t0()).await.unwrap().unwrap();
    let bad = JobPayload::GenerateContent(GenerateContentJob {
        group: group("GYM"),
        hour: 24,
    });
    assert!(queue.complete(&job, &[bad], t0()).await.is_err());
    assert_eq!(db::count_jobs(&pool, JobStatus::Active).await.unwrap(), 1);
    assert_eq!(db::count_jobs(&pool, JobStatus::Waiting).await.unwrap(), 0);
}

#[tokio::test]
async fn duplicate_job_id_is_ignored() {
    let pool = setup_pool().await;
    let queue = JobQueue::new(pool.clone(), RetryPolicy::default());
    let opts = || EnqueueOptions {
        job_id: Some("daily_batch:GYM:manual".into()),
        ..Default::default()
    };
    let first = queue.enqueue(&daily("GYM"), opts(), t0()).await.unwrap();
    let second = queue.enqueue(&daily("GYM"), opts(), t0()).await.unwrap();
    assert_eq!(first.as_deref(), Some("daily_batch:GYM:manual"));
    assert_eq!(second, None);
    assert_eq!(db::count_jobs(&pool, JobStatus::Waiting).await.unwrap(), 1);
}

#[tokio::test]
async fn delayed_job_waits_for_its_time() {
    let pool = setup_pool().await;
    let queue = JobQueue::new(pool, RetryPolicy::default());
    let opts = EnqueueOptions {
        delay: Some(Duration::from_secs(60)),
        ..Default::default()
    };
    queue.enqueue(&daily("GYM"), opts, t0()).await.unwrap();
    assert!(queue.claim(t0() + secs(59)).await.unwrap().is_none());
    assert!(queue.claim(t0() + secs(60)).await.unwrap().is_some());
}

#[tokio::test]
async fn resync_keeps_exactly_one_trigger_per_group() {
    let pool = setup_pool().await;
    let queue = JobQueue::new(pool, RetryPolicy::default());
    let groups = vec![group("FOOTBALL"), group("GYM")];

    sync_recurring_triggers(&queue, &groups, "0 0 6 * * *", t0()).await.unwrap();
    sync_recurring_triggers(&queue, &groups, "0 0 6 * * *", t0()).await.unwrap();
    let keys: Vec<String> = queue.recurring().await.unwrap().into_iter().map(|r| r.key).collect();
    assert_eq!(keys, vec!["daily_batch:FOOTBALL", "daily_batch:GYM"]);

    sync_recurring_triggers(&queue, &groups[..1], "0 0 6 * * *", t0()).await.unwrap();
    let keys: Vec<String> = queue.recurring().await.unwrap().into_iter().map(|r| r.key).collect();
    assert_eq!(keys, vec!["daily_batch:FOOTBALL"]);
}

#[tokio::test]
async fn recurring_trigger_fires_once_per_due_time() {
    let pool = setup_pool().await;
    let queue = JobQueue::new(pool.clone(), RetryPolicy::default());
    let next = queue
        .add_recurring("daily_batch:GYM", &daily("GYM"), "0 0 6 * * *", t0())
        .await
        .unwrap();
    assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap());

    assert!(queue.fire_due_recurring(t0() + secs(3599)).await.unwrap().is_empty());
    let fired = queue.fire_due_recurring(t0() + secs(3630)).await.unwrap();
    assert_eq!(fired, vec![format!("daily_batch:GYM:{}", next.timestamp_millis())]);
    assert!(queue.fire_due_recurring(t0() + secs(3630)).await.unwrap().is_empty());

    // three missed days collapse into one run
    let later = t0() + ChronoDuration::days(3) + secs(3700);
    assert_eq!(queue.fire_due_recurring(later).await.unwrap().len(), 1);
    assert_eq!(db::count_jobs(&pool, JobStatus::Waiting).await.unwrap(), 2);

    let job = queue.claim(later).await.unwrap().unwrap();
    assert_eq!(job.payload, daily("GYM"));
}

#[tokio::test]
async fn stalled_jobs_are_released_or_failed() {
    let pool = setup_pool().await;
    let queue = JobQueue::new(pool.clone(), RetryPolicy::default());
    queue
        .enqueue(&daily("GYM"), EnqueueOptions::default(), t0())
        .await
        .unwrap();
    let single = EnqueueOptions {
        job_id: Some("single-shot".into()),
        max_attempts: Some(1),
        ..Default::default()
    };
    queue.enqueue(&daily("FOOTBALL"), single, t0()).await.unwrap();
    queue.claim(t0()).await.unwrap().unwrap();
    queue.claim(t0()).await.unwrap().unwrap();

    let stall = Duration::from_secs(1800);
    assert_eq!(queue.release_stalled(stall, t0() + secs(600)).await.unwrap(), 0);
    assert_eq!(queue.release_stalled(stall, t0() + secs(1900)).await.unwrap(), 2);

    let single = db::get_job(&pool, "single-shot").await.unwrap().unwrap();
    assert_eq!(single.status, JobStatus::Failed);
    let retried = queue.claim(t0() + secs(1900)).await.unwrap().unwrap();
    assert_eq!(retried.attempts, 2);
}

#[tokio::test]
async fn prune_keeps_newest_finished_jobs() {
    let pool = setup_pool().await;
    let queue = JobQueue::new(pool.clone(), RetryPolicy::default());
    for i in 0..5 {
        let now = t0() + secs(i);
        queue
            .enqueue(&daily("GYM"), EnqueueOptions::default(), now)
            .await
            .unwrap();
        let job = queue.claim(now).await.unwrap().unwrap();
        queue.complete(&job, &[], now).await.unwrap();
    }
    queue
        .enqueue(&daily("GYM"), EnqueueOptions::default(), t0())
        .await
        .unwrap();

    assert_eq!(queue.prune(2, 10).await.unwrap(), 3);
    assert_eq!(db::count_jobs(&pool, JobStatus::Completed).await.unwrap(), 2);
    assert_eq!(db::count_jobs(&pool, JobStatus::Waiting).await.unwrap(), 1);
}

#[tokio::test]
async fn operator_can_requeue_failed_job() {
    let pool = setup_pool().await;
    let queue = JobQueue::new(pool.clone(), RetryPolicy::default());
    let opts = EnqueueOptions {
        max_attempts: Some(1),
        ..Default::default()
    };
    let id = queue.enqueue(&daily("GYM"), opts, t0()).await.unwrap().unwrap();
    let job = queue.claim(t0()).await.unwrap().unwrap();
    queue.fail(&job, &anyhow!("down"), t0()).await.unwrap();

    assert!(db::requeue_failed_job(&pool, &id, t0() + secs(10)).await.unwrap());
    assert!(!db::requeue_failed_job(&pool, &id, t0() + secs(10)).await.unwrap());
    let job = queue.claim(t0() + secs(10)).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn broken_trigger_does_not_block_others() {
    let pool = setup_pool().await;
    let queue = JobQueue::new(pool.clone(), RetryPolicy::default());
    let broken = db::RecurringRecord {
        key: "daily_batch:BROKEN".into(),
        stage: "daily_batch".into(),
        payload: "{not json".into(),
        cron: "0 0 6 * * *".into(),
        next_run_at: t0(),
    };
    db::upsert_recurring(&pool, &broken, t0()).await.unwrap();
    let bad_cron = db::RecurringRecord {
        key: "daily_batch:BADCRON".into(),
        payload: daily("BADCRON").to_json().unwrap(),
        cron: "whenever".into(),
        ..broken.clone()
    };
    db::upsert_recurring(&pool, &bad_cron, t0()).await.unwrap();
    queue
        .add_recurring("daily_batch:GYM", &daily("GYM"), "0 0 6 * * *", t0())
        .await
        .unwrap();

    let fired = queue.fire_due_recurring(t0() + secs(3630)).await.unwrap();
    assert_eq!(fired.len(), 1);
    assert!(fired[0].starts_with("daily_batch:GYM:"));
    let job = queue.claim(t0() + secs(3630)).await.unwrap().unwrap();
    assert_eq!(job.payload, daily("GYM"));
}
