//! Daily trigger per group, plus queue housekeeping.
use crate::jobs::{DailyBatchJob, JobPayload};
use crate::model::Group;
use crate::queue::JobQueue;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, instrument};

pub fn trigger_key(group: &str) -> String {
    format!("daily_batch:{}", group)
}

/// Replace every registered trigger with one per configured group.
#[instrument(skip_all, fields(groups = groups.len()))]
pub async fn sync_recurring_triggers(
    queue: &JobQueue,
    groups: &[Group],
    cron_expr: &str,
    now: DateTime<Utc>,
) -> Result<usize> {
    for existing in queue.recurring().await? {
        queue.remove_recurring(&existing.key).await?;
    }
    for group in groups {
        let payload = JobPayload::DailyBatch(DailyBatchJob {
            group: group.clone(),
        });
        let next = queue
            .add_recurring(&trigger_key(&group.name), &payload, cron_expr, now)
            .await?;
        info!(group = %group.name, cron = cron_expr, %next, "daily batch scheduled");
    }
    Ok(groups.len())
}

#[derive(Debug, Clone, Copy)]
pub struct TriggerSettings {
    pub tick: Duration,
    pub maintenance_every: Duration,
    pub stall_timeout: Duration,
    pub keep_completed: u32,
    pub keep_failed: u32,
}

/// Recover stalled jobs and prune old finished ones.
pub async fn run_maintenance(queue: &JobQueue, settings: &TriggerSettings, now: DateTime<Utc>) -> Result<()> {
    let released = queue.release_stalled(settings.stall_timeout, now).await?;
    if released > 0 {
        info!(released, "released stalled jobs");
    }
    let pruned = queue.prune(settings.keep_completed, settings.keep_failed).await?;
    if pruned > 0 {
        info!(pruned, "pruned finished jobs");
    }
    Ok(())
}

/// Fire due triggers on every tick until shutdown.
pub async fn run_trigger_loop(queue: JobQueue, settings: TriggerSettings, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(settings.tick);
    let mut maintenance = tokio::time::interval(settings.maintenance_every);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Err(err) = queue.fire_due_recurring(Utc::now()).await {
                    error!(?err, "failed to fire recurring triggers");
                }
            }
            _ = maintenance.tick() => {
                if let Err(err) = run_maintenance(&queue, &settings, Utc::now()).await {
                    error!(?err, "queue maintenance failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("trigger loop stopped");
}
