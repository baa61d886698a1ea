//! Per-task timer loop: one lightweight task per registry entry, waiting
//! on the next cron fire or the entry's close signal.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;

use crate::error::{CronmeshError, Result};
use crate::schedule::model::Trigger;
use crate::schedule::{Scheduler, TaskEntry};

/// Floor for the lock lease renewal interval; sub-second leases are
/// supported down to this bound.
pub const MIN_LEASE_QUARTER: Duration = Duration::from_millis(100);
pub const MAX_LEASE_QUARTER: Duration = Duration::from_secs(30);

/// Parse a cron expression. Five-field expressions get a zero seconds
/// column prepended, so both classic and seconds-resolution forms work.
pub fn parse_cron(expr: &str) -> Result<Schedule> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| CronmeshError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// A quarter of the task's fire interval, clamped to [100ms, 30s]. Used
/// as the run-lock lease and renewed at 3/4 of itself.
pub fn lease_quarter(expr: &str) -> Duration {
    let Ok(schedule) = parse_cron(expr) else {
        return MAX_LEASE_QUARTER;
    };
    let now = Utc::now();
    let Some(next) = schedule.after(&now).next() else {
        return MAX_LEASE_QUARTER;
    };
    let quarter = (next - now).to_std().unwrap_or_default() / 4;
    quarter.clamp(MIN_LEASE_QUARTER, MAX_LEASE_QUARTER)
}

pub(crate) async fn schedule_loop(scheduler: Arc<Scheduler>, entry: Arc<TaskEntry>) {
    let schedule = match parse_cron(&entry.cron_expr) {
        Ok(schedule) => schedule,
        Err(e) => {
            tracing::error!(task_id = %entry.id, error = %e, "cron parse failed, timer not started");
            return;
        }
    };
    tracing::info!(
        task_id = %entry.id,
        name = %entry.name,
        cron = %entry.cron_expr,
        "timer started"
    );

    loop {
        let now = Utc::now();
        let Some(next) = schedule.after(&now).next() else {
            tracing::warn!(task_id = %entry.id, "no future fire time, timer stopped");
            return;
        };
        // a backwards clock adjustment can put the fire in the past;
        // wait at least 1ms and recompute
        let wait = (next - now)
            .to_std()
            .unwrap_or(Duration::from_millis(1))
            .max(Duration::from_millis(1));

        tokio::select! {
            _ = entry.close.cancelled() => {
                tracing::info!(task_id = %entry.id, name = %entry.name, "timer closed");
                return;
            }
            _ = tokio::time::sleep(wait) => {
                if !entry.enabled {
                    tracing::warn!(task_id = %entry.id, name = %entry.name, "task disabled, fire skipped");
                    continue;
                }
                let scheduler = scheduler.clone();
                let fired = entry.clone();
                tokio::spawn(async move {
                    scheduler.start_run(fired, Trigger::Auto).await;
                });
            }
        }
    }
}
