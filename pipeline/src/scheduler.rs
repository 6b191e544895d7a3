//! Stateless cron trigger: on every tick, compare each schedulable stream's
//! cron expression against the clock and enqueue sync jobs that are due.
//!
//! Nothing is stored between ticks. Missed ticks (process down, clock skew)
//! collapse into a single catch-up sync because due-ness is derived from
//! last_sync_at, not from a timer queue.

use chrono::{DateTime, Utc};
use cron::Schedule;
use metrics::counter;
use pipeline_core::{Error, Result};
use sqlx::PgPool;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::model::{JobSpec, SyncMode};
use crate::{queue, registry};

/// Parse a cron expression, accepting the common 5-field form by assuming
/// second zero.
fn parse_schedule(expr: &str) -> Result<Schedule> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    };

    Schedule::from_str(&normalized)
        .map_err(|e| Error::Validation(format!("invalid cron expression '{}': {}", expr, e)))
}

/// Whether a stream is due: a scheduled tick exists in (last_sync_at, now].
/// A stream that has never synced is due immediately.
fn is_due(expr: &str, last_sync_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Result<bool> {
    let schedule = parse_schedule(expr)?;

    match last_sync_at {
        None => Ok(true),
        Some(last) => Ok(schedule
            .after(&last)
            .next()
            .map(|tick| tick <= now)
            .unwrap_or(false)),
    }
}

/// One trigger pass: enqueue an incremental sync for every due stream that
/// does not already have an active sync job.
#[instrument(skip(db))]
pub async fn enqueue_due_streams(db: &PgPool, now: DateTime<Utc>) -> Result<u64> {
    let streams = registry::list_schedulable_streams(db).await?;
    let mut enqueued = 0u64;

    for stream in streams {
        let Some(expr) = &stream.cron_schedule else {
            continue;
        };

        let due = match is_due(expr, stream.last_sync_at, now) {
            Ok(due) => due,
            Err(e) => {
                // A bad expression on one stream must not stall the others.
                warn!(
                    source_id = %stream.source_id,
                    stream_name = %stream.stream_name,
                    error = %e,
                    "Skipping stream with invalid schedule"
                );
                continue;
            }
        };

        if !due {
            continue;
        }

        if has_active_sync(db, &stream).await? {
            debug!(
                source_id = %stream.source_id,
                stream_name = %stream.stream_name,
                "Sync already queued or running, skipping"
            );
            continue;
        }

        let spec = JobSpec::sync(stream.source_id, &stream.stream_name, SyncMode::Incremental);
        let job = queue::enqueue(db, spec).await?;
        enqueued += 1;

        info!(
            job_id = %job.id,
            source_id = %stream.source_id,
            stream_name = %stream.stream_name,
            "Scheduled sync enqueued"
        );
    }

    if enqueued > 0 {
        counter!("pipeline_scheduler_jobs_enqueued").increment(enqueued);
    }

    Ok(enqueued)
}

async fn has_active_sync(db: &PgPool, stream: &crate::model::Stream) -> Result<bool> {
    let active: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM elt.jobs
            WHERE job_type = 'sync'
              AND status IN ('pending', 'running')
              AND source_id = $1
              AND stream_name = $2
        )
        "#,
    )
    .bind(stream.source_id)
    .bind(&stream.stream_name)
    .fetch_one(db)
    .await?;

    Ok(active)
}

/// Trigger loop, one pass per `interval`. Runs until the task is dropped.
pub async fn run(db: PgPool, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(interval_secs = interval.as_secs(), "Scheduler started");

    loop {
        ticker.tick().await;
        if let Err(e) = enqueue_due_streams(&db, Utc::now()).await {
            warn!(error = %e, "Scheduler pass failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn five_field_expressions_are_accepted() {
        assert!(parse_schedule("*/15 * * * *").is_ok());
        assert!(parse_schedule("0 */15 * * * *").is_ok());
        assert!(parse_schedule("every hour").is_err());
    }

    #[test]
    fn never_synced_stream_is_due() {
        assert!(is_due("0 * * * *", None, ts("2025-06-01T10:07:00Z")).unwrap());
    }

    #[test]
    fn due_when_a_tick_passed_since_last_sync() {
        // Hourly at minute 0; last sync 09:30, now 10:05: the 10:00 tick passed.
        assert!(is_due(
            "0 * * * *",
            Some(ts("2025-06-01T09:30:00Z")),
            ts("2025-06-01T10:05:00Z"),
        )
        .unwrap());
    }

    #[test]
    fn not_due_before_next_tick() {
        // Last sync 10:01, now 10:30: next tick is 11:00.
        assert!(!is_due(
            "0 * * * *",
            Some(ts("2025-06-01T10:01:00Z")),
            ts("2025-06-01T10:30:00Z"),
        )
        .unwrap());
    }

    #[test]
    fn daily_schedule_spanning_midnight() {
        // Daily at 03:00; last sync yesterday 03:00, now 02:59: not due yet.
        assert!(!is_due(
            "0 3 * * *",
            Some(ts("2025-06-01T03:00:30Z")),
            ts("2025-06-02T02:59:00Z"),
        )
        .unwrap());

        assert!(is_due(
            "0 3 * * *",
            Some(ts("2025-06-01T03:00:30Z")),
            ts("2025-06-02T03:01:00Z"),
        )
        .unwrap());
    }

    #[test]
    fn invalid_expression_is_an_error() {
        let err = is_due("not cron", None, Utc::now()).unwrap_err();
        assert_eq!(err.class(), "validation_error");
    }
}
