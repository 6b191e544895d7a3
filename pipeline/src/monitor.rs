//! Operator-facing read models: pipeline health and the failed-work view.
//!
//! Everything here is read-only SQL over the queue, archive and checkpoint
//! tables; the CLI renders it as JSON.

use pipeline_core::Result;
use serde::Serialize;
use sqlx::PgPool;

use crate::archive;
use crate::model::{ArchiveJob, Job, JobStatus, TransformCheckpoint};

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct JobCount {
    pub job_type: String,
    pub status: String,
    pub count: i64,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct StreamHealth {
    pub source_name: String,
    pub provider: String,
    pub stream_name: String,
    pub is_enabled: bool,
    pub cron_schedule: Option<String>,
    pub last_sync_at: Option<chrono::DateTime<chrono::Utc>>,
    pub has_cursor: bool,
    pub archived_objects: i64,
}

#[derive(Debug, Serialize)]
pub struct PipelineStatus {
    pub job_counts: Vec<JobCount>,
    pub streams: Vec<StreamHealth>,
    pub checkpoints: Vec<TransformCheckpoint>,
}

/// Snapshot of queue depth, stream freshness and checkpoint progress.
pub async fn status(db: &PgPool) -> Result<PipelineStatus> {
    let job_counts: Vec<JobCount> = sqlx::query_as(
        r#"
        SELECT job_type, status, COUNT(*) AS count
        FROM elt.jobs
        GROUP BY job_type, status
        ORDER BY job_type, status
        "#,
    )
    .fetch_all(db)
    .await?;

    let streams: Vec<StreamHealth> = sqlx::query_as(
        r#"
        SELECT s.name AS source_name,
               s.provider,
               st.stream_name,
               st.is_enabled,
               st.cron_schedule,
               st.last_sync_at,
               st.last_sync_token IS NOT NULL AS has_cursor,
               (SELECT COUNT(*) FROM elt.stream_objects o
                WHERE o.source_id = st.source_id AND o.stream_name = st.stream_name)
                   AS archived_objects
        FROM elt.streams st
        JOIN elt.sources s ON s.id = st.source_id
        ORDER BY s.name, st.stream_name
        "#,
    )
    .fetch_all(db)
    .await?;

    let checkpoints: Vec<TransformCheckpoint> = sqlx::query_as(
        r#"
        SELECT id, source_id, stream_name, transform_name, last_storage_key,
               last_timestamp, last_stream_object_id, objects_processed,
               records_processed, last_run_at
        FROM elt.stream_transform_checkpoints
        ORDER BY stream_name, transform_name
        "#,
    )
    .fetch_all(db)
    .await?;

    Ok(PipelineStatus {
        job_counts,
        streams,
        checkpoints,
    })
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct DeadLetterCount {
    pub transform_name: String,
    pub stream_name: String,
    pub count: i64,
}

#[derive(Debug, Serialize)]
pub struct FailedWorkReport {
    /// Jobs that ended failed, newest first.
    pub failed_jobs: Vec<Job>,
    /// Terminally failed archive jobs. Raw data for these batches was never
    /// persisted.
    pub failed_archive_jobs: Vec<ArchiveJob>,
    /// Records rejected by transforms, grouped per transform and stream.
    pub dead_letters: Vec<DeadLetterCount>,
}

impl FailedWorkReport {
    pub fn is_clean(&self) -> bool {
        self.failed_jobs.is_empty()
            && self.failed_archive_jobs.is_empty()
            && self.dead_letters.is_empty()
    }
}

/// Everything that needs a human: failed jobs, archive jobs out of retries,
/// and dead-lettered records.
pub async fn failed_work(db: &PgPool, job_limit: i64) -> Result<FailedWorkReport> {
    let failed_jobs =
        crate::queue::query_jobs(db, None, Some(JobStatus::Failed), job_limit).await?;

    let failed_archive_jobs = archive::terminally_failed(db).await?;

    let dead_letters: Vec<DeadLetterCount> = sqlx::query_as(
        r#"
        SELECT d.transform_name, o.stream_name, COUNT(*) AS count
        FROM elt.transform_dead_letters d
        JOIN elt.stream_objects o ON o.id = d.stream_object_id
        GROUP BY d.transform_name, o.stream_name
        ORDER BY count DESC
        "#,
    )
    .fetch_all(db)
    .await?;

    Ok(FailedWorkReport {
        failed_jobs,
        failed_archive_jobs,
        dead_letters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_report_is_clean() {
        let report = FailedWorkReport {
            failed_jobs: Vec::new(),
            failed_archive_jobs: Vec::new(),
            dead_letters: Vec::new(),
        };
        assert!(report.is_clean());
    }

    #[test]
    fn dead_letters_make_report_dirty() {
        let report = FailedWorkReport {
            failed_jobs: Vec::new(),
            failed_archive_jobs: Vec::new(),
            dead_letters: vec![DeadLetterCount {
                transform_name: "events".into(),
                stream_name: "gmail".into(),
                count: 3,
            }],
        };
        assert!(!report.is_clean());
    }
}
