//! Job queue: enqueue, atomic claim, completion, failure, cancellation.
//!
//! Claiming is a single locking read (`FOR UPDATE SKIP LOCKED`) so concurrent
//! workers never execute the same job. Jobs with unmet dependencies are
//! invisible to claim regardless of age.

use crate::dag;
use crate::model::{Job, JobSpec, JobStatus, JobType};
use metrics::counter;
use pipeline_core::{Error, Result};
use sqlx::PgPool;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, job_type, status, priority, source_id, stream_name, sync_mode, \
     transform_name, parent_job_id, records_processed, error_message, error_class, metadata, \
     started_at, completed_at, created_at, updated_at";

/// Insert a new pending job plus its dependency edges.
///
/// The row and every edge commit together: a rejected edge (cycle, missing
/// prerequisite) rolls the job back, so a half-gated job is never visible to
/// `claim_next`.
#[instrument(skip(db, spec), fields(job_type = %spec.job_type))]
pub async fn enqueue(db: &PgPool, spec: JobSpec) -> Result<Job> {
    validate_spec(&spec)?;

    let query = format!(
        r#"
        INSERT INTO elt.jobs (
            job_type, status, priority, source_id, stream_name,
            sync_mode, transform_name, parent_job_id, metadata
        ) VALUES ($1, 'pending', $2, $3, $4, $5, $6, $7, $8)
        RETURNING {JOB_COLUMNS}
        "#
    );

    let mut tx = db.begin().await?;

    let job: Job = sqlx::query_as(&query)
        .bind(spec.job_type)
        .bind(spec.priority)
        .bind(spec.source_id)
        .bind(&spec.stream_name)
        .bind(spec.sync_mode)
        .bind(&spec.transform_name)
        .bind(spec.parent_job_id)
        .bind(&spec.metadata)
        .fetch_one(&mut *tx)
        .await?;

    for dep in &spec.depends_on {
        dag::add_edge(&mut tx, job.id, *dep).await?;
    }

    tx.commit().await?;

    counter!("pipeline_jobs_enqueued", "job_type" => spec.job_type.to_string()).increment(1);

    info!(
        job_id = %job.id,
        job_type = %job.job_type,
        priority = job.priority,
        depends_on = spec.depends_on.len(),
        "Job enqueued"
    );

    Ok(job)
}

fn validate_spec(spec: &JobSpec) -> Result<()> {
    match spec.job_type {
        JobType::Sync => {
            if spec.source_id.is_none() || spec.stream_name.is_none() {
                return Err(Error::Validation(
                    "sync job requires source_id and stream_name".into(),
                ));
            }
        }
        JobType::Transform => {
            if spec.source_id.is_none()
                || spec.stream_name.is_none()
                || spec.transform_name.is_none()
            {
                return Err(Error::Validation(
                    "transform job requires source_id, stream_name and transform_name".into(),
                ));
            }
        }
        JobType::Archive => {}
    }

    let mut seen = std::collections::HashSet::new();
    for dep in &spec.depends_on {
        if !seen.insert(dep) {
            return Err(Error::Coordination(format!(
                "duplicate dependency {} in depends_on",
                dep
            )));
        }
    }

    Ok(())
}

/// Claim the next eligible pending job and atomically mark it running.
///
/// Eligibility: all dependency edges point at succeeded jobs, and for sync
/// jobs no other sync job is running for the same (source, stream). Ordering
/// is priority DESC, created_at ASC. `SKIP LOCKED` makes a concurrent
/// claimant pass over rows another worker holds.
#[instrument(skip(db))]
pub async fn claim_next(db: &PgPool) -> Result<Option<Job>> {
    let query = format!(
        r#"
        UPDATE elt.jobs
        SET status = 'running', started_at = NOW(), updated_at = NOW()
        WHERE id = (
            SELECT j.id
            FROM elt.jobs j
            WHERE j.status = 'pending'
              AND NOT EXISTS (
                  SELECT 1
                  FROM elt.job_dependencies d
                  JOIN elt.jobs dep ON dep.id = d.depends_on_job_id
                  WHERE d.job_id = j.id
                    AND dep.status <> 'succeeded'
              )
              AND (
                  j.job_type <> 'sync'
                  OR NOT EXISTS (
                      SELECT 1 FROM elt.jobs running
                      WHERE running.job_type = 'sync'
                        AND running.status = 'running'
                        AND running.source_id = j.source_id
                        AND running.stream_name = j.stream_name
                  )
              )
            ORDER BY j.priority DESC, j.created_at ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
        )
        RETURNING {JOB_COLUMNS}
        "#
    );

    let claimed: Option<Job> = sqlx::query_as(&query).fetch_optional(db).await?;

    if let Some(job) = &claimed {
        counter!("pipeline_jobs_claimed", "job_type" => job.job_type.to_string()).increment(1);
        debug!(job_id = %job.id, job_type = %job.job_type, "Claimed job");
    }

    Ok(claimed)
}

pub async fn get_job(db: &PgPool, job_id: Uuid) -> Result<Job> {
    let query = format!("SELECT {JOB_COLUMNS} FROM elt.jobs WHERE id = $1");
    sqlx::query_as(&query)
        .bind(job_id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))
}

/// Current status of a job, cheap enough for cooperative-cancellation polling
/// between record batches.
pub async fn job_status(db: &PgPool, job_id: Uuid) -> Result<JobStatus> {
    let status: Option<JobStatus> =
        sqlx::query_scalar("SELECT status FROM elt.jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(db)
            .await?;

    status.ok_or_else(|| Error::NotFound(format!("job {}", job_id)))
}

/// Mark a running job succeeded.
#[instrument(skip(db))]
pub async fn complete(db: &PgPool, job_id: Uuid, records_processed: i64) -> Result<()> {
    let updated = sqlx::query(
        r#"
        UPDATE elt.jobs
        SET status = 'succeeded',
            records_processed = $2,
            completed_at = NOW(),
            updated_at = NOW()
        WHERE id = $1 AND status = 'running'
        "#,
    )
    .bind(job_id)
    .bind(records_processed)
    .execute(db)
    .await?
    .rows_affected();

    if updated == 0 {
        return Err(Error::Coordination(format!(
            "invalid transition: job {} is not running",
            job_id
        )));
    }

    counter!("pipeline_jobs_succeeded").increment(1);
    info!(job_id = %job_id, records_processed, "Job succeeded");
    Ok(())
}

/// Mark a running job failed and cancel everything that depended on it.
#[instrument(skip(db, message))]
pub async fn fail(
    db: &PgPool,
    job_id: Uuid,
    error_class: &str,
    message: &str,
    retryable: bool,
) -> Result<()> {
    let updated = sqlx::query(
        r#"
        UPDATE elt.jobs
        SET status = 'failed',
            error_class = $2,
            error_message = $3,
            completed_at = NOW(),
            updated_at = NOW()
        WHERE id = $1 AND status = 'running'
        "#,
    )
    .bind(job_id)
    .bind(error_class)
    .bind(message)
    .execute(db)
    .await?
    .rows_affected();

    if updated == 0 {
        return Err(Error::Coordination(format!(
            "invalid transition: job {} is not running",
            job_id
        )));
    }

    counter!("pipeline_jobs_failed", "error_class" => error_class.to_string()).increment(1);
    warn!(job_id = %job_id, error_class, retryable, "Job failed");

    cascade_cancel_dependents(db, job_id).await?;
    Ok(())
}

/// Cancel a pending or running job; its dependents cascade to cancelled.
#[instrument(skip(db))]
pub async fn cancel(db: &PgPool, job_id: Uuid) -> Result<()> {
    let updated = sqlx::query(
        r#"
        UPDATE elt.jobs
        SET status = 'cancelled', completed_at = NOW(), updated_at = NOW()
        WHERE id = $1 AND status IN ('pending', 'running')
        "#,
    )
    .bind(job_id)
    .execute(db)
    .await?
    .rows_affected();

    if updated == 0 {
        return Err(Error::Coordination(format!(
            "job {} cannot be cancelled (not found or already terminal)",
            job_id
        )));
    }

    info!(job_id = %job_id, "Job cancelled");
    cascade_cancel_dependents(db, job_id).await?;
    Ok(())
}

/// A job that depends on a failed or cancelled prerequisite can never become
/// ready; mark the whole downstream closure cancelled rather than leaving it
/// pending forever.
async fn cascade_cancel_dependents(db: &PgPool, job_id: Uuid) -> Result<()> {
    let cancelled = sqlx::query(
        r#"
        WITH RECURSIVE downstream AS (
            SELECT job_id FROM elt.job_dependencies WHERE depends_on_job_id = $1
            UNION
            SELECT d.job_id
            FROM elt.job_dependencies d
            JOIN downstream ds ON d.depends_on_job_id = ds.job_id
        )
        UPDATE elt.jobs
        SET status = 'cancelled',
            error_class = 'dependency_failed',
            error_message = 'upstream job ' || $1::text || ' did not succeed',
            completed_at = NOW(),
            updated_at = NOW()
        WHERE id IN (SELECT job_id FROM downstream)
          AND status IN ('pending', 'running')
        "#,
    )
    .bind(job_id)
    .execute(db)
    .await?
    .rows_affected();

    if cancelled > 0 {
        counter!("pipeline_jobs_cascade_cancelled").increment(cancelled);
        warn!(
            upstream_job_id = %job_id,
            cancelled,
            "Cancelled dependent jobs after upstream failure"
        );
    }

    Ok(())
}

/// Query jobs for the status surface, newest first.
pub async fn query_jobs(
    db: &PgPool,
    source_id: Option<Uuid>,
    status: Option<JobStatus>,
    limit: i64,
) -> Result<Vec<Job>> {
    let query = format!(
        r#"
        SELECT {JOB_COLUMNS} FROM elt.jobs
        WHERE ($1::uuid IS NULL OR source_id = $1)
          AND ($2::text IS NULL OR status = $2)
        ORDER BY created_at DESC
        LIMIT $3
        "#
    );

    let jobs: Vec<Job> = sqlx::query_as(&query)
        .bind(source_id)
        .bind(status.map(|s| s.to_string()))
        .bind(limit)
        .fetch_all(db)
        .await?;

    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn sync_spec_requires_stream() {
        let spec = JobSpec {
            job_type: JobType::Sync,
            source_id: Some(Uuid::new_v4()),
            stream_name: None,
            sync_mode: None,
            transform_name: None,
            priority: 0,
            parent_job_id: None,
            depends_on: Vec::new(),
            metadata: serde_json::Value::Null,
        };
        assert!(validate_spec(&spec).is_err());
    }

    #[test]
    fn transform_spec_requires_transform_name() {
        let spec = JobSpec::transform(Uuid::new_v4(), "gmail", "email_events");
        assert!(validate_spec(&spec).is_ok());

        let mut broken = spec;
        broken.transform_name = None;
        assert!(validate_spec(&broken).is_err());
    }

    #[test]
    fn duplicate_dependencies_are_rejected() {
        let dep = Uuid::new_v4();
        let mut spec = JobSpec::transform(Uuid::new_v4(), "gmail", "email_events");
        spec.depends_on = vec![dep, dep];

        let err = validate_spec(&spec).expect_err("duplicate deps must fail");
        assert!(err.is_coordination());
    }

    // Rolled-back-on-error path needs live Postgres; the marker metadata lets
    // the test find (or prove the absence of) its own row.
    #[tokio::test]
    #[ignore = "needs DATABASE_URL pointing at a migrated database"]
    async fn failed_edge_insert_leaves_no_job_row() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .expect("connect to test database");

        let marker = Uuid::new_v4().to_string();
        let spec = JobSpec {
            job_type: JobType::Archive,
            source_id: None,
            stream_name: None,
            sync_mode: None,
            transform_name: None,
            priority: 0,
            parent_job_id: None,
            // Nonexistent prerequisite; the edge insert hits the FK.
            depends_on: vec![Uuid::new_v4()],
            metadata: serde_json::json!({ "marker": marker }),
        };

        enqueue(&pool, spec).await.expect_err("edge FK must fail");

        let orphans: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM elt.jobs WHERE metadata->>'marker' = $1",
        )
        .bind(&marker)
        .fetch_one(&pool)
        .await
        .expect("count");
        assert_eq!(orphans, 0);
    }

    #[test]
    fn archive_spec_needs_no_links() {
        let spec = JobSpec {
            job_type: JobType::Archive,
            source_id: None,
            stream_name: None,
            sync_mode: None,
            transform_name: None,
            priority: 0,
            parent_job_id: None,
            depends_on: Vec::new(),
            metadata: serde_json::Value::Null,
        };
        assert!(validate_spec(&spec).is_ok());
    }
}
