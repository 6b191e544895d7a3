//! Archival subsystem: drains in-memory pages of raw records into immutable,
//! content-addressed ndjson objects, tracking every attempt as an ArchiveJob
//! with a bounded retry budget.

use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use metrics::counter;
use pipeline_core::backoff::create_backoff;
use pipeline_core::{Error, Result};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::model::{ArchiveJob, RawRecord, StreamObject};
use crate::storage::{encode_ndjson, ObjectStore, StreamKey};

const ARCHIVE_JOB_COLUMNS: &str = "id, sync_job_id, source_id, stream_name, storage_key, status, \
     retry_count, max_retries, record_count, size_bytes, min_timestamp, max_timestamp, \
     error_message, started_at, completed_at, created_at";

const STREAM_OBJECT_COLUMNS: &str = "id, source_id, stream_name, storage_key, record_count, \
     size_bytes, min_timestamp, max_timestamp, archive_job_id, created_at";

pub struct Archiver {
    db: PgPool,
    store: Arc<dyn ObjectStore>,
    max_retries: u32,
    retry_base_delay_ms: u64,
    write_timeout: Duration,
}

impl Archiver {
    pub fn new(
        db: PgPool,
        store: Arc<dyn ObjectStore>,
        max_retries: u32,
        retry_base_delay_ms: u64,
        write_timeout: Duration,
    ) -> Self {
        Self {
            db,
            store,
            max_retries,
            retry_base_delay_ms,
            write_timeout,
        }
    }

    /// Persist one page of records as a StreamObject.
    ///
    /// The storage key embeds a fingerprint of the batch, so retrying the
    /// same logical page converges on the same key: if the object is already
    /// recorded the existing StreamObject is returned and nothing is written.
    #[instrument(skip(self, records), fields(record_count = records.len()))]
    pub async fn flush(
        &self,
        sync_job_id: Option<Uuid>,
        source_id: Uuid,
        provider: &str,
        stream_name: &str,
        records: &[RawRecord],
    ) -> Result<StreamObject> {
        // Timestamp range comes from the batch itself; providers deliver
        // out-of-order and backfilled records.
        let (min_timestamp, max_timestamp) = batch_bounds(records)
            .ok_or_else(|| Error::Validation("cannot archive an empty batch".into()))?;

        let storage_key =
            storage_key_for(provider, source_id, stream_name, min_timestamp, records);

        if let Some(existing) = self.find_stream_object(&storage_key).await? {
            info!(
                storage_key = %storage_key,
                stream_object_id = %existing.id,
                "Batch already archived, reusing stream object"
            );
            return Ok(existing);
        }

        let body = encode_ndjson(records)?;
        let size_bytes = body.len() as i64;

        let archive_job_id = self
            .create_archive_job(
                sync_job_id,
                source_id,
                stream_name,
                &storage_key,
                records.len() as i32,
                size_bytes,
                min_timestamp,
                max_timestamp,
            )
            .await?;

        let mut backoff = create_backoff(self.max_retries, self.retry_base_delay_ms);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.mark_in_progress(archive_job_id).await?;

            match self.write_object(&storage_key, body.clone()).await {
                Ok(()) => {
                    let object = self
                        .commit_stream_object(
                            archive_job_id,
                            source_id,
                            stream_name,
                            &storage_key,
                            records.len() as i32,
                            size_bytes,
                            min_timestamp,
                            max_timestamp,
                        )
                        .await?;

                    counter!("pipeline_archive_objects_written").increment(1);
                    counter!("pipeline_archive_records_written")
                        .increment(records.len() as u64);

                    info!(
                        archive_job_id = %archive_job_id,
                        storage_key = %storage_key,
                        size_bytes,
                        "Archive flush completed"
                    );
                    return Ok(object);
                }
                Err(Error::IdempotencyViolation(_)) => {
                    // The object landed on a previous attempt (or a racing
                    // worker) before its metadata row was committed. The key
                    // is content-derived, so the stored bytes are this batch.
                    warn!(
                        storage_key = %storage_key,
                        "Object already in storage without metadata, adopting it"
                    );
                    let object = self
                        .commit_stream_object(
                            archive_job_id,
                            source_id,
                            stream_name,
                            &storage_key,
                            records.len() as i32,
                            size_bytes,
                            min_timestamp,
                            max_timestamp,
                        )
                        .await?;
                    return Ok(object);
                }
                // Pending rows always have retry_count < max_retries; the
                // final attempt's failure is recorded by mark_failed.
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    self.mark_retry(archive_job_id, &e.to_string()).await?;
                    counter!("pipeline_archive_retries").increment(1);

                    let delay = backoff
                        .next_backoff()
                        .unwrap_or(Duration::from_millis(self.retry_base_delay_ms));
                    warn!(
                        archive_job_id = %archive_job_id,
                        attempt,
                        retry_after_ms = delay.as_millis(),
                        error = %e,
                        "Archive write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.mark_failed(archive_job_id, &e.to_string()).await?;
                    counter!("pipeline_archive_failures").increment(1);
                    error!(
                        archive_job_id = %archive_job_id,
                        storage_key = %storage_key,
                        error = %e,
                        "Archive job permanently failed, operator attention required"
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn write_object(&self, key: &str, body: bytes::Bytes) -> Result<()> {
        tokio::time::timeout(self.write_timeout, self.store.put_if_absent(key, body))
            .await
            .map_err(|_| Error::Timeout(self.write_timeout.as_secs()))?
    }

    async fn find_stream_object(&self, storage_key: &str) -> Result<Option<StreamObject>> {
        let query = format!(
            "SELECT {STREAM_OBJECT_COLUMNS} FROM elt.stream_objects WHERE storage_key = $1"
        );
        Ok(sqlx::query_as(&query)
            .bind(storage_key)
            .fetch_optional(&self.db)
            .await?)
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_archive_job(
        &self,
        sync_job_id: Option<Uuid>,
        source_id: Uuid,
        stream_name: &str,
        storage_key: &str,
        record_count: i32,
        size_bytes: i64,
        min_timestamp: DateTime<Utc>,
        max_timestamp: DateTime<Utc>,
    ) -> Result<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO elt.archive_jobs (
                sync_job_id, source_id, stream_name, storage_key, status,
                max_retries, record_count, size_bytes, min_timestamp, max_timestamp
            ) VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(sync_job_id)
        .bind(source_id)
        .bind(stream_name)
        .bind(storage_key)
        .bind(self.max_retries as i32)
        .bind(record_count)
        .bind(size_bytes)
        .bind(min_timestamp)
        .bind(max_timestamp)
        .fetch_one(&self.db)
        .await?;

        Ok(id)
    }

    async fn mark_in_progress(&self, archive_job_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE elt.archive_jobs SET status = 'in_progress', started_at = NOW() WHERE id = $1",
        )
        .bind(archive_job_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn mark_retry(&self, archive_job_id: Uuid, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE elt.archive_jobs
            SET status = 'pending', retry_count = retry_count + 1, error_message = $2
            WHERE id = $1
            "#,
        )
        .bind(archive_job_id)
        .bind(message)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, archive_job_id: Uuid, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE elt.archive_jobs
            SET status = 'failed',
                retry_count = retry_count + 1,
                error_message = $2,
                completed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(archive_job_id)
        .bind(message)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Record the StreamObject and complete the archive job in one
    /// transaction; a flush either leaves both rows or neither.
    #[allow(clippy::too_many_arguments)]
    async fn commit_stream_object(
        &self,
        archive_job_id: Uuid,
        source_id: Uuid,
        stream_name: &str,
        storage_key: &str,
        record_count: i32,
        size_bytes: i64,
        min_timestamp: DateTime<Utc>,
        max_timestamp: DateTime<Utc>,
    ) -> Result<StreamObject> {
        let mut tx = self.db.begin().await?;

        let query = format!(
            r#"
            INSERT INTO elt.stream_objects (
                source_id, stream_name, storage_key, record_count, size_bytes,
                min_timestamp, max_timestamp, archive_job_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {STREAM_OBJECT_COLUMNS}
            "#
        );

        let object: StreamObject = sqlx::query_as(&query)
            .bind(source_id)
            .bind(stream_name)
            .bind(storage_key)
            .bind(record_count)
            .bind(size_bytes)
            .bind(min_timestamp)
            .bind(max_timestamp)
            .bind(archive_job_id)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE elt.archive_jobs
            SET status = 'completed',
                started_at = COALESCE(started_at, NOW()),
                completed_at = NOW(),
                error_message = NULL
            WHERE id = $1
            "#,
        )
        .bind(archive_job_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(object)
    }
}

/// Crash cleanup, run by claimed `archive`-type jobs: any archive job still
/// non-terminal after its parent sync job reached a terminal state lost its
/// in-memory records and can never complete. Fail it so the monitor surfaces
/// it instead of it idling as pending forever.
#[instrument(skip(db))]
pub async fn reconcile(db: &PgPool) -> Result<u64> {
    let reconciled = sqlx::query(
        r#"
        UPDATE elt.archive_jobs a
        SET status = 'failed',
            started_at = COALESCE(a.started_at, NOW()),
            error_message = 'orphaned by terminal sync job',
            completed_at = NOW()
        FROM elt.jobs j
        WHERE a.sync_job_id = j.id
          AND a.status IN ('pending', 'in_progress')
          AND j.status IN ('succeeded', 'failed', 'cancelled')
          AND NOT EXISTS (
              SELECT 1 FROM elt.stream_objects o WHERE o.archive_job_id = a.id
          )
        "#,
    )
    .execute(db)
    .await?
    .rows_affected();

    if reconciled > 0 {
        warn!(reconciled, "Failed orphaned archive jobs");
        counter!("pipeline_archive_jobs_reconciled").increment(reconciled);
    }

    Ok(reconciled)
}

/// Inclusive timestamp range of a batch, or `None` when it is empty.
fn batch_bounds(records: &[RawRecord]) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let min = records.iter().map(|r| r.timestamp).min()?;
    let max = records.iter().map(|r| r.timestamp).max()?;
    Some((min, max))
}

/// Storage key for a batch. Every component, the date partition included, is
/// derived from the records themselves, so a retried flush converges on the
/// same key no matter when it runs.
fn storage_key_for(
    provider: &str,
    source_id: Uuid,
    stream_name: &str,
    min_timestamp: DateTime<Utc>,
    records: &[RawRecord],
) -> String {
    StreamKey::new(provider, source_id, stream_name, min_timestamp.date_naive()).build(records)
}

/// Terminally failed archive jobs: retry budget burned, or orphaned by a
/// crashed sync. Their raw batches were never persisted, so every row here
/// is unrecoverable without intervention.
pub async fn terminally_failed(db: &PgPool) -> Result<Vec<ArchiveJob>> {
    let query = format!(
        r#"
        SELECT {ARCHIVE_JOB_COLUMNS}
        FROM elt.archive_jobs
        WHERE status = 'failed'
        ORDER BY created_at DESC
        "#
    );
    Ok(sqlx::query_as(&query).fetch_all(db).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn record_at(id: &str, ts: DateTime<Utc>) -> RawRecord {
        RawRecord {
            id: id.into(),
            timestamp: ts,
            payload: serde_json::json!({}),
        }
    }

    #[test]
    fn batch_bounds_empty_is_none() {
        assert_eq!(batch_bounds(&[]), None);
    }

    #[test]
    fn batch_bounds_ignores_record_order() {
        let early = Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2025, 1, 2, 9, 30, 0).unwrap();
        let mid = Utc.with_ymd_and_hms(2025, 1, 1, 23, 59, 59).unwrap();

        let records = vec![
            record_at("b", late),
            record_at("a", early),
            record_at("c", mid),
        ];

        assert_eq!(batch_bounds(&records), Some((early, late)));
    }

    #[test]
    fn batch_bounds_single_record() {
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        assert_eq!(batch_bounds(&[record_at("only", ts)]), Some((ts, ts)));
    }

    #[test]
    fn storage_key_date_comes_from_the_batch() {
        let early = Utc.with_ymd_and_hms(2025, 1, 1, 23, 50, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2025, 1, 2, 0, 10, 0).unwrap();
        let records = vec![record_at("b", late), record_at("a", early)];

        let source_id = Uuid::new_v4();
        let (min, _) = batch_bounds(&records).unwrap();
        let key = storage_key_for("gmail", source_id, "messages", min, &records);

        // Partitioned under the batch's earliest day, not the wall clock.
        assert!(key.contains("date=2025-01-01"), "{key}");
        assert_eq!(
            key,
            storage_key_for("gmail", source_id, "messages", min, &records)
        );
    }
}
