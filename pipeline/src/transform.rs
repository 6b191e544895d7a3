//! Transform-checkpoint engine: consumes archived stream objects in a total
//! order and loads them into ontology tables, resuming from a durable
//! per-(source, stream, transform) checkpoint.
//!
//! Consumption order is (min_timestamp, storage_key). Each object is loaded
//! in one transaction together with the checkpoint advance, so a crash
//! re-processes at most one object and the upsert keyed on source_stream_id
//! absorbs the replay.

use metrics::counter;
use once_cell::sync::Lazy;
use pipeline_core::{Error, Result};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::model::{Job, JobPayload, JobStatus, RawRecord, StreamObject, TransformCheckpoint};
use crate::queue;
use crate::storage::{decode_ndjson, ObjectStore};

const CHECKPOINT_COLUMNS: &str = "id, source_id, stream_name, transform_name, last_storage_key, \
     last_timestamp, last_stream_object_id, objects_processed, records_processed, last_run_at";

/// Objects loaded per advance call before yielding the claim back.
const OBJECTS_PER_BATCH: i64 = 50;

/// One row destined for `ontology.events`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRow {
    pub source_stream_id: String,
    pub kind: String,
    pub occurred_at: chrono::DateTime<chrono::Utc>,
    pub payload: serde_json::Value,
}

/// Maps raw records into ontology rows. Per-record failures are reported as
/// messages and dead-lettered; they never abort the object.
pub trait RecordMapper: Send + Sync {
    fn name(&self) -> &'static str;

    fn applies_to(&self, stream_name: &str) -> bool;

    /// `Ok(None)` drops the record silently (not every raw record maps to an
    /// ontology row); `Err` dead-letters it.
    fn map(
        &self,
        stream_name: &str,
        record: &RawRecord,
    ) -> std::result::Result<Option<EventRow>, String>;
}

/// Default mapper: any stream's records become events, taking `kind` from
/// the payload when present and falling back to the stream name.
struct EventMapper;

impl RecordMapper for EventMapper {
    fn name(&self) -> &'static str {
        "events"
    }

    fn applies_to(&self, _stream_name: &str) -> bool {
        true
    }

    fn map(
        &self,
        stream_name: &str,
        record: &RawRecord,
    ) -> std::result::Result<Option<EventRow>, String> {
        let payload = match &record.payload {
            serde_json::Value::Object(_) => record.payload.clone(),
            serde_json::Value::Null => serde_json::json!({}),
            other => {
                return Err(format!(
                    "payload must be a JSON object, got {}",
                    json_type_name(other)
                ))
            }
        };

        let kind = payload
            .get("kind")
            .and_then(|v| v.as_str())
            .unwrap_or(stream_name)
            .to_string();

        Ok(Some(EventRow {
            source_stream_id: record.id.clone(),
            kind,
            occurred_at: record.timestamp,
            payload,
        }))
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

static MAPPERS: Lazy<Vec<Box<dyn RecordMapper>>> = Lazy::new(|| vec![Box::new(EventMapper)]);

/// Transform names to chain after a sync of `stream_name`.
pub fn transforms_for_stream(stream_name: &str) -> Vec<&'static str> {
    MAPPERS
        .iter()
        .filter(|m| m.applies_to(stream_name))
        .map(|m| m.name())
        .collect()
}

fn mapper(transform_name: &str) -> Option<&'static dyn RecordMapper> {
    MAPPERS
        .iter()
        .find(|m| m.name() == transform_name)
        .map(|m| m.as_ref())
}

#[derive(Debug, Default)]
pub struct AdvanceOutcome {
    pub objects_consumed: u64,
    pub records_loaded: u64,
    pub records_skipped: u64,
    pub dead_lettered: u64,
    pub cancelled: bool,
}

pub struct TransformEngine {
    db: PgPool,
    store: Arc<dyn ObjectStore>,
}

impl TransformEngine {
    pub fn new(db: PgPool, store: Arc<dyn ObjectStore>) -> Self {
        Self { db, store }
    }

    /// Execute a claimed transform job: consume every archived object past
    /// the checkpoint, in order.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn run(&self, job: &Job) -> Result<AdvanceOutcome> {
        let (source_id, stream_name, transform_name) = match job.payload()? {
            JobPayload::Transform {
                source_id,
                stream_name,
                transform_name,
            } => (source_id, stream_name, transform_name),
            _ => {
                return Err(Error::Validation(format!(
                    "job {} is not a transform job",
                    job.id
                )))
            }
        };

        let mut outcome = AdvanceOutcome::default();
        loop {
            if queue::job_status(&self.db, job.id).await? == JobStatus::Cancelled {
                info!(job_id = %job.id, "Transform cancelled, stopping at object boundary");
                outcome.cancelled = true;
                return Ok(outcome);
            }

            let batch = self
                .advance(source_id, &stream_name, &transform_name)
                .await?;

            let drained = batch.objects_consumed < OBJECTS_PER_BATCH as u64;

            outcome.objects_consumed += batch.objects_consumed;
            outcome.records_loaded += batch.records_loaded;
            outcome.records_skipped += batch.records_skipped;
            outcome.dead_lettered += batch.dead_lettered;

            if drained {
                return Ok(outcome);
            }
        }
    }

    /// Consume up to one batch of objects beyond the checkpoint.
    ///
    /// Aborts without advancing on structural errors (undecodable object,
    /// unknown transform); those need code or data fixes, not retries.
    #[instrument(skip(self))]
    pub async fn advance(
        &self,
        source_id: Uuid,
        stream_name: &str,
        transform_name: &str,
    ) -> Result<AdvanceOutcome> {
        let mapper = mapper(transform_name)
            .ok_or_else(|| Error::Structural(format!("unknown transform '{}'", transform_name)))?;

        let checkpoint = self
            .load_or_create_checkpoint(source_id, stream_name, transform_name)
            .await?;

        let objects = self.objects_beyond(&checkpoint).await?;
        let mut outcome = AdvanceOutcome::default();

        for object in objects {
            let body = self.store.get(&object.storage_key).await?;
            let records = decode_ndjson(&body)?;

            let loaded = self
                .load_object(mapper, &checkpoint, &object, &records)
                .await?;

            outcome.objects_consumed += 1;
            outcome.records_loaded += loaded.loaded;
            outcome.records_skipped += loaded.skipped;
            outcome.dead_lettered += loaded.dead_lettered;

            counter!("pipeline_transform_objects_consumed", "transform" => transform_name.to_string())
                .increment(1);
        }

        if outcome.objects_consumed > 0 {
            info!(
                source_id = %source_id,
                stream_name,
                transform_name,
                objects = outcome.objects_consumed,
                records = outcome.records_loaded,
                dead_lettered = outcome.dead_lettered,
                "Checkpoint advanced"
            );
        }

        Ok(outcome)
    }

    async fn load_or_create_checkpoint(
        &self,
        source_id: Uuid,
        stream_name: &str,
        transform_name: &str,
    ) -> Result<TransformCheckpoint> {
        sqlx::query(
            r#"
            INSERT INTO elt.stream_transform_checkpoints (source_id, stream_name, transform_name)
            VALUES ($1, $2, $3)
            ON CONFLICT (source_id, stream_name, transform_name) DO NOTHING
            "#,
        )
        .bind(source_id)
        .bind(stream_name)
        .bind(transform_name)
        .execute(&self.db)
        .await?;

        let query = format!(
            r#"
            SELECT {CHECKPOINT_COLUMNS}
            FROM elt.stream_transform_checkpoints
            WHERE source_id = $1 AND stream_name = $2 AND transform_name = $3
            "#
        );

        Ok(sqlx::query_as(&query)
            .bind(source_id)
            .bind(stream_name)
            .bind(transform_name)
            .fetch_one(&self.db)
            .await?)
    }

    /// Objects strictly beyond the checkpoint in (min_timestamp, storage_key)
    /// order. Row-value comparison matches `StreamObject::position`.
    async fn objects_beyond(&self, checkpoint: &TransformCheckpoint) -> Result<Vec<StreamObject>> {
        let query = r#"
            SELECT id, source_id, stream_name, storage_key, record_count, size_bytes,
                   min_timestamp, max_timestamp, archive_job_id, created_at
            FROM elt.stream_objects
            WHERE source_id = $1
              AND stream_name = $2
              AND ($3::timestamptz IS NULL OR (min_timestamp, storage_key) > ($3, $4))
            ORDER BY min_timestamp ASC, storage_key ASC
            LIMIT $5
        "#;

        Ok(sqlx::query_as(query)
            .bind(checkpoint.source_id)
            .bind(&checkpoint.stream_name)
            .bind(checkpoint.last_timestamp)
            .bind(&checkpoint.last_storage_key)
            .bind(OBJECTS_PER_BATCH)
            .fetch_all(&self.db)
            .await?)
    }

    /// Load one object's records and advance the checkpoint in a single
    /// transaction.
    async fn load_object(
        &self,
        mapper: &dyn RecordMapper,
        checkpoint: &TransformCheckpoint,
        object: &StreamObject,
        records: &[RawRecord],
    ) -> Result<LoadCounts> {
        let mut tx = self.db.begin().await?;
        let mut counts = LoadCounts::default();

        for record in records {
            match mapper.map(&object.stream_name, record) {
                Ok(Some(row)) => {
                    sqlx::query(
                        r#"
                        INSERT INTO ontology.events (
                            source_stream_id, source_id, stream_name, kind, occurred_at, payload
                        ) VALUES ($1, $2, $3, $4, $5, $6)
                        ON CONFLICT (source_stream_id) DO UPDATE SET
                            kind = EXCLUDED.kind,
                            occurred_at = EXCLUDED.occurred_at,
                            payload = EXCLUDED.payload,
                            updated_at = NOW()
                        "#,
                    )
                    .bind(&row.source_stream_id)
                    .bind(object.source_id)
                    .bind(&object.stream_name)
                    .bind(&row.kind)
                    .bind(row.occurred_at)
                    .bind(&row.payload)
                    .execute(&mut *tx)
                    .await?;

                    counts.loaded += 1;
                }
                Ok(None) => counts.skipped += 1,
                Err(message) => {
                    sqlx::query(
                        r#"
                        INSERT INTO elt.transform_dead_letters (
                            stream_object_id, transform_name, source_stream_id, error
                        ) VALUES ($1, $2, $3, $4)
                        "#,
                    )
                    .bind(object.id)
                    .bind(mapper.name())
                    .bind(&record.id)
                    .bind(&message)
                    .execute(&mut *tx)
                    .await?;

                    counts.dead_lettered += 1;
                    warn!(
                        stream_object_id = %object.id,
                        source_stream_id = %record.id,
                        error = %message,
                        "Record dead-lettered"
                    );
                }
            }
        }

        // Monotonic guard: a concurrent consumer that already advanced past
        // this object leaves 0 rows, and this load must roll back.
        let advanced = sqlx::query(
            r#"
            UPDATE elt.stream_transform_checkpoints
            SET last_storage_key = $2,
                last_timestamp = $3,
                last_stream_object_id = $4,
                objects_processed = objects_processed + 1,
                records_processed = records_processed + $5,
                last_run_at = NOW()
            WHERE id = $1
              AND (
                  last_timestamp IS NULL
                  OR (last_timestamp, last_storage_key) < ($3, $2)
              )
            "#,
        )
        .bind(checkpoint.id)
        .bind(&object.storage_key)
        .bind(object.min_timestamp)
        .bind(object.id)
        .bind(counts.loaded as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if advanced == 0 {
            tx.rollback().await?;
            return Err(Error::Coordination(format!(
                "checkpoint {} moved past object {} concurrently",
                checkpoint.id, object.storage_key
            )));
        }

        tx.commit().await?;

        if counts.dead_lettered > 0 {
            counter!("pipeline_transform_dead_letters", "transform" => mapper.name().to_string())
                .increment(counts.dead_lettered);
        }

        Ok(counts)
    }
}

#[derive(Debug, Default)]
struct LoadCounts {
    loaded: u64,
    skipped: u64,
    dead_lettered: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn record(id: &str, payload: serde_json::Value) -> RawRecord {
        RawRecord {
            id: id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    #[test]
    fn default_mapper_registered_for_every_stream() {
        assert_eq!(transforms_for_stream("gmail"), vec!["events"]);
        assert_eq!(transforms_for_stream("healthkit"), vec!["events"]);
        assert!(mapper("events").is_some());
        assert!(mapper("nonexistent").is_none());
    }

    #[test]
    fn event_mapper_takes_kind_from_payload() {
        let row = EventMapper
            .map("gmail", &record("m-1", serde_json::json!({"kind": "email_received"})))
            .unwrap()
            .unwrap();

        assert_eq!(row.kind, "email_received");
        assert_eq!(row.source_stream_id, "m-1");
    }

    #[test]
    fn event_mapper_falls_back_to_stream_name() {
        let row = EventMapper
            .map("location", &record("p-1", serde_json::json!({"lat": 1.0})))
            .unwrap()
            .unwrap();

        assert_eq!(row.kind, "location");
    }

    #[test]
    fn null_payload_becomes_empty_object() {
        let row = EventMapper
            .map("steps", &record("s-1", serde_json::Value::Null))
            .unwrap()
            .unwrap();

        assert_eq!(row.payload, serde_json::json!({}));
    }

    #[test]
    fn scalar_payload_is_rejected() {
        let err = EventMapper
            .map("steps", &record("s-2", serde_json::json!(42)))
            .unwrap_err();

        assert!(err.contains("number"));
    }
}
