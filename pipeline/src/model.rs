use chrono::{DateTime, Utc};
use pipeline_core::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Unit of orchestrated pipeline work.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum JobType {
    Sync,
    Transform,
    Archive,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobType::Sync => write!(f, "sync"),
            JobType::Transform => write!(f, "transform"),
            JobType::Archive => write!(f, "archive"),
        }
    }
}

impl std::str::FromStr for JobType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sync" => Ok(JobType::Sync),
            "transform" => Ok(JobType::Transform),
            "archive" => Ok(JobType::Archive),
            _ => Err(Error::Validation(format!("invalid job type: {}", s))),
        }
    }
}

/// Canonical status vocabulary. `succeeded` is the terminal success state;
/// older `completed` spellings are historical and not accepted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(Error::Validation(format!("invalid job status: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum SyncMode {
    FullRefresh,
    Incremental,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::FullRefresh => write!(f, "full_refresh"),
            SyncMode::Incremental => write!(f, "incremental"),
        }
    }
}

impl std::str::FromStr for SyncMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full_refresh" => Ok(SyncMode::FullRefresh),
            "incremental" => Ok(SyncMode::Incremental),
            _ => Err(Error::Validation(format!("invalid sync mode: {}", s))),
        }
    }
}

/// Shared job envelope. Type-specific fields are nullable columns in the
/// table; `payload()` projects them into the tagged variant.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: i32,

    pub source_id: Option<Uuid>,
    pub stream_name: Option<String>,
    pub sync_mode: Option<SyncMode>,
    pub transform_name: Option<String>,
    pub parent_job_id: Option<Uuid>,

    pub records_processed: i64,
    pub error_message: Option<String>,
    pub error_class: Option<String>,
    pub metadata: serde_json::Value,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Tagged view over the type-specific part of a [`Job`].
#[derive(Debug, Clone)]
pub enum JobPayload {
    Sync {
        source_id: Uuid,
        stream_name: String,
        mode: SyncMode,
    },
    Transform {
        source_id: Uuid,
        stream_name: String,
        transform_name: String,
    },
    Archive,
}

impl Job {
    pub fn payload(&self) -> Result<JobPayload> {
        match self.job_type {
            JobType::Sync => Ok(JobPayload::Sync {
                source_id: self
                    .source_id
                    .ok_or_else(|| Error::Validation("sync job missing source_id".into()))?,
                stream_name: self
                    .stream_name
                    .clone()
                    .ok_or_else(|| Error::Validation("sync job missing stream_name".into()))?,
                mode: self.sync_mode.unwrap_or(SyncMode::Incremental),
            }),
            JobType::Transform => Ok(JobPayload::Transform {
                source_id: self
                    .source_id
                    .ok_or_else(|| Error::Validation("transform job missing source_id".into()))?,
                stream_name: self
                    .stream_name
                    .clone()
                    .ok_or_else(|| Error::Validation("transform job missing stream_name".into()))?,
                transform_name: self.transform_name.clone().ok_or_else(|| {
                    Error::Validation("transform job missing transform_name".into())
                })?,
            }),
            JobType::Archive => Ok(JobPayload::Archive),
        }
    }
}

/// Submission surface request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_type: JobType,
    pub source_id: Option<Uuid>,
    pub stream_name: Option<String>,
    pub sync_mode: Option<SyncMode>,
    pub transform_name: Option<String>,
    pub priority: i32,
    pub parent_job_id: Option<Uuid>,
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl JobSpec {
    pub fn sync(source_id: Uuid, stream_name: impl Into<String>, mode: SyncMode) -> Self {
        Self {
            job_type: JobType::Sync,
            source_id: Some(source_id),
            stream_name: Some(stream_name.into()),
            sync_mode: Some(mode),
            transform_name: None,
            priority: 0,
            parent_job_id: None,
            depends_on: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn transform(
        source_id: Uuid,
        stream_name: impl Into<String>,
        transform_name: impl Into<String>,
    ) -> Self {
        Self {
            job_type: JobType::Transform,
            source_id: Some(source_id),
            stream_name: Some(stream_name.into()),
            sync_mode: None,
            transform_name: Some(transform_name.into()),
            priority: 0,
            parent_job_id: None,
            depends_on: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, job_id: Uuid) -> Self {
        self.depends_on.push(job_id);
        self
    }
}

/// One raw record as fetched from a provider and serialized to ndjson.
/// `id` is the provider-stable `source_stream_id` used for load-time
/// idempotency downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// A page of records pulled from a provider.
#[derive(Debug, Clone)]
pub struct ProviderPage {
    pub records: Vec<RawRecord>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// Immutable descriptor for a committed batch of archived raw records.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct StreamObject {
    pub id: Uuid,
    pub source_id: Uuid,
    pub stream_name: String,
    pub storage_key: String,
    pub record_count: i32,
    pub size_bytes: i64,
    pub min_timestamp: DateTime<Utc>,
    pub max_timestamp: DateTime<Utc>,
    pub archive_job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl StreamObject {
    /// Total order the checkpoint engine consumes objects in.
    pub fn position(&self) -> (DateTime<Utc>, &str) {
        (self.min_timestamp, self.storage_key.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum ArchiveStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for ArchiveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveStatus::Pending => write!(f, "pending"),
            ArchiveStatus::InProgress => write!(f, "in_progress"),
            ArchiveStatus::Completed => write!(f, "completed"),
            ArchiveStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Retryable task producing one [`StreamObject`].
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ArchiveJob {
    pub id: Uuid,
    pub sync_job_id: Option<Uuid>,
    pub source_id: Uuid,
    pub stream_name: String,
    pub storage_key: String,
    pub status: ArchiveStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub record_count: i32,
    pub size_bytes: i64,
    pub min_timestamp: Option<DateTime<Utc>>,
    pub max_timestamp: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ArchiveJob {
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Durable resume point for one (source, stream, transform) consumer.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TransformCheckpoint {
    pub id: Uuid,
    pub source_id: Uuid,
    pub stream_name: String,
    pub transform_name: String,
    pub last_storage_key: Option<String>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub last_stream_object_id: Option<Uuid>,
    pub objects_processed: i64,
    pub records_processed: i64,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl TransformCheckpoint {
    /// Whether `object` lies strictly beyond this checkpoint.
    pub fn precedes(&self, object: &StreamObject) -> bool {
        match (self.last_timestamp, self.last_storage_key.as_deref()) {
            (Some(ts), Some(key)) => object.position() > (ts, key),
            _ => true,
        }
    }
}

/// Authenticated external provider or paired device. Credentials never
/// leave the process through serialized views.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Source {
    pub id: Uuid,
    pub name: String,
    pub provider: String,
    pub auth_type: String,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub device_id: Option<String>,
    #[serde(skip_serializing)]
    pub pairing_code: Option<String>,
    pub pairing_status: Option<String>,
    pub code_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    pub device_token: Option<String>,
    pub is_active: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One named, independently scheduled feed from a source.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Stream {
    pub id: Uuid,
    pub source_id: Uuid,
    pub stream_name: String,
    pub cron_schedule: Option<String>,
    pub is_enabled: bool,
    pub last_sync_token: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn object(min_ts: &str, key: &str) -> StreamObject {
        StreamObject {
            id: Uuid::new_v4(),
            source_id: Uuid::new_v4(),
            stream_name: "healthkit".into(),
            storage_key: key.into(),
            record_count: 1,
            size_bytes: 1,
            min_timestamp: min_ts.parse().unwrap(),
            max_timestamp: min_ts.parse().unwrap(),
            archive_job_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn status_roundtrip() {
        for s in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(s.to_string().parse::<JobStatus>().unwrap(), s);
        }
        assert!("completed".parse::<JobStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn sync_mode_roundtrip() {
        assert_eq!(
            "full_refresh".parse::<SyncMode>().unwrap(),
            SyncMode::FullRefresh
        );
        assert!("sync_strategy".parse::<SyncMode>().is_err());
    }

    #[test]
    fn fresh_checkpoint_precedes_everything() {
        let ckpt = TransformCheckpoint {
            id: Uuid::new_v4(),
            source_id: Uuid::new_v4(),
            stream_name: "location".into(),
            transform_name: "location_visits".into(),
            last_storage_key: None,
            last_timestamp: None,
            last_stream_object_id: None,
            objects_processed: 0,
            records_processed: 0,
            last_run_at: None,
        };
        assert!(ckpt.precedes(&object("2025-01-01T00:00:00Z", "a")));
    }

    #[test]
    fn checkpoint_orders_by_timestamp_then_key() {
        let mut ckpt = TransformCheckpoint {
            id: Uuid::new_v4(),
            source_id: Uuid::new_v4(),
            stream_name: "location".into(),
            transform_name: "location_visits".into(),
            last_storage_key: Some("b".into()),
            last_timestamp: Some("2025-01-02T00:00:00Z".parse().unwrap()),
            last_stream_object_id: None,
            objects_processed: 1,
            records_processed: 10,
            last_run_at: None,
        };

        // Earlier timestamp: already consumed.
        assert!(!ckpt.precedes(&object("2025-01-01T00:00:00Z", "z")));
        // Same timestamp, earlier key: already consumed.
        assert!(!ckpt.precedes(&object("2025-01-02T00:00:00Z", "a")));
        // Same timestamp, later key: still ahead.
        assert!(ckpt.precedes(&object("2025-01-02T00:00:00Z", "c")));
        // Later timestamp: ahead regardless of key.
        assert!(ckpt.precedes(&object("2025-01-03T00:00:00Z", "a")));

        ckpt.last_storage_key = Some("zzz".into());
        assert!(ckpt.precedes(&object("2025-01-03T00:00:00Z", "aaa")));
    }

    #[test]
    fn retry_budget_boundary() {
        let mut job = ArchiveJob {
            id: Uuid::new_v4(),
            sync_job_id: None,
            source_id: Uuid::new_v4(),
            stream_name: "gmail".into(),
            storage_key: "k".into(),
            status: ArchiveStatus::Failed,
            retry_count: 2,
            max_retries: 3,
            record_count: 1,
            size_bytes: 1,
            min_timestamp: None,
            max_timestamp: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        };
        assert!(!job.retries_exhausted());

        job.retry_count = 3;
        assert!(job.retries_exhausted());
    }

    #[test]
    fn sync_payload_requires_stream() {
        let job = Job {
            id: Uuid::new_v4(),
            job_type: JobType::Sync,
            status: JobStatus::Pending,
            priority: 0,
            source_id: Some(Uuid::new_v4()),
            stream_name: None,
            sync_mode: Some(SyncMode::Incremental),
            transform_name: None,
            parent_job_id: None,
            records_processed: 0,
            error_message: None,
            error_class: None,
            metadata: serde_json::Value::Null,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(job.payload().is_err());
    }
}
