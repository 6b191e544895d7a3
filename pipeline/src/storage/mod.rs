//! Object storage for archived stream batches: write-once ndjson files under
//! a deterministic key layout.

pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDate;
use pipeline_core::{Error, Result};
use uuid::Uuid;

use crate::model::RawRecord;

pub use s3::S3Store;

/// Write-once, read-many blob store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `body` under `key`, failing with `IdempotencyViolation` if the
    /// key already exists. Objects are never overwritten.
    async fn put_if_absent(&self, key: &str, body: Bytes) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Bytes>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn health_check(&self) -> Result<()>;
}

/// Deterministic key layout:
/// `streams/{provider}/{source_id}/{stream_name}/date={YYYY-MM-DD}/records_{fingerprint}.ndjson`
///
/// The fingerprint is computed from the batch content, so a retried flush of
/// the same logical batch maps to the same key.
#[derive(Debug, Clone)]
pub struct StreamKey {
    provider: String,
    source_id: Uuid,
    stream_name: String,
    date: NaiveDate,
}

impl StreamKey {
    pub fn new(
        provider: impl Into<String>,
        source_id: Uuid,
        stream_name: impl Into<String>,
        date: NaiveDate,
    ) -> Self {
        Self {
            provider: provider.into(),
            source_id,
            stream_name: stream_name.into(),
            date,
        }
    }

    pub fn build(&self, records: &[RawRecord]) -> String {
        format!(
            "streams/{}/{}/{}/date={}/records_{:016x}.ndjson",
            self.provider,
            self.source_id,
            self.stream_name,
            self.date.format("%Y-%m-%d"),
            batch_fingerprint(records),
        )
    }
}

/// FNV-1a over the record ids. Stable across processes, unlike the stdlib
/// hasher, which is all the idempotent-retry contract needs.
fn batch_fingerprint(records: &[RawRecord]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x1000_0000_01b3;

    let mut hash = FNV_OFFSET;
    for record in records {
        for byte in record.id.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash ^= 0x1e;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Serialize a batch to newline-delimited JSON.
pub fn encode_ndjson(records: &[RawRecord]) -> Result<Bytes> {
    let mut out = Vec::with_capacity(records.len() * 128);
    for record in records {
        serde_json::to_writer(&mut out, record)?;
        out.push(b'\n');
    }
    Ok(Bytes::from(out))
}

/// Parse an archived ndjson object. A malformed line is a structural error;
/// archived objects are immutable so this never succeeds on retry.
pub fn decode_ndjson(data: &[u8]) -> Result<Vec<RawRecord>> {
    let text = std::str::from_utf8(data)
        .map_err(|e| Error::Structural(format!("archived object is not UTF-8: {}", e)))?;

    let mut records = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        let record: RawRecord = serde_json::from_str(line).map_err(|e| {
            Error::Structural(format!("malformed record at line {}: {}", line_no + 1, e))
        })?;
        records.push(record);
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn record(id: &str) -> RawRecord {
        RawRecord {
            id: id.into(),
            timestamp: Utc::now(),
            payload: serde_json::json!({"v": 1}),
        }
    }

    #[test]
    fn key_layout_is_stable() {
        let source_id: Uuid = "550e8400-e29b-41d4-a716-446655440000".parse().unwrap();
        let key = StreamKey::new(
            "google",
            source_id,
            "gmail",
            NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
        );
        let built = key.build(&[record("msg-1"), record("msg-2")]);

        assert!(built.starts_with(
            "streams/google/550e8400-e29b-41d4-a716-446655440000/gmail/date=2025-01-15/records_"
        ));
        assert!(built.ends_with(".ndjson"));
    }

    #[test]
    fn same_batch_same_key() {
        let source_id = Uuid::new_v4();
        let date = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let key = StreamKey::new("ios", source_id, "healthkit", date);

        let batch = vec![record("a"), record("b")];
        assert_eq!(key.build(&batch), key.build(&batch));
    }

    #[test]
    fn different_batches_differ() {
        let key = StreamKey::new(
            "ios",
            Uuid::new_v4(),
            "healthkit",
            NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
        );
        assert_ne!(
            key.build(&[record("a"), record("b")]),
            key.build(&[record("a"), record("c")])
        );
        // The per-record separator keeps ["ab"] distinct from ["a","b"].
        assert_ne!(key.build(&[record("ab")]), key.build(&[record("a"), record("b")]));
    }

    #[test]
    fn ndjson_roundtrip() {
        let records = vec![record("x"), record("y")];
        let bytes = encode_ndjson(&records).unwrap();
        let decoded = decode_ndjson(&bytes).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].id, "x");
        assert_eq!(decoded[1].id, "y");
    }

    #[test]
    fn malformed_line_is_structural() {
        let err = decode_ndjson(b"{\"id\":\"a\"\n").unwrap_err();
        assert!(err.is_structural());
    }

    proptest! {
        #[test]
        fn fingerprint_is_deterministic(ids in proptest::collection::vec("[a-z0-9-]{1,32}", 0..20)) {
            let records: Vec<RawRecord> = ids.iter().map(|id| record(id)).collect();
            prop_assert_eq!(batch_fingerprint(&records), batch_fingerprint(&records));
        }
    }
}
