//! Source and stream registries: the identity/credential boundary for
//! providers and devices, and per-feed scheduling + cursor state.

use chrono::{Duration, Utc};
use pipeline_core::{Error, Result};
use rand::Rng;
use sqlx::PgPool;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::model::{Source, Stream};

const SOURCE_COLUMNS: &str = "id, name, provider, auth_type, access_token, refresh_token, \
     token_expires_at, device_id, pairing_code, pairing_status, code_expires_at, device_token, \
     is_active, error_message, created_at, updated_at";

const STREAM_COLUMNS: &str = "id, source_id, stream_name, cron_schedule, is_enabled, \
     last_sync_token, last_sync_at, created_at, updated_at";

// No 0/O/1/I so codes survive being read aloud.
const PAIRING_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const PAIRING_CODE_LEN: usize = 8;
const PAIRING_CODE_TTL_MINUTES: i64 = 10;

#[instrument(skip(db))]
pub async fn create_source(
    db: &PgPool,
    name: &str,
    provider: &str,
    auth_type: &str,
) -> Result<Source> {
    let query = format!(
        r#"
        INSERT INTO elt.sources (name, provider, auth_type)
        VALUES ($1, $2, $3)
        RETURNING {SOURCE_COLUMNS}
        "#
    );

    let source: Source = sqlx::query_as(&query)
        .bind(name)
        .bind(provider)
        .bind(auth_type)
        .fetch_one(db)
        .await?;

    info!(source_id = %source.id, provider, "Source created");
    Ok(source)
}

pub async fn get_source(db: &PgPool, source_id: Uuid) -> Result<Source> {
    let query = format!("SELECT {SOURCE_COLUMNS} FROM elt.sources WHERE id = $1");
    sqlx::query_as(&query)
        .bind(source_id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| Error::NotFound(format!("source {}", source_id)))
}

pub async fn list_sources(db: &PgPool) -> Result<Vec<Source>> {
    let query = format!("SELECT {SOURCE_COLUMNS} FROM elt.sources ORDER BY created_at DESC");
    Ok(sqlx::query_as(&query).fetch_all(db).await?)
}

/// Soft-disable; streams keep referencing the source and nothing is deleted.
pub async fn set_source_active(db: &PgPool, source_id: Uuid, active: bool) -> Result<()> {
    let updated = sqlx::query(
        "UPDATE elt.sources SET is_active = $2, updated_at = NOW() WHERE id = $1",
    )
    .bind(source_id)
    .bind(active)
    .execute(db)
    .await?
    .rows_affected();

    if updated == 0 {
        return Err(Error::NotFound(format!("source {}", source_id)));
    }
    Ok(())
}

/// Rotate OAuth credentials in place.
#[instrument(skip(db, access_token, refresh_token))]
pub async fn rotate_token(
    db: &PgPool,
    source_id: Uuid,
    access_token: &str,
    refresh_token: Option<&str>,
    expires_at: Option<chrono::DateTime<Utc>>,
) -> Result<()> {
    let updated = sqlx::query(
        r#"
        UPDATE elt.sources
        SET access_token = $2,
            refresh_token = COALESCE($3, refresh_token),
            token_expires_at = $4,
            error_message = NULL,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(source_id)
    .bind(access_token)
    .bind(refresh_token)
    .bind(expires_at)
    .execute(db)
    .await?
    .rows_affected();

    if updated == 0 {
        return Err(Error::NotFound(format!("source {}", source_id)));
    }

    info!(source_id = %source_id, "Credentials rotated");
    Ok(())
}

pub async fn record_source_error(db: &PgPool, source_id: Uuid, message: &str) -> Result<()> {
    sqlx::query("UPDATE elt.sources SET error_message = $2, updated_at = NOW() WHERE id = $1")
        .bind(source_id)
        .bind(message)
        .execute(db)
        .await?;
    Ok(())
}

/// Hard delete, cascading to streams, jobs and archived metadata.
pub async fn delete_source(db: &PgPool, source_id: Uuid) -> Result<()> {
    let deleted = sqlx::query("DELETE FROM elt.sources WHERE id = $1")
        .bind(source_id)
        .execute(db)
        .await?
        .rows_affected();

    if deleted == 0 {
        return Err(Error::NotFound(format!("source {}", source_id)));
    }

    info!(source_id = %source_id, "Source deleted");
    Ok(())
}

/// Issue a pairing code for a device source. Any previous pending code is
/// replaced; the partial unique index keeps pending codes unique across
/// sources so completion can resolve by code alone.
#[instrument(skip(db))]
pub async fn begin_device_pairing(db: &PgPool, source_id: Uuid) -> Result<String> {
    let source = get_source(db, source_id).await?;
    if source.auth_type != "device" {
        return Err(Error::Validation(format!(
            "source {} is not a device source",
            source_id
        )));
    }

    let code = generate_pairing_code();
    let expires = Utc::now() + Duration::minutes(PAIRING_CODE_TTL_MINUTES);

    sqlx::query(
        r#"
        UPDATE elt.sources
        SET pairing_code = $2,
            pairing_status = 'pending',
            code_expires_at = $3,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(source_id)
    .bind(&code)
    .bind(expires)
    .execute(db)
    .await?;

    info!(source_id = %source_id, "Device pairing initiated");
    Ok(code)
}

/// Complete pairing: the device presents the code and receives a token.
#[instrument(skip(db, code, device_token))]
pub async fn complete_device_pairing(
    db: &PgPool,
    code: &str,
    device_id: &str,
    device_token: &str,
) -> Result<Source> {
    let query = format!(
        r#"
        UPDATE elt.sources
        SET pairing_status = 'paired',
            pairing_code = NULL,
            code_expires_at = NULL,
            device_id = $2,
            device_token = $3,
            updated_at = NOW()
        WHERE pairing_code = $1
          AND pairing_status = 'pending'
          AND code_expires_at > NOW()
        RETURNING {SOURCE_COLUMNS}
        "#
    );

    let source: Option<Source> = sqlx::query_as(&query)
        .bind(code)
        .bind(device_id)
        .bind(device_token)
        .fetch_optional(db)
        .await?;

    let source =
        source.ok_or_else(|| Error::Validation("pairing code invalid or expired".into()))?;

    info!(source_id = %source.id, device_id, "Device paired");
    Ok(source)
}

fn generate_pairing_code() -> String {
    let mut rng = rand::thread_rng();
    (0..PAIRING_CODE_LEN)
        .map(|_| PAIRING_ALPHABET[rng.gen_range(0..PAIRING_ALPHABET.len())] as char)
        .collect()
}

#[instrument(skip(db))]
pub async fn upsert_stream(
    db: &PgPool,
    source_id: Uuid,
    stream_name: &str,
    cron_schedule: Option<&str>,
    is_enabled: bool,
) -> Result<Stream> {
    let query = format!(
        r#"
        INSERT INTO elt.streams (source_id, stream_name, cron_schedule, is_enabled)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (source_id, stream_name) DO UPDATE SET
            cron_schedule = EXCLUDED.cron_schedule,
            is_enabled = EXCLUDED.is_enabled,
            updated_at = NOW()
        RETURNING {STREAM_COLUMNS}
        "#
    );

    let stream: Stream = sqlx::query_as(&query)
        .bind(source_id)
        .bind(stream_name)
        .bind(cron_schedule)
        .bind(is_enabled)
        .fetch_one(db)
        .await?;

    Ok(stream)
}

pub async fn get_stream(db: &PgPool, source_id: Uuid, stream_name: &str) -> Result<Stream> {
    let query = format!(
        "SELECT {STREAM_COLUMNS} FROM elt.streams WHERE source_id = $1 AND stream_name = $2"
    );
    sqlx::query_as(&query)
        .bind(source_id)
        .bind(stream_name)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| Error::NotFound(format!("stream {}/{}", source_id, stream_name)))
}

/// Enabled, schedulable streams on active sources. The cron-due decision
/// itself lives in the scheduler.
pub async fn list_schedulable_streams(db: &PgPool) -> Result<Vec<Stream>> {
    let query = format!(
        r#"
        SELECT {STREAM_COLUMNS_QUALIFIED}
        FROM elt.streams st
        JOIN elt.sources s ON s.id = st.source_id
        WHERE st.is_enabled = TRUE
          AND st.cron_schedule IS NOT NULL
          AND s.is_active = TRUE
        "#,
        STREAM_COLUMNS_QUALIFIED = "st.id, st.source_id, st.stream_name, st.cron_schedule, \
             st.is_enabled, st.last_sync_token, st.last_sync_at, st.created_at, st.updated_at"
    );

    Ok(sqlx::query_as(&query).fetch_all(db).await?)
}

/// Advance the incremental cursor. Only called after the page that produced
/// `token` has been durably archived; crashing before this leaves the cursor
/// at its previous value and bounds data loss to a refetch.
pub async fn update_stream_cursor(
    db: &PgPool,
    source_id: Uuid,
    stream_name: &str,
    token: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE elt.streams
        SET last_sync_token = $3, last_sync_at = NOW(), updated_at = NOW()
        WHERE source_id = $1 AND stream_name = $2
        "#,
    )
    .bind(source_id)
    .bind(stream_name)
    .bind(token)
    .execute(db)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairing_codes_use_unambiguous_alphabet() {
        for _ in 0..50 {
            let code = generate_pairing_code();
            assert_eq!(code.len(), PAIRING_CODE_LEN);
            assert!(code.bytes().all(|b| PAIRING_ALPHABET.contains(&b)));
            assert!(!code.contains('0') && !code.contains('O'));
            assert!(!code.contains('1') && !code.contains('I'));
        }
    }
}
