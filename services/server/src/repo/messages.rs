//! Durable message rows.
//!
//! Partition key is the account uuid; rows order within a device by server
//! timestamp.  The upsert is idempotent on the full composite key so the
//! persister can safely retry a page after a crash mid-run.

use chrono::{DateTime, TimeZone, Utc};
use courier_protocol::{Envelope, EnvelopeKind};
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Batched idempotent upsert; conflict on the composite key means the row
/// was already persisted by an earlier (possibly crashed) run.
pub async fn upsert_batch(
    pool: &PgPool,
    envelopes: &[Envelope],
    retention: Duration,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for envelope in envelopes {
        let expires_at = expiry(envelope.server_timestamp, retention);
        sqlx::query(
            r#"INSERT INTO messages
               (account_uuid, device_id, server_timestamp, guid, kind,
                source_uuid, source_device, client_timestamp, content, expires_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
               ON CONFLICT (account_uuid, device_id, server_timestamp, guid) DO NOTHING"#,
        )
        .bind(envelope.destination_uuid)
        .bind(i64::from(envelope.destination_device))
        .bind(envelope.server_timestamp)
        .bind(envelope.guid)
        .bind(envelope.kind.code())
        .bind(envelope.source_uuid)
        .bind(envelope.source_device.map(i64::from))
        .bind(envelope.client_timestamp)
        .bind(envelope.content.as_slice())
        .bind(expires_at)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await
}

/// Oldest `limit` rows for one device, ascending by server timestamp.
pub async fn fetch_page(
    pool: &PgPool,
    account: Uuid,
    device: u32,
    limit: i64,
) -> Result<Vec<Envelope>, sqlx::Error> {
    let rows = sqlx::query(
        r#"SELECT account_uuid, device_id, server_timestamp, guid, kind,
                  source_uuid, source_device, client_timestamp, content
           FROM messages
           WHERE account_uuid = $1 AND device_id = $2 AND expires_at > now()
           ORDER BY server_timestamp ASC
           LIMIT $3"#,
    )
    .bind(account)
    .bind(i64::from(device))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().filter_map(row_to_envelope).collect())
}

/// Delete one row by GUID, returning it when present.
pub async fn delete_by_guid(
    pool: &PgPool,
    account: Uuid,
    device: u32,
    guid: Uuid,
) -> Result<Option<Envelope>, sqlx::Error> {
    let row = sqlx::query(
        r#"DELETE FROM messages
           WHERE account_uuid = $1 AND device_id = $2 AND guid = $3
           RETURNING account_uuid, device_id, server_timestamp, guid, kind,
                     source_uuid, source_device, client_timestamp, content"#,
    )
    .bind(account)
    .bind(i64::from(device))
    .bind(guid)
    .fetch_optional(pool)
    .await?;
    Ok(row.and_then(row_to_envelope))
}

/// Delete the single oldest row matching (sender, server timestamp).
pub async fn delete_by_sender_timestamp(
    pool: &PgPool,
    account: Uuid,
    device: u32,
    sender: Uuid,
    server_timestamp: i64,
) -> Result<Option<Envelope>, sqlx::Error> {
    let row = sqlx::query(
        r#"DELETE FROM messages
           WHERE guid IN (
               SELECT guid FROM messages
               WHERE account_uuid = $1 AND device_id = $2
                 AND source_uuid = $3 AND server_timestamp = $4
               ORDER BY server_timestamp ASC
               LIMIT 1
           )
           RETURNING account_uuid, device_id, server_timestamp, guid, kind,
                     source_uuid, source_device, client_timestamp, content"#,
    )
    .bind(account)
    .bind(i64::from(device))
    .bind(sender)
    .bind(server_timestamp)
    .fetch_optional(pool)
    .await?;
    Ok(row.and_then(row_to_envelope))
}

pub async fn clear_device(pool: &PgPool, account: Uuid, device: u32) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM messages WHERE account_uuid = $1 AND device_id = $2")
        .bind(account)
        .bind(i64::from(device))
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn clear_account(pool: &PgPool, account: Uuid) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM messages WHERE account_uuid = $1")
        .bind(account)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Reap a bounded batch of rows past their retention.  Returns rows removed;
/// callers keep calling while the batch comes back full.
pub async fn reap_expired(pool: &PgPool, limit: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"DELETE FROM messages
           WHERE ctid IN (
               SELECT ctid FROM messages WHERE expires_at <= now() LIMIT $1
           )"#,
    )
    .bind(limit)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

fn expiry(server_timestamp: i64, retention: Duration) -> DateTime<Utc> {
    let base = Utc
        .timestamp_millis_opt(server_timestamp)
        .single()
        .unwrap_or_else(Utc::now);
    base + chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(30))
}

fn row_to_envelope(row: sqlx::postgres::PgRow) -> Option<Envelope> {
    let kind_code: i16 = row.get("kind");
    let Some(kind) = EnvelopeKind::from_code(kind_code) else {
        warn!(kind_code, "dropping durable row with unknown envelope kind");
        return None;
    };
    let device_id: i64 = row.get("device_id");
    let source_device: Option<i64> = row.get("source_device");
    Some(Envelope {
        guid: row.get("guid"),
        server_timestamp: row.get("server_timestamp"),
        client_timestamp: row.get("client_timestamp"),
        kind,
        source_uuid: row.get("source_uuid"),
        source_device: source_device.and_then(|d| u32::try_from(d).ok()),
        destination_uuid: row.get("account_uuid"),
        destination_device: u32::try_from(device_id).unwrap_or_default(),
        content: row.get("content"),
    })
}
