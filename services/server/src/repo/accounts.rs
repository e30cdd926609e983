//! Read-side account/device lookups.
//!
//! Account and device lifecycle is owned elsewhere; the delivery pipeline
//! only reads the device set (for submission validation and push-token
//! resolution) and clears push tokens that providers report stale.

use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub device_id: u32,
    pub registration_id: u32,
    pub apn_token: Option<String>,
    pub fcm_token: Option<String>,
    pub fetches_messages: bool,
}

pub async fn account_exists(pool: &PgPool, account: Uuid) -> Result<bool, sqlx::Error> {
    let row = sqlx::query("SELECT 1 AS one FROM accounts WHERE account_uuid = $1")
        .bind(account)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

pub async fn list_devices(pool: &PgPool, account: Uuid) -> Result<Vec<DeviceRecord>, sqlx::Error> {
    let rows = sqlx::query(
        r#"SELECT device_id, registration_id, apn_token, fcm_token, fetches_messages
           FROM devices
           WHERE account_uuid = $1
           ORDER BY device_id ASC"#,
    )
    .bind(account)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(row_to_device).collect())
}

pub async fn get_device(
    pool: &PgPool,
    account: Uuid,
    device: u32,
) -> Result<Option<DeviceRecord>, sqlx::Error> {
    let row = sqlx::query(
        r#"SELECT device_id, registration_id, apn_token, fcm_token, fetches_messages
           FROM devices
           WHERE account_uuid = $1 AND device_id = $2"#,
    )
    .bind(account)
    .bind(i64::from(device))
    .fetch_optional(pool)
    .await?;
    Ok(row.map(row_to_device))
}

/// Clear a push token the provider reported invalid or that exhausted its
/// retry budget.
pub async fn clear_apn_token(pool: &PgPool, account: Uuid, device: u32) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE devices SET apn_token = NULL WHERE account_uuid = $1 AND device_id = $2")
        .bind(account)
        .bind(i64::from(device))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn clear_fcm_token(pool: &PgPool, account: Uuid, device: u32) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE devices SET fcm_token = NULL WHERE account_uuid = $1 AND device_id = $2")
        .bind(account)
        .bind(i64::from(device))
        .execute(pool)
        .await?;
    Ok(())
}

fn row_to_device(row: sqlx::postgres::PgRow) -> DeviceRecord {
    let device_id: i64 = row.get("device_id");
    let registration_id: i64 = row.get("registration_id");
    DeviceRecord {
        device_id: u32::try_from(device_id).unwrap_or_default(),
        registration_id: u32::try_from(registration_id).unwrap_or_default(),
        apn_token: row.get("apn_token"),
        fcm_token: row.get("fcm_token"),
        fetches_messages: row.get("fetches_messages"),
    }
}
