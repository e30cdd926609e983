use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub struct TokenClaims {
    pub account_uuid: Uuid,
    pub device_id: u32,
}

pub async fn validate_token(pool: &PgPool, raw_token: &str) -> Option<TokenClaims> {
    let hash = Sha256::digest(raw_token.as_bytes());
    let row = sqlx::query(
        r#"SELECT account_uuid, device_id
           FROM device_tokens
           WHERE token_hash = $1
             AND revoked_at IS NULL"#,
    )
    .bind(hash.as_slice())
    .fetch_optional(pool)
    .await
    .ok()??;
    let device_id: i64 = row.get("device_id");
    Some(TokenClaims {
        account_uuid: row.get("account_uuid"),
        device_id: u32::try_from(device_id).ok()?,
    })
}

pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}
