//! Platform push senders.
//!
//! Both providers speak HTTPS through one shared `reqwest` client and map
//! responses into the three-way outcome the scheduler acts on.  Payloads are
//! pure wakes (`content-available` style); message content never rides a
//! push.

use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use crate::config::{ApnConfig, FcmConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// The provider rejected the token permanently; clear it.
    InvalidToken,
    /// Worth retrying on the backoff ladder.
    Transient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushPlatform {
    Apn,
    Fcm,
}

#[async_trait]
pub trait PushProvider: Send + Sync {
    fn platform(&self) -> PushPlatform;
    async fn send_wake(&self, token: &str) -> PushOutcome;
}

// ---------------------------------------------------------------------------
// APNs
// ---------------------------------------------------------------------------

pub struct ApnSender {
    client: reqwest::Client,
    cfg: ApnConfig,
}

impl ApnSender {
    pub fn new(client: reqwest::Client, cfg: ApnConfig) -> Self {
        Self { client, cfg }
    }
}

#[async_trait]
impl PushProvider for ApnSender {
    fn platform(&self) -> PushPlatform {
        PushPlatform::Apn
    }

    async fn send_wake(&self, token: &str) -> PushOutcome {
        let url = format!("{}/3/device/{}", self.cfg.endpoint.trim_end_matches('/'), token);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.cfg.bearer_token)
            .header("apns-topic", &self.cfg.topic)
            .header("apns-push-type", "background")
            .header("apns-priority", "5")
            .json(&json!({ "aps": { "content-available": 1 } }))
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "APNs request failed");
                return PushOutcome::Transient;
            }
        };

        let status = response.status();
        if status.is_success() {
            return PushOutcome::Delivered;
        }
        let reason = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.get("reason").and_then(|r| r.as_str().map(str::to_owned)))
            .unwrap_or_default();
        match (status.as_u16(), reason.as_str()) {
            (410, _) | (_, "BadDeviceToken") | (_, "Unregistered") | (_, "ExpiredToken") => {
                PushOutcome::InvalidToken
            }
            (code, reason) if status.is_server_error() || code == 429 => {
                warn!(code, reason, "APNs transient failure");
                PushOutcome::Transient
            }
            (code, reason) => {
                warn!(code, reason, "APNs rejected push");
                PushOutcome::Transient
            }
        }
    }
}

// ---------------------------------------------------------------------------
// FCM
// ---------------------------------------------------------------------------

pub struct FcmSender {
    client: reqwest::Client,
    cfg: FcmConfig,
}

impl FcmSender {
    pub fn new(client: reqwest::Client, cfg: FcmConfig) -> Self {
        Self { client, cfg }
    }
}

#[async_trait]
impl PushProvider for FcmSender {
    fn platform(&self) -> PushPlatform {
        PushPlatform::Fcm
    }

    async fn send_wake(&self, token: &str) -> PushOutcome {
        let response = self
            .client
            .post(&self.cfg.endpoint)
            .header("authorization", format!("key={}", self.cfg.server_key))
            .json(&json!({
                "to": token,
                "priority": "high",
                "data": { "wake": true }
            }))
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "FCM request failed");
                return PushOutcome::Transient;
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!(code = status.as_u16(), "FCM transient failure");
            return PushOutcome::Transient;
        }
        let body = response.json::<serde_json::Value>().await.unwrap_or_default();
        let error = body
            .get("results")
            .and_then(|r| r.get(0))
            .and_then(|r| r.get("error"))
            .and_then(|e| e.as_str())
            .unwrap_or_default();
        match error {
            "" => PushOutcome::Delivered,
            "NotRegistered" | "InvalidRegistration" | "MismatchSenderId" => {
                PushOutcome::InvalidToken
            }
            other => {
                warn!(reason = other, "FCM delivery error");
                PushOutcome::Transient
            }
        }
    }
}
