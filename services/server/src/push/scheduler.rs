//! Push fallback retry schedule.
//!
//! A single time-sorted set `push_schedule` holds (account::device) members
//! scored by the wall-clock time of their next push; a companion hash counts
//! attempts.  The pump loop atomically pops due members, dispatches platform
//! pushes with bounded parallelism, and reschedules survivors on a doubling
//! backoff until the attempt cap.  Client acks and socket attaches cancel
//! the entry; exhaustion and provider token rejections clear the token.

use deadpool_redis::redis::{self, Script};
use futures_util::{stream, StreamExt};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{CacheCluster, CacheError};
use crate::config::PushConfig;
use crate::push::provider::{PushOutcome, PushPlatform, PushProvider};
use crate::repo;

pub const SCHEDULE_KEY: &str = "push_schedule";
pub const ATTEMPTS_KEY: &str = "push_schedule_attempts";

const SCHEDULE: &str = r#"
local current = redis.call("ZSCORE", KEYS[1], ARGV[2])
if not current or tonumber(ARGV[1]) < tonumber(current) then
    redis.call("ZADD", KEYS[1], ARGV[1], ARGV[2])
end
return 1
"#;

const TAKE_DUE: &str = r#"
local due = redis.call("ZRANGEBYSCORE", KEYS[1], 0, ARGV[1], "LIMIT", 0, ARGV[2])
local result = {}
for i, member in ipairs(due) do
    redis.call("ZREM", KEYS[1], member)
    local attempts = redis.call("HINCRBY", KEYS[2], member, 1)
    result[2 * i - 1] = member
    result[2 * i] = attempts
end
return result
"#;

fn member(account: Uuid, device: u32) -> String {
    format!("{account}::{device}")
}

fn parse_member(member: &str) -> Option<(Uuid, u32)> {
    let (account, device) = member.split_once("::")?;
    Some((account.parse().ok()?, device.parse().ok()?))
}

/// Doubling ladder: `initial * 2^(attempt-1)`, capped.
pub fn backoff(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let doubled = initial.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    doubled.min(max)
}

pub struct PushScheduler {
    cache: Arc<CacheCluster>,
    pool: PgPool,
    cfg: PushConfig,
    apn: Option<Arc<dyn PushProvider>>,
    fcm: Option<Arc<dyn PushProvider>>,
    schedule: Script,
    take_due: Script,
}

impl PushScheduler {
    pub fn new(
        cache: Arc<CacheCluster>,
        pool: PgPool,
        cfg: PushConfig,
        apn: Option<Arc<dyn PushProvider>>,
        fcm: Option<Arc<dyn PushProvider>>,
    ) -> Self {
        Self {
            cache,
            pool,
            cfg,
            apn,
            fcm,
            schedule: Script::new(SCHEDULE),
            take_due: Script::new(TAKE_DUE),
        }
    }

    /// Add a retry entry, keeping the earlier time when one already exists.
    pub async fn schedule(
        &self,
        account: Uuid,
        device: u32,
        not_before_ms: i64,
    ) -> Result<(), CacheError> {
        let mut invocation = self.schedule.prepare_invoke();
        invocation
            .key(SCHEDULE_KEY)
            .arg(not_before_ms)
            .arg(member(account, device));
        self.cache.run_script::<i64>(&invocation).await?;
        Ok(())
    }

    /// Drop the entry and its attempt counter (socket attached or ack seen).
    pub async fn cancel(&self, account: Uuid, device: u32) -> Result<(), CacheError> {
        let m = member(account, device);
        let mut pipe = redis::pipe();
        pipe.cmd("ZREM")
            .arg(SCHEDULE_KEY)
            .arg(&m)
            .ignore()
            .cmd("HDEL")
            .arg(ATTEMPTS_KEY)
            .arg(&m)
            .ignore();
        self.cache.run_pipe::<()>(&pipe).await
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.cfg.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = self.pump_once().await {
                    if !matches!(e, CacheError::BreakerOpen) {
                        warn!(error = %e, "push schedule pump failed");
                    }
                }
            }
        })
    }

    /// Pop and dispatch one batch of due entries.
    pub async fn pump_once(&self) -> Result<usize, CacheError> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut invocation = self.take_due.prepare_invoke();
        invocation
            .key(SCHEDULE_KEY)
            .key(ATTEMPTS_KEY)
            .arg(now)
            .arg(self.cfg.batch);
        let due: Vec<(String, u32)> = self.cache.run_script(&invocation).await?;
        if due.is_empty() {
            return Ok(0);
        }
        let count = due.len();
        stream::iter(due)
            .map(|(entry, attempts)| self.dispatch(entry, attempts))
            .buffer_unordered(self.cfg.parallelism.max(1))
            .collect::<Vec<()>>()
            .await;
        Ok(count)
    }

    async fn dispatch(&self, entry: String, attempts: u32) {
        let Some((account, device)) = parse_member(&entry) else {
            warn!(entry, "dropping malformed push schedule entry");
            let _ = self.forget(&entry).await;
            return;
        };

        let record = match repo::accounts::get_device(&self.pool, account, device).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(%account, device, "push target device no longer exists");
                let _ = self.forget(&entry).await;
                return;
            }
            Err(e) => {
                warn!(%account, device, error = %e, "push target lookup failed");
                let _ = self.reschedule(account, device, attempts).await;
                return;
            }
        };

        let Some((platform, token)) = push_target(&record) else {
            let _ = self.forget(&entry).await;
            return;
        };
        let provider = match platform {
            PushPlatform::Apn => self.apn.as_ref(),
            PushPlatform::Fcm => self.fcm.as_ref(),
        };
        let Some(provider) = provider else {
            debug!(%account, device, ?platform, "push platform not configured");
            let _ = self.forget(&entry).await;
            return;
        };

        match provider.send_wake(&token).await {
            PushOutcome::Delivered if attempts < self.cfg.max_attempts => {
                let _ = self.reschedule(account, device, attempts).await;
            }
            PushOutcome::Delivered | PushOutcome::InvalidToken => {
                // Retry budget exhausted or token rejected: stop pushing and
                // mark the token stale so the account path clears it.
                let stale_for_exhaustion = attempts >= self.cfg.max_attempts;
                if !stale_for_exhaustion {
                    debug!(%account, device, ?platform, "provider rejected push token");
                }
                let cleared = match platform {
                    PushPlatform::Apn => {
                        repo::accounts::clear_apn_token(&self.pool, account, device).await
                    }
                    PushPlatform::Fcm => {
                        repo::accounts::clear_fcm_token(&self.pool, account, device).await
                    }
                };
                if let Err(e) = cleared {
                    warn!(%account, device, error = %e, "failed to clear stale push token");
                }
                let _ = self.forget(&entry).await;
            }
            PushOutcome::Transient => {
                if attempts >= self.cfg.max_attempts {
                    let _ = self.forget(&entry).await;
                } else {
                    let _ = self.reschedule(account, device, attempts).await;
                }
            }
        }
    }

    async fn reschedule(&self, account: Uuid, device: u32, attempts: u32) -> Result<(), CacheError> {
        let delay = backoff(self.cfg.initial_backoff, self.cfg.max_backoff, attempts);
        let next = chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;
        self.cache
            .run::<i64>(
                redis::cmd("ZADD")
                    .arg(SCHEDULE_KEY)
                    .arg(next)
                    .arg(member(account, device)),
            )
            .await?;
        Ok(())
    }

    async fn forget(&self, entry: &str) -> Result<(), CacheError> {
        let mut pipe = redis::pipe();
        pipe.cmd("ZREM")
            .arg(SCHEDULE_KEY)
            .arg(entry)
            .ignore()
            .cmd("HDEL")
            .arg(ATTEMPTS_KEY)
            .arg(entry)
            .ignore();
        self.cache.run_pipe::<()>(&pipe).await
    }
}

/// APN wins when both tokens exist; fetchers are never push-notified.
pub fn push_target(record: &repo::accounts::DeviceRecord) -> Option<(PushPlatform, String)> {
    if record.fetches_messages {
        return None;
    }
    if let Some(token) = &record.apn_token {
        return Some((PushPlatform::Apn, token.clone()));
    }
    record
        .fcm_token
        .as_ref()
        .map(|token| (PushPlatform::Fcm, token.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::accounts::DeviceRecord;

    fn record(apn: Option<&str>, fcm: Option<&str>, fetches: bool) -> DeviceRecord {
        DeviceRecord {
            device_id: 1,
            registration_id: 1,
            apn_token: apn.map(str::to_owned),
            fcm_token: fcm.map(str::to_owned),
            fetches_messages: fetches,
        }
    }

    #[test]
    fn apn_wins_over_fcm() {
        let target = push_target(&record(Some("a"), Some("f"), false));
        assert_eq!(target, Some((PushPlatform::Apn, "a".to_owned())));
    }

    #[test]
    fn fetchers_are_never_pushed() {
        assert_eq!(push_target(&record(Some("a"), None, true)), None);
    }

    #[test]
    fn fcm_used_when_only_token() {
        let target = push_target(&record(None, Some("f"), false));
        assert_eq!(target, Some((PushPlatform::Fcm, "f".to_owned())));
    }

    #[test]
    fn tokenless_devices_are_skipped() {
        assert_eq!(push_target(&record(None, None, false)), None);
    }

    #[test]
    fn backoff_doubles_to_cap() {
        let initial = Duration::from_secs(10);
        let max = Duration::from_secs(600);
        assert_eq!(backoff(initial, max, 1), Duration::from_secs(10));
        assert_eq!(backoff(initial, max, 2), Duration::from_secs(20));
        assert_eq!(backoff(initial, max, 5), Duration::from_secs(160));
        assert_eq!(backoff(initial, max, 12), Duration::from_secs(600));
    }

    #[test]
    fn member_round_trips() {
        let account = Uuid::new_v4();
        assert_eq!(parse_member(&member(account, 7)), Some((account, 7)));
        assert_eq!(parse_member("garbage"), None);
    }
}
