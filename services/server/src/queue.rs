//! Per-(account, device) message queues in the cache.
//!
//! Queue state is four keys sharing one hash tag so they land on a single
//! shard and can be mutated inside one server-side script:
//!
//! - `user_queue::{acct::dev}` — ZSET, member = bincode envelope, score = qid
//! - `user_queue_metadata::{acct::dev}` — HASH, guid -> qid
//! - `user_queue_counter::{acct::dev}` — monotonic qid source
//! - `user_queue_persist_in_progress::{acct::dev}` — persist lock flag
//!
//! plus the per-shard enumeration `persist_queue_index::{shard}` used by the
//! persister.  Every mutation goes through a script; there is no client-side
//! read-modify-write anywhere in this module.
//!
//! Duplicate GUIDs: a second insert with the same GUID overwrites the index
//! entry (last-writer wins) while both members stay in the ordered queue
//! until removed individually.  Readers dedup by GUID.

use courier_protocol::Envelope;
use deadpool_redis::redis::{self, Script};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::cache::{CacheCluster, CacheError};

/// Events published on a queue's notification channel.
pub mod queue_events {
    pub const INSERTED: &str = "inserted";
    pub const EPHEMERAL: &str = "ephemeral";
    pub const PERSISTED: &str = "persisted";
}

const INSERT: &str = r#"
local was_empty = 0
if redis.call("ZCARD", KEYS[1]) == 0 then
    was_empty = 1
end
local qid = redis.call("INCR", KEYS[3])
redis.call("ZADD", KEYS[1], qid, ARGV[1])
redis.call("HSET", KEYS[2], ARGV[2], qid)
redis.call("ZADD", KEYS[4], "NX", ARGV[3], KEYS[1])
redis.call("PUBLISH", ARGV[4], "inserted")
return {qid, was_empty}
"#;

const PAGE: &str = r#"
return redis.call("ZRANGEBYSCORE", KEYS[1], "(" .. ARGV[1], "+inf",
                  "LIMIT", 0, ARGV[2], "WITHSCORES")
"#;

const REMOVE_BY_GUID: &str = r#"
local qid = redis.call("HGET", KEYS[2], ARGV[1])
if not qid then
    return false
end
local removed = redis.call("ZRANGEBYSCORE", KEYS[1], qid, qid)
redis.call("ZREMRANGEBYSCORE", KEYS[1], qid, qid)
redis.call("HDEL", KEYS[2], ARGV[1])
if redis.call("ZCARD", KEYS[1]) == 0 then
    redis.call("ZREM", KEYS[3], KEYS[1])
end
if removed[1] then
    return removed[1]
end
return false
"#;

const QUEUES_TO_PERSIST: &str = r#"
return redis.call("ZRANGEBYSCORE", KEYS[1], 0, ARGV[1], "LIMIT", 0, ARGV[2])
"#;

const DRAIN_AND_TRIM: &str = r#"
local items = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1])
if #items > 0 then
    redis.call("ZREMRANGEBYSCORE", KEYS[1], "-inf", ARGV[1])
    local index = redis.call("HGETALL", KEYS[2])
    for i = 1, #index, 2 do
        if tonumber(index[i + 1]) <= tonumber(ARGV[1]) then
            redis.call("HDEL", KEYS[2], index[i])
        end
    end
end
if redis.call("ZCARD", KEYS[1]) == 0 then
    redis.call("ZREM", KEYS[3], KEYS[1])
end
return items
"#;

const CLEAR: &str = r#"
redis.call("DEL", KEYS[1], KEYS[2], KEYS[3], KEYS[4])
redis.call("ZREM", KEYS[5], KEYS[1])
return 1
"#;

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

pub fn queue_key(account: Uuid, device: u32) -> String {
    format!("user_queue::{{{account}::{device}}}")
}

pub fn metadata_key(account: Uuid, device: u32) -> String {
    format!("user_queue_metadata::{{{account}::{device}}}")
}

pub fn counter_key(account: Uuid, device: u32) -> String {
    format!("user_queue_counter::{{{account}::{device}}}")
}

pub fn persist_flag_key(account: Uuid, device: u32) -> String {
    format!("user_queue_persist_in_progress::{{{account}::{device}}}")
}

pub fn shard_index_key(shard: u32) -> String {
    format!("persist_queue_index::{{{shard}}}")
}

/// Notification channel for one queue; shaped like a keyspace channel so the
/// listener routes it with the same machinery as real keyspace events.
pub fn events_channel(account: Uuid, device: u32) -> String {
    format!("__keyspace@0__:{}", queue_key(account, device))
}

/// Inverse of [`queue_key`]; also accepts the events-channel form.
pub fn parse_queue_key(key: &str) -> Option<(Uuid, u32)> {
    let key = key.strip_prefix("__keyspace@0__:").unwrap_or(key);
    let inner = key
        .strip_prefix("user_queue::{")?
        .strip_suffix('}')?;
    let (account, device) = inner.split_once("::")?;
    Some((account.parse().ok()?, device.parse().ok()?))
}

/// Stable shard assignment: first 8 bytes of SHA-256 of the queue key.
pub fn shard_for_queue_key(key: &str, shards: u32) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(shards.max(1))) as u32
}

// ---------------------------------------------------------------------------
// Queue operations
// ---------------------------------------------------------------------------

/// One envelope read from the queue together with its queue id.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub envelope: Envelope,
    pub qid: u64,
}

/// Result of an insert: the assigned queue id, and whether the queue was
/// empty beforehand (drives the push-latency accounting upstream).
#[derive(Debug, Clone, Copy)]
pub struct InsertOutcome {
    pub qid: u64,
    pub was_empty: bool,
}

/// Result of the bounded by-(sender, timestamp) removal scan.
#[derive(Debug)]
pub enum ScanOutcome {
    Removed(Box<Envelope>),
    NotFound,
    /// The queue is longer than the scan cap and no match was found within
    /// it; the caller learns the scan was partial.
    Truncated,
}

pub struct DeviceQueues {
    cache: Arc<CacheCluster>,
    scan_cap: u32,
    insert: Script,
    page: Script,
    remove_by_guid: Script,
    queues_to_persist: Script,
    drain_and_trim: Script,
    clear: Script,
}

impl DeviceQueues {
    pub fn new(cache: Arc<CacheCluster>, scan_cap: u32) -> Self {
        Self {
            cache,
            scan_cap,
            insert: Script::new(INSERT),
            page: Script::new(PAGE),
            remove_by_guid: Script::new(REMOVE_BY_GUID),
            queues_to_persist: Script::new(QUEUES_TO_PERSIST),
            drain_and_trim: Script::new(DRAIN_AND_TRIM),
            clear: Script::new(CLEAR),
        }
    }

    /// Append an envelope to its device queue and index it by GUID.
    pub async fn insert(&self, envelope: &Envelope) -> Result<InsertOutcome, CacheError> {
        let account = envelope.destination_uuid;
        let device = envelope.destination_device;
        let blob = bincode::serialize(envelope)
            .map_err(|e| CacheError::Corrupt(format!("envelope encode: {e}")))?;
        let key = queue_key(account, device);
        let shard = shard_for_queue_key(&key, self.cache.shards);

        let mut invocation = self.insert.prepare_invoke();
        invocation
            .key(key)
            .key(metadata_key(account, device))
            .key(counter_key(account, device))
            .key(shard_index_key(shard))
            .arg(blob)
            .arg(envelope.guid.to_string())
            // NX on the shard index keeps the oldest envelope's timestamp as
            // the queue's age, which is what the persister sweeps on.
            .arg(envelope.server_timestamp)
            .arg(events_channel(account, device));
        let (qid, was_empty): (u64, u8) = self.cache.run_script(&invocation).await?;
        Ok(InsertOutcome {
            qid,
            was_empty: was_empty == 1,
        })
    }

    /// Up to `limit` envelopes with qid strictly greater than `after`,
    /// ascending.  Corrupt members are dropped with a warning rather than
    /// poisoning the page.
    pub async fn page(
        &self,
        account: Uuid,
        device: u32,
        after: u64,
        limit: u32,
    ) -> Result<Vec<QueueItem>, CacheError> {
        let mut invocation = self.page.prepare_invoke();
        invocation
            .key(queue_key(account, device))
            .arg(after)
            .arg(limit);
        let raw: Vec<(Vec<u8>, u64)> = self.cache.run_script(&invocation).await?;
        Ok(decode_items(raw))
    }

    /// Remove one envelope by GUID; `None` when the GUID is not indexed.
    pub async fn remove_by_guid(
        &self,
        account: Uuid,
        device: u32,
        guid: Uuid,
    ) -> Result<Option<Envelope>, CacheError> {
        let mut invocation = self.remove_by_guid.prepare_invoke();
        invocation
            .key(queue_key(account, device))
            .key(metadata_key(account, device))
            .key(shard_index_key(shard_for_queue_key(
                &queue_key(account, device),
                self.cache.shards,
            )))
            .arg(guid.to_string());
        let raw: Option<Vec<u8>> = self.cache.run_script(&invocation).await?;
        match raw {
            None => Ok(None),
            Some(blob) => match bincode::deserialize::<Envelope>(&blob) {
                Ok(envelope) => Ok(Some(envelope)),
                Err(e) => {
                    warn!(%account, device, error = %e, "dropping corrupt removed envelope");
                    Ok(None)
                }
            },
        }
    }

    /// Bounded linear scan for the (sender, server-timestamp) ack form.
    ///
    /// Scans the oldest `scan_cap` entries; a miss on a longer queue reports
    /// [`ScanOutcome::Truncated`] instead of scanning further.
    pub async fn remove_by_sender_timestamp(
        &self,
        account: Uuid,
        device: u32,
        sender: Uuid,
        server_timestamp: i64,
    ) -> Result<ScanOutcome, CacheError> {
        let window = self.page(account, device, 0, self.scan_cap).await?;
        for item in &window {
            if item.envelope.source_uuid == Some(sender)
                && item.envelope.server_timestamp == server_timestamp
            {
                let removed = self
                    .remove_by_guid(account, device, item.envelope.guid)
                    .await?;
                return Ok(match removed {
                    Some(envelope) => ScanOutcome::Removed(Box::new(envelope)),
                    None => ScanOutcome::NotFound,
                });
            }
        }
        if window.len() as u32 >= self.scan_cap {
            Ok(ScanOutcome::Truncated)
        } else {
            Ok(ScanOutcome::NotFound)
        }
    }

    pub async fn has_messages(&self, account: Uuid, device: u32) -> Result<bool, CacheError> {
        let count: u64 = self
            .cache
            .run(redis::cmd("ZCARD").arg(queue_key(account, device)))
            .await?;
        Ok(count > 0)
    }

    /// Queue keys on `shard` whose oldest cached envelope predates
    /// `older_than_ms`, capped at `max`.
    pub async fn queues_to_persist(
        &self,
        shard: u32,
        older_than_ms: i64,
        max: u32,
    ) -> Result<Vec<String>, CacheError> {
        let mut invocation = self.queues_to_persist.prepare_invoke();
        invocation
            .key(shard_index_key(shard))
            .arg(older_than_ms)
            .arg(max);
        self.cache.run_script(&invocation).await
    }

    /// Set the queue's persist flag; `false` when another worker holds it.
    pub async fn lock_for_persist(
        &self,
        account: Uuid,
        device: u32,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let reply: Option<String> = self
            .cache
            .run(
                redis::cmd("SET")
                    .arg(persist_flag_key(account, device))
                    .arg(1)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl.as_secs().max(1)),
            )
            .await?;
        Ok(reply.is_some())
    }

    /// Drop the persist flag and announce the move to durable storage.
    pub async fn unlock_persist(&self, account: Uuid, device: u32) -> Result<(), CacheError> {
        let mut pipe = redis::pipe();
        pipe.cmd("PUBLISH")
            .arg(events_channel(account, device))
            .arg(queue_events::PERSISTED)
            .ignore()
            .cmd("DEL")
            .arg(persist_flag_key(account, device))
            .ignore();
        self.cache.run_pipe::<()>(&pipe).await
    }

    /// Atomically return and delete all envelopes with qid <= `upto`,
    /// paired with their GUID index entries.
    pub async fn drain_and_trim(
        &self,
        account: Uuid,
        device: u32,
        upto: u64,
    ) -> Result<Vec<Envelope>, CacheError> {
        let mut invocation = self.drain_and_trim.prepare_invoke();
        invocation
            .key(queue_key(account, device))
            .key(metadata_key(account, device))
            .key(shard_index_key(shard_for_queue_key(
                &queue_key(account, device),
                self.cache.shards,
            )))
            .arg(upto);
        let raw: Vec<Vec<u8>> = self.cache.run_script(&invocation).await?;
        let mut envelopes = Vec::with_capacity(raw.len());
        for blob in raw {
            match bincode::deserialize::<Envelope>(&blob) {
                Ok(envelope) => envelopes.push(envelope),
                Err(e) => warn!(%account, device, error = %e, "dropping corrupt drained envelope"),
            }
        }
        Ok(envelopes)
    }

    /// Drop every key belonging to one device queue.
    pub async fn clear_device(&self, account: Uuid, device: u32) -> Result<(), CacheError> {
        let key = queue_key(account, device);
        let shard = shard_for_queue_key(&key, self.cache.shards);
        let mut invocation = self.clear.prepare_invoke();
        invocation
            .key(key)
            .key(metadata_key(account, device))
            .key(counter_key(account, device))
            .key(persist_flag_key(account, device))
            .key(shard_index_key(shard));
        self.cache.run_script::<i64>(&invocation).await?;
        Ok(())
    }

    /// Publish a one-shot ephemeral envelope on the queue channel without
    /// touching queue state.  The envelope rides inside the event payload;
    /// whichever instance holds the socket writes it straight through.
    pub async fn publish_ephemeral(&self, envelope: &Envelope) -> Result<(), CacheError> {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;

        let blob = bincode::serialize(envelope)
            .map_err(|e| CacheError::Corrupt(format!("envelope encode: {e}")))?;
        let payload = format!("{}:{}", queue_events::EPHEMERAL, STANDARD.encode(blob));
        self.cache
            .run::<i64>(
                redis::cmd("PUBLISH")
                    .arg(events_channel(
                        envelope.destination_uuid,
                        envelope.destination_device,
                    ))
                    .arg(payload),
            )
            .await?;
        Ok(())
    }
}

fn decode_items(raw: Vec<(Vec<u8>, u64)>) -> Vec<QueueItem> {
    let mut items = Vec::with_capacity(raw.len());
    for (blob, qid) in raw {
        match bincode::deserialize::<Envelope>(&blob) {
            Ok(envelope) => items.push(QueueItem { envelope, qid }),
            Err(e) => warn!(qid, error = %e, "dropping corrupt queued envelope"),
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_keys_share_one_hash_tag() {
        let account = Uuid::new_v4();
        let tag = format!("{{{account}::3}}");
        for key in [
            queue_key(account, 3),
            metadata_key(account, 3),
            counter_key(account, 3),
            persist_flag_key(account, 3),
        ] {
            assert!(key.contains(&tag), "{key} must embed {tag}");
        }
    }

    #[test]
    fn parse_queue_key_round_trips() {
        let account = Uuid::new_v4();
        let key = queue_key(account, 42);
        assert_eq!(parse_queue_key(&key), Some((account, 42)));
        assert_eq!(
            parse_queue_key(&format!("__keyspace@0__:{key}")),
            Some((account, 42))
        );
        assert_eq!(parse_queue_key("presence::abc::1"), None);
        assert_eq!(parse_queue_key("user_queue::{not-a-uuid::1}"), None);
    }

    #[test]
    fn shard_assignment_is_stable_and_bounded() {
        let key = "user_queue::{6a5eb9e2-8c0a-4b8f-9d5f-111111111111::1}";
        let first = shard_for_queue_key(key, 8);
        for _ in 0..10 {
            assert_eq!(shard_for_queue_key(key, 8), first);
        }
        assert!(first < 8);
        assert_eq!(shard_for_queue_key(key, 1), 0);
    }

    #[test]
    fn events_channel_mirrors_keyspace_form() {
        let account = Uuid::new_v4();
        let channel = events_channel(account, 2);
        assert!(channel.starts_with("__keyspace@0__:user_queue::{"));
        assert_eq!(parse_queue_key(&channel), Some((account, 2)));
    }
}
