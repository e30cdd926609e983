//! Background drain of aged cache queues into the durable table.
//!
//! Work is bounded per run: one shard per tick, claimed through an
//! INCR-mod-shards cursor under a leased key so only one worker drains a
//! shard at a time; per queue, a persist flag keeps a concurrent run (or a
//! live read racing the drain) off the same queue.  Durable writes precede
//! cache removal — a crash between the two re-persists the page on the next
//! run and the idempotent upsert swallows the duplicates.

use deadpool_redis::redis::{self, Script};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{CacheCluster, CacheError};
use crate::config::PersisterConfig;
use crate::queue::{self, DeviceQueues};
use crate::repo;

const CURSOR_KEY: &str = "persister_cursor";

const RELEASE_LEASE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    redis.call("DEL", KEYS[1])
    return 1
end
return 0
"#;

fn lease_key(shard: u32) -> String {
    format!("persister_lease::{{{shard}}}")
}

pub struct MessagePersister {
    cache: Arc<CacheCluster>,
    queues: Arc<DeviceQueues>,
    pool: PgPool,
    cfg: PersisterConfig,
    persist_delay: Duration,
    retention: Duration,
    instance_id: String,
    release_lease: Script,
}

impl MessagePersister {
    pub fn new(
        cache: Arc<CacheCluster>,
        queues: Arc<DeviceQueues>,
        pool: PgPool,
        cfg: PersisterConfig,
        persist_delay: Duration,
        retention: Duration,
        instance_id: String,
    ) -> Self {
        Self {
            cache,
            queues,
            pool,
            cfg,
            persist_delay,
            retention,
            instance_id,
            release_lease: Script::new(RELEASE_LEASE),
        }
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.cfg.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = self.run_once().await {
                    if !matches!(e, CacheError::BreakerOpen) {
                        warn!(error = %e, "persister run failed");
                    }
                }
            }
        })
    }

    /// One persister tick: claim the next shard and drain its aged queues.
    pub async fn run_once(&self) -> Result<(), CacheError> {
        let cursor: i64 = self.cache.run(redis::cmd("INCR").arg(CURSOR_KEY)).await?;
        let shard = (cursor.unsigned_abs() % u64::from(self.cache.shards)) as u32;

        let lease: Option<String> = self
            .cache
            .run(
                redis::cmd("SET")
                    .arg(lease_key(shard))
                    .arg(&self.instance_id)
                    .arg("NX")
                    .arg("EX")
                    .arg(self.cfg.lease_ttl.as_secs().max(1)),
            )
            .await?;
        if lease.is_none() {
            // Another worker holds the shard; its lease TTL bounds how long
            // a crashed holder can block us.
            return Ok(());
        }

        let result = self.drain_shard(shard).await;
        self.release(shard).await;
        self.reap_expired().await;
        result
    }

    async fn drain_shard(&self, shard: u32) -> Result<(), CacheError> {
        let older_than = chrono::Utc::now().timestamp_millis()
            - i64::try_from(self.persist_delay.as_millis()).unwrap_or(i64::MAX);
        let queue_keys = self
            .queues
            .queues_to_persist(shard, older_than, self.cfg.max_queues_per_run)
            .await?;
        if queue_keys.is_empty() {
            return Ok(());
        }
        debug!(shard, queues = queue_keys.len(), "persisting aged queues");

        for key in queue_keys {
            let Some((account, device)) = queue::parse_queue_key(&key) else {
                warn!(key, "skipping unparseable queue key in shard index");
                continue;
            };
            if !self
                .queues
                .lock_for_persist(account, device, self.cfg.lease_ttl)
                .await?
            {
                continue;
            }
            let drained = self.drain_queue(account, device).await;
            self.queues.unlock_persist(account, device).await?;
            drained?;
        }
        Ok(())
    }

    /// Page through one queue oldest-first: write to the table, then trim
    /// the cache up to the last written queue id.
    async fn drain_queue(&self, account: Uuid, device: u32) -> Result<(), CacheError> {
        loop {
            let page = self
                .queues
                .page(account, device, 0, self.cfg.page_size)
                .await?;
            let Some(last) = page.last() else {
                return Ok(());
            };
            let upto = last.qid;
            let envelopes: Vec<_> = page.into_iter().map(|item| item.envelope).collect();
            let full_page = envelopes.len() as u32 >= self.cfg.page_size;

            if let Err(e) =
                repo::messages::upsert_batch(&self.pool, &envelopes, self.retention).await
            {
                // Transient: leave the queue intact and retry on a later run.
                warn!(%account, device, error = %e, "durable write failed; queue left cached");
                return Ok(());
            }
            self.queues.drain_and_trim(account, device, upto).await?;

            if !full_page {
                return Ok(());
            }
        }
    }

    async fn release(&self, shard: u32) {
        let mut invocation = self.release_lease.prepare_invoke();
        invocation.key(lease_key(shard)).arg(&self.instance_id);
        if let Err(e) = self.cache.run_script::<i64>(&invocation).await {
            // The lease TTL cleans up after us.
            debug!(shard, error = %e, "lease release failed");
        }
    }

    /// Opportunistic retention sweep over the durable table.
    async fn reap_expired(&self) {
        match repo::messages::reap_expired(&self.pool, 500).await {
            Ok(0) => {}
            Ok(reaped) => debug!(reaped, "reaped expired durable rows"),
            Err(e) => warn!(error = %e, "expired-row reap failed"),
        }
    }
}
