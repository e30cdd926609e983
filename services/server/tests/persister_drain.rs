//! Integration tests for the background persister: aged queues land in the
//! durable table exactly once, readers never see doubles, and the persisted
//! event reaches subscribers.

mod common;

use common::{envelope, now_ms};
use server::messages::QueueEvent;
use std::time::Duration;
use uuid::Uuid;

async fn table_count(pool: &sqlx::PgPool, account: Uuid) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE account_uuid = $1")
        .bind(account)
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition not reached within timeout");
}

#[tokio::test]
async fn aged_queue_is_drained_to_table_in_order() {
    let harness = common::start().await;
    let account = Uuid::new_v4();
    common::insert_device(&harness.pool, account, 1, 10, None, None, false).await;

    let (_sub, mut events) = harness.state.messages.subscribe(account, 1);

    // 377 envelopes, 20 minutes old — all beyond the persist delay.
    let base = now_ms() - 20 * 60 * 1000;
    for i in 0..377 {
        harness
            .state
            .messages
            .insert(&envelope(account, 1, base + i))
            .await
            .unwrap();
    }

    let pool = harness.pool.clone();
    wait_for(|| {
        let pool = pool.clone();
        async move { table_count(&pool, account).await == 377 }
    })
    .await;

    // Cache queue fully trimmed.
    let queues = harness.state.messages.queues();
    wait_for(|| async { !queues.has_messages(account, 1).await.unwrap() }).await;

    // Rows come back ordered by server timestamp.
    let rows = server::repo::messages::fetch_page(&harness.pool, account, 1, 500)
        .await
        .unwrap();
    assert_eq!(rows.len(), 377);
    for window in rows.windows(2) {
        assert!(window[0].server_timestamp <= window[1].server_timestamp);
    }

    // The persisted notification was observed.
    let saw_persisted = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = events.recv().await {
            if event == QueueEvent::MessagesPersisted {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(saw_persisted, "expected a MessagesPersisted event");
}

#[tokio::test]
async fn persisting_the_same_guid_twice_keeps_one_row() {
    let harness = common::start().await;
    let account = Uuid::new_v4();
    common::insert_device(&harness.pool, account, 1, 10, None, None, false).await;

    let env = envelope(account, 1, now_ms() - 20 * 60 * 1000);
    harness.state.messages.insert(&env).await.unwrap();

    let pool = harness.pool.clone();
    wait_for(|| {
        let pool = pool.clone();
        async move { table_count(&pool, account).await == 1 }
    })
    .await;

    // The same envelope ages out of the cache a second time (e.g. a crashed
    // run that wrote but never trimmed).  The upsert must swallow it.
    harness.state.messages.insert(&env).await.unwrap();
    let queues = harness.state.messages.queues();
    wait_for(|| async { !queues.has_messages(account, 1).await.unwrap() }).await;

    let per_guid: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE guid = $1")
        .bind(env.guid)
        .fetch_one(&harness.pool)
        .await
        .unwrap();
    assert_eq!(per_guid, 1);
}

#[tokio::test]
async fn merged_read_prefers_cache_copy_over_durable_row() {
    let harness = common::start().await;
    let account = Uuid::new_v4();
    common::insert_device(&harness.pool, account, 1, 10, None, None, false).await;

    // Same GUID in both stores — the reader must see it exactly once.
    let env = envelope(account, 1, now_ms());
    server::repo::messages::upsert_batch(&harness.pool, &[env.clone()], Duration::from_secs(3600))
        .await
        .unwrap();
    harness.state.messages.insert(&env).await.unwrap();

    let (merged, has_more) = harness
        .state
        .messages
        .messages_for_device(account, 1, false)
        .await
        .unwrap();
    assert!(!has_more);
    assert_eq!(merged.iter().filter(|e| e.guid == env.guid).count(), 1);
}
