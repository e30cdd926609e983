//! Integration tests for the push fallback schedule.

mod common;

use common::now_ms;
use deadpool_redis::redis;
use server::push::scheduler::{ATTEMPTS_KEY, SCHEDULE_KEY};
use uuid::Uuid;

async fn raw_connection(url: &str) -> redis::aio::MultiplexedConnection {
    redis::Client::open(url)
        .unwrap()
        .get_multiplexed_async_connection()
        .await
        .unwrap()
}

#[tokio::test]
async fn schedule_keeps_the_earlier_time() {
    let harness = common::start().await;
    let account = Uuid::new_v4();
    let later = now_ms() + 60_000;
    let earlier = now_ms() + 30_000;

    harness.state.push.schedule(account, 1, later).await.unwrap();
    harness
        .state
        .push
        .schedule(account, 1, earlier)
        .await
        .unwrap();

    let mut conn = raw_connection(&harness.redis_url).await;
    let score: f64 = redis::cmd("ZSCORE")
        .arg(SCHEDULE_KEY)
        .arg(format!("{account}::1"))
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(score as i64, earlier);

    // A later reschedule attempt does not push the time back out.
    harness.state.push.schedule(account, 1, later).await.unwrap();
    let score: f64 = redis::cmd("ZSCORE")
        .arg(SCHEDULE_KEY)
        .arg(format!("{account}::1"))
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(score as i64, earlier);
}

#[tokio::test]
async fn cancel_removes_entry_and_attempts() {
    let harness = common::start().await;
    let account = Uuid::new_v4();

    harness
        .state
        .push
        .schedule(account, 1, now_ms() + 60_000)
        .await
        .unwrap();
    harness.state.push.cancel(account, 1).await.unwrap();

    let mut conn = raw_connection(&harness.redis_url).await;
    let remaining: Option<f64> = redis::cmd("ZSCORE")
        .arg(SCHEDULE_KEY)
        .arg(format!("{account}::1"))
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(remaining.is_none());
    let attempts: Option<u32> = redis::cmd("HGET")
        .arg(ATTEMPTS_KEY)
        .arg(format!("{account}::1"))
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(attempts.is_none());
}

#[tokio::test]
async fn due_entry_for_tokenless_device_is_dropped() {
    let harness = common::start().await;
    let account = Uuid::new_v4();
    common::insert_device(&harness.pool, account, 1, 10, None, None, false).await;

    // Due immediately; the pump runs every 50ms in the harness.
    harness
        .state
        .push
        .schedule(account, 1, now_ms() - 1000)
        .await
        .unwrap();

    let mut conn = raw_connection(&harness.redis_url).await;
    for _ in 0..100 {
        let remaining: Option<f64> = redis::cmd("ZSCORE")
            .arg(SCHEDULE_KEY)
            .arg(format!("{account}::1"))
            .query_async(&mut conn)
            .await
            .unwrap();
        if remaining.is_none() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    panic!("due entry was never drained");
}
