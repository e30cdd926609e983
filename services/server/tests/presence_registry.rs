//! Integration tests for presence registration, displacement, and clearing.

mod common;

use deadpool_redis::redis;
use futures_util::StreamExt;
use server::cache::CacheCluster;
use server::presence::{displacement_channel, PresenceRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

fn second_registry(harness: &common::Harness, instance_id: &str) -> Arc<PresenceRegistry> {
    let cache = Arc::new(CacheCluster::new(&harness.state.config.cache).unwrap());
    Arc::new(PresenceRegistry::new(
        cache,
        instance_id.to_owned(),
        Duration::from_secs(660),
        Duration::from_secs(300),
    ))
}

#[tokio::test]
async fn newer_registration_displaces_and_publishes_once() {
    let harness = common::start().await;
    let account = Uuid::new_v4();

    let registry_a = second_registry(&harness, "front-a");
    let registry_b = second_registry(&harness, "front-b");

    // Raw subscription so the publish itself is observable.
    let client = redis::Client::open(harness.redis_url.as_str()).unwrap();
    let mut pubsub = client.get_async_pubsub().await.unwrap();
    pubsub
        .subscribe(displacement_channel(account, 1))
        .await
        .unwrap();

    let (tx_a, _rx_a) = mpsc::unbounded_channel();
    let session_a = Uuid::new_v4();
    registry_a
        .set_present(account, 1, session_a, tx_a)
        .await
        .unwrap();

    let (tx_b, _rx_b) = mpsc::unbounded_channel();
    registry_b
        .set_present(account, 1, Uuid::new_v4(), tx_b)
        .await
        .unwrap();

    // Presence resolves to the newer holder.
    let holder = registry_a.holder(account, 1).await.unwrap();
    assert_eq!(holder.as_deref(), Some("front-b"));
    assert!(!registry_a.is_present_locally(account, 1).await.unwrap());
    assert!(registry_b.is_present_locally(account, 1).await.unwrap());

    // Exactly one displacement event, naming A's session.
    let mut stream = pubsub.on_message();
    let message = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("displacement publish")
        .unwrap();
    let payload: String = message.get_payload().unwrap();
    assert_eq!(payload, format!("front-a#{session_a}"));
    let extra = tokio::time::timeout(Duration::from_millis(300), stream.next()).await;
    assert!(extra.is_err(), "only one displacement event expected");
}

#[tokio::test]
async fn clear_presence_only_releases_own_record() {
    let harness = common::start().await;
    let account = Uuid::new_v4();

    let registry_a = second_registry(&harness, "front-a");
    let registry_b = second_registry(&harness, "front-b");

    let (tx_a, _rx_a) = mpsc::unbounded_channel();
    let session_a = Uuid::new_v4();
    registry_a
        .set_present(account, 1, session_a, tx_a)
        .await
        .unwrap();

    // A stranger's clear is a no-op.
    let stray_session = Uuid::new_v4();
    registry_b
        .clear_presence(account, 1, stray_session)
        .await
        .unwrap();
    assert_eq!(
        registry_a.holder(account, 1).await.unwrap().as_deref(),
        Some("front-a")
    );

    // The owner's clear removes the record.
    registry_a
        .clear_presence(account, 1, session_a)
        .await
        .unwrap();
    assert!(registry_a.holder(account, 1).await.unwrap().is_none());
}

#[tokio::test]
async fn same_instance_reconnect_displaces_prior_session_locally() {
    let harness = common::start().await;
    let account = Uuid::new_v4();
    let registry = second_registry(&harness, "front-a");

    let (tx_old, mut rx_old) = mpsc::unbounded_channel();
    registry
        .set_present(account, 1, Uuid::new_v4(), tx_old)
        .await
        .unwrap();

    let (tx_new, _rx_new) = mpsc::unbounded_channel();
    registry
        .set_present(account, 1, Uuid::new_v4(), tx_new)
        .await
        .unwrap();

    let signal = tokio::time::timeout(Duration::from_secs(2), rx_old.recv())
        .await
        .expect("displacement signal");
    assert_eq!(signal, Some(server::presence::PresenceSignal::Displaced));
}
