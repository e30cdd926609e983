//! End-to-end WebSocket delivery: live push, ack cleanup, offline fallback,
//! and displacement by a newer connection.

mod common;

use common::{envelope, now_ms};
use courier_protocol::{close_codes, MessageAck, WsFrame};
use courier_test_utils::{MockWsClient, Received};
use server::sender::Dispatch;
use std::time::Duration;
use uuid::Uuid;

async fn recv_until_message(client: &mut MockWsClient) -> courier_protocol::Envelope {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.recv_frame())
            .await
            .expect("frame within timeout")
            .unwrap();
        match frame {
            WsFrame::Message(push) => return push.envelope,
            WsFrame::Heartbeat(_) | WsFrame::QueueEmpty => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

#[tokio::test]
async fn live_delivery_then_ack_leaves_no_trace() {
    let (harness, addr) = common::start_with_server().await;
    let account = Uuid::new_v4();
    common::insert_device(&harness.pool, account, 1, 10, None, None, false).await;
    common::insert_token(&harness.pool, account, 1, b"recipient-token").await;

    let url = format!("ws://{}/ws/v1/clients", addr);
    let mut client = MockWsClient::connect_with_token(&url, "recipient-token")
        .await
        .unwrap();

    // Handshake heartbeat, then the empty-queue marker.
    match client.recv_frame().await.unwrap() {
        WsFrame::Heartbeat(hb) => assert_eq!(hb.account_uuid, account),
        other => panic!("expected heartbeat, got {:?}", other),
    }
    match client.recv_frame().await.unwrap() {
        WsFrame::QueueEmpty => {}
        other => panic!("expected queue_empty, got {:?}", other),
    }

    let dispatch = harness
        .state
        .sender
        .send(envelope(account, 1, 0), false)
        .await
        .unwrap();
    assert_eq!(dispatch, Dispatch::StoredAndNotified);

    let delivered = recv_until_message(&mut client).await;
    client
        .send_frame(&WsFrame::Ack(MessageAck {
            guid: delivered.guid,
        }))
        .await
        .unwrap();

    // After the ack: no cache entry, no durable row.
    let queues = harness.state.messages.queues();
    for _ in 0..50 {
        if !queues.has_messages(account, 1).await.unwrap() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(!queues.has_messages(account, 1).await.unwrap());
    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE account_uuid = $1")
        .bind(account)
        .fetch_one(&harness.pool)
        .await
        .unwrap();
    assert_eq!(rows, 0);
}

#[tokio::test]
async fn offline_send_schedules_push_and_flushes_on_attach() {
    let (harness, addr) = common::start_with_server().await;
    let account = Uuid::new_v4();
    common::insert_device(&harness.pool, account, 1, 10, Some("apn-token"), None, false).await;
    common::insert_token(&harness.pool, account, 1, b"sleepy-token").await;

    // No socket attached: stored and push-notified.
    let dispatch = harness
        .state
        .sender
        .send(envelope(account, 1, 0), false)
        .await
        .unwrap();
    assert_eq!(dispatch, Dispatch::StoredAndPushScheduled);
    assert!(harness
        .state
        .messages
        .queues()
        .has_messages(account, 1)
        .await
        .unwrap());

    // Attach: the pending envelope is flushed, ack empties the queue.
    let url = format!("ws://{}/ws/v1/clients", addr);
    let mut client = MockWsClient::connect_with_token(&url, "sleepy-token")
        .await
        .unwrap();
    let delivered = recv_until_message(&mut client).await;
    client
        .send_frame(&WsFrame::Ack(MessageAck {
            guid: delivered.guid,
        }))
        .await
        .unwrap();

    let queues = harness.state.messages.queues();
    for _ in 0..50 {
        if !queues.has_messages(account, 1).await.unwrap() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(!queues.has_messages(account, 1).await.unwrap());
}

#[tokio::test]
async fn ephemeral_send_to_absent_device_is_dropped() {
    let harness = common::start().await;
    let account = Uuid::new_v4();
    common::insert_device(&harness.pool, account, 1, 10, None, None, false).await;

    let dispatch = harness
        .state
        .sender
        .send(envelope(account, 1, now_ms()), true)
        .await
        .unwrap();
    assert_eq!(dispatch, Dispatch::DroppedEphemeral);
    assert!(!harness
        .state
        .messages
        .queues()
        .has_messages(account, 1)
        .await
        .unwrap());
}

#[tokio::test]
async fn newer_connection_displaces_older_with_close_code() {
    let (harness, addr) = common::start_with_server().await;
    let account = Uuid::new_v4();
    common::insert_device(&harness.pool, account, 1, 10, None, None, false).await;
    common::insert_token(&harness.pool, account, 1, b"dup-token").await;

    let url = format!("ws://{}/ws/v1/clients", addr);
    let mut session_a = MockWsClient::connect_with_token(&url, "dup-token")
        .await
        .unwrap();
    match session_a.recv_frame().await.unwrap() {
        WsFrame::Heartbeat(_) => {}
        other => panic!("expected heartbeat, got {:?}", other),
    }

    let mut session_b = MockWsClient::connect_with_token(&url, "dup-token")
        .await
        .unwrap();
    match session_b.recv_frame().await.unwrap() {
        WsFrame::Heartbeat(_) => {}
        other => panic!("expected heartbeat, got {:?}", other),
    }

    // A observes the replaced close code.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match session_a.recv().await.unwrap() {
                Received::Closed(code) => return code,
                Received::Frame(_) => continue,
            }
        }
    })
    .await
    .expect("close within timeout");
    assert_eq!(closed, Some(close_codes::REPLACED_BY_NEW_CONNECTION));

    // Messages now flow through B only.
    harness
        .state
        .sender
        .send(envelope(account, 1, 0), false)
        .await
        .unwrap();
    let delivered = recv_until_message(&mut session_b).await;
    session_b
        .send_frame(&WsFrame::Ack(MessageAck {
            guid: delivered.guid,
        }))
        .await
        .unwrap();
}
