//! Client WebSocket sessions.
//!
//! Lifecycle per socket: authenticate, register presence and the local
//! delivery handle, flush the pending queue with per-frame acks, then sit in
//! a select loop over {socket, queue events, presence signals, heartbeat}.
//! A displacement signal closes the socket with the "replaced" close code;
//! normal disconnects clear presence and the queue subscription.
//!
//! Delivery is at-least-once: a frame whose ack times out is re-sent, and
//! the envelope stays in the cache queue until the ack removes it.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use courier_protocol::{
    close_codes, error_codes, Envelope, ErrorFrame, Heartbeat, MessagePush, SendResponse, WsFrame,
};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{extract_bearer, validate_token};
use crate::messages::QueueEvent;
use crate::presence::PresenceSignal;
use crate::state::{AppState, Counters};
use crate::submit::{submit_messages, SubmitOutcome};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const SESSION_TIMEOUT: Duration = Duration::from_secs(90);
const ACK_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on one flush refill.
const FLUSH_PAGE: usize = 512;

pub async fn ws_client_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer)
        .map(str::to_owned);
    ws.on_upgrade(move |socket| handle_client_socket(socket, state, token))
}

async fn send_frame(socket: &mut WebSocket, frame: &WsFrame) -> Result<(), axum::Error> {
    let json = serde_json::to_string(frame).map_err(axum::Error::new)?;
    socket.send(Message::Text(json)).await
}

async fn send_ws_error(socket: &mut WebSocket, code: &str, message: &str, retryable: bool) {
    let frame = WsFrame::Error(ErrorFrame {
        code: code.to_owned(),
        message: message.to_owned(),
        retryable,
    });
    if let Ok(json) = serde_json::to_string(&frame) {
        let _ = socket.send(Message::Text(json)).await;
    }
}

/// An envelope written to the socket, waiting on its ack.
struct InFlight {
    envelope: Envelope,
    deadline: tokio::time::Instant,
}

struct Session {
    account: Uuid,
    device: u32,
    pending: VecDeque<Envelope>,
    inflight: Option<InFlight>,
    queue_empty_sent: bool,
}

async fn handle_client_socket(mut socket: WebSocket, state: AppState, token: Option<String>) {
    let token = match token {
        Some(t) => t,
        None => {
            send_ws_error(
                &mut socket,
                error_codes::INVALID_TOKEN,
                "missing Authorization header",
                false,
            )
            .await;
            return;
        }
    };
    let claims = match validate_token(&state.pool, &token).await {
        Some(c) => c,
        None => {
            send_ws_error(
                &mut socket,
                error_codes::INVALID_TOKEN,
                "unknown or revoked token",
                false,
            )
            .await;
            return;
        }
    };

    let account = claims.account_uuid;
    let device = claims.device_id;
    let session_id = Uuid::new_v4();
    info!(%account, device, session = %session_id, "client connected");

    // Wire the session into the delivery fabric before the first flush so
    // nothing slips between flush and subscribe.
    let (signals_tx, mut signals_rx) = mpsc::unbounded_channel::<PresenceSignal>();
    let (deliver_tx, mut deliver_rx) = mpsc::unbounded_channel::<Envelope>();
    let (subscription, mut events_rx) = state.messages.subscribe(account, device);
    state
        .sessions
        .register(account, device, session_id, deliver_tx);
    if let Err(e) = state
        .presence
        .set_present(account, device, session_id, signals_tx.clone())
        .await
    {
        warn!(%account, device, error = %e, "presence registration failed");
        state.messages.unsubscribe(account, device, subscription);
        state.sessions.unregister(account, device, session_id);
        send_ws_error(
            &mut socket,
            error_codes::INTERNAL_ERROR,
            "presence registration failed",
            true,
        )
        .await;
        return;
    }
    if let Err(e) = state.push.cancel(account, device).await {
        debug!(%account, device, error = %e, "push cancel on attach failed");
    }

    let hello = WsFrame::Heartbeat(Heartbeat {
        session_id: session_id.to_string(),
        account_uuid: account,
        device_id: device,
    });
    if send_frame(&mut socket, &hello).await.is_err() {
        teardown(&state, account, device, session_id, subscription).await;
        return;
    }

    let mut session = Session {
        account,
        device,
        pending: VecDeque::new(),
        inflight: None,
        queue_empty_sent: false,
    };

    // Initial flush of everything already waiting.
    refill(&state, &mut session).await;
    if pump(&mut socket, &mut session).await.is_err() {
        teardown(&state, account, device, session_id, subscription).await;
        return;
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await;

    let mut replaced = false;
    loop {
        let ack_deadline = session
            .inflight
            .as_ref()
            .map(|f| f.deadline)
            .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            incoming = tokio::time::timeout(SESSION_TIMEOUT, socket.recv()) => {
                match incoming {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        match serde_json::from_str::<WsFrame>(&text) {
                            Ok(frame) => {
                                if handle_frame(&state, &mut socket, &mut session, frame).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                send_ws_error(
                                    &mut socket,
                                    error_codes::PROTOCOL_ERROR,
                                    &format!("invalid JSON: {}", e),
                                    false,
                                )
                                .await;
                                break;
                            }
                        }
                    }
                    Ok(Some(Ok(Message::Ping(data)))) => {
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                        info!(%account, device, "client disconnected");
                        break;
                    }
                    Err(_) => {
                        warn!(%account, device, "session timeout");
                        break;
                    }
                    Ok(Some(Err(e))) => {
                        warn!(%account, device, error = %e, "WS error");
                        break;
                    }
                    Ok(Some(Ok(_))) => {}
                }
            }
            _ = heartbeat.tick() => {
                let hb = WsFrame::Heartbeat(Heartbeat {
                    session_id: session_id.to_string(),
                    account_uuid: account,
                    device_id: device,
                });
                if send_frame(&mut socket, &hb).await.is_err() {
                    break;
                }
            }
            Some(envelope) = deliver_rx.recv() => {
                // Ephemeral local delivery: written through, never tracked.
                let frame = WsFrame::Message(MessagePush { envelope });
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
            event = events_rx.recv() => {
                match event {
                    Some(QueueEvent::NewMessages) => {
                        if session.pending.is_empty() && session.inflight.is_none() {
                            refill(&state, &mut session).await;
                        }
                        if pump(&mut socket, &mut session).await.is_err() {
                            break;
                        }
                    }
                    Some(QueueEvent::NewEphemeral(envelope)) => {
                        let frame = WsFrame::Message(MessagePush { envelope: *envelope });
                        if send_frame(&mut socket, &frame).await.is_err() {
                            break;
                        }
                    }
                    Some(QueueEvent::MessagesPersisted) => {
                        debug!(%account, device, "queue contents persisted to durable storage");
                    }
                    None => {
                        // Only a newer in-process session closes this
                        // channel; treat it as displacement.
                        info!(%account, device, "session replaced by new connection");
                        Counters::bump(&state.counters.displaced_sessions);
                        replaced = true;
                        break;
                    }
                }
            }
            signal = signals_rx.recv() => {
                match signal {
                    Some(PresenceSignal::Displaced) => {
                        info!(%account, device, "session replaced by new connection");
                        Counters::bump(&state.counters.displaced_sessions);
                        replaced = true;
                        break;
                    }
                    Some(PresenceSignal::Expired) => {
                        // Lost the record without a successor; re-register.
                        if let Err(e) = state
                            .presence
                            .set_present(account, device, session_id, signals_tx.clone())
                            .await
                        {
                            warn!(%account, device, error = %e, "presence re-registration failed");
                        }
                    }
                    None => {}
                }
            }
            _ = tokio::time::sleep_until(ack_deadline), if session.inflight.is_some() => {
                // Ack timed out: the envelope is still queued; re-send later.
                if let Some(inflight) = session.inflight.take() {
                    debug!(%account, device, guid = %inflight.envelope.guid, "ack timeout, re-queueing frame");
                    session.pending.push_back(inflight.envelope);
                }
                if pump(&mut socket, &mut session).await.is_err() {
                    break;
                }
            }
        }
    }

    if replaced {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_codes::REPLACED_BY_NEW_CONNECTION,
                reason: "replaced by new connection".into(),
            })))
            .await;
        // Presence now belongs to the successor; only drop local handles.
        state.messages.unsubscribe(account, device, subscription);
        state.sessions.unregister(account, device, session_id);
        return;
    }

    teardown(&state, account, device, session_id, subscription).await;
    info!(%account, device, session = %session_id, "client session ended");
}

async fn teardown(
    state: &AppState,
    account: Uuid,
    device: u32,
    session: Uuid,
    subscription: crate::messages::SubscriptionId,
) {
    state.messages.unsubscribe(account, device, subscription);
    state.sessions.unregister(account, device, session);
    if let Err(e) = state.presence.clear_presence(account, device, session).await {
        warn!(%account, device, error = %e, "presence clear failed");
    }
    if let Err(e) = state.push.cancel(account, device).await {
        debug!(%account, device, error = %e, "push cancel on disconnect failed");
    }
}

/// Pull the next page of stored envelopes into the flush buffer.
async fn refill(state: &AppState, session: &mut Session) {
    match state
        .messages
        .messages_for_device(session.account, session.device, false)
        .await
    {
        Ok((messages, _has_more)) => {
            session
                .pending
                .extend(messages.into_iter().take(FLUSH_PAGE));
        }
        Err(e) => {
            warn!(account = %session.account, device = session.device, error = %e,
                  "pending flush read failed");
        }
    }
}

/// Write the next frame when nothing is awaiting an ack; emit the one-shot
/// queue-empty marker once the backlog fully drains.
async fn pump(socket: &mut WebSocket, session: &mut Session) -> Result<(), axum::Error> {
    if session.inflight.is_none() {
        if let Some(envelope) = session.pending.pop_front() {
            let frame = WsFrame::Message(MessagePush {
                envelope: envelope.clone(),
            });
            send_frame(socket, &frame).await?;
            session.inflight = Some(InFlight {
                envelope,
                deadline: tokio::time::Instant::now() + ACK_TIMEOUT,
            });
        } else if !session.queue_empty_sent {
            send_frame(socket, &WsFrame::QueueEmpty).await?;
            session.queue_empty_sent = true;
        }
    }
    Ok(())
}

async fn handle_frame(
    state: &AppState,
    socket: &mut WebSocket,
    session: &mut Session,
    frame: WsFrame,
) -> Result<(), axum::Error> {
    match frame {
        WsFrame::Ack(ack) => {
            if session
                .inflight
                .as_ref()
                .is_some_and(|f| f.envelope.guid == ack.guid)
            {
                session.inflight = None;
            }
            if let Err(e) = state
                .messages
                .delete_by_guid(session.account, session.device, ack.guid)
                .await
            {
                warn!(guid = %ack.guid, error = %e, "ack removal failed");
            }
            if let Err(e) = state.push.cancel(session.account, session.device).await {
                debug!(error = %e, "push cancel on ack failed");
            }
            pump(socket, session).await
        }
        WsFrame::SenderTimestampAck(ack) => {
            if let Err(e) = state
                .messages
                .delete_by_sender_timestamp(
                    session.account,
                    session.device,
                    ack.source_uuid,
                    ack.server_timestamp,
                )
                .await
            {
                warn!(source = %ack.source_uuid, error = %e, "sender-timestamp ack failed");
            }
            Ok(())
        }
        WsFrame::Send(request) => {
            let source = Some((session.account, session.device));
            let response = match submit_messages(state, source, request.destination_uuid, &request.body)
                .await
            {
                Ok(SubmitOutcome::Accepted) => SendResponse {
                    request_id: request.request_id,
                    status: 200,
                    mismatched_devices: None,
                    stale_devices: None,
                },
                Ok(SubmitOutcome::Mismatched(body)) => SendResponse {
                    request_id: request.request_id,
                    status: 409,
                    mismatched_devices: Some(body),
                    stale_devices: None,
                },
                Ok(SubmitOutcome::Stale(body)) => SendResponse {
                    request_id: request.request_id,
                    status: 410,
                    mismatched_devices: None,
                    stale_devices: Some(body),
                },
                Ok(SubmitOutcome::UnknownDestination) => SendResponse {
                    request_id: request.request_id,
                    status: 404,
                    mismatched_devices: None,
                    stale_devices: None,
                },
                Err(e) => {
                    warn!(destination = %request.destination_uuid, error = %e, "WS send failed");
                    SendResponse {
                        request_id: request.request_id,
                        status: 500,
                        mismatched_devices: None,
                        stale_devices: None,
                    }
                }
            };
            send_frame(socket, &WsFrame::SendResponse(response)).await
        }
        WsFrame::Heartbeat(_) => Ok(()),
        other => {
            warn!(?other, "unexpected frame kind from client");
            Ok(())
        }
    }
}
