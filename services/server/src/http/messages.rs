//! REST message operations.
//!
//! The WebSocket `send` frame and these handlers share the same submission
//! path; only the transport differs.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use courier_protocol::{error_codes, IncomingMessageList, OutgoingMessageList};
use tracing::warn;
use uuid::Uuid;

use crate::auth::{extract_bearer, validate_token, TokenClaims};
use crate::http::response::error_response;
use crate::limits::RateLimitDecision;
use crate::state::AppState;
use crate::submit::{submit_messages, SubmitOutcome};

async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<TokenClaims, Response> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer);
    let Some(token) = token else {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            error_codes::INVALID_TOKEN,
            "missing Authorization header",
        ));
    };
    match validate_token(&state.pool, token).await {
        Some(claims) => Ok(claims),
        None => Err(error_response(
            StatusCode::UNAUTHORIZED,
            error_codes::INVALID_TOKEN,
            "unknown or revoked token",
        )),
    }
}

/// `PUT /v1/messages/{recipient}` — submit one message per recipient device.
pub async fn put_messages(
    State(state): State<AppState>,
    Path(destination): Path<Uuid>,
    headers: HeaderMap,
    Json(list): Json<IncomingMessageList>,
) -> Response {
    let claims = match authorize(&state, &headers).await {
        Ok(claims) => claims,
        Err(response) => return response,
    };

    match state.limiter.check_send(claims.account_uuid) {
        RateLimitDecision::Allowed => {}
        RateLimitDecision::RateLimited { retry_after } => {
            let mut response = error_response(
                StatusCode::TOO_MANY_REQUESTS,
                error_codes::RATE_LIMITED,
                "message send rate exceeded",
            );
            if let Ok(value) = retry_after.as_secs().to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
            return response;
        }
        RateLimitDecision::Blocked => {
            return error_response(
                StatusCode::PRECONDITION_REQUIRED,
                error_codes::RATE_LIMITED,
                "push challenge required",
            );
        }
    }

    let source = Some((claims.account_uuid, claims.device_id));
    match submit_messages(&state, source, destination, &list).await {
        Ok(SubmitOutcome::Accepted) => Json(serde_json::json!({})).into_response(),
        Ok(SubmitOutcome::Mismatched(body)) => {
            (StatusCode::CONFLICT, Json(body)).into_response()
        }
        Ok(SubmitOutcome::Stale(body)) => (StatusCode::GONE, Json(body)).into_response(),
        Ok(SubmitOutcome::UnknownDestination) => error_response(
            StatusCode::NOT_FOUND,
            error_codes::PROTOCOL_ERROR,
            "unknown destination account",
        ),
        Err(e) => {
            warn!(%destination, error = %e, "message submission failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                error_codes::INTERNAL_ERROR,
                "message submission failed",
            )
        }
    }
}

/// `GET /v1/messages/` — poll pending envelopes for the authenticated device.
pub async fn get_messages(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let claims = match authorize(&state, &headers).await {
        Ok(claims) => claims,
        Err(response) => return response,
    };
    match state
        .messages
        .messages_for_device(claims.account_uuid, claims.device_id, false)
        .await
    {
        Ok((messages, has_more)) => Json(OutgoingMessageList { messages, has_more }).into_response(),
        Err(e) => {
            warn!(account = %claims.account_uuid, error = %e, "message poll failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                error_codes::INTERNAL_ERROR,
                "message poll failed",
            )
        }
    }
}

/// `DELETE /v1/messages/{guid}` — acknowledge one delivered envelope.
pub async fn delete_message(
    State(state): State<AppState>,
    Path(guid): Path<Uuid>,
    headers: HeaderMap,
) -> Response {
    let claims = match authorize(&state, &headers).await {
        Ok(claims) => claims,
        Err(response) => return response,
    };
    let removed = state
        .messages
        .delete_by_guid(claims.account_uuid, claims.device_id, guid)
        .await;
    match removed {
        Ok(_) => {
            if let Err(e) = state.push.cancel(claims.account_uuid, claims.device_id).await {
                warn!(account = %claims.account_uuid, error = %e, "push cancel failed");
            }
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => {
            warn!(%guid, error = %e, "message ack failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                error_codes::INTERNAL_ERROR,
                "message ack failed",
            )
        }
    }
}

/// `DELETE /v1/messages/{source}/{timestamp}` — the legacy ack form.
pub async fn delete_message_by_sender(
    State(state): State<AppState>,
    Path((source, server_timestamp)): Path<(Uuid, i64)>,
    headers: HeaderMap,
) -> Response {
    let claims = match authorize(&state, &headers).await {
        Ok(claims) => claims,
        Err(response) => return response,
    };
    let removed = state
        .messages
        .delete_by_sender_timestamp(
            claims.account_uuid,
            claims.device_id,
            source,
            server_timestamp,
        )
        .await;
    match removed {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            warn!(%source, server_timestamp, error = %e, "sender-timestamp ack failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                error_codes::INTERNAL_ERROR,
                "message ack failed",
            )
        }
    }
}
