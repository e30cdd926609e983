use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use courier_protocol::HttpErrorEnvelope;

/// Uniform JSON error envelope for non-2xx responses without a dedicated
/// conflict body.
pub fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(HttpErrorEnvelope {
            code: code.to_owned(),
            message: message.to_owned(),
        }),
    )
        .into_response()
}
