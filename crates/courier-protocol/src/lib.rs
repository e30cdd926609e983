// courier-protocol: wire types for the message delivery service.
//
// All WebSocket frames use a top-level `kind` field for discriminated
// deserialization.  HTTP body types live here too so the server and the
// test clients share one frozen schema.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Payload categories carried by an envelope.
///
/// The numeric codes are frozen: they are what lands in the durable table's
/// `kind` column and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Ciphertext,
    KeyExchange,
    PrekeyBundle,
    Receipt,
    UnidentifiedSender,
}

impl EnvelopeKind {
    pub fn code(self) -> i16 {
        match self {
            EnvelopeKind::Ciphertext => 1,
            EnvelopeKind::KeyExchange => 2,
            EnvelopeKind::PrekeyBundle => 3,
            EnvelopeKind::Receipt => 5,
            EnvelopeKind::UnidentifiedSender => 6,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(EnvelopeKind::Ciphertext),
            2 => Some(EnvelopeKind::KeyExchange),
            3 => Some(EnvelopeKind::PrekeyBundle),
            5 => Some(EnvelopeKind::Receipt),
            6 => Some(EnvelopeKind::UnidentifiedSender),
            _ => None,
        }
    }
}

/// A single opaque message unit addressed to one recipient device.
///
/// `guid` and `server_timestamp` are assigned by the server exactly once, at
/// first acceptance.  `source_uuid`/`source_device` are both absent for
/// sealed-sender envelopes.  `content` is ciphertext the server never
/// inspects; it rides as base64 on the JSON wire and as raw bytes in binary
/// serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub guid: Uuid,
    /// Milliseconds since epoch, monotonic within a device queue.
    pub server_timestamp: i64,
    /// Client-supplied timestamp; accepted as-is, no server adjustment.
    pub client_timestamp: i64,
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_device: Option<u32>,
    pub destination_uuid: Uuid,
    pub destination_device: u32,
    #[serde(with = "content_bytes")]
    pub content: Vec<u8>,
}

/// Serde helper for opaque payload bytes: base64 in human-readable formats
/// (JSON wire), raw bytes in binary formats (cache serialization).
pub mod content_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&STANDARD.encode(bytes))
        } else {
            serializer.serialize_bytes(bytes)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        if deserializer.is_human_readable() {
            let encoded = String::deserialize(deserializer)?;
            STANDARD
                .decode(encoded.as_bytes())
                .map_err(serde::de::Error::custom)
        } else {
            Vec::<u8>::deserialize(deserializer)
        }
    }
}

// ---------------------------------------------------------------------------
// Client -> Server frames
// ---------------------------------------------------------------------------

/// One message of a multi-device submission, addressed to a single device of
/// the recipient account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub kind: EnvelopeKind,
    pub destination_device: u32,
    /// Must match the registration id currently stored for the device;
    /// a mismatch yields the stale-devices conflict.
    pub destination_registration_id: u32,
    #[serde(with = "content_bytes")]
    pub content: Vec<u8>,
}

/// Body of `PUT /v1/messages/{recipient_uuid}` and of the `send` WS frame.
///
/// `online = true` requests ephemeral delivery: the message is written to a
/// live socket or dropped, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessageList {
    pub messages: Vec<IncomingMessage>,
    /// Client-supplied timestamp propagated into each envelope.
    pub timestamp: i64,
    #[serde(default)]
    pub online: bool,
}

/// Sent by a client over WS to submit messages to a recipient account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub request_id: String,
    pub destination_uuid: Uuid,
    #[serde(flatten)]
    pub body: IncomingMessageList,
}

/// Acknowledge receipt of one delivered envelope by GUID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAck {
    pub guid: Uuid,
}

/// Acknowledge by (sender, server timestamp) — the legacy ack form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderTimestampAck {
    pub source_uuid: Uuid,
    pub server_timestamp: i64,
}

// ---------------------------------------------------------------------------
// Server -> Client frames
// ---------------------------------------------------------------------------

/// Outcome of a `SendRequest`.  `status` mirrors the HTTP status the same
/// submission would have produced; the conflict bodies are populated for
/// 409/410 respectively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResponse {
    pub request_id: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mismatched_devices: Option<MismatchedDevices>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_devices: Option<StaleDevices>,
}

/// An unsolicited message push on an attached socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePush {
    pub envelope: Envelope,
}

/// Heartbeat (server -> client), sent at 30-second intervals.  The initial
/// heartbeat carries the server-assigned `session_id` and the identity
/// resolved from the bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub session_id: String,
    pub account_uuid: Uuid,
    pub device_id: u32,
}

/// Frozen error codes.
pub mod error_codes {
    pub const INVALID_TOKEN: &str = "INVALID_TOKEN";
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const MISMATCHED_DEVICES: &str = "MISMATCHED_DEVICES";
    pub const STALE_DEVICES: &str = "STALE_DEVICES";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// WebSocket close codes outside the RFC range.
pub mod close_codes {
    /// A newer session registered presence for the same (account, device).
    pub const REPLACED_BY_NEW_CONNECTION: u16 = 4409;
    /// Unrecoverable server-side failure; clients should reconnect.
    pub const INTERNAL_ERROR: u16 = 4500;
}

/// Protocol error frame (server -> client).
///
/// | Code                | Retryable |
/// |---------------------|-----------|
/// | INVALID_TOKEN       | false     |
/// | PROTOCOL_ERROR      | false     |
/// | RATE_LIMITED        | true      |
/// | MISMATCHED_DEVICES  | false     |
/// | STALE_DEVICES       | false     |
/// | INTERNAL_ERROR      | true      |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

// ---------------------------------------------------------------------------
// Top-level discriminated union
// ---------------------------------------------------------------------------

/// All WebSocket frame kinds.
///
/// ```json
/// { "kind": "message", "envelope": { ... } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum WsFrame {
    Send(SendRequest),
    SendResponse(SendResponse),
    Message(MessagePush),
    Ack(MessageAck),
    SenderTimestampAck(SenderTimestampAck),
    /// Marks the end of the initial pending-queue flush.
    QueueEmpty,
    Heartbeat(Heartbeat),
    Error(ErrorFrame),
}

// ---------------------------------------------------------------------------
// HTTP API response types (frozen schema definitions)
// ---------------------------------------------------------------------------

/// 409 body: the submitted device set does not match the account's devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MismatchedDevices {
    pub missing_devices: Vec<u32>,
    pub extra_devices: Vec<u32>,
}

/// 410 body: devices whose registration id no longer matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleDevices {
    pub stale_devices: Vec<u32>,
}

/// Response for `GET /v1/messages/`.  At most 10 000 envelopes per page;
/// `has_more` hints that another poll will return more.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessageList {
    pub messages: Vec<Envelope>,
    pub has_more: bool,
}

/// Frozen HTTP error envelope used by all non-2xx responses that do not have
/// a dedicated conflict body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpErrorEnvelope {
    pub code: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelope() -> Envelope {
        Envelope {
            guid: Uuid::new_v4(),
            server_timestamp: 1_700_000_000_123,
            client_timestamp: 1_700_000_000_000,
            kind: EnvelopeKind::Ciphertext,
            source_uuid: Some(Uuid::new_v4()),
            source_device: Some(2),
            destination_uuid: Uuid::new_v4(),
            destination_device: 1,
            content: vec![0x00, 0x01, 0xfe, 0xff],
        }
    }

    #[test]
    fn envelope_kind_codes_round_trip() {
        for kind in [
            EnvelopeKind::Ciphertext,
            EnvelopeKind::KeyExchange,
            EnvelopeKind::PrekeyBundle,
            EnvelopeKind::Receipt,
            EnvelopeKind::UnidentifiedSender,
        ] {
            assert_eq!(EnvelopeKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(EnvelopeKind::from_code(0), None);
        assert_eq!(EnvelopeKind::from_code(4), None);
    }

    #[test]
    fn envelope_content_is_base64_in_json() {
        let envelope = sample_envelope();
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["content"], serde_json::json!("AAH+/w=="));
        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn envelope_bincode_round_trip_keeps_raw_bytes() {
        let envelope = sample_envelope();
        let bytes = bincode::serialize(&envelope).unwrap();
        let back: Envelope = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn sealed_sender_omits_source_fields() {
        let mut envelope = sample_envelope();
        envelope.source_uuid = None;
        envelope.source_device = None;
        envelope.kind = EnvelopeKind::UnidentifiedSender;
        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json.get("source_uuid").is_none());
        assert!(json.get("source_device").is_none());
    }

    #[test]
    fn ws_frame_uses_kind_tag() {
        let frame = WsFrame::Message(MessagePush {
            envelope: sample_envelope(),
        });
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["kind"], "message");

        let ack = serde_json::json!({ "kind": "ack", "guid": Uuid::new_v4() });
        assert!(matches!(
            serde_json::from_value::<WsFrame>(ack).unwrap(),
            WsFrame::Ack(_)
        ));

        let empty: WsFrame = serde_json::from_str(r#"{"kind":"queue_empty"}"#).unwrap();
        assert_eq!(empty, WsFrame::QueueEmpty);
    }

    #[test]
    fn conflict_bodies_use_frozen_field_names() {
        let mismatch = MismatchedDevices {
            missing_devices: vec![3],
            extra_devices: vec![],
        };
        let json = serde_json::to_value(&mismatch).unwrap();
        assert!(json.get("missingDevices").is_some());
        assert!(json.get("extraDevices").is_some());

        let stale = StaleDevices {
            stale_devices: vec![2],
        };
        let json = serde_json::to_value(&stale).unwrap();
        assert!(json.get("staleDevices").is_some());

        let list = OutgoingMessageList {
            messages: vec![],
            has_more: true,
        };
        let json = serde_json::to_value(&list).unwrap();
        assert_eq!(json["hasMore"], serde_json::json!(true));
    }

    #[test]
    fn send_request_flattens_message_list() {
        let request = WsFrame::Send(SendRequest {
            request_id: "r1".to_owned(),
            destination_uuid: Uuid::new_v4(),
            body: IncomingMessageList {
                messages: vec![IncomingMessage {
                    kind: EnvelopeKind::Ciphertext,
                    destination_device: 1,
                    destination_registration_id: 7,
                    content: b"opaque".to_vec(),
                }],
                timestamp: 123,
                online: false,
            },
        });
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["kind"], "send");
        // Flattened: the list fields sit at the top level of the frame.
        assert_eq!(json["timestamp"], serde_json::json!(123));
        assert_eq!(json["messages"][0]["destination_device"], 1);
    }
}
