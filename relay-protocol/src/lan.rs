//! # LAN Relay Frames
//!
//! JSON text frames exchanged between the gateway and LAN-local clients.
//! Requests are parsed leniently into [`LanRequest`]; anything that cannot
//! be served becomes a [`Rejection`] that maps onto a typed `error` reply.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::value_to_string;

// ─── Replies (gateway → client) ─────────────────────────────────

/// All frames the gateway sends to a LAN client.
///
/// Internally tagged: `LanReply::Pong { .. }` serializes as
/// `{"type":"pong",...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LanReply {
    /// Sent once right after admission.
    Welcome { client_id: String, cloud_connected: bool },

    Pong { msg_id: String },

    Status {
        client_id: String,
        cloud_connected: bool,
        messages_to_cloud: u64,
        messages_from_cloud: u64,
    },

    /// A `to_cloud` message was accepted into the outbox.
    Ack {
        msg_id: String,
        status: String,
        cloud_connected: bool,
    },

    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg_id: Option<String>,
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cloud_connected: Option<bool>,
    },

    /// A cloud message routed to this client by its relay envelope.
    FromCloud {
        msg_id: String,
        event: String,
        data: Value,
    },
}

impl LanReply {
    pub fn queued(msg_id: impl Into<String>, cloud_connected: bool) -> Self {
        LanReply::Ack {
            msg_id: msg_id.into(),
            status: "queued".to_string(),
            cloud_connected,
        }
    }

    pub fn to_json(&self) -> String {
        // Every variant is plain strings/bools/numbers/values.
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

impl From<Rejection> for LanReply {
    fn from(r: Rejection) -> Self {
        LanReply::Error {
            msg_id: r.msg_id,
            code: r.code,
            message: r.message,
            cloud_connected: None,
        }
    }
}

/// Error codes carried in `error` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NonText,
    InvalidJson,
    InvalidMessage,
    MissingEvent,
    MissingMsgId,
    InvalidData,
    UnknownType,
    QueueFull,
    ClientQueueFull,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NonText => "non_text",
            ErrorCode::InvalidJson => "invalid_json",
            ErrorCode::InvalidMessage => "invalid_message",
            ErrorCode::MissingEvent => "missing_event",
            ErrorCode::MissingMsgId => "missing_msg_id",
            ErrorCode::InvalidData => "invalid_data",
            ErrorCode::UnknownType => "unknown_type",
            ErrorCode::QueueFull => "queue_full",
            ErrorCode::ClientQueueFull => "client_queue_full",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Requests (client → gateway) ────────────────────────────────

/// A validated request from a LAN client.
#[derive(Debug, Clone, PartialEq)]
pub enum LanRequest {
    Ping { msg_id: String },
    Status,
    ToCloud {
        msg_id: String,
        event: String,
        data: Map<String, Value>,
    },
}

/// Why a LAN frame could not be served.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub msg_id: Option<String>,
    pub code: ErrorCode,
    pub message: String,
}

impl Rejection {
    fn new(msg_id: Option<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            msg_id,
            code,
            message: message.into(),
        }
    }

    pub fn non_text() -> Self {
        Self::new(None, ErrorCode::NonText, "Text JSON required")
    }
}

impl LanRequest {
    /// Parses and validates one text frame.
    ///
    /// `to_cloud` requires a non-empty `event` and `msg_id`, and `data` must
    /// be an object (absent or `null` counts as `{}`).
    pub fn parse(text: &str) -> Result<Self, Rejection> {
        let value: Value = serde_json::from_str(text)
            .map_err(|_| Rejection::new(None, ErrorCode::InvalidJson, "Invalid JSON"))?;
        let Value::Object(mut msg) = value else {
            return Err(Rejection::new(None, ErrorCode::InvalidMessage, "JSON object required"));
        };

        let field = |msg: &Map<String, Value>, key: &str| {
            msg.get(key)
                .map(value_to_string)
                .unwrap_or_default()
                .trim()
                .to_string()
        };
        let mtype = field(&msg, "type");
        let msg_id = field(&msg, "msg_id");

        match mtype.as_str() {
            "ping" => Ok(LanRequest::Ping { msg_id }),
            "status" => Ok(LanRequest::Status),
            "to_cloud" => {
                let event = field(&msg, "event");
                if event.is_empty() {
                    return Err(Rejection::new(
                        Some(msg_id),
                        ErrorCode::MissingEvent,
                        "event required",
                    ));
                }
                if msg_id.is_empty() {
                    return Err(Rejection::new(None, ErrorCode::MissingMsgId, "msg_id required"));
                }
                let data = match msg.remove("data") {
                    None | Some(Value::Null) => Map::new(),
                    Some(Value::Object(data)) => data,
                    Some(_) => {
                        return Err(Rejection::new(
                            Some(msg_id),
                            ErrorCode::InvalidData,
                            "data must be a JSON object",
                        ))
                    }
                };
                Ok(LanRequest::ToCloud { msg_id, event, data })
            }
            other => Err(Rejection::new(
                Some(msg_id),
                ErrorCode::UnknownType,
                format!("Unknown type: {}", other),
            )),
        }
    }
}
