//! # Cloud (Pusher) Frames
//!
//! Every frame on the broker socket is a JSON object with an `event` name,
//! an optional `channel` and a `data` field. Pusher servers frequently send
//! `data` as a JSON-encoded *string*, so inbound data is decoded
//! defensively, and outbound object data is string-encoded the same way.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::value_to_string;

// ─── Event Names ────────────────────────────────────────────────

pub const CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
pub const PING: &str = "pusher:ping";
pub const PONG: &str = "pusher:pong";
pub const ERROR: &str = "pusher:error";
pub const SUBSCRIBE: &str = "pusher:subscribe";
pub const SERVER_COMMAND: &str = "server-command";
pub const HEARTBEAT: &str = "client-heartbeat";
pub const COMMAND_RESULT: &str = "client-command-result";

// ─── Frame ──────────────────────────────────────────────────────

/// A single Pusher protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PusherFrame {
    pub event: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Raw `data` as received. Use [`PusherFrame::data_value`] to read it.
    #[serde(default)]
    pub data: Value,
}

impl PusherFrame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            channel: None,
            data,
        }
    }

    pub fn on_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Parses a text frame from the broker.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Returns `data` with one level of JSON-as-string decoding applied.
    /// A string that is not valid JSON is returned unchanged.
    pub fn data_value(&self) -> Value {
        decode_data(&self.data)
    }

    /// Serializes the frame for the wire, string-encoding object/array data.
    pub fn to_wire(&self) -> serde_json::Result<String> {
        let data = match &self.data {
            Value::String(_) | Value::Null => self.data.clone(),
            other => Value::String(serde_json::to_string(other)?),
        };
        let mut out = Map::new();
        out.insert("event".into(), Value::String(self.event.clone()));
        if let Some(channel) = &self.channel {
            out.insert("channel".into(), Value::String(channel.clone()));
        }
        out.insert("data".into(), data);
        serde_json::to_string(&Value::Object(out))
    }

    // ── Outbound constructors ──

    pub fn pong() -> Self {
        Self::new(PONG, Value::Object(Map::new()))
    }

    pub fn subscribe(channel: &str, auth: &str, channel_data: &str) -> Self {
        Self::new(
            SUBSCRIBE,
            serde_json::json!({
                "channel": channel,
                "auth": auth,
                "channel_data": channel_data,
            }),
        )
    }

    pub fn heartbeat(channel: &str, ts: u64, version: &str) -> Self {
        Self::new(HEARTBEAT, serde_json::json!({ "ts": ts, "version": version }))
            .on_channel(channel)
    }

    pub fn command_result(channel: &str, result: &CommandResult) -> Self {
        let data = serde_json::to_value(result).unwrap_or(Value::Null);
        Self::new(COMMAND_RESULT, data).on_channel(channel)
    }
}

/// Decodes a Pusher `data` field that may have been sent as a JSON string.
pub fn decode_data(data: &Value) -> Value {
    match data {
        Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| data.clone()),
        other => other.clone(),
    }
}

/// Extracts `socket_id` from a `pusher:connection_established` payload.
/// Returns `None` when the payload is not an object with a non-empty id.
pub fn socket_id_from(data: &Value) -> Option<String> {
    let id = data.as_object()?.get("socket_id")?;
    let id = value_to_string(id);
    (!id.is_empty()).then_some(id)
}

// ─── Relay Envelope ─────────────────────────────────────────────

/// Routing metadata embedded as `data.relay` on messages that travel
/// between the cloud and a specific LAN client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub client_id: String,
    pub msg_id: String,
}

/// Returns a copy of `data` with `relay = {client_id, msg_id}` set.
pub fn inject_relay(mut data: Map<String, Value>, client_id: &str, msg_id: &str) -> Map<String, Value> {
    data.insert(
        "relay".into(),
        serde_json::json!({ "client_id": client_id, "msg_id": msg_id }),
    );
    data
}

/// Removes an object-valued `relay` field from `data`.
///
/// The envelope is returned only when it names a non-empty client id; an
/// object envelope without one is still stripped. A non-object `relay` is
/// left in place and treated as absent.
pub fn strip_relay(mut data: Map<String, Value>) -> (Option<RelayEnvelope>, Map<String, Value>) {
    let Some(Value::Object(relay)) = data.get("relay") else {
        return (None, data);
    };
    let client_id = relay
        .get("client_id")
        .map(value_to_string)
        .unwrap_or_default()
        .trim()
        .to_string();
    let msg_id = relay
        .get("msg_id")
        .map(value_to_string)
        .unwrap_or_default()
        .trim()
        .to_string();
    data.remove("relay");
    let envelope = (!client_id.is_empty()).then_some(RelayEnvelope { client_id, msg_id });
    (envelope, data)
}

// ─── Commands ───────────────────────────────────────────────────

/// A decoded `server-command` with its relay envelope already stripped.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerCommand {
    pub correlation_id: String,
    pub command_name: String,
    pub payload: Map<String, Value>,
    pub relay: Option<RelayEnvelope>,
    /// The full data object minus `relay`, as forwarded to LAN clients.
    pub stripped: Map<String, Value>,
}

impl ServerCommand {
    /// Builds a command from decoded `server-command` data.
    /// Returns `None` when the data is not a JSON object.
    pub fn from_data(data: Value) -> Option<Self> {
        let Value::Object(data) = data else {
            return None;
        };
        let (relay, stripped) = strip_relay(data);
        let correlation_id = stripped
            .get("correlation_id")
            .map(value_to_string)
            .unwrap_or_default();
        let command_name = stripped
            .get("command_name")
            .map(value_to_string)
            .unwrap_or_default();
        let payload = match stripped.get("payload") {
            Some(Value::Object(p)) => p.clone(),
            _ => Map::new(),
        };
        Some(Self {
            correlation_id,
            command_name,
            payload,
            relay,
            stripped,
        })
    }
}

/// Body of a `client-command-result` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub correlation_id: String,
    pub command_name: String,
    pub ok: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl CommandResult {
    /// The failure reported to the cloud when a relay target is not connected.
    pub fn unreachable(command: &ServerCommand, client_id: &str) -> Self {
        Self {
            correlation_id: command.correlation_id.clone(),
            command_name: command.command_name.clone(),
            ok: false,
            message: format!("Relay client not connected: {}", client_id),
            payload: None,
        }
    }
}
