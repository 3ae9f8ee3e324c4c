//! # Relay Protocol
//!
//! Wire types shared by the gateway's two faces:
//! - [`cloud`]: Pusher-protocol frames exchanged with the Reverb broker,
//!   plus the relay envelope that tags a message with a LAN client identity
//! - [`lan`]: JSON frames exchanged with LAN-local relay clients
//!
//! Nothing in this crate performs I/O; it only shapes and validates JSON.

pub mod cloud;
pub mod lan;

pub use cloud::{CommandResult, PusherFrame, RelayEnvelope, ServerCommand};
pub use lan::{ErrorCode, LanReply, LanRequest, Rejection};

/// Renders a JSON value the way the broker's PHP side stringifies ids:
/// strings verbatim, `null` as empty, everything else as compact JSON.
pub fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
