//! # Errors
//!
//! Typed errors for the cloud side and for configuration. LAN-side problems
//! never surface as errors: they are answered with typed `error` frames or
//! by closing the offending socket.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Everything that can end a cloud session.
///
/// Only the reconnect supervisor turns one of these into a retry.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("failed to connect to WS using {url}: {last}")]
    Connect { url: String, last: String },

    #[error("timed out opening {url} after {secs}s")]
    OpenTimeout { url: String, secs: u64 },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("failed to authenticate/subscribe using {url}: {last}")]
    Auth { url: String, last: String },

    #[error("auth HTTP error {status}: {body}")]
    AuthStatus { status: u16, body: String },

    #[error("auth response missing '{0}'")]
    AuthResponse(&'static str),

    #[error("invalid request: {0}")]
    Request(String),

    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tls config error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("session task failed: {0}")]
    Task(String),

    #[error("outbox closed")]
    OutboxClosed,

    #[error("cloud websocket closed")]
    Closed,
}

/// Invalid or missing settings detected while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("invalid allowlist entry: {0:?}")]
    Allowlist(String),
}
