//! # WebSocket Handlers
//!
//! Contains the LAN-facing WebSocket logic:
//! - Admission (allow-list, shared token) right after the upgrade
//! - Session registration with replacement of a stale session
//! - Dispatching each incoming frame and answering it

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use relay_protocol::{LanReply, LanRequest, Rejection};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::state::{ClientSession, RelayGateway, CLOSE_NORMAL, CLOSE_POLICY};

/// Shared secret header.
pub const TOKEN_HEADER: &str = "x-pc1-token";
/// Optional stable identity header.
pub const CLIENT_ID_HEADER: &str = "x-relay-client-id";

// ─── WebSocket Upgrade Endpoint ─────────────────────────────────

/// `GET /` (and `/ws`): upgrades a LAN client connection.
///
/// Admission is decided after the upgrade so rejected clients receive a
/// proper close code instead of a bare HTTP error.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(gateway): State<RelayGateway>,
) -> impl IntoResponse {
    let token = header_value(&headers, TOKEN_HEADER);
    let requested_id = header_value(&headers, CLIENT_ID_HEADER);
    let max = gateway.config.max_message_bytes;
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| {
            handle_connection(socket, gateway, addr.ip(), token, requested_id)
        })
}

pub(crate) fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Checks the allow-list first, then the token. An empty configured token
/// rejects everyone. Returns the close reason on failure.
pub fn admit(config: &RelayConfig, ip: IpAddr, token: Option<&str>) -> Result<(), &'static str> {
    if !config.allows(ip) {
        return Err("forbidden");
    }
    if !token_matches(&config.token, token) {
        return Err("unauthorized");
    }
    Ok(())
}

fn token_matches(expected: &str, presented: Option<&str>) -> bool {
    !expected.is_empty() && presented == Some(expected)
}

// ─── Connection Lifecycle ───────────────────────────────────────

/// ## Flow:
/// 1. Admit or close with 1008
/// 2. Pick the client ID (header or fresh UUID) and register, replacing
///    any session that already holds that ID
/// 3. Send `welcome`
/// 4. Answer frames until the socket closes
/// 5. Unregister, unless a newer session already took over the ID
async fn handle_connection(
    mut socket: WebSocket,
    gateway: RelayGateway,
    remote_ip: IpAddr,
    token: Option<String>,
    requested_id: Option<String>,
) {
    if let Err(reason) = admit(&gateway.config, remote_ip, token.as_deref()) {
        warn!("local_relay_reject remote_ip={} reason={}", remote_ip, reason);
        let frame = CloseFrame {
            code: CLOSE_POLICY,
            reason: reason.into(),
        };
        let _ = socket.send(Message::Close(Some(frame))).await;
        return;
    }

    let client_id = requested_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let (ws_sink, mut ws_stream) = socket.split();
    let session = Arc::new(ClientSession::new(client_id.clone(), remote_ip, ws_sink));

    if let Some(old) = gateway.register(session.clone()) {
        info!("local_relay_replaced client_id={} old_ip={}", client_id, old.remote_ip);
        old.close(CLOSE_NORMAL, "replaced").await;
    }
    info!("local_relay_connected client_id={} remote_ip={}", client_id, remote_ip);

    let welcome = LanReply::Welcome {
        client_id: client_id.clone(),
        cloud_connected: gateway.cloud_connected(),
    };
    if session.send(&welcome).await.is_ok() {
        // ── Inbound Loop ──
        while let Some(frame) = ws_stream.next().await {
            let msg = match frame {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("local_relay_read_error client_id={} error={}", client_id, e);
                    break;
                }
            };
            let reply = match msg {
                Message::Text(text) => Some(handle_text(&gateway, &session, text.as_str())),
                Message::Binary(_) => Some(Rejection::non_text().into()),
                Message::Close(_) => break,
                // Ping/pong are answered by the socket itself.
                _ => None,
            };
            if let Some(reply) = reply {
                if session.send(&reply).await.is_err() {
                    break;
                }
            }
        }
    }

    // ── Cleanup on Disconnect ──
    if gateway.unregister_if_current(&session) {
        info!("local_relay_disconnected client_id={}", client_id);
    } else {
        debug!("local_relay_disconnected client_id={} (replaced)", client_id);
    }
}

// ─── Frame Dispatcher ───────────────────────────────────────────

/// Answers one text frame from a LAN client.
pub fn handle_text(gateway: &RelayGateway, session: &ClientSession, text: &str) -> LanReply {
    let request = match LanRequest::parse(text) {
        Ok(request) => request,
        Err(rejection) => return rejection.into(),
    };

    match request {
        LanRequest::Ping { msg_id } => LanReply::Pong { msg_id },

        LanRequest::Status => LanReply::Status {
            client_id: session.client_id.clone(),
            cloud_connected: gateway.cloud_connected(),
            messages_to_cloud: gateway.messages_to_cloud(),
            messages_from_cloud: gateway.messages_from_cloud(),
        },

        LanRequest::ToCloud { msg_id, event, data } => {
            let reply = gateway
                .forwarder()
                .enqueue(&session.client_id, &msg_id, &event, data);
            gateway.count_to_cloud();
            reply
        }
    }
}
