//! # REST API Endpoints
//!
//! Provides HTTP API endpoints for querying gateway state.
//! Currently only exposes a list of connected LAN clients.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;
use tracing::warn;

use crate::handlers::{admit, header_value, TOKEN_HEADER};
use crate::state::RelayGateway;

/// Response item representing a single connected LAN client.
#[derive(Debug, Serialize)]
pub struct ClientListItem {
    /// Identity the client connected with (header or generated UUID).
    pub client_id: String,
    /// Peer address the session was accepted from.
    pub remote_ip: String,
}

/// `GET /api/clients`: lists connected clients.
///
/// Admitted like the WebSocket endpoint: a peer outside the allow-list gets
/// `403`, a missing or wrong `X-PC1-Token` gets `401`.
pub async fn list_clients(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(gateway): State<RelayGateway>,
) -> Result<Json<Vec<ClientListItem>>, StatusCode> {
    let token = header_value(&headers, TOKEN_HEADER);
    if let Err(reason) = admit(&gateway.config, addr.ip(), token.as_deref()) {
        warn!("local_relay_api_reject remote_ip={} reason={}", addr.ip(), reason);
        return Err(rejection_status(reason));
    }

    let mut clients: Vec<ClientListItem> = gateway
        .sessions
        .iter()
        .map(|entry| ClientListItem {
            client_id: entry.key().clone(),
            remote_ip: entry.value().remote_ip.to_string(),
        })
        .collect();
    clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
    Ok(Json(clients))
}

fn rejection_status(reason: &str) -> StatusCode {
    match reason {
        "forbidden" => StatusCode::FORBIDDEN,
        _ => StatusCode::UNAUTHORIZED,
    }
}
