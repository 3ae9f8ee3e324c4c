//! # LAN Server
//!
//! Routes and serving loop for the LAN relay. Stopping the server closes
//! every live session with 1001 before the listener goes away.

use std::future::Future;
use std::net::SocketAddr;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::api::list_clients;
use crate::handlers::ws_handler;
use crate::state::RelayGateway;

pub fn router(gateway: RelayGateway) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/api/clients", get(list_clients))
        .with_state(gateway)
}

/// Binds the configured address.
pub async fn bind(gateway: &RelayGateway) -> std::io::Result<TcpListener> {
    let addr = gateway
        .config
        .bind_addr()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
    let listener = TcpListener::bind(addr).await?;
    if gateway.config.token.is_empty() {
        warn!("local_relay_token_missing: LOCAL_RELAY_TOKEN is empty; all local connections will be rejected");
    }
    info!("local_relay_listening addr={}", listener.local_addr()?);
    Ok(listener)
}

/// Serves until `shutdown` resolves, then closes all LAN sessions.
pub async fn serve<F>(listener: TcpListener, gateway: RelayGateway, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(gateway.clone()).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            gateway.shutdown().await;
        })
        .await
}
