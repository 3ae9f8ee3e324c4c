//! # Reverb Gateway
//!
//! Binary entry point. Reads configuration from the environment (and an
//! optional `.env` file), starts the LAN relay when a token is configured,
//! then keeps the cloud session alive until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use reverb_gateway::{
    auth, server, supervisor, CloudForwarder, CloudLink, CloudSession, CommandTable, Outbox,
    RelayConfig, RelayGateway, ReverbClientConfig,
};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

const CONFIG_RETRY_DELAY: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    // A missing .env file is normal in production.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reverb_gateway=info".into()),
        )
        .init();

    // Only the first install wins; a second one is harmless.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let (config, http) = tokio::select! {
        ready = load_cloud_config() => ready,
        _ = tokio::signal::ctrl_c() => return,
    };
    let config = Arc::new(config);
    auth::check_client_version(&http, &config).await;

    let outbox = Arc::new(Outbox::new(config.outbox_max_total, config.outbox_max_per_client));
    let link = CloudLink::default();

    // ── LAN relay ──
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let (relay, relay_task) = start_relay(&config, outbox.clone(), link.clone(), stop_rx).await;

    // ── Cloud session ──
    let executor = Arc::new(CommandTable::with_builtins(&config.version));
    let session = Arc::new(CloudSession::new(
        config.clone(),
        outbox,
        link,
        relay,
        executor,
        http,
    ));
    info!("🛰️ Reverb Gateway starting (channel={})", config.channel);

    tokio::select! {
        _ = supervisor::run_forever(session) => {}
        _ = tokio::signal::ctrl_c() => info!("shutdown_requested"),
    }

    let _ = stop_tx.send(());
    if let Some(task) = relay_task {
        let _ = task.await;
    }
    info!("Reverb Gateway stopped");
}

/// Loads the cloud configuration and builds the HTTP client for it,
/// retrying while either fails so a service manager does not restart-loop
/// on a missing variable.
async fn load_cloud_config() -> (ReverbClientConfig, reqwest::Client) {
    supervisor::retry_until_ok(
        "cloud_config_load",
        CONFIG_RETRY_DELAY,
        || -> Result<_, Box<dyn std::error::Error>> {
            let config = ReverbClientConfig::from_env()?;
            let http = auth::http_client(&config)?;
            Ok((config, http))
        },
    )
    .await
}

/// Starts the LAN relay if `LOCAL_RELAY_TOKEN` is set. Any failure is
/// logged and the cloud side runs without a gateway.
async fn start_relay(
    config: &ReverbClientConfig,
    outbox: Arc<Outbox>,
    link: CloudLink,
    stop: oneshot::Receiver<()>,
) -> (Option<RelayGateway>, Option<tokio::task::JoinHandle<()>>) {
    let relay_config = match RelayConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("local_relay_disabled reason=\"{}\"", e);
            return (None, None);
        }
    };
    if relay_config.token.is_empty() {
        info!("local_relay_disabled reason=\"LOCAL_RELAY_TOKEN not set\"");
        return (None, None);
    }

    let forwarder = CloudForwarder::new(outbox, config.channel.clone(), link.clone());
    let gateway = RelayGateway::new(relay_config, forwarder, link);
    let listener = match server::bind(&gateway).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("local_relay_bind_failed error={}", e);
            return (None, None);
        }
    };

    let serving = gateway.clone();
    let task = tokio::spawn(async move {
        let shutdown = async move {
            let _ = stop.await;
        };
        if let Err(e) = server::serve(listener, serving, shutdown).await {
            error!("local_relay_serve_failed error={}", e);
        }
    });
    (Some(gateway), Some(task))
}
