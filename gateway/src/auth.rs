//! # Channel Authentication
//!
//! Presence channels need a signature from the application backend before
//! the broker accepts a subscription. The backend also publishes the
//! client version it expects, which is checked once at start-up.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::config::ReverbClientConfig;
use crate::endpoints::auth_candidates;
use crate::error::CloudError;

pub const CLIENT_KEY_HEADER: &str = "X-Client-Key";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// `{auth, channel_data}` as returned by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAuth {
    pub auth: String,
    pub channel_data: String,
}

#[derive(Debug, Deserialize)]
struct RawAuth {
    #[serde(default)]
    auth: Option<serde_json::Value>,
    #[serde(default)]
    channel_data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Meta {
    #[serde(default)]
    py_client_version: Option<String>,
}

/// HTTP client honouring the TLS-bypass flag.
pub fn http_client(config: &ReverbClientConfig) -> Result<reqwest::Client, CloudError> {
    let mut builder = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .danger_accept_invalid_certs(config.insecure_ssl);
    if let Some(agent) = &config.ws_user_agent {
        builder = builder.user_agent(agent.clone());
    }
    Ok(builder.build()?)
}

/// Signs `channel` for `socket_id`, trying each auth URL candidate in turn.
pub async fn authenticate(
    http: &reqwest::Client,
    config: &ReverbClientConfig,
    socket_id: &str,
) -> Result<ChannelAuth, CloudError> {
    let mut last = None;
    for url in auth_candidates(&config.auth_url) {
        match auth_once(http, &url, config, socket_id).await {
            Ok(auth) => return Ok(auth),
            Err(e) => {
                warn!("cloud_auth_attempt_failed url={} error={}", url, e);
                last = Some(e);
            }
        }
    }
    Err(CloudError::Auth {
        url: config.auth_url.clone(),
        last: last.map(|e| e.to_string()).unwrap_or_default(),
    })
}

async fn auth_once(
    http: &reqwest::Client,
    url: &str,
    config: &ReverbClientConfig,
    socket_id: &str,
) -> Result<ChannelAuth, CloudError> {
    let resp = http
        .post(url)
        .header(CLIENT_KEY_HEADER, &config.client_key)
        .json(&json!({ "socket_id": socket_id, "channel_name": config.channel }))
        .send()
        .await?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(CloudError::AuthStatus {
            status: status.as_u16(),
            body: truncate(&body, 300),
        });
    }

    let raw: RawAuth = resp.json().await?;
    let field = |v: Option<serde_json::Value>| {
        v.map(|v| relay_protocol::value_to_string(&v)).filter(|s| !s.is_empty())
    };
    let auth = field(raw.auth).ok_or(CloudError::AuthResponse("auth"))?;
    let channel_data = field(raw.channel_data).ok_or(CloudError::AuthResponse("channel_data"))?;
    Ok(ChannelAuth { auth, channel_data })
}

/// Compares the backend's expected client version with ours.
/// Never fails: problems are logged as warnings.
pub async fn check_client_version(http: &reqwest::Client, config: &ReverbClientConfig) {
    let result = async {
        let resp = http
            .get(&config.meta_url)
            .header(CLIENT_KEY_HEADER, &config.client_key)
            .send()
            .await?
            .error_for_status()?;
        resp.json::<Meta>().await
    }
    .await;

    match result {
        Ok(Meta { py_client_version: Some(expected) }) if expected != config.version => {
            warn!(
                "client_version_mismatch expected={} running={}",
                expected, config.version
            );
        }
        Ok(Meta { py_client_version: Some(_) }) => {
            info!("client_version_ok version={}", config.version);
        }
        Ok(Meta { py_client_version: None }) => {
            warn!("client_version_unknown url={}", config.meta_url);
        }
        Err(e) => {
            warn!("client_version_check_failed url={} error={}", config.meta_url, e);
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
