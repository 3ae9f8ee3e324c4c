//! # Configuration
//!
//! Both configurations are read once from the environment at start-up and
//! never mutated afterwards:
//! - [`ReverbClientConfig`]: the cloud session (`REVERB_*`, `RELAY_OUTBOX_*`)
//! - [`RelayConfig`]: the LAN gateway (`LOCAL_RELAY_*`)
//!
//! Loading goes through a lookup function so tests can feed a plain map
//! instead of touching the process environment.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::error::ConfigError;

pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;
pub const DEFAULT_CHANNEL: &str = "presence-client.1";
pub const DEFAULT_RELAY_PORT: u16 = 8765;

const AUTH_PATH_SUFFIX: &str = "/client/broadcasting/auth";
const META_PATH: &str = "/client/meta";

// ─── Cloud Session ──────────────────────────────────────────────

/// Settings for the single cloud (Reverb/Pusher) session.
#[derive(Debug, Clone)]
pub struct ReverbClientConfig {
    /// Full WebSocket URL, including `/app/<key>?<protocol query>`.
    pub ws_url: String,
    /// HTTP endpoint that signs presence-channel subscriptions.
    pub auth_url: String,
    /// HTTP endpoint that reports the expected client version.
    pub meta_url: String,
    pub channel: String,
    /// Sent as `X-Client-Key` on every HTTP call.
    pub client_key: String,
    pub ws_origin: Option<String>,
    pub ws_user_agent: Option<String>,
    pub heartbeat_interval: Duration,
    /// Upper bound for the reconnect backoff.
    pub reconnect_delay_cap: Duration,
    pub version: String,
    /// Skip TLS certificate verification (self-signed dev brokers).
    pub insecure_ssl: bool,
    pub log_heartbeats: bool,
    pub max_message_bytes: usize,
    pub outbox_max_total: usize,
    pub outbox_max_per_client: usize,
}

impl ReverbClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Environment variables:
    /// - `REVERB_WS_URL`: full WebSocket URL; otherwise built from
    ///   `REVERB_WS_HOST` + `REVERB_APP_KEY` (+ `REVERB_WS_PROTOCOL_QUERY`)
    /// - `REVERB_AUTH_URL` (required), `REVERB_META_URL`
    /// - `REVERB_CLIENT_KEY` (required), `REVERB_CHANNEL`
    /// - `REVERB_HEARTBEAT_SECONDS` (10), `REVERB_RECONNECT_DELAY_SECONDS` (60)
    /// - `REVERB_VERSION`, `REVERB_INSECURE_SSL`, `REVERB_LOG_HEARTBEATS`
    /// - `REVERB_MAX_MESSAGE_BYTES`, `REVERB_WS_ORIGIN`, `REVERB_WS_USER_AGENT`
    /// - `RELAY_OUTBOX_MAX_TOTAL` (1000), `RELAY_OUTBOX_MAX_PER_CLIENT` (100)
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let ws_url = match get("REVERB_WS_URL") {
            Some(url) => url,
            None => {
                let host = get("REVERB_WS_HOST").ok_or(ConfigError::Missing("REVERB_WS_URL or REVERB_WS_HOST"))?;
                let query = get("REVERB_WS_PROTOCOL_QUERY").unwrap_or_else(default_protocol_query);
                build_ws_url(&host, get("REVERB_APP_KEY").as_deref(), &query)?
            }
        };

        let auth_url = get("REVERB_AUTH_URL").ok_or(ConfigError::Missing("REVERB_AUTH_URL"))?;
        let meta_url = get("REVERB_META_URL").unwrap_or_else(|| infer_meta_url(&auth_url));
        let client_key = get("REVERB_CLIENT_KEY").ok_or(ConfigError::Missing("REVERB_CLIENT_KEY"))?;

        let heartbeat_secs: u64 = parse_or(&get, "REVERB_HEARTBEAT_SECONDS", 10)?;
        let reconnect_secs: u64 = parse_or(&get, "REVERB_RECONNECT_DELAY_SECONDS", 60)?;

        Ok(Self {
            ws_url,
            auth_url,
            meta_url,
            channel: get("REVERB_CHANNEL").unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
            client_key,
            ws_origin: get("REVERB_WS_ORIGIN"),
            ws_user_agent: get("REVERB_WS_USER_AGENT"),
            heartbeat_interval: Duration::from_secs(heartbeat_secs.max(1)),
            reconnect_delay_cap: Duration::from_secs(reconnect_secs.max(1)),
            version: get("REVERB_VERSION").unwrap_or_else(|| "dev".to_string()),
            insecure_ssl: get("REVERB_INSECURE_SSL").is_some_and(|v| is_truthy(&v)),
            log_heartbeats: get("REVERB_LOG_HEARTBEATS").is_some_and(|v| is_truthy(&v)),
            max_message_bytes: parse_or(&get, "REVERB_MAX_MESSAGE_BYTES", DEFAULT_MAX_MESSAGE_BYTES)?,
            outbox_max_total: parse_or(&get, "RELAY_OUTBOX_MAX_TOTAL", 1000usize)?.max(1),
            outbox_max_per_client: parse_or(&get, "RELAY_OUTBOX_MAX_PER_CLIENT", 100usize)?.max(1),
        })
    }
}

fn default_protocol_query() -> String {
    format!(
        "protocol=7&client=rust&version={}&flash=false",
        env!("CARGO_PKG_VERSION")
    )
}

/// Builds `<scheme>://<host>/app/<key>?<query>` from a bare host or base URL.
///
/// A host ending in `:8080` without a scheme is assumed to be plain `ws://`
/// (DDEV's HTTP router port); anything else defaults to `wss://`. A base
/// that already contains `/app/` is used as-is.
fn build_ws_url(host: &str, app_key: Option<&str>, query: &str) -> Result<String, ConfigError> {
    let base = if host.starts_with("ws://") || host.starts_with("wss://") {
        host.to_string()
    } else {
        let scheme = if host.ends_with(":8080") { "ws" } else { "wss" };
        format!("{}://{}", scheme, host)
    };
    if base.contains("/app/") {
        return Ok(base);
    }
    let app_key = app_key.ok_or(ConfigError::Missing("REVERB_APP_KEY"))?;
    Ok(format!("{}/app/{}?{}", base.trim_end_matches('/'), app_key, query))
}

/// Derives the meta endpoint from the auth endpoint:
/// `/client/broadcasting/auth` → `/client/meta`.
pub fn infer_meta_url(auth_url: &str) -> String {
    let Ok(mut url) = Url::parse(auth_url) else {
        return auth_url.to_string();
    };
    if !url.has_host() {
        return auth_url.to_string();
    }
    let path = match url.path().strip_suffix(AUTH_PATH_SUFFIX) {
        Some(prefix) => format!("{}{}", prefix, META_PATH),
        None => META_PATH.to_string(),
    };
    url.set_path(&path);
    url.set_query(None);
    url.set_fragment(None);
    url.to_string()
}

// ─── LAN Gateway ────────────────────────────────────────────────

/// Settings for the LAN-facing relay server.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Shared secret expected in `X-PC1-Token`. Empty rejects everyone.
    pub token: String,
    /// Allowed client networks; empty allows any address.
    pub allowlist: Vec<IpNet>,
    pub max_message_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_RELAY_PORT,
            token: String::new(),
            allowlist: Vec::new(),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Environment variables: `LOCAL_RELAY_HOST`, `LOCAL_RELAY_PORT`,
    /// `LOCAL_RELAY_TOKEN`, `LOCAL_RELAY_ALLOWLIST` (comma-separated IPs or
    /// CIDRs), `LOCAL_RELAY_MAX_MESSAGE_BYTES`.
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();
        Ok(Self {
            host: get("LOCAL_RELAY_HOST").unwrap_or(defaults.host),
            port: parse_or(&get, "LOCAL_RELAY_PORT", defaults.port)?,
            token: get("LOCAL_RELAY_TOKEN").unwrap_or_default(),
            allowlist: match get("LOCAL_RELAY_ALLOWLIST") {
                Some(raw) => parse_allowlist(&raw)?,
                None => Vec::new(),
            },
            max_message_bytes: parse_or(&get, "LOCAL_RELAY_MAX_MESSAGE_BYTES", defaults.max_message_bytes)?,
        })
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self.host.parse().map_err(|_| ConfigError::Invalid {
            key: "LOCAL_RELAY_HOST",
            value: self.host.clone(),
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Whether a peer address passes the allow-list.
    pub fn allows(&self, ip: IpAddr) -> bool {
        self.allowlist.is_empty() || self.allowlist.iter().any(|net| net.contains(ip))
    }
}

// ─── Allow-list ─────────────────────────────────────────────────

/// An IP network in CIDR form. A bare address is a single-host network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNet {
    addr: IpAddr,
    prefix: u8,
}

impl IpNet {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = mask_u32(self.prefix);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = mask_u128(self.prefix);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for IpNet {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ConfigError::Allowlist(s.to_string());
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let addr: IpAddr = addr.trim().parse().map_err(|_| bad())?;
        let addr = addr.to_canonical();
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p.trim().parse::<u8>().map_err(|_| bad())?,
            None => max,
        };
        if prefix > max {
            return Err(bad());
        }
        Ok(Self { addr, prefix })
    }
}

fn mask_u32(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn mask_u128(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

/// Parses a comma-separated list such as `192.168.1.10,10.0.0.0/8`.
pub fn parse_allowlist(raw: &str) -> Result<Vec<IpNet>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(IpNet::from_str)
        .collect()
}

// ─── Helpers ────────────────────────────────────────────────────

fn is_truthy(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "yes" | "YES")
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(default),
    }
}
