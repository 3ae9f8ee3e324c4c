//! # Gateway State
//!
//! Shared state for the LAN side of the relay:
//! - **Session registry**: maps client IDs to their live [`ClientSession`]
//! - **Cloud link**: whether the cloud session is currently subscribed
//! - **Counters**: frames relayed in each direction, reported by `status`
//!
//! The registry uses [`DashMap`] since every LAN socket runs in its own
//! task. At most one session is live per client ID; a newer connection
//! with the same ID replaces the older one.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use dashmap::DashMap;
use futures::stream::SplitSink;
use futures::SinkExt;
use relay_protocol::LanReply;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::outbox::CloudForwarder;

/// Close code sent when a client is replaced by a newer connection.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code sent to every client when the gateway stops.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close code sent when admission fails.
pub const CLOSE_POLICY: u16 = 1008;

// ─── Cloud Link ─────────────────────────────────────────────────

/// Shared "cloud connected" flag.
///
/// Set by the cloud session once it has subscribed, cleared when it tears
/// down. LAN replies report it so local clients know whether their
/// messages will go out right away.
#[derive(Debug, Clone, Default)]
pub struct CloudLink(Arc<AtomicBool>);

impl CloudLink {
    pub fn is_connected(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.0.store(connected, Ordering::SeqCst);
    }
}

// ─── Client Session ─────────────────────────────────────────────

type WsSink = SplitSink<WebSocket, Message>;

/// One connected LAN client.
pub struct ClientSession {
    /// Unique per connection, so a replaced session can tell itself apart
    /// from its successor under the same client ID.
    pub conn_id: Uuid,
    /// Identity used for routing; unique among live sessions.
    pub client_id: String,
    /// Peer address, as seen by the listener.
    pub remote_ip: IpAddr,
    /// Write half; the lock keeps frames from interleaving.
    sink: Mutex<WsSink>,
}

impl ClientSession {
    pub fn new(client_id: String, remote_ip: IpAddr, sink: WsSink) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            client_id,
            remote_ip,
            sink: Mutex::new(sink),
        }
    }

    pub async fn send(&self, reply: &LanReply) -> Result<(), axum::Error> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(reply.to_json().into())).await
    }

    /// Sends a close frame. Errors are ignored since the peer may be gone.
    pub async fn close(&self, code: u16, reason: &str) {
        let mut sink = self.sink.lock().await;
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        let _ = sink.send(Message::Close(Some(frame))).await;
    }
}

// ─── Relay Gateway ──────────────────────────────────────────────

/// Shared state handed to every LAN handler and to the cloud session.
#[derive(Clone)]
pub struct RelayGateway {
    pub config: Arc<RelayConfig>,

    /// Live sessions keyed by client ID.
    pub sessions: Arc<DashMap<String, Arc<ClientSession>>>,

    /// Wraps `to_cloud` payloads and puts them on the outbox.
    forwarder: CloudForwarder,

    /// Shared with the cloud session; read for `welcome` and `status`.
    link: CloudLink,

    /// `to_cloud` frames that passed validation, queued or not.
    to_cloud: Arc<AtomicU64>,

    /// Cloud messages handed to a live LAN session.
    from_cloud: Arc<AtomicU64>,
}

impl RelayGateway {
    pub fn new(config: RelayConfig, forwarder: CloudForwarder, link: CloudLink) -> Self {
        Self {
            config: Arc::new(config),
            sessions: Arc::new(DashMap::new()),
            forwarder,
            link,
            to_cloud: Arc::new(AtomicU64::new(0)),
            from_cloud: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn forwarder(&self) -> &CloudForwarder {
        &self.forwarder
    }

    pub fn cloud_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn messages_to_cloud(&self) -> u64 {
        self.to_cloud.load(Ordering::Relaxed)
    }

    pub fn messages_from_cloud(&self) -> u64 {
        self.from_cloud.load(Ordering::Relaxed)
    }

    pub fn count_to_cloud(&self) {
        self.to_cloud.fetch_add(1, Ordering::Relaxed);
    }

    /// Registers a session, returning the one it replaced, if any.
    pub fn register(&self, session: Arc<ClientSession>) -> Option<Arc<ClientSession>> {
        self.sessions.insert(session.client_id.clone(), session)
    }

    /// Removes `session` unless it has already been replaced.
    pub fn unregister_if_current(&self, session: &ClientSession) -> bool {
        self.sessions
            .remove_if(&session.client_id, |_, live| live.conn_id == session.conn_id)
            .is_some()
    }

    /// Routes a relay-tagged cloud message to a LAN client.
    ///
    /// Returns `false` when no live session has that ID or the write fails;
    /// the caller reports the miss back to the cloud.
    pub async fn deliver_from_cloud(
        &self,
        client_id: &str,
        msg_id: &str,
        event: &str,
        data: Value,
    ) -> bool {
        // Clone the Arc out so no map shard stays locked across the send.
        let session = self.sessions.get(client_id).map(|s| s.value().clone());
        let Some(session) = session else {
            warn!("local_relay_route_miss client_id={} event={}", client_id, event);
            return false;
        };

        self.from_cloud.fetch_add(1, Ordering::Relaxed);
        let reply = LanReply::FromCloud {
            msg_id: msg_id.to_string(),
            event: event.to_string(),
            data,
        };
        match session.send(&reply).await {
            Ok(()) => true,
            Err(e) => {
                warn!("local_relay_send_failed client_id={} error={}", client_id, e);
                false
            }
        }
    }

    /// Closes every session with 1001 and empties the registry.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<ClientSession>> =
            self.sessions.iter().map(|s| s.value().clone()).collect();
        self.sessions.clear();
        for session in sessions {
            session.close(CLOSE_GOING_AWAY, "server shutting down").await;
        }
        info!("local_relay_stopped");
    }
}
