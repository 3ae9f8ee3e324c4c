//! # Cloud Outbox
//!
//! Bounded in-memory queue of frames waiting to go up to the cloud. Each
//! item is owned by the LAN client that asked for it, and a per-client
//! pending counter keeps one noisy client from filling the whole queue.
//!
//! Counter rules:
//! - incremented once when [`Outbox::try_put`] accepts an item
//! - decremented once when the item is sent or finally dropped
//! - untouched by [`Outbox::requeue_existing`]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use relay_protocol::cloud::inject_relay;
use relay_protocol::{ErrorCode, LanReply, PusherFrame};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::state::CloudLink;

/// One queued frame and the LAN client that owns it.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxItem {
    pub client_id: String,
    pub msg_id: String,
    pub frame: PusherFrame,
}

/// Why [`Outbox::try_put`] refused an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxRejection {
    QueueFull,
    ClientQueueFull,
}

impl OutboxRejection {
    pub fn code(&self) -> ErrorCode {
        match self {
            OutboxRejection::QueueFull => ErrorCode::QueueFull,
            OutboxRejection::ClientQueueFull => ErrorCode::ClientQueueFull,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            OutboxRejection::QueueFull => "Cloud outbox is full",
            OutboxRejection::ClientQueueFull => "Too many pending messages for this client",
        }
    }
}

pub struct Outbox {
    tx: mpsc::Sender<OutboxItem>,
    rx: tokio::sync::Mutex<mpsc::Receiver<OutboxItem>>,
    pending: Mutex<HashMap<String, usize>>,
    max_per_client: usize,
}

impl Outbox {
    /// Both caps are clamped to at least 1.
    pub fn new(max_total: usize, max_per_client: usize) -> Self {
        let (tx, rx) = mpsc::channel(max_total.max(1));
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            pending: Mutex::new(HashMap::new()),
            max_per_client: max_per_client.max(1),
        }
    }

    /// Enqueues an item without waiting. The total cap is checked before
    /// the per-client cap.
    pub fn try_put(&self, item: OutboxItem) -> Result<(), OutboxRejection> {
        let mut pending = self.pending_map();
        if self.tx.capacity() == 0 {
            return Err(OutboxRejection::QueueFull);
        }
        let count = pending.get(&item.client_id).copied().unwrap_or(0);
        if count >= self.max_per_client {
            return Err(OutboxRejection::ClientQueueFull);
        }
        let client_id = item.client_id.clone();
        self.tx
            .try_send(item)
            .map_err(|_| OutboxRejection::QueueFull)?;
        *pending.entry(client_id).or_insert(0) += 1;
        Ok(())
    }

    /// Waits for the next item in arrival order.
    ///
    /// Cancel-safe: dropping the future never loses an item. Returns `None`
    /// only if the channel is closed, which cannot happen while `self` lives.
    pub async fn take(&self) -> Option<OutboxItem> {
        self.rx.lock().await.recv().await
    }

    /// Settles one item for `client_id`, removing the entry at zero.
    pub fn mark_done(&self, client_id: &str) {
        let mut pending = self.pending_map();
        if let Some(count) = pending.get_mut(client_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                pending.remove(client_id);
            }
        }
    }

    /// Puts an already-counted item back at the tail.
    /// Returns `false` when the queue is at hard capacity.
    pub fn requeue_existing(&self, item: OutboxItem) -> bool {
        self.tx.try_send(item).is_ok()
    }

    /// Items counted against `client_id` (queued or in flight).
    pub fn pending(&self, client_id: &str) -> usize {
        self.pending_map().get(client_id).copied().unwrap_or(0)
    }

    /// Items currently sitting in the queue.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pending_map(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        // The map holds plain counters, so a poisoned lock is still usable.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ─── In-flight Guard ────────────────────────────────────────────

/// An item taken from the outbox that has not been settled yet.
///
/// If the guard is dropped unsettled (e.g. the sender task was aborted
/// mid-send), the item is requeued, or dropped and counted down when the
/// queue is full, so a pending counter can never leak.
pub struct InFlight {
    outbox: Arc<Outbox>,
    item: Option<OutboxItem>,
}

impl InFlight {
    pub fn new(outbox: Arc<Outbox>, item: OutboxItem) -> Self {
        Self {
            outbox,
            item: Some(item),
        }
    }

    /// The item reached the cloud.
    pub fn done(mut self) {
        if let Some(item) = self.item.take() {
            self.outbox.mark_done(&item.client_id);
        }
    }

    /// The send failed: one best-effort requeue, else drop and count down.
    pub fn retry_later(mut self) {
        if let Some(item) = self.item.take() {
            requeue_or_drop(&self.outbox, item);
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            requeue_or_drop(&self.outbox, item);
        }
    }
}

fn requeue_or_drop(outbox: &Outbox, item: OutboxItem) {
    let client_id = item.client_id.clone();
    let msg_id = item.msg_id.clone();
    if outbox.requeue_existing(item) {
        debug!("cloud_outbox_requeued client_id={} msg_id={}", client_id, msg_id);
    } else {
        outbox.mark_done(&client_id);
        warn!("cloud_outbox_drop_inflight client_id={} msg_id={}", client_id, msg_id);
    }
}

// ─── LAN → Cloud Forwarder ──────────────────────────────────────

/// Turns a validated `to_cloud` request into an outbox item and answers
/// the LAN client with `ack` or a capacity `error`.
#[derive(Clone)]
pub struct CloudForwarder {
    outbox: Arc<Outbox>,
    channel: String,
    link: CloudLink,
}

impl CloudForwarder {
    pub fn new(outbox: Arc<Outbox>, channel: impl Into<String>, link: CloudLink) -> Self {
        Self {
            outbox,
            channel: channel.into(),
            link,
        }
    }

    pub fn enqueue(
        &self,
        client_id: &str,
        msg_id: &str,
        event: &str,
        data: Map<String, Value>,
    ) -> LanReply {
        let data = inject_relay(data, client_id, msg_id);
        let frame = PusherFrame::new(event, Value::Object(data)).on_channel(self.channel.as_str());
        let item = OutboxItem {
            client_id: client_id.to_string(),
            msg_id: msg_id.to_string(),
            frame,
        };
        let cloud_connected = self.link.is_connected();
        match self.outbox.try_put(item) {
            Ok(()) => LanReply::queued(msg_id, cloud_connected),
            Err(rejection) => {
                warn!(
                    "cloud_outbox_reject client_id={} msg_id={} code={}",
                    client_id,
                    msg_id,
                    rejection.code()
                );
                LanReply::Error {
                    msg_id: Some(msg_id.to_string()),
                    code: rejection.code(),
                    message: rejection.message().to_string(),
                    cloud_connected: Some(cloud_connected),
                }
            }
        }
    }
}
