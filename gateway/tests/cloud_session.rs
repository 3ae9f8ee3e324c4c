//! Cloud side end to end: the supervisor talks to a fake Reverb broker and
//! a fake auth backend on loopback, with a real LAN relay in between.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{http::HeaderMap, http::StatusCode, routing::post, Json, Router};
use common::*;
use futures::{SinkExt, StreamExt};
use reverb_gateway::{
    supervisor, CloudLink, CloudSession, CommandOutcome, CommandTable, Outbox,
    ReverbClientConfig,
};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

type Broker = WebSocketStream<TcpStream>;

const CLIENT_KEY: &str = "device-key";

// ─── Fakes ──────────────────────────────────────────────────────

const AUTH_PATH: &str = "/client/broadcasting/auth";

/// Serves `app` on loopback and returns the auth URL it answers on.
async fn serve_auth(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}{}", addr, AUTH_PATH)
}

/// Auth backend that signs any channel for the right client key.
async fn start_auth() -> String {
    async fn sign(headers: HeaderMap, Json(body): Json<Value>) -> Result<Json<Value>, StatusCode> {
        if headers.get("x-client-key").and_then(|v| v.to_str().ok()) != Some(CLIENT_KEY) {
            return Err(StatusCode::FORBIDDEN);
        }
        Ok(Json(json!({
            "auth": format!("app-key:{}", body["socket_id"].as_str().unwrap_or("")),
            "channel_data": json!({"user_id": 1}).to_string(),
        })))
    }
    serve_auth(Router::new().route(AUTH_PATH, post(sign))).await
}

/// Auth backend that always answers `status` with `body`, counting calls.
async fn start_broken_auth(status: StatusCode, body: Value) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let app = Router::new().route(
        AUTH_PATH,
        post(move || {
            let counter = counter.clone();
            let body = body.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                (status, Json(body))
            }
        }),
    );
    (serve_auth(app).await, hits)
}

fn config(broker: &TcpListener, auth_url: &str, heartbeat_secs: u64) -> ReverbClientConfig {
    let ws_url = format!("ws://{}/app/test-key?protocol=7", broker.local_addr().unwrap());
    let vars: HashMap<&str, String> = HashMap::from([
        ("REVERB_WS_URL", ws_url),
        ("REVERB_AUTH_URL", auth_url.to_string()),
        ("REVERB_CLIENT_KEY", CLIENT_KEY.to_string()),
        ("REVERB_CHANNEL", CHANNEL.to_string()),
        ("REVERB_HEARTBEAT_SECONDS", heartbeat_secs.to_string()),
        ("REVERB_RECONNECT_DELAY_SECONDS", "2".to_string()),
        ("REVERB_VERSION", "9.9.9".to_string()),
    ]);
    ReverbClientConfig::from_lookup(|k| vars.get(k).cloned()).unwrap()
}

async fn broker_send(ws: &mut Broker, event: &str, data: Value) {
    // Pusher servers string-encode `data`.
    let frame = json!({"event": event, "data": data.to_string()});
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

/// Next frame with `event`, with its `data` decoded. Other frames are skipped.
async fn broker_expect(ws: &mut Broker, event: &str) -> Value {
    tokio::time::timeout(WAIT, async {
        loop {
            let msg = ws.next().await.expect("broker socket ended").unwrap();
            let Message::Text(text) = msg else { continue };
            let frame: Value = serde_json::from_str(&text).unwrap();
            if frame["event"] == event {
                let data = match &frame["data"] {
                    Value::String(s) => serde_json::from_str(s).unwrap(),
                    other => other.clone(),
                };
                let mut out = frame.clone();
                out["data"] = data;
                return out;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", event))
}

/// Event names the gateway sends until it closes the socket.
async fn broker_events_until_closed(ws: &mut Broker) -> Vec<String> {
    tokio::time::timeout(WAIT, async {
        let mut events = Vec::new();
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let frame: Value = serde_json::from_str(&text).unwrap();
                    events.push(frame["event"].as_str().unwrap_or("").to_string());
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return events,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("gateway kept the socket open")
}

/// Accepts the gateway's connection and sends `connection_established`.
async fn accept_and_handshake(listener: &TcpListener) -> Broker {
    let (tcp, _) = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let mut ws = accept_async(tcp).await.unwrap();
    broker_send(
        &mut ws,
        "pusher:connection_established",
        json!({"socket_id": "1234.5678", "activity_timeout": 30}),
    )
    .await;
    ws
}

/// Accepts the gateway's connection and walks it through handshake and
/// subscribe, as Reverb would.
async fn accept_and_subscribe(listener: &TcpListener) -> Broker {
    let mut ws = accept_and_handshake(listener).await;
    let sub = broker_expect(&mut ws, "pusher:subscribe").await;
    assert_eq!(sub["data"]["channel"], CHANNEL);
    assert_eq!(sub["data"]["auth"], "app-key:1234.5678");
    assert_eq!(sub["data"]["channel_data"], r#"{"user_id":1}"#);
    ws
}

struct Harness {
    broker: TcpListener,
    lan: LanServer,
    supervisor: tokio::task::JoinHandle<()>,
}

async fn start(executor: CommandTable, with_lan: bool) -> Harness {
    let auth_url = start_auth().await;
    start_with(executor, with_lan, &auth_url, 3600).await
}

async fn start_with(
    executor: CommandTable,
    with_lan: bool,
    auth_url: &str,
    heartbeat_secs: u64,
) -> Harness {
    let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = Arc::new(config(&broker, auth_url, heartbeat_secs));

    let outbox = Arc::new(Outbox::new(config.outbox_max_total, config.outbox_max_per_client));
    let link = CloudLink::default();
    let lan = LanServer::start(outbox.clone(), link.clone()).await;
    let relay = with_lan.then(|| lan.gateway.clone());

    let session = Arc::new(CloudSession::new(
        config,
        outbox,
        link,
        relay,
        Arc::new(executor),
        reqwest::Client::new(),
    ));
    let supervisor = tokio::spawn(supervisor::run_forever(session));
    Harness { broker, lan, supervisor }
}

impl Harness {
    async fn finish(self) {
        self.supervisor.abort();
        let _ = self.supervisor.await;
        self.lan.stop().await;
    }
}

// ─── Scenarios ──────────────────────────────────────────────────

#[tokio::test]
async fn local_message_is_acked_and_reaches_broker_with_envelope() {
    let h = start(CommandTable::new(), true).await;
    let mut broker = accept_and_subscribe(&h.broker).await;
    let link = h.lan.link.clone();
    assert!(eventually(|| link.is_connected()).await);

    let mut lan = h.lan.join("pc1").await;
    send_json(
        &mut lan,
        json!({"type": "to_cloud", "msg_id": "m1", "event": "client-scan-done", "data": {"frames": 12}}),
    )
    .await;
    let ack = recv_json(&mut lan).await;
    assert_eq!(ack, json!({"type": "ack", "msg_id": "m1", "status": "queued", "cloud_connected": true}));

    let up = broker_expect(&mut broker, "client-scan-done").await;
    assert_eq!(up["channel"], CHANNEL);
    assert_eq!(up["data"], json!({"frames": 12, "relay": {"client_id": "pc1", "msg_id": "m1"}}));

    let outbox = h.lan.outbox.clone();
    assert!(eventually(|| outbox.pending("pc1") == 0).await);
    h.finish().await;
}

#[tokio::test]
async fn relay_tagged_command_reaches_lan_client_without_envelope() {
    let h = start(CommandTable::new(), true).await;
    let mut broker = accept_and_subscribe(&h.broker).await;
    let mut lan = h.lan.join("pc1").await;

    broker_send(
        &mut broker,
        "server-command",
        json!({
            "correlation_id": "c-7",
            "command_name": "acquire",
            "payload": {"dwell": 5},
            "relay": {"client_id": "pc1", "msg_id": "r-1"}
        }),
    )
    .await;

    let down = recv_json(&mut lan).await;
    assert_eq!(down["type"], "from_cloud");
    assert_eq!(down["msg_id"], "r-1");
    assert_eq!(down["event"], "server-command");
    assert_eq!(
        down["data"],
        json!({"correlation_id": "c-7", "command_name": "acquire", "payload": {"dwell": 5}})
    );
    h.finish().await;
}

#[tokio::test]
async fn unreachable_relay_target_is_reported_to_cloud() {
    let h = start(CommandTable::new(), true).await;
    let mut broker = accept_and_subscribe(&h.broker).await;

    broker_send(
        &mut broker,
        "server-command",
        json!({
            "correlation_id": "c-9",
            "command_name": "acquire",
            "payload": {},
            "relay": {"client_id": "ghost", "msg_id": "r-2"}
        }),
    )
    .await;

    let result = broker_expect(&mut broker, "client-command-result").await;
    assert_eq!(result["channel"], CHANNEL);
    assert_eq!(
        result["data"],
        json!({
            "correlation_id": "c-9",
            "command_name": "acquire",
            "ok": false,
            "message": "Relay client not connected: ghost"
        })
    );
    h.finish().await;
}

#[tokio::test]
async fn relay_target_without_gateway_is_unreachable() {
    let h = start(CommandTable::new(), false).await;
    let mut broker = accept_and_subscribe(&h.broker).await;

    broker_send(
        &mut broker,
        "server-command",
        json!({"correlation_id": "c-1", "command_name": "x", "relay": {"client_id": "pc1", "msg_id": "m"}}),
    )
    .await;
    let result = broker_expect(&mut broker, "client-command-result").await;
    assert_eq!(result["data"]["ok"], false);
    assert_eq!(result["data"]["message"], "Relay client not connected: pc1");
    h.finish().await;
}

#[tokio::test]
async fn untagged_command_runs_locally_and_result_is_embedded() {
    let mut table = CommandTable::with_builtins("9.9.9");
    table.register("get_metrics", |_| {
        CommandOutcome::ok(Some(json!({"supported": true, "vacuum": {"chamber_pa": 0.0012}})))
    });
    let h = start(table, true).await;
    let mut broker = accept_and_subscribe(&h.broker).await;

    broker_send(
        &mut broker,
        "server-command",
        json!({"correlation_id": "c-3", "command_name": "getMetrics", "payload": "ignored"}),
    )
    .await;

    let result = broker_expect(&mut broker, "client-command-result").await;
    assert_eq!(
        result["data"],
        json!({
            "correlation_id": "c-3",
            "command_name": "getMetrics",
            "ok": true,
            "message": "ok",
            "payload": {"supported": true, "vacuum": {"chamber_pa": 0.0012}}
        })
    );

    broker_send(&mut broker, "server-command", json!({"correlation_id": "c-4", "command_name": "warp"})).await;
    let result = broker_expect(&mut broker, "client-command-result").await;
    assert_eq!(result["data"]["ok"], false);
    assert_eq!(result["data"]["message"], "Unknown command: warp");
    h.finish().await;
}

#[tokio::test]
async fn ping_is_answered_and_noise_is_ignored() {
    let h = start(CommandTable::new(), true).await;
    let mut broker = accept_and_subscribe(&h.broker).await;

    broker.send(Message::Text("not json at all".into())).await.unwrap();
    broker_send(&mut broker, "pusher:error", json!({"code": 4200, "message": "whatever"})).await;
    broker_send(&mut broker, "pusher_internal:subscription_succeeded", json!({})).await;
    broker_send(&mut broker, "pusher:ping", json!({})).await;

    let pong = broker_expect(&mut broker, "pusher:pong").await;
    assert_eq!(pong["data"], json!({}));
    h.finish().await;
}

#[tokio::test]
async fn dropped_broker_is_reconnected_quickly() {
    let h = start(CommandTable::new(), true).await;
    let broker = accept_and_subscribe(&h.broker).await;
    let link = h.lan.link.clone();
    assert!(eventually(|| link.is_connected()).await);

    drop(broker);
    assert!(eventually(|| !link.is_connected()).await);

    // The failed session had completed its handshake, so the next attempt
    // comes after the one-second base delay (plus jitter).
    let started = tokio::time::Instant::now();
    let _broker = accept_and_subscribe(&h.broker).await;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(eventually(|| link.is_connected()).await);
    h.finish().await;
}

#[tokio::test]
async fn malformed_handshake_frame_ends_the_attempt() {
    let h = start(CommandTable::new(), true).await;
    let (tcp, _) = tokio::time::timeout(WAIT, h.broker.accept()).await.unwrap().unwrap();
    let mut broker = accept_async(tcp).await.unwrap();
    broker.send(Message::Text("{not json".into())).await.unwrap();
    // The gateway may already be closing, so this write is allowed to fail.
    let established = json!({
        "event": "pusher:connection_established",
        "data": json!({"socket_id": "1.2"}).to_string(),
    });
    let _ = broker.send(Message::Text(established.to_string())).await;

    let events = broker_events_until_closed(&mut broker).await;
    assert!(!events.iter().any(|e| e == "pusher:subscribe"), "sent {:?}", events);
    assert!(!h.lan.link.is_connected());

    // The supervisor retries, and a clean handshake then subscribes.
    let _broker = accept_and_subscribe(&h.broker).await;
    h.finish().await;
}

#[tokio::test]
async fn heartbeat_is_sent_every_interval() {
    let auth_url = start_auth().await;
    let h = start_with(CommandTable::new(), true, &auth_url, 1).await;
    let mut broker = accept_and_subscribe(&h.broker).await;

    let first = broker_expect(&mut broker, "client-heartbeat").await;
    assert_eq!(first["channel"], CHANNEL);
    assert_eq!(first["data"]["version"], "9.9.9");
    assert!(first["data"]["ts"].as_u64().unwrap() > 0);
    assert_eq!(first["data"].as_object().unwrap().len(), 2);

    let second = broker_expect(&mut broker, "client-heartbeat").await;
    assert!(second["data"]["ts"].as_u64().unwrap() >= first["data"]["ts"].as_u64().unwrap());
    h.finish().await;
}

/// The broker hands out a socket id twice; neither attempt may subscribe.
async fn assert_auth_failure_never_subscribes(status: StatusCode, body: Value) {
    let (auth_url, hits) = start_broken_auth(status, body).await;
    let h = start_with(CommandTable::new(), true, &auth_url, 3600).await;

    for attempt in 1..=2 {
        let mut broker = accept_and_handshake(&h.broker).await;
        let events = broker_events_until_closed(&mut broker).await;
        assert!(!events.iter().any(|e| e == "pusher:subscribe"), "sent {:?}", events);
        assert_eq!(hits.load(Ordering::SeqCst), attempt);
    }
    assert!(!h.lan.link.is_connected());
    h.finish().await;
}

#[tokio::test]
async fn auth_server_error_fails_the_attempt() {
    assert_auth_failure_never_subscribes(StatusCode::INTERNAL_SERVER_ERROR, json!({"error": "boom"}))
        .await;
}

#[tokio::test]
async fn auth_without_channel_data_fails_the_attempt() {
    assert_auth_failure_never_subscribes(StatusCode::OK, json!({"auth": "x"})).await;
}

#[tokio::test]
async fn message_queued_while_disconnected_is_sent_after_reconnect() {
    let h = start(CommandTable::new(), true).await;
    let broker = accept_and_subscribe(&h.broker).await;
    let link = h.lan.link.clone();
    assert!(eventually(|| link.is_connected()).await);

    drop(broker);
    assert!(eventually(|| !link.is_connected()).await);

    let mut lan = h.lan.join("pc1").await;
    send_json(
        &mut lan,
        json!({"type": "to_cloud", "msg_id": "m9", "event": "client-offline-note", "data": {}}),
    )
    .await;
    let ack = recv_json(&mut lan).await;
    assert_eq!(ack, json!({"type": "ack", "msg_id": "m9", "status": "queued", "cloud_connected": false}));
    assert_eq!(h.lan.outbox.pending("pc1"), 1);

    let mut broker = accept_and_subscribe(&h.broker).await;
    let up = broker_expect(&mut broker, "client-offline-note").await;
    assert_eq!(up["data"], json!({"relay": {"client_id": "pc1", "msg_id": "m9"}}));

    let outbox = h.lan.outbox.clone();
    assert!(eventually(|| outbox.pending("pc1") == 0).await);
    h.finish().await;
}
