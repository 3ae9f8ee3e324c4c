//! Shared helpers for the gateway integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use reverb_gateway::{server, CloudForwarder, CloudLink, Outbox, RelayConfig, RelayGateway};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub const TOKEN: &str = "lan-secret";
pub const CHANNEL: &str = "presence-client.1";
pub const WAIT: Duration = Duration::from_secs(5);

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct LanServer {
    pub addr: SocketAddr,
    pub gateway: RelayGateway,
    pub outbox: Arc<Outbox>,
    pub link: CloudLink,
    stop: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl LanServer {
    pub async fn start(outbox: Arc<Outbox>, link: CloudLink) -> Self {
        Self::start_with(
            RelayConfig {
                host: "127.0.0.1".into(),
                port: 0,
                token: TOKEN.into(),
                ..RelayConfig::default()
            },
            outbox,
            link,
        )
        .await
    }

    pub async fn start_with(config: RelayConfig, outbox: Arc<Outbox>, link: CloudLink) -> Self {
        let forwarder = CloudForwarder::new(outbox.clone(), CHANNEL, link.clone());
        let gateway = RelayGateway::new(config, forwarder, link.clone());
        let listener = server::bind(&gateway).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let serving = gateway.clone();
        let task = tokio::spawn(async move {
            server::serve(listener, serving, async move {
                let _ = stop_rx.await;
            })
            .await
            .unwrap();
        });
        Self {
            addr,
            gateway,
            outbox,
            link,
            stop: Some(stop_tx),
            task,
        }
    }

    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = tokio::time::timeout(WAIT, &mut self.task).await;
    }

    pub async fn connect(&self, token: Option<&str>, client_id: Option<&str>) -> Ws {
        let mut request = format!("ws://{}/", self.addr).into_client_request().unwrap();
        if let Some(token) = token {
            request
                .headers_mut()
                .insert("X-PC1-Token", HeaderValue::from_str(token).unwrap());
        }
        if let Some(id) = client_id {
            request
                .headers_mut()
                .insert("X-Relay-Client-Id", HeaderValue::from_str(id).unwrap());
        }
        let (ws, _) = connect_async(request).await.unwrap();
        ws
    }

    /// Connects with the right token and consumes the `welcome` frame.
    pub async fn join(&self, client_id: &str) -> Ws {
        let mut ws = self.connect(Some(TOKEN), Some(client_id)).await;
        let welcome = recv_json(&mut ws).await;
        assert_eq!(welcome["type"], "welcome");
        assert_eq!(welcome["client_id"], client_id);
        ws
    }
}

pub async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Next text frame as JSON, skipping control frames.
pub async fn recv_json(ws: &mut Ws) -> Value {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(Message::Close(frame))) => panic!("unexpected close: {:?}", frame),
                Some(Ok(_)) => continue,
                Some(Err(e)) => panic!("socket error: {}", e),
                None => panic!("socket ended"),
            }
        }
    })
    .await
    .expect("timed out waiting for a text frame")
}

/// Waits for the peer's close frame, skipping anything else.
pub async fn recv_close(ws: &mut Ws) -> Option<CloseFrame<'static>> {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(_)) => continue,
                _ => return None,
            }
        }
    })
    .await
    .expect("timed out waiting for close")
}

/// Polls `check` until it holds or the wait expires.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
