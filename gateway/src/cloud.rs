//! # Cloud Session
//!
//! One connection to the Reverb broker, from TCP connect to tear-down:
//!
//! 1. **Connecting**: try each URL candidate until one upgrades
//! 2. **HandshakeWait**: read until `pusher:connection_established`
//! 3. **Authenticating**: have the backend sign the presence channel
//! 4. **Subscribing**: send `pusher:subscribe` (no ack is awaited)
//! 5. **Running**: heartbeat, outbox sender and receiver run side by side
//!
//! A session never completes successfully: it ends when the broker socket
//! ends or errors, and the [`SessionEnd`] tells the supervisor how far it
//! got. All writes go through one [`CloudWriter`] so frames never
//! interleave.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use relay_protocol::cloud::{self as wire, socket_id_from};
use relay_protocol::{CommandResult, PusherFrame, ServerCommand};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{ORIGIN, USER_AGENT};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::auth::authenticate;
use crate::config::ReverbClientConfig;
use crate::endpoints::ws_candidates;
use crate::error::CloudError;
use crate::executor::{CommandExecutor, CommandOutcome};
use crate::outbox::{InFlight, Outbox};
use crate::state::{CloudLink, RelayGateway};

/// Upper bound on TCP connect, TLS and the WebSocket upgrade together.
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

type CloudStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type CloudSink = SplitSink<CloudStream, Message>;
type CloudSource = SplitStream<CloudStream>;

/// How far a session got before it ended. Ordered by progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Connecting,
    HandshakeWait,
    Authenticating,
    Subscribing,
    Running,
}

/// Why and where a session ended.
#[derive(Debug)]
pub struct SessionEnd {
    pub phase: Phase,
    pub error: CloudError,
}

impl SessionEnd {
    /// True once a socket id was received from the broker.
    pub fn handshake_completed(&self) -> bool {
        self.phase >= Phase::Authenticating
    }
}

// ─── Writer ─────────────────────────────────────────────────────

/// Serialized write half of the broker socket.
#[derive(Clone)]
pub struct CloudWriter(Arc<Mutex<CloudSink>>);

impl CloudWriter {
    fn new(sink: CloudSink) -> Self {
        Self(Arc::new(Mutex::new(sink)))
    }

    /// Sends one whole frame, `data` string-encoded.
    pub async fn send(&self, frame: &PusherFrame) -> Result<(), CloudError> {
        let text = frame.to_wire()?;
        let mut sink = self.0.lock().await;
        sink.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn close(&self) {
        let mut sink = self.0.lock().await;
        let _ = sink.close().await;
    }
}

/// Aborts the task when dropped, so an aborted session never leaves its
/// heartbeat or sender running against a dead socket.
pub(crate) struct AbortOnDrop<T>(pub(crate) JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Clears the cloud-connected flag however the session ends.
struct LinkGuard(CloudLink);

impl Drop for LinkGuard {
    fn drop(&mut self) {
        self.0.set_connected(false);
    }
}

// ─── Session ────────────────────────────────────────────────────

pub struct CloudSession {
    config: Arc<ReverbClientConfig>,
    outbox: Arc<Outbox>,
    link: CloudLink,
    relay: Option<RelayGateway>,
    executor: Arc<dyn CommandExecutor>,
    http: reqwest::Client,
}

impl CloudSession {
    pub fn new(
        config: Arc<ReverbClientConfig>,
        outbox: Arc<Outbox>,
        link: CloudLink,
        relay: Option<RelayGateway>,
        executor: Arc<dyn CommandExecutor>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            config,
            outbox,
            link,
            relay,
            executor,
            http,
        }
    }

    pub fn config(&self) -> &ReverbClientConfig {
        &self.config
    }

    /// Runs one session to its end. Never returns without an error.
    pub async fn run(&self) -> SessionEnd {
        let mut phase = Phase::Connecting;
        let _link = LinkGuard(self.link.clone());
        let error = self.run_phases(&mut phase).await;
        SessionEnd { phase, error }
    }

    async fn run_phases(&self, phase: &mut Phase) -> CloudError {
        let ws = match self.connect().await {
            Ok(ws) => ws,
            Err(e) => return e,
        };

        *phase = Phase::HandshakeWait;
        let (sink, mut stream) = ws.split();
        let writer = CloudWriter::new(sink);
        let error = self.establish_and_run(phase, &writer, &mut stream).await;

        // ── Tear-down ──
        self.link.set_connected(false);
        writer.close().await;
        info!("cloud_ws_disconnected phase={:?} error={}", phase, error);
        error
    }

    async fn establish_and_run(
        &self,
        phase: &mut Phase,
        writer: &CloudWriter,
        stream: &mut CloudSource,
    ) -> CloudError {
        let socket_id = match wait_for_handshake(stream).await {
            Ok(id) => id,
            Err(e) => return e,
        };
        info!("cloud_ws_handshake socket_id={}", socket_id);

        *phase = Phase::Authenticating;
        let auth = match authenticate(&self.http, &self.config, &socket_id).await {
            Ok(auth) => auth,
            Err(e) => return e,
        };

        *phase = Phase::Subscribing;
        let subscribe = PusherFrame::subscribe(&self.config.channel, &auth.auth, &auth.channel_data);
        if let Err(e) = writer.send(&subscribe).await {
            return e;
        }
        self.link.set_connected(true);
        info!("cloud_subscribed channel={}", self.config.channel);

        *phase = Phase::Running;
        let mut heartbeat = AbortOnDrop(tokio::spawn(heartbeat_loop(
            writer.clone(),
            self.config.clone(),
        )));
        let mut sender = AbortOnDrop(tokio::spawn(sender_loop(writer.clone(), self.outbox.clone())));

        let error = tokio::select! {
            e = self.receive_loop(stream, writer) => e,
            r = &mut heartbeat.0 => task_error("heartbeat", r),
            r = &mut sender.0 => task_error("sender", r),
        };

        for task in [&mut heartbeat, &mut sender] {
            if !task.0.is_finished() {
                task.0.abort();
                // Cancellation is the expected outcome here.
                let _ = (&mut task.0).await;
            }
        }
        error
    }

    // ── Connecting ──

    async fn connect(&self) -> Result<CloudStream, CloudError> {
        let mut last = String::new();
        for url in ws_candidates(&self.config.ws_url) {
            info!("cloud_ws_connecting url={}", url);
            match self.connect_once(&url).await {
                Ok(ws) => {
                    info!("cloud_ws_connected url={}", url);
                    return Ok(ws);
                }
                Err(e) => {
                    warn!("cloud_ws_connect_failed url={} error={}", url, e);
                    last = e.to_string();
                }
            }
        }
        Err(CloudError::Connect {
            url: self.config.ws_url.clone(),
            last,
        })
    }

    async fn connect_once(&self, url: &str) -> Result<CloudStream, CloudError> {
        let mut request = url.into_client_request()?;
        let headers = request.headers_mut();
        if let Some(origin) = &self.config.ws_origin {
            headers.insert(ORIGIN, header_value(origin)?);
        }
        if let Some(agent) = &self.config.ws_user_agent {
            headers.insert(USER_AGENT, header_value(agent)?);
        }

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.config.max_message_bytes);
        ws_config.max_frame_size = Some(self.config.max_message_bytes);

        let connector = if self.config.insecure_ssl {
            Some(Connector::Rustls(Arc::new(insecure_tls_config()?)))
        } else {
            None
        };

        let open = connect_async_tls_with_config(request, Some(ws_config), false, connector);
        let (ws, _response) = tokio::time::timeout(OPEN_TIMEOUT, open)
            .await
            .map_err(|_| CloudError::OpenTimeout {
                url: url.to_string(),
                secs: OPEN_TIMEOUT.as_secs(),
            })??;
        Ok(ws)
    }

    // ── Running: receiver ──

    async fn receive_loop(&self, stream: &mut CloudSource, writer: &CloudWriter) -> CloudError {
        while let Some(msg) = stream.next().await {
            let text = match msg {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(frame)) => {
                    info!("cloud_ws_close_frame frame={:?}", frame);
                    return CloudError::Closed;
                }
                Ok(_) => continue,
                Err(e) => return e.into(),
            };
            if let Err(e) = self.dispatch(&text, writer).await {
                return e;
            }
        }
        CloudError::Closed
    }

    async fn dispatch(&self, text: &str, writer: &CloudWriter) -> Result<(), CloudError> {
        let frame = match PusherFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("cloud_ws_bad_frame error={} len={}", e, text.len());
                return Ok(());
            }
        };

        match frame.event.as_str() {
            wire::PING => writer.send(&PusherFrame::pong()).await,
            wire::ERROR => {
                warn!("cloud_pusher_error data={}", frame.data_value());
                Ok(())
            }
            wire::SERVER_COMMAND => self.handle_command(frame.data_value(), writer).await,
            other => {
                debug!("cloud_event_ignored event={}", other);
                Ok(())
            }
        }
    }

    async fn handle_command(&self, data: Value, writer: &CloudWriter) -> Result<(), CloudError> {
        let Some(command) = ServerCommand::from_data(data) else {
            warn!("cloud_command_invalid: data is not an object");
            return Ok(());
        };
        let channel = &self.config.channel;

        // ── Relay-tagged: route to the LAN client ──
        if let Some(relay) = &command.relay {
            let delivered = match &self.relay {
                Some(gateway) => {
                    gateway
                        .deliver_from_cloud(
                            &relay.client_id,
                            &relay.msg_id,
                            wire::SERVER_COMMAND,
                            Value::Object(command.stripped.clone()),
                        )
                        .await
                }
                None => false,
            };
            if delivered {
                info!(
                    "cloud_command_relayed client_id={} command={} correlation_id={}",
                    relay.client_id, command.command_name, command.correlation_id
                );
                return Ok(());
            }
            let result = CommandResult::unreachable(&command, &relay.client_id);
            return writer.send(&PusherFrame::command_result(channel, &result)).await;
        }

        // ── Untagged: execute locally ──
        info!(
            "cloud_command_received command={} correlation_id={}",
            command.command_name, command.correlation_id
        );
        let executor = self.executor.clone();
        let name = command.command_name.clone();
        let payload = command.payload.clone();
        let outcome = tokio::task::spawn_blocking(move || executor.execute(&name, &payload))
            .await
            .unwrap_or_else(|e| CommandOutcome::fail(format!("command task failed: {}", e)));

        let result = CommandResult {
            correlation_id: command.correlation_id,
            command_name: command.command_name,
            ok: outcome.ok,
            message: outcome.message,
            payload: outcome.result,
        };
        writer.send(&PusherFrame::command_result(channel, &result)).await
    }
}

// ─── Handshake ──────────────────────────────────────────────────

async fn wait_for_handshake(stream: &mut CloudSource) -> Result<String, CloudError> {
    while let Some(msg) = stream.next().await {
        let text = match msg? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        // Well-formed events other than the handshake are skipped, but a
        // frame that does not decode ends the attempt.
        let frame = PusherFrame::parse(&text)
            .map_err(|e| CloudError::Handshake(format!("malformed frame: {}", e)))?;
        if frame.event != wire::CONNECTION_ESTABLISHED {
            debug!("cloud_handshake_skip event={}", frame.event);
            continue;
        }
        return socket_id_from(&frame.data_value()).ok_or_else(|| {
            CloudError::Handshake("connection_established without socket_id".to_string())
        });
    }
    Err(CloudError::Handshake(
        "socket closed before connection_established".to_string(),
    ))
}

// ─── Running: heartbeat & sender ────────────────────────────────

async fn heartbeat_loop(writer: CloudWriter, config: Arc<ReverbClientConfig>) -> CloudError {
    loop {
        tokio::time::sleep(config.heartbeat_interval).await;
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        let frame = PusherFrame::heartbeat(&config.channel, ts, &config.version);
        if let Err(e) = writer.send(&frame).await {
            return e;
        }
        if config.log_heartbeats {
            info!("cloud_heartbeat_sent ts={} channel={}", ts, config.channel);
        } else {
            debug!("cloud_heartbeat_sent ts={} channel={}", ts, config.channel);
        }
    }
}

async fn sender_loop(writer: CloudWriter, outbox: Arc<Outbox>) -> CloudError {
    loop {
        let Some(item) = outbox.take().await else {
            return CloudError::OutboxClosed;
        };
        let frame = item.frame.clone();
        let (client_id, msg_id) = (item.client_id.clone(), item.msg_id.clone());
        let in_flight = InFlight::new(outbox.clone(), item);
        match writer.send(&frame).await {
            Ok(()) => {
                in_flight.done();
                debug!("cloud_outbox_sent client_id={} msg_id={}", client_id, msg_id);
            }
            Err(e) => {
                warn!("cloud_outbox_send_failed client_id={} msg_id={} error={}", client_id, msg_id, e);
                in_flight.retry_later();
                return e;
            }
        }
    }
}

fn task_error(name: &str, result: Result<CloudError, tokio::task::JoinError>) -> CloudError {
    result.unwrap_or_else(|e| CloudError::Task(format!("{} task: {}", name, e)))
}

fn header_value(value: &str) -> Result<HeaderValue, CloudError> {
    HeaderValue::from_str(value).map_err(|e| CloudError::Request(e.to_string()))
}

// ─── TLS ────────────────────────────────────────────────────────

/// Client config that accepts any server certificate. Only used when
/// `REVERB_INSECURE_SSL` is set, for self-signed development brokers.
fn insecure_tls_config() -> Result<rustls::ClientConfig, CloudError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    Ok(config)
}

#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}
