//! Persistent hub connection with an explicit reconnect state machine.
//!
//! The connection moves through `Disconnected → Connecting → Open` and drops
//! back to `Reconnecting` on any transient failure; auth rejections are
//! fatal and stop the manager. Group membership is server-side state that
//! dies with a connection, so joined groups are re-applied after every
//! reconnect. Inbound pushes are fanned out on a broadcast channel —
//! delivery to the process is at most once, matching the relay's own
//! semantics.

use crate::backoff::ExponentialBackoff;
use crate::config::ClientConfig;
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hrp_common::message::{ClientMessage, ErrorCode, ServerMessage};
use hrp_common::token::{self, Claims};
use hrp_common::types::{connect_path, ACCESS_TOKEN_PARAM};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, Message>;
type WsRecv = SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// How long to wait for the server's welcome frame after the upgrade.
const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
enum ClientError {
    Fatal(anyhow::Error),
    Transient(anyhow::Error),
}

/// Connection status of the hub WebSocket link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// Not connected and not trying.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Welcomed by the hub and receiving pushes.
    Open,
    /// Connection lost; waiting out the backoff before the next attempt.
    Reconnecting,
}

/// A payload pushed by the hub.
#[derive(Debug, Clone)]
pub struct PushEvent {
    /// Opaque JSON payload supplied by the publisher.
    pub payload: Value,
    /// Local timestamp when the push was received.
    pub received_at: chrono::DateTime<Utc>,
}

/// Commands accepted by the connection manager.
#[derive(Debug)]
pub enum Command {
    /// Join a group (re-applied after reconnects).
    Join(String),
    /// Leave a group.
    Leave(String),
}

/// Handle to a running hub connection.
pub struct HubClient {
    cmd_tx: mpsc::Sender<Command>,
    inbox_tx: broadcast::Sender<PushEvent>,
    status_rx: watch::Receiver<ConnStatus>,
}

impl HubClient {
    /// Spawns the connection manager and returns a handle to it.
    #[must_use]
    pub fn spawn(config: Arc<ClientConfig>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (inbox_tx, _) = broadcast::channel(256);
        let (status_tx, status_rx) = watch::channel(ConnStatus::Disconnected);
        let _ = tokio::spawn(connection_manager(
            config,
            cmd_rx,
            inbox_tx.clone(),
            status_tx,
        ));
        Self {
            cmd_tx,
            inbox_tx,
            status_rx,
        }
    }

    /// Joins a group; membership survives reconnects.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection manager has stopped.
    pub async fn join_group(&self, group: impl Into<String>) -> anyhow::Result<()> {
        self.cmd_tx
            .send(Command::Join(group.into()))
            .await
            .map_err(|_| anyhow::anyhow!("connection manager stopped"))
    }

    /// Leaves a group.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection manager has stopped.
    pub async fn leave_group(&self, group: impl Into<String>) -> anyhow::Result<()> {
        self.cmd_tx
            .send(Command::Leave(group.into()))
            .await
            .map_err(|_| anyhow::anyhow!("connection manager stopped"))
    }

    /// Subscribes to pushed payloads.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.inbox_tx.subscribe()
    }

    /// Watches the connection status.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<ConnStatus> {
        self.status_rx.clone()
    }
}

/// The access token presented on connect, if any.
///
/// A pre-issued token takes precedence; otherwise one is self-signed from
/// the shared secret with the hub's connect audience.
fn connect_token(config: &ClientConfig) -> anyhow::Result<Option<String>> {
    if let Some(token) = &config.token {
        return Ok(Some(token.clone()));
    }
    let Some(secret) = &config.secret else {
        return Ok(None);
    };
    let claims = Claims {
        aud: connect_path(&config.hub),
        sub: config.subject.clone(),
        exp: token::unix_now() + config.token_ttl_s,
    };
    let signed = token::sign(&claims, secret.as_bytes())?;
    Ok(Some(signed))
}

fn connect_url(config: &ClientConfig, token: Option<&str>) -> String {
    match token {
        Some(token) => format!("{}?{}={}", config.server, ACCESS_TOKEN_PARAM, token),
        None => config.server.clone(),
    }
}

fn classify_connect_error(e: tokio_tungstenite::tungstenite::Error) -> ClientError {
    if let tokio_tungstenite::tungstenite::Error::Http(resp) = &e {
        let status = resp.status().as_u16();
        if status == 401 || status == 403 {
            return ClientError::Fatal(anyhow::anyhow!("connection rejected: HTTP {status}"));
        }
    }
    ClientError::Transient(e.into())
}

/// Top-level hub connection loop with automatic reconnection and backoff.
pub async fn connection_manager(
    config: Arc<ClientConfig>,
    mut cmd_rx: mpsc::Receiver<Command>,
    inbox_tx: broadcast::Sender<PushEvent>,
    status_tx: watch::Sender<ConnStatus>,
) {
    let mut backoff = ExponentialBackoff::new(
        Duration::from_millis(config.reconnect.initial_delay_ms),
        Duration::from_millis(config.reconnect.max_delay_ms),
        config.reconnect.backoff_factor,
    );
    let mut joined: HashSet<String> = HashSet::new();

    status_tx.send_replace(ConnStatus::Connecting);
    loop {
        match connect_and_run(&config, &mut cmd_rx, &inbox_tx, &status_tx, &mut joined).await {
            Ok(()) => {
                info!("hub connection closed cleanly");
                break;
            }
            Err(ClientError::Fatal(e)) => {
                error!(error = %e, "fatal hub error, not retrying");
                break;
            }
            Err(ClientError::Transient(e)) => {
                let was_open = *status_tx.borrow() == ConnStatus::Open;
                warn!(error = %e, "hub connection lost");
                if was_open {
                    backoff.reset();
                }
            }
        }

        status_tx.send_replace(ConnStatus::Reconnecting);
        let delay = backoff.next_delay();
        info!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnecting"
        );
        tokio::time::sleep(delay).await;
    }
    status_tx.send_replace(ConnStatus::Disconnected);
}

async fn send_client_message(ws_tx: &mut WsSink, msg: &ClientMessage) -> Result<(), ClientError> {
    let json = serde_json::to_string(msg).map_err(|e| ClientError::Transient(e.into()))?;
    ws_tx
        .send(Message::Text(json))
        .await
        .map_err(|e| ClientError::Transient(e.into()))
}

async fn await_welcome(ws_rx: &mut WsRecv) -> Result<(), ClientError> {
    let deadline = tokio::time::Instant::now() + WELCOME_TIMEOUT;
    loop {
        let msg = tokio::time::timeout_at(deadline, ws_rx.next())
            .await
            .map_err(|_| ClientError::Transient(anyhow::anyhow!("timed out waiting for welcome")))?
            .ok_or_else(|| ClientError::Transient(anyhow::anyhow!("closed before welcome")))?
            .map_err(|e| ClientError::Transient(e.into()))?;
        match msg {
            Message::Text(text) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::Welcome { connection_id }) => {
                    info!(%connection_id, "admitted to hub");
                    return Ok(());
                }
                Ok(ServerMessage::Error { code, message }) => {
                    let err = anyhow::anyhow!("rejected by hub: {message}");
                    return Err(match code {
                        ErrorCode::Unauthorized => ClientError::Fatal(err),
                        _ => ClientError::Transient(err),
                    });
                }
                Ok(other) => {
                    debug!(frame = ?other, "ignoring frame before welcome");
                }
                Err(e) => {
                    debug!(error = %e, "ignoring unparseable frame before welcome");
                }
            },
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => {
                return Err(ClientError::Transient(anyhow::anyhow!(
                    "closed before welcome"
                )));
            }
            Message::Binary(_) | Message::Frame(_) => {}
        }
    }
}

async fn connect_and_run(
    config: &ClientConfig,
    cmd_rx: &mut mpsc::Receiver<Command>,
    inbox_tx: &broadcast::Sender<PushEvent>,
    status_tx: &watch::Sender<ConnStatus>,
    joined: &mut HashSet<String>,
) -> Result<(), ClientError> {
    let token = connect_token(config).map_err(ClientError::Fatal)?;
    let url = connect_url(config, token.as_deref());

    let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(classify_connect_error)?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    await_welcome(&mut ws_rx).await?;

    // Group membership died with the previous connection; re-apply it.
    for group in joined.iter() {
        send_client_message(
            &mut ws_tx,
            &ClientMessage::JoinGroup {
                group: group.clone(),
            },
        )
        .await?;
    }

    status_tx.send_replace(ConnStatus::Open);

    let mut ping_interval =
        tokio::time::interval(Duration::from_secs(config.keepalive.interval_s));

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let msg = msg
                    .ok_or_else(|| ClientError::Transient(anyhow::anyhow!("connection closed")))?
                    .map_err(|e| ClientError::Transient(e.into()))?;
                match msg {
                    Message::Text(text) => {
                        let frame = match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                debug!(error = %e, "ignoring unparseable frame");
                                continue;
                            }
                        };
                        match frame {
                            ServerMessage::Push { payload } => {
                                if inbox_tx
                                    .send(PushEvent {
                                        payload,
                                        received_at: Utc::now(),
                                    })
                                    .is_err()
                                {
                                    debug!("push dropped: no active subscribers");
                                }
                            }
                            ServerMessage::Ack { op, group } => {
                                debug!(op, group, "group edit acknowledged");
                            }
                            ServerMessage::Error { code, message } => {
                                warn!(?code, message, "hub reported an error");
                            }
                            ServerMessage::Pong => debug!("pong received"),
                            ServerMessage::Welcome { .. } => {
                                debug!("unexpected welcome after open");
                            }
                        }
                    }
                    Message::Ping(data) => {
                        ws_tx.send(Message::Pong(data)).await
                            .map_err(|e| ClientError::Transient(e.into()))?;
                    }
                    Message::Close(_) => {
                        return Err(ClientError::Transient(anyhow::anyhow!(
                            "server closed the connection"
                        )));
                    }
                    Message::Binary(_) | Message::Pong(_) | Message::Frame(_) => {}
                }
            }

            cmd = cmd_rx.recv() => {
                // The handle was dropped; shut down cleanly.
                let Some(cmd) = cmd else { return Ok(()) };
                match cmd {
                    Command::Join(group) => {
                        let _ = joined.insert(group.clone());
                        send_client_message(&mut ws_tx, &ClientMessage::JoinGroup { group }).await?;
                    }
                    Command::Leave(group) => {
                        let _ = joined.remove(&group);
                        send_client_message(&mut ws_tx, &ClientMessage::LeaveGroup { group }).await?;
                    }
                }
            }

            _ = ping_interval.tick() => {
                send_client_message(&mut ws_tx, &ClientMessage::Ping).await?;
            }
        }
    }
}
