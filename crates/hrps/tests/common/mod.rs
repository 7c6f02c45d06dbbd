#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use hrp_common::message::{ClientMessage, ServerMessage};
use hrp_common::token::{self, Claims};
use hrp_common::types::{connect_path, ConnectionId};
use hrps::api::{self, ApiState};
use hrps::config::ServerConfig;
use hrps::metrics::HealthState;
use hrps::outbound::OverflowPolicy;
use hrps::server::ServerState;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

pub const SECRET: &str = "integration-shared-secret-0123456789";

pub fn test_config(listen: SocketAddr, api_addr: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen,
        api_addr,
        hub: "message".to_string(),
        max_conns: 1000,
        max_conns_ip: 100,
        max_payload: 65_535,
        outbound_buffer: 64,
        overflow_policy: OverflowPolicy::DropOldest,
        write_timeout: 5,
        ping_interval: 30,
        idle_timeout: 120,
        clock_skew: 0,
        client_auth: true,
    }
}

/// Signs a client channel token for the `message` hub.
pub fn connect_token(subject: Option<&str>, expires_in: i64) -> String {
    sign_token(&connect_path("message"), subject, expires_in)
}

/// Signs a token for an arbitrary audience, expiring `expires_in` seconds
/// from now (negative values produce already-expired tokens).
pub fn sign_token(aud: &str, subject: Option<&str>, expires_in: i64) -> String {
    let now = i64::try_from(token::unix_now()).unwrap();
    let claims = Claims {
        aud: aud.to_string(),
        sub: subject.map(str::to_string),
        exp: u64::try_from(now + expires_in).unwrap_or(0),
    };
    token::sign(&claims, SECRET.as_bytes()).unwrap()
}

pub async fn start_server() -> (SocketAddr, SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let api_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let api_addr = api_listener.local_addr().unwrap();

    start_server_with(listener, api_listener, test_config(addr, api_addr)).await
}

pub async fn start_server_with(
    listener: TcpListener,
    api_listener: TcpListener,
    config: ServerConfig,
) -> (SocketAddr, SocketAddr, Arc<ServerState>) {
    let addr = listener.local_addr().unwrap();
    let api_addr = api_listener.local_addr().unwrap();
    let state = Arc::new(ServerState::new(config, SECRET.as_bytes().to_vec(), 1000));

    let gateway_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = hrps::run(listener, gateway_state).await {
            eprintln!("server error in test: {e}");
        }
    });

    let app = api::router(ApiState {
        server: state.clone(),
        health: HealthState::new(),
        metrics: None,
    });
    tokio::spawn(async move {
        let _ = axum::serve(api_listener, app).await;
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, api_addr, state)
}

pub struct TestClient {
    pub ws_tx: futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        Message,
    >,
    pub ws_rx: futures_util::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    >,
    pub connection_id: ConnectionId,
}

impl TestClient {
    /// Connects with a freshly-signed token and consumes the welcome frame.
    pub async fn connect(addr: &SocketAddr) -> Self {
        Self::connect_as(addr, None).await
    }

    pub async fn connect_as(addr: &SocketAddr, subject: Option<&str>) -> Self {
        let token = connect_token(subject, 60);
        Self::connect_with_token(addr, &token)
            .await
            .expect("connect with valid token")
    }

    pub async fn connect_with_token(
        addr: &SocketAddr,
        token: &str,
    ) -> Result<Self, tokio_tungstenite::tungstenite::Error> {
        let url = format!("ws://{addr}/?access_token={token}");
        let (ws, _) = tokio_tungstenite::connect_async(url).await?;
        let (ws_tx, mut ws_rx) = ws.split();

        let welcome = tokio::time::timeout(Duration::from_secs(5), ws_rx.next())
            .await
            .expect("timeout waiting for welcome")
            .expect("closed before welcome")?;
        let Message::Text(text) = welcome else {
            panic!("expected text welcome frame, got {welcome:?}");
        };
        let msg: ServerMessage = serde_json::from_str(&text).unwrap();
        let ServerMessage::Welcome { connection_id } = msg else {
            panic!("expected welcome, got {msg:?}");
        };

        Ok(Self {
            ws_tx,
            ws_rx,
            connection_id,
        })
    }

    pub async fn send(&mut self, msg: &ClientMessage) {
        let json = serde_json::to_string(msg).unwrap();
        self.ws_tx.send(Message::Text(json)).await.unwrap();
    }

    pub async fn recv_msg(&mut self) -> ServerMessage {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws_rx.next())
                .await
                .expect("timeout waiting for frame")
                .unwrap()
                .unwrap();
            match msg {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    pub async fn recv_msg_timeout(&mut self, timeout: Duration) -> Option<ServerMessage> {
        tokio::time::timeout(timeout, self.recv_msg()).await.ok()
    }

    /// Joins a group and waits for the acknowledgment.
    pub async fn join(&mut self, group: &str) {
        self.send(&ClientMessage::JoinGroup {
            group: group.to_string(),
        })
        .await;
        match self.recv_msg().await {
            ServerMessage::Ack { op, group: acked } => {
                assert_eq!(op, "join_group");
                assert_eq!(acked, group);
            }
            other => panic!("expected join ack, got {other:?}"),
        }
    }

    /// Leaves a group and waits for the acknowledgment.
    pub async fn leave(&mut self, group: &str) {
        self.send(&ClientMessage::LeaveGroup {
            group: group.to_string(),
        })
        .await;
        match self.recv_msg().await {
            ServerMessage::Ack { op, group: acked } => {
                assert_eq!(op, "leave_group");
                assert_eq!(acked, group);
            }
            other => panic!("expected leave ack, got {other:?}"),
        }
    }

    /// Receives the next push, skipping acks and pongs.
    pub async fn recv_push(&mut self) -> Value {
        loop {
            match self.recv_msg().await {
                ServerMessage::Push { payload } => return payload,
                ServerMessage::Ack { .. } | ServerMessage::Pong => {}
                other => panic!("expected push, got {other:?}"),
            }
        }
    }
}

/// POSTs a publish request and returns the status plus the parsed body.
pub async fn http_publish(
    api_addr: &SocketAddr,
    path: &str,
    token: &str,
    payload: &Value,
) -> (reqwest::StatusCode, Value) {
    let response = reqwest::Client::new()
        .post(format!("http://{api_addr}{path}"))
        .bearer_auth(token)
        .json(payload)
        .send()
        .await
        .unwrap();
    let status = response.status();
    let body = response.json().await.unwrap_or(Value::Null);
    (status, body)
}
