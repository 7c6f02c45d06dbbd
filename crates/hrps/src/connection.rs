//! Client channel lifecycle: upgrade, token check, registration, and the
//! per-connection read/write loop.
//!
//! A connection moves strictly forward: accept → open → closing → closed.
//! Close, transport error, write timeout, and idle timeout all converge on
//! the same teardown path, which unregisters the connection exactly once. A
//! closed id is never reused; a reconnect registers a brand-new connection.

use crate::error::HrpsError;
use crate::metrics::{counters, gauges};
use crate::outbound::{CloseReason, OutboundQueue};
use crate::registry::ConnHandle;
use crate::server::ServerState;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hrp_common::message::{ClientMessage, ErrorCode, ServerMessage};
use hrp_common::token::{self, AuthError, Principal};
use hrp_common::types::{connect_path, ACCESS_TOKEN_PARAM};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::time::{interval, timeout, Duration};
use tokio_tungstenite::tungstenite::handshake::server::ErrorResponse;
use tokio_tungstenite::tungstenite::http::{Request, Response, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

/// Pulls the access token out of an upgrade request.
///
/// The query parameter takes precedence over the `Authorization` header.
fn extract_token(request: &Request<()>) -> Option<String> {
    if let Some(query) = request.uri().query() {
        for pair in query.split('&') {
            if let Some(value) = pair
                .strip_prefix(ACCESS_TOKEN_PARAM)
                .and_then(|rest| rest.strip_prefix('='))
            {
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Checks the presented token against the hub's connect audience.
///
/// With client auth disabled every connection is admitted anonymously.
fn authenticate(state: &ServerState, token: Option<&str>) -> Result<Principal, AuthError> {
    if !state.config.client_auth {
        return Ok(Principal { subject: None });
    }
    let token = token.ok_or(AuthError::Malformed)?;
    token::validate(
        token,
        &state.secret,
        &connect_path(&state.config.hub),
        Duration::from_secs(state.config.clock_skew),
    )
}

const fn auth_failure_kind(error: &AuthError) -> &'static str {
    match error {
        AuthError::Malformed => "malformed",
        AuthError::SignatureMismatch => "signature_mismatch",
        AuthError::Expired => "expired",
        AuthError::AudienceMismatch => "audience_mismatch",
    }
}

struct IpGuard {
    state: Arc<ServerState>,
    ip: IpAddr,
}

impl Drop for IpGuard {
    fn drop(&mut self) {
        let mut remove = false;
        if let Some(mut entry) = self.state.ip_connections.get_mut(&self.ip) {
            *entry = entry.saturating_sub(1);
            if *entry == 0 {
                remove = true;
            }
        }
        if remove {
            self.state
                .ip_connections
                .remove_if(&self.ip, |_, v| *v == 0);
        }
    }
}

/// Sends one WebSocket message with the configured write bound.
///
/// An unresponsive socket fails with [`HrpsError::WriteTimeout`] instead of
/// stalling the connection task.
async fn send_timed<S>(ws_tx: &mut S, msg: Message, bound: Duration) -> Result<(), HrpsError>
where
    S: futures_util::Sink<Message, Error = tungstenite::Error> + Unpin,
{
    match timeout(bound, ws_tx.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(HrpsError::WebSocket(e)),
        Err(_) => Err(HrpsError::WriteTimeout),
    }
}

async fn send_server_message<S>(
    ws_tx: &mut S,
    msg: &ServerMessage,
    bound: Duration,
) -> Result<(), HrpsError>
where
    S: futures_util::Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let json = serde_json::to_string(msg).map_err(|e| {
        tracing::warn!(error = %e, "failed to serialize server message");
        HrpsError::ConnectionClosed
    })?;
    send_timed(ws_tx, Message::Text(json), bound).await
}

pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), HrpsError> {
    // Limit unauthenticated connections so a connect flood cannot exhaust
    // file descriptors before token validation runs.
    let _permit = state.pre_auth_semaphore.acquire().await.map_err(|_| {
        tracing::debug!("pre-auth semaphore closed");
        HrpsError::ConnectionClosed
    })?;

    let ws_config = WebSocketConfig {
        max_message_size: Some(state.config.max_payload),
        max_frame_size: Some(state.config.max_payload),
        ..WebSocketConfig::default()
    };

    let principal_cell = Arc::new(std::sync::OnceLock::new());
    let cell = principal_cell.clone();
    let cb_state = Arc::clone(&state);
    let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        move |req: &Request<()>, resp: Response<()>| {
            // Token validation happens before the upgrade completes, so a
            // rejected client sees a plain HTTP status and no channel is
            // ever registered.
            match authenticate(&cb_state, extract_token(req).as_deref()) {
                Ok(principal) => {
                    let _ = cell.set(principal);
                    Ok(resp)
                }
                Err(e) => {
                    counters::connections_total("rejected");
                    counters::auth_failures_total(auth_failure_kind(&e));
                    tracing::debug!(peer = %peer_addr, error = %e, "rejecting client channel");
                    let status = match e {
                        AuthError::AudienceMismatch => StatusCode::FORBIDDEN,
                        _ => StatusCode::UNAUTHORIZED,
                    };
                    let mut resp = ErrorResponse::new(Some(e.to_string()));
                    *resp.status_mut() = status;
                    Err(resp)
                }
            }
        },
        Some(ws_config),
    )
    .await
    .map_err(HrpsError::WebSocket)?;

    let client_ip = peer_addr.ip();

    // Atomic check-and-increment for per-IP connection limiting.
    let mut should_reject = false;
    match state.ip_connections.entry(client_ip) {
        dashmap::mapref::entry::Entry::Occupied(mut entry) => {
            let count = *entry.get();
            if count >= state.config.max_conns_ip {
                should_reject = true;
            } else {
                *entry.get_mut() += 1;
            }
        }
        dashmap::mapref::entry::Entry::Vacant(entry) => {
            let _ = entry.insert(1);
        }
    }

    if should_reject {
        counters::connections_total("ip_limited");
        tracing::debug!(ip = %client_ip, limit = state.config.max_conns_ip, "per-IP connection limit exceeded");
        return Err(HrpsError::ConnectionClosed);
    }

    let _ip_guard = IpGuard {
        state: state.clone(),
        ip: client_ip,
    };

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let write_timeout = Duration::from_secs(state.config.write_timeout);

    let principal = principal_cell
        .get()
        .cloned()
        .unwrap_or(Principal { subject: None });

    let queue = Arc::new(OutboundQueue::new(state.config.outbound_buffer));
    let handle = match state.registry.register(principal.subject, queue) {
        Ok(handle) => handle,
        Err(e) => {
            counters::connections_total("capacity");
            let _ = send_server_message(
                &mut ws_tx,
                &ServerMessage::Error {
                    code: ErrorCode::CapacityExceeded,
                    message: e.to_string(),
                },
                write_timeout,
            )
            .await;
            return Err(HrpsError::Registry(e));
        }
    };

    counters::connections_total("accepted");
    gauges::inc_connections_active();
    tracing::debug!(conn = %handle.id, peer = %peer_addr, "client channel open");

    let welcome = ServerMessage::Welcome {
        connection_id: handle.id,
    };
    let result = match send_server_message(&mut ws_tx, &welcome, write_timeout).await {
        Ok(()) => run_message_loop(&mut ws_tx, &mut ws_rx, &state, &handle).await,
        Err(e) => Err(e),
    };

    if matches!(&result, Err(HrpsError::WriteTimeout)) {
        handle.queue.close(CloseReason::TimedOut);
    }
    state.registry.unregister(handle.id);
    gauges::dec_connections_active();
    tracing::debug!(conn = %handle.id, "client channel closed");

    result
}

/// Drives the select loop for an open connection: inbound control messages,
/// outbound pushes, and keepalive/idle bookkeeping.
async fn run_message_loop(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    state: &ServerState,
    handle: &ConnHandle,
) -> Result<(), HrpsError> {
    let mut ping_interval = interval(Duration::from_secs(state.config.ping_interval));
    let idle_timeout = Duration::from_secs(state.config.idle_timeout);
    let write_timeout = Duration::from_secs(state.config.write_timeout);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                last_activity = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&text, state, ws_tx, handle, write_timeout).await?;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        send_timed(ws_tx, Message::Pong(data), write_timeout).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(HrpsError::WebSocket(e)),
                    _ => {}
                }
            }
            frame = handle.queue.pop() => {
                match frame {
                    Some(json) => {
                        last_activity = Instant::now();
                        send_timed(ws_tx, Message::Text(json.as_ref().to_owned()), write_timeout).await?;
                    }
                    // Queue closed from outside the loop; tear down.
                    None => return Ok(()),
                }
            }
            _ = ping_interval.tick() => {
                if last_activity.elapsed() >= idle_timeout {
                    tracing::debug!(conn = %handle.id, "idle timeout reached, closing connection");
                    return Ok(());
                }
                send_timed(ws_tx, Message::Ping(vec![]), write_timeout).await?;
            }
        }
    }
}

async fn handle_client_message<S>(
    text: &str,
    state: &ServerState,
    ws_tx: &mut S,
    handle: &ConnHandle,
    write_timeout: Duration,
) -> Result<(), HrpsError>
where
    S: futures_util::Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(conn = %handle.id, error = %e, "unparseable client message");
            return send_server_message(
                ws_tx,
                &ServerMessage::Error {
                    code: ErrorCode::BadRequest,
                    message: "unrecognized message".to_string(),
                },
                write_timeout,
            )
            .await;
        }
    };

    let reply = match msg {
        ClientMessage::JoinGroup { group } => group_edit(state, handle, &group, "join_group"),
        ClientMessage::LeaveGroup { group } => group_edit(state, handle, &group, "leave_group"),
        ClientMessage::Ping => ServerMessage::Pong,
    };
    send_server_message(ws_tx, &reply, write_timeout).await
}

fn group_edit(state: &ServerState, handle: &ConnHandle, group: &str, op: &str) -> ServerMessage {
    if group.is_empty() {
        return ServerMessage::Error {
            code: ErrorCode::BadRequest,
            message: "group name must not be empty".to_string(),
        };
    }
    let result = if op == "join_group" {
        state.registry.join_group(handle.id, group)
    } else {
        state.registry.leave_group(handle.id, group)
    };
    match result {
        Ok(()) => ServerMessage::Ack {
            op: op.to_string(),
            group: group.to_string(),
        },
        Err(e) => ServerMessage::Error {
            code: ErrorCode::BadRequest,
            message: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::outbound::OverflowPolicy;
    use hrp_common::token::Claims;

    const SECRET: &[u8] = b"connection-test-secret-0123456789ab";

    fn test_state(client_auth: bool) -> ServerState {
        let config = ServerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            api_addr: "127.0.0.1:0".parse().unwrap(),
            hub: "message".to_string(),
            max_conns: 100,
            max_conns_ip: 10,
            max_payload: 65_535,
            outbound_buffer: 16,
            overflow_policy: OverflowPolicy::DropOldest,
            write_timeout: 5,
            ping_interval: 30,
            idle_timeout: 120,
            clock_skew: 0,
            client_auth,
        };
        ServerState::new(config, SECRET.to_vec(), 100)
    }

    fn request(uri: &str) -> Request<()> {
        Request::builder().uri(uri).body(()).unwrap()
    }

    #[test]
    fn token_from_query_parameter() {
        let req = request("/connect?access_token=abc.def.ghi");
        assert_eq!(extract_token(&req).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn token_from_query_among_other_parameters() {
        let req = request("/connect?hub=message&access_token=tok&x=1");
        assert_eq!(extract_token(&req).as_deref(), Some("tok"));
    }

    #[test]
    fn token_from_bearer_header() {
        let req = Request::builder()
            .uri("/connect")
            .header("authorization", "Bearer tok123")
            .body(())
            .unwrap();
        assert_eq!(extract_token(&req).as_deref(), Some("tok123"));
    }

    #[test]
    fn query_parameter_wins_over_header() {
        let req = Request::builder()
            .uri("/connect?access_token=from-query")
            .header("authorization", "Bearer from-header")
            .body(())
            .unwrap();
        assert_eq!(extract_token(&req).as_deref(), Some("from-query"));
    }

    #[test]
    fn missing_token_is_none() {
        assert_eq!(extract_token(&request("/connect")), None);
        assert_eq!(extract_token(&request("/connect?access_token=")), None);
    }

    #[test]
    fn authenticate_disabled_admits_anonymously() {
        let state = test_state(false);
        let principal = authenticate(&state, None).unwrap();
        assert_eq!(principal.subject, None);
    }

    #[test]
    fn authenticate_requires_token_when_enabled() {
        let state = test_state(true);
        assert_eq!(authenticate(&state, None).unwrap_err(), AuthError::Malformed);
    }

    #[test]
    fn authenticate_accepts_connect_audience_and_extracts_subject() {
        let state = test_state(true);
        let claims = Claims {
            aud: connect_path("message"),
            sub: Some("alice".to_string()),
            exp: token::unix_now() + 60,
        };
        let jwt = token::sign(&claims, SECRET).unwrap();
        let principal = authenticate(&state, Some(&jwt)).unwrap();
        assert_eq!(principal.subject.as_deref(), Some("alice"));
    }

    #[test]
    fn authenticate_rejects_publish_audience() {
        let state = test_state(true);
        let claims = Claims {
            aud: "/hubs/message".to_string(),
            sub: None,
            exp: token::unix_now() + 60,
        };
        let jwt = token::sign(&claims, SECRET).unwrap();
        assert_eq!(
            authenticate(&state, Some(&jwt)).unwrap_err(),
            AuthError::AudienceMismatch
        );
    }

    #[test]
    fn authenticate_rejects_expired_token() {
        let state = test_state(true);
        let claims = Claims {
            aud: connect_path("message"),
            sub: None,
            exp: token::unix_now() - 120,
        };
        let jwt = token::sign(&claims, SECRET).unwrap();
        assert_eq!(
            authenticate(&state, Some(&jwt)).unwrap_err(),
            AuthError::Expired
        );
    }
}
