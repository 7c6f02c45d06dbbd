//! HTTP surface of the relay: publish endpoints, health, and metrics.
//!
//! Publish requests carry a bearer token whose audience must equal the exact
//! resource path being invoked. Validation happens before any registry or
//! dispatch work; a rejected request has no delivery side effects.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use hrp_common::token::{self, AuthError};
use hrp_common::types::PublishTarget;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::dispatch::PublishRequest;
use crate::metrics::{counters, HealthState};
use crate::server::ServerState;

/// State shared by every API handler.
#[derive(Clone)]
pub struct ApiState {
    /// The relay's shared state (registry, dispatcher, config).
    pub server: Arc<ServerState>,
    /// Readiness flag surfaced on `/ready`.
    pub health: HealthState,
    /// Prometheus render handle; `None` when no recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness check response.
#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Builds the API router.
#[must_use]
pub fn router(api: ApiState) -> Router {
    Router::new()
        .route("/hubs/{hub}", post(publish_broadcast))
        .route("/hubs/{hub}/users/{user}", post(publish_to_user))
        .route("/hubs/{hub}/groups/{group}", post(publish_to_group))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(api)
}

/// Installs the Prometheus recorder and serves the API.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed or binding fails.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<ServerState>,
    health: HealthState,
) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let app = router(ApiState {
        server: state,
        health,
        metrics: Some(handle),
    });
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("api server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn publish_broadcast(
    State(api): State<ApiState>,
    Path(hub): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    publish(&api, &headers, &hub, PublishTarget::Broadcast, payload)
}

async fn publish_to_user(
    State(api): State<ApiState>,
    Path((hub, user)): Path<(String, String)>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    publish(&api, &headers, &hub, PublishTarget::User(user), payload)
}

async fn publish_to_group(
    State(api): State<ApiState>,
    Path((hub, group)): Path<(String, String)>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    publish(&api, &headers, &hub, PublishTarget::Group(group), payload)
}

fn publish(
    api: &ApiState,
    headers: &HeaderMap,
    hub: &str,
    target: PublishTarget,
    payload: Value,
) -> Response {
    let Some(bearer) = bearer_token(headers) else {
        counters::auth_failures_total("missing");
        return error_response(StatusCode::UNAUTHORIZED, "missing bearer token");
    };

    let resource = target.resource_path(hub);
    if let Err(e) = token::validate(
        bearer,
        &api.server.secret,
        &resource,
        Duration::from_secs(api.server.config.clock_skew),
    ) {
        counters::auth_failures_total(match e {
            AuthError::Malformed => "malformed",
            AuthError::SignatureMismatch => "signature_mismatch",
            AuthError::Expired => "expired",
            AuthError::AudienceMismatch => "audience_mismatch",
        });
        return error_response(auth_status(&e), &e.to_string());
    }

    if hub != api.server.config.hub {
        return error_response(StatusCode::NOT_FOUND, &format!("unknown hub {hub}"));
    }

    let report = api.server.dispatcher.publish(&PublishRequest { target, payload });
    let status = if report.all_failed() {
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::OK
    };
    (status, Json(report)).into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|v| !v.is_empty())
}

/// Auth failures are always 4xx: a wrong audience is a forbidden resource,
/// everything else is a bad credential.
const fn auth_status(error: &AuthError) -> StatusCode {
    match error {
        AuthError::AudienceMismatch => StatusCode::FORBIDDEN,
        _ => StatusCode::UNAUTHORIZED,
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

/// Health check handler - returns 200 if server is running.
async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

/// Readiness check handler - returns 200 if ready, 503 if not.
async fn ready_handler(State(api): State<ApiState>) -> (StatusCode, Json<ReadyResponse>) {
    if api.health.is_ready() {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "not ready",
                ready: false,
            }),
        )
    }
}

async fn metrics_handler(State(api): State<ApiState>) -> String {
    api.metrics.as_ref().map(PrometheusHandle::render).unwrap_or_default()
}
