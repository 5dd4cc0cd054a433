//! HTTP/WebSocket surface for the managed-server module.
//!
//! Routes are declared in one static table; authentication is owned by the
//! deployment's edge, which forwards the caller identity in a header.

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::lifecycle::LifecycleManager;
use crate::metrics::Metrics;
use crate::registry::{ManagedServer, Registry};
use crate::relay::RelaySession;

/// Header carrying the authenticated caller identity.
pub const OWNER_HEADER: &str = "x-owner-id";

/// Shared state for all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub lifecycle: Arc<LifecycleManager>,
    pub relay: Arc<RelaySession>,
    pub metrics: Arc<Metrics>,
}

/// The managed-server route table.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/servers", get(list_servers).post(register_server))
        .route("/api/v1/servers/discover", get(discover_servers))
        .route("/api/v1/servers/:id", get(get_server).delete(remove_server))
        .route("/api/v1/servers/:id/start", post(start_server))
        .route("/api/v1/servers/:id/stop", post(stop_server))
        .route("/api/v1/servers/:id/ws", get(connect_server_ws))
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct RegisterServerRequest {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct DiscoverParams {
    #[serde(default)]
    q: String,
}

fn owner_id(headers: &HeaderMap) -> Result<Uuid> {
    headers
        .get(OWNER_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value).ok())
        .ok_or_else(|| {
            GatewayError::InvalidRequest(format!("missing or invalid {} header", OWNER_HEADER))
        })
}

async fn list_servers(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ManagedServer>>> {
    let owner = owner_id(&headers)?;
    Ok(Json(state.registry.list(owner).await?))
}

async fn register_server(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RegisterServerRequest>,
) -> Result<impl IntoResponse> {
    let owner = owner_id(&headers)?;
    if request.name.trim().is_empty() || request.image.trim().is_empty() {
        return Err(GatewayError::InvalidRequest(
            "name and image are required".to_string(),
        ));
    }

    let server = state
        .registry
        .register(owner, request.name, request.image, request.config)
        .await?;
    Ok((StatusCode::CREATED, Json(server)))
}

async fn discover_servers(
    State(state): State<AppState>,
    Query(params): Query<DiscoverParams>,
) -> Result<Json<Vec<ManagedServer>>> {
    Ok(Json(state.registry.discover(&params.q).await?))
}

async fn get_server(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ManagedServer>> {
    Ok(Json(state.registry.get(id).await?))
}

async fn remove_server(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode> {
    state.registry.remove(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_server(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Value>> {
    match state.lifecycle.start_server(id).await {
        Ok(()) => {
            state.metrics.record_lifecycle("start", "success");
            Ok(Json(json!({"status": "started"})))
        }
        Err(err) => {
            state.metrics.record_lifecycle("start", "failure");
            Err(err)
        }
    }
}

async fn stop_server(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Value>> {
    match state.lifecycle.stop_server(id).await {
        Ok(()) => {
            state.metrics.record_lifecycle("stop", "success");
            Ok(Json(json!({"status": "stopped"})))
        }
        Err(err) => {
            state.metrics.record_lifecycle("stop", "failure");
            Err(err)
        }
    }
}

/// Validate relay preconditions, then upgrade and hand the socket to the
/// relay session. Rejections are reported as plain HTTP errors before the
/// upgrade takes place.
async fn connect_server_ws(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Response {
    let server = match state.lifecycle.validate_relay(id).await {
        Ok(server) => server,
        Err(err) => return err.into_response(),
    };

    let relay = state.relay.clone();
    ws.on_upgrade(move |socket| async move { relay.run(&server, socket).await })
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "service": "mcp-harbor",
        "version": crate::VERSION,
        "container_runtime": state.lifecycle.runtime_configured(),
    }))
}

async fn render_metrics(State(state): State<AppState>) -> Result<String> {
    state.metrics.render()
}
