//! HTTP API Server
//!
//! Serves the peer side of the HTTP Distro transport plus a small REST API
//! for registering instances, inspecting data and managing membership.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{DefaultBodyLimit, Json, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::cluster::{ClusterMembership, Member, MemberSource};
use crate::config::{http_address, split_host_port};
use crate::distro::transport::{DatumPush, DatumQuery};
use crate::distro::{DataOperation, DistroProtocol, SyncKey, SyncPayload};
use crate::error::{Error, Result};
use crate::network::FrameHeader;
use crate::store::{Datum, Instance};

/// Header set on registry writes a peer forwarded to the key's owner
pub const FORWARDED_HEADER: &str = "x-distro-forwarded";

const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state
pub struct AppState {
    /// Replication driver
    pub protocol: Arc<DistroProtocol>,
    /// Cluster membership
    pub membership: Arc<ClusterMembership>,
    /// Added to a member's port to reach its HTTP API
    pub http_port_offset: u16,
    /// Client for forwarding writes to key owners
    pub client: reqwest::Client,
}

/// HTTP API server
pub struct HttpServer {
    bind_address: String,
    state: Arc<AppState>,
    shutdown: watch::Sender<bool>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(
        bind_address: String,
        protocol: Arc<DistroProtocol>,
        membership: Arc<ClusterMembership>,
        http_port_offset: u16,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            bind_address,
            state: Arc::new(AppState {
                protocol,
                membership,
                http_port_offset,
                client: reqwest::Client::new(),
            }),
            shutdown,
        }
    }

    /// Get the state for sharing with other components
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Create the router
    pub fn router(state: Arc<AppState>) -> Router {
        Router::new()
            // Distro peer endpoints
            .route("/distro/datum", put(handle_datum_push))
            .route("/distro/checksum", put(handle_checksum_push))
            .route("/distro/datum/query", post(handle_datum_query))
            .route("/distro/datums", get(handle_snapshot))
            // Registry
            .route(
                "/instances",
                post(handle_register).delete(handle_deregister),
            )
            .route("/instances/:key", get(handle_get_instances))
            // Cluster and status
            .route("/cluster", get(handle_cluster_info))
            .route("/cluster/members", post(handle_add_member))
            .route("/cluster/members/:address", delete(handle_remove_member))
            .route("/health", get(handle_health))
            .layer(DefaultBodyLimit::max(FrameHeader::MAX_LENGTH as usize))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind and serve until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.bind_address);
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let app = Self::router(Arc::clone(&self.state));
        let mut shutdown_rx = self.shutdown.subscribe();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while shutdown_rx.changed().await.is_ok() {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            })
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

// ============ Request/Response Types ============

/// Query string of `PUT /distro/checksum`
#[derive(Debug, Deserialize)]
pub struct ChecksumPush {
    pub source: String,
}

/// Register or deregister request
#[derive(Debug, Deserialize, Serialize)]
pub struct InstanceRequest {
    /// Resource key, e.g. `public##svc:A`
    pub key: String,
    pub instance: Instance,
}

/// Add member request
#[derive(Debug, Deserialize, Serialize)]
pub struct MemberRequest {
    pub address: String,
}

/// Generic success response
#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub success: bool,
    pub message: Option<String>,
}

/// Cluster info response
#[derive(Debug, Serialize)]
pub struct ClusterInfoResponse {
    pub local_address: String,
    pub members: Vec<Member>,
    /// Keys owned by this node
    pub owned_keys: usize,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub address: String,
    pub initial_load_done: bool,
    pub datums: usize,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(status: StatusCode, code: &str, error: impl std::fmt::Display) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

fn octets(content: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        content,
    )
        .into_response()
}

fn ack() -> Response {
    Json(AckResponse {
        success: true,
        message: None,
    })
    .into_response()
}

// ============ Distro Handlers ============

async fn handle_datum_push(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DatumPush>,
    body: Bytes,
) -> Response {
    let key = match params.sync_key() {
        Ok(key) => key,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "INVALID_KEY", e),
    };
    let payload = SyncPayload::new(key, body.to_vec(), params.operation);

    match state.protocol.process_data(payload, &params.source).await {
        Ok(()) => ack(),
        Err(e) => {
            tracing::warn!("Rejected Distro push from {}: {}", params.source, e);
            error_response(StatusCode::BAD_REQUEST, "DISTRO_PUSH_FAILED", e)
        }
    }
}

async fn handle_checksum_push(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ChecksumPush>,
    body: Bytes,
) -> Response {
    let payload = SyncPayload::new(SyncKey::Checksum, body.to_vec(), DataOperation::Verify);

    // Acked once decoded; the repair runs on its own task
    match state.protocol.process_data(payload, &params.source).await {
        Ok(()) => ack(),
        Err(e) => {
            tracing::warn!("Rejected checksums from {}: {}", params.source, e);
            error_response(StatusCode::BAD_REQUEST, "VERIFY_FAILED", e)
        }
    }
}

async fn handle_datum_query(
    State(state): State<Arc<AppState>>,
    Json(query): Json<DatumQuery>,
) -> Response {
    let key = SyncKey::Combined {
        keys: query.keys,
        target: state.protocol.local_address().to_string(),
    };

    match state.protocol.storage().get_data(&key).await {
        Ok(payload) => octets(payload.content),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "QUERY_FAILED", e),
    }
}

async fn handle_snapshot(State(state): State<Arc<AppState>>) -> Response {
    match state.protocol.storage().get_snapshot().await {
        Ok(payload) => octets(payload.content),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "SNAPSHOT_FAILED", e),
    }
}

// ============ Registry Handlers ============

/// Send a registry write to the owner of its key.
///
/// Returns `None` when this node owns the key and applies the write itself.
async fn forward_to_owner(
    state: &AppState,
    method: reqwest::Method,
    headers: &HeaderMap,
    req: &InstanceRequest,
) -> Option<Response> {
    let owner = state.protocol.mapper().map_server(&req.key)?;
    if owner == state.protocol.local_address() {
        return None;
    }

    if let Some(peer) = headers.get(FORWARDED_HEADER) {
        tracing::warn!(
            "Forwarded write of {} from {:?} does not belong here, owner is {}",
            req.key,
            peer,
            owner
        );
        return Some(error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_REDIRECT",
            "receive invalid redirect request from peer",
        ));
    }

    let Some(address) = http_address(&owner, state.http_port_offset) else {
        return Some(error_response(
            StatusCode::BAD_GATEWAY,
            "FORWARD_FAILED",
            format!("no HTTP address for owner {}", owner),
        ));
    };

    tracing::debug!("Forwarding {} of {} to owner {}", method, req.key, owner);
    let sent = state
        .client
        .request(method, format!("http://{}/instances", address))
        .header(FORWARDED_HEADER, state.protocol.local_address())
        .timeout(FORWARD_TIMEOUT)
        .json(req)
        .send()
        .await;

    let response = match sent {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("Forwarding {} to {} failed: {}", req.key, owner, e);
            return Some(error_response(StatusCode::BAD_GATEWAY, "FORWARD_FAILED", e));
        }
    };

    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    match response.bytes().await {
        Ok(body) => Some(
            (
                status,
                [(header::CONTENT_TYPE, "application/json")],
                body.to_vec(),
            )
                .into_response(),
        ),
        Err(e) => Some(error_response(StatusCode::BAD_GATEWAY, "FORWARD_FAILED", e)),
    }
}

async fn handle_register(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<InstanceRequest>,
) -> Response {
    if let Some(forwarded) = forward_to_owner(&state, reqwest::Method::POST, &headers, &req).await {
        return forwarded;
    }

    match state.protocol.register_instance(&req.key, req.instance).await {
        Ok(()) => ack(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, "REGISTER_FAILED", e),
    }
}

async fn handle_deregister(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<InstanceRequest>,
) -> Response {
    if let Some(forwarded) = forward_to_owner(&state, reqwest::Method::DELETE, &headers, &req).await
    {
        return forwarded;
    }

    match state.protocol.deregister_instance(&req.key, req.instance).await {
        Ok(()) => ack(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, "DEREGISTER_FAILED", e),
    }
}

async fn handle_get_instances(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Response {
    match state.protocol.store().get(&key).await {
        Some(datum) => Json::<Datum>(datum).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            "KEY_NOT_FOUND",
            format!("{} not found", key),
        ),
    }
}

// ============ Cluster Handlers ============

async fn handle_cluster_info(State(state): State<Arc<AppState>>) -> Response {
    let mapper = state.protocol.mapper();
    let owned_keys = state
        .protocol
        .store()
        .keys()
        .await
        .iter()
        .filter(|key| mapper.is_responsible(key))
        .count();

    Json(ClusterInfoResponse {
        local_address: state.membership.local_address().to_string(),
        members: state.membership.all_members().await,
        owned_keys,
    })
    .into_response()
}

async fn handle_add_member(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MemberRequest>,
) -> Response {
    if split_host_port(&req.address).is_none() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_ADDRESS",
            format!("{} is not host:port", req.address),
        );
    }

    let added = state.membership.add_member(req.address.clone()).await;
    Json(AckResponse {
        success: true,
        message: (!added).then(|| format!("{} already a member", req.address)),
    })
    .into_response()
}

async fn handle_remove_member(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Response {
    match state.membership.remove_member(&address).await {
        Some(_) => ack(),
        None => error_response(
            StatusCode::NOT_FOUND,
            "MEMBER_NOT_FOUND",
            format!("{} is not a removable member", address),
        ),
    }
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Response {
    Json(HealthResponse {
        healthy: true,
        address: state.protocol.local_address().to_string(),
        initial_load_done: state.protocol.storage().is_initial_load_done(),
        datums: state.protocol.store().len().await,
    })
    .into_response()
}
