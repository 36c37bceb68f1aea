//! HTTP API (request dispatch)
//!
//! Four GET routes in front of the demo cluster. Every route is wrapped by
//! the response cache; on a miss the handler checks its route-class limiter
//! before touching the cluster or serializing anything, and answers 429
//! when refused.

use axum::{
    body::{to_bytes, Body},
    extract::{Query, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::Level;

use crate::cluster::{
    ClientOp, ClusterError, ClusterStatus, ClusterSupervisor, MemberInfo, OpOutcome,
};
use crate::core::record::DEFAULT_ENDPOINT;
use crate::core::{
    rfc3339_now, CachedResponse, EndpointData, Fingerprint, IntervalLimiter, Limiters,
    Measurement, RecordSnapshot, ResponseCache, TelemetryRecord,
};
use crate::infrastructure::metrics::{DispatchMetrics, DispatchSnapshot};
use crate::telemetry::{RecordSync, SyncOutcome, SyncStatus};
use crate::log_api;

/// Largest handler body the cache will capture
const MAX_CACHED_BODY: usize = 4 * 1024 * 1024;

/// Marks whether a response came from the cache
const X_CACHE: &str = "x-cache";

/// Request-handling errors
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("too many requests")]
    RateLimited {
        route: &'static str,
        retry_after: Duration,
    },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("server is shutting down")]
    ShuttingDown,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Cluster(e) => match e {
                ClusterError::UnknownMember(_) => StatusCode::BAD_REQUEST,
                ClusterError::MemberStopped(_) | ClusterError::MemberRunning(_) => {
                    StatusCode::CONFLICT
                }
                ClusterError::NoQuorum { .. } | ClusterError::ShutDown => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

/// JSON error body
#[derive(Debug, Serialize)]
pub struct ErrorDto {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = ErrorDto {
            error: self.to_string(),
            route: None,
            retry_after_ms: None,
        };

        match self {
            ApiError::RateLimited { route, retry_after } => {
                body.route = Some(route);
                body.retry_after_ms = Some(retry_after.as_millis() as u64);
                // whole seconds, rounded up, never zero
                let secs = retry_after.as_millis().div_ceil(1000).max(1);
                (status, [(header::RETRY_AFTER, secs.to_string())], Json(body)).into_response()
            }
            _ => (status, Json(body)).into_response(),
        }
    }
}

/// `/conn` response
#[derive(Debug, Serialize)]
pub struct ConnectDto {
    pub scheme: &'static str,
    pub endpoints: Vec<String>,
    pub members: Vec<MemberInfo>,
}

/// `/server-status` response
#[derive(Debug, Serialize)]
pub struct ServerStatusDto {
    pub cluster: ClusterStatus,
    pub polls_ok: u64,
    pub polls_failed: u64,
    pub sync: SyncStatus,
    pub dispatch: DispatchSnapshot,
}

/// `/client-request` response
#[derive(Debug, Serialize)]
pub struct ClientResponseDto {
    pub action: &'static str,
    pub latency_us: u64,
    pub outcome: OpOutcome,
    /// Caller's telemetry entry after this request
    pub telemetry: EndpointData,
}

/// `/get-record` response
#[derive(Debug, Serialize)]
pub struct RecordDto {
    pub record: RecordSnapshot,
    pub sync: SyncStatus,
    /// Result of a forced upload, when one was requested and sync is enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forced: Option<String>,
}

/// `/client-request` query
#[derive(Debug, Deserialize)]
pub struct ClientRequestParams {
    pub action: String,
    pub key: Option<String>,
    pub value: Option<String>,
    #[serde(default)]
    pub node: usize,
    /// Tester endpoint the measurement is recorded under
    pub endpoint: Option<String>,
}

impl ClientRequestParams {
    fn to_op(&self) -> Result<ClientOp, ApiError> {
        let node = self.node;
        let key = || {
            self.key
                .clone()
                .filter(|k| !k.is_empty())
                .ok_or_else(|| ApiError::BadRequest(format!("{} requires a key", self.action)))
        };

        match self.action.as_str() {
            "put" => Ok(ClientOp::Put {
                node,
                key: key()?,
                value: self
                    .value
                    .clone()
                    .ok_or_else(|| ApiError::BadRequest("put requires a value".to_string()))?,
            }),
            "get" => Ok(ClientOp::Get { node, key: key()? }),
            "delete" => Ok(ClientOp::Delete { node, key: key()? }),
            "stop-node" => Ok(ClientOp::StopMember { node }),
            "restart-node" => Ok(ClientOp::RestartMember { node }),
            other => Err(ApiError::BadRequest(format!("unknown action {other:?}"))),
        }
    }
}

/// `/get-record` query
#[derive(Debug, Deserialize)]
pub struct RecordParams {
    #[serde(default)]
    pub force: bool,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub cluster: Arc<ClusterSupervisor>,
    pub limiters: Arc<Limiters>,
    pub record: Arc<TelemetryRecord>,
    pub sync: Arc<RecordSync>,
    pub metrics: Arc<DispatchMetrics>,
    /// Root shutdown signal; in-flight cluster work is abandoned when it fires
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Take the route-class slot or fail with 429
    fn admit(&self, route: &'static str, limiter: &IntervalLimiter) -> Result<(), ApiError> {
        if limiter.allow() {
            return Ok(());
        }

        self.metrics.record_rejected();
        let retry_after = limiter.retry_after();
        log_api!(
            Level::DEBUG,
            route,
            retry_after_ms = retry_after.as_millis() as u64,
            "Request rejected by rate limiter"
        );
        Err(ApiError::RateLimited { route, retry_after })
    }
}

#[derive(Clone)]
struct CacheState {
    cache: Arc<ResponseCache>,
    metrics: Arc<DispatchMetrics>,
}

/// Build the API router
pub fn router(state: AppState, cache: Arc<ResponseCache>) -> Router {
    let cache_state = CacheState {
        cache,
        metrics: state.metrics.clone(),
    };

    Router::new()
        .route("/conn", get(connect))
        .route("/server-status", get(server_status))
        .route("/client-request", get(client_request))
        .route("/get-record", get(get_record))
        .route_layer(middleware::from_fn_with_state(cache_state, cache_response))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve live cache entries; capture successful handler output
async fn cache_response(State(cache): State<CacheState>, request: Request, next: Next) -> Response {
    if request.method() != Method::GET {
        return next.run(request).await;
    }

    let key = Fingerprint::new(request.method(), request.uri().path(), request.uri().query());
    if let Some(hit) = cache.cache.get(&key) {
        cache.metrics.record_cache_hit();
        return cached_into_response(hit);
    }
    cache.metrics.record_cache_miss();

    let response = next.run(request).await;
    if !response.status().is_success() {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match to_bytes(body, MAX_CACHED_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            log_api!(Level::WARN, error = %e, "Failed to capture response body");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    cache.cache.insert(
        key,
        CachedResponse {
            status: parts.status,
            content_type: parts.headers.get(header::CONTENT_TYPE).cloned(),
            body: bytes.clone(),
        },
    );
    parts.headers.insert(X_CACHE, HeaderValue::from_static("miss"));
    Response::from_parts(parts, Body::from(bytes))
}

fn cached_into_response(cached: CachedResponse) -> Response {
    let mut response = (cached.status, cached.body).into_response();
    let headers = response.headers_mut();
    match cached.content_type {
        Some(content_type) => headers.insert(header::CONTENT_TYPE, content_type),
        None => headers.remove(header::CONTENT_TYPE),
    };
    headers.insert(X_CACHE, HeaderValue::from_static("hit"));
    response
}

/// Handler for /conn
/// Returns member client endpoints and the scheme to reach them with
async fn connect(State(state): State<AppState>) -> Result<Json<ConnectDto>, ApiError> {
    state.admit("conn", &state.limiters.read)?;

    let handle = state.cluster.handle();
    let members = handle.members();
    Ok(Json(ConnectDto {
        scheme: handle.scheme(),
        endpoints: members.iter().map(|m| m.client_url.clone()).collect(),
        members,
    }))
}

/// Handler for /server-status
/// Returns the last published health snapshot; never queries the cluster
async fn server_status(State(state): State<AppState>) -> Result<Json<ServerStatusDto>, ApiError> {
    state.admit("server-status", &state.limiters.read)?;

    let board = state.cluster.board();
    Ok(Json(ServerStatusDto {
        cluster: board.snapshot(),
        polls_ok: board.polls_ok(),
        polls_failed: board.polls_failed(),
        sync: state.sync.status(),
        dispatch: state.metrics.snapshot(),
    }))
}

/// Handler for /client-request
async fn client_request(
    State(state): State<AppState>,
    Query(params): Query<ClientRequestParams>,
) -> Result<Json<ClientResponseDto>, ApiError> {
    let op = params.to_op()?;
    let handle = state.cluster.handle();
    let size = handle.members().len();
    if op.node() >= size {
        return Err(ApiError::BadRequest(format!(
            "node {} out of range (cluster has {size} members)",
            op.node()
        )));
    }

    if op.is_membership_change() {
        state.admit("client-request:membership", &state.limiters.stop_restart)?;
    } else {
        state.admit("client-request", &state.limiters.client_request)?;
    }

    let action = op.action();
    let node = op.node();
    let started = Instant::now();
    let result = tokio::select! {
        biased;

        _ = state.shutdown.cancelled() => {
            state.metrics.record_cancelled();
            log_api!(Level::DEBUG, action, node, "Client request abandoned on shutdown");
            return Err(ApiError::ShuttingDown);
        }

        result = handle.execute(op) => result,
    };
    let latency_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);

    let endpoint = params.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT);
    let node_name = match &result {
        Ok(outcome) => outcome.node.clone(),
        Err(_) => format!("node{}", node + 1),
    };
    let telemetry = state.record.append(
        endpoint,
        Measurement {
            at: rfc3339_now(),
            action: action.to_string(),
            node: node_name,
            latency_us,
            ok: result.is_ok(),
        },
    );

    match result {
        Ok(outcome) => {
            log_api!(Level::DEBUG, action, node, latency_us, endpoint, "Client request served");
            Ok(Json(ClientResponseDto {
                action,
                latency_us,
                outcome,
                telemetry,
            }))
        }
        Err(e) => {
            log_api!(Level::WARN, action, node, error = %e, "Client request failed");
            Err(e.into())
        }
    }
}

/// Handler for /get-record
async fn get_record(
    State(state): State<AppState>,
    Query(params): Query<RecordParams>,
) -> Result<Json<RecordDto>, ApiError> {
    state.admit("get-record", &state.limiters.sync_record)?;

    // the slot taken above covers the forced upload as well
    let forced = if params.force && state.sync.is_enabled() {
        let outcome = tokio::select! {
            biased;
            _ = state.shutdown.cancelled() => return Err(ApiError::ShuttingDown),
            outcome = state.sync.sync_now() => outcome,
        };
        Some(describe(&outcome))
    } else {
        None
    };

    Ok(Json(RecordDto {
        record: state.record.snapshot(),
        sync: state.sync.status(),
        forced,
    }))
}

fn describe(outcome: &SyncOutcome) -> String {
    match outcome {
        SyncOutcome::Disabled => "disabled".to_string(),
        SyncOutcome::Throttled => "throttled".to_string(),
        SyncOutcome::Uploaded { bytes } => format!("uploaded {bytes} bytes"),
        SyncOutcome::Failed(error) => format!("failed: {error}"),
    }
}
