//! Operational REST API.
//!
//! HTTP surface for the betting core:
//! - `GET /api/health` - Store and cache liveness
//! - `GET /api/stats` - Engine counter snapshot
//! - `GET /api/markets/{id}/state` - Current market snapshot (cache-first)
//! - `POST /api/bets` - Synchronous bet placement
//! - `POST /api/admin/markets/{id}/poll` - Force one ingestion tick

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use oddsbook_common::{Db, DbError, MarketId, MarketSnapshot, ResultEntry, WagerId};

use crate::cache::SharedMarketCache;
use crate::config::ApiConfig;
use crate::gateway::SourceTag;
use crate::placement::{BetRequest, PlacementService};
use crate::poller::SharedPollerSet;
use crate::state::SharedCounters;

// ============================================================================
// API Types
// ============================================================================

/// API error response.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
}

impl ApiError {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal_error", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }
}

/// Body of a refused bet slip. Validation failures are client errors,
/// never 5xx.
#[derive(Debug, Serialize)]
pub struct RejectedResponse {
    pub rejected: String,
}

/// Body of an accepted bet slip.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BetAccepted {
    pub wager_id: WagerId,
}

/// Full market snapshot returned by the state read. `source_tag` says
/// whether the payload was already cached or was fetched on demand.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketStateResponse {
    pub market_id: MarketId,
    pub current_state: Option<Value>,
    pub recent_results: Vec<ResultEntry>,
    pub timestamp: DateTime<Utc>,
    pub source_tag: SourceTag,
}

impl MarketStateResponse {
    fn from_snapshot(snapshot: MarketSnapshot, source_tag: SourceTag) -> Self {
        Self {
            market_id: snapshot.market_id,
            current_state: snapshot.current_state,
            recent_results: snapshot.recent_results,
            timestamp: snapshot.updated_at,
            source_tag,
        }
    }
}

// ============================================================================
// API State
// ============================================================================

/// Which ledger backend the engine was booted with.
#[derive(Clone)]
pub enum StoreBackend {
    Memory,
    Postgres(Db),
}

impl StoreBackend {
    pub fn label(&self) -> &'static str {
        match self {
            StoreBackend::Memory => "memory",
            StoreBackend::Postgres(_) => "postgres",
        }
    }

    async fn ping(&self) -> Result<(), DbError> {
        match self {
            StoreBackend::Memory => Ok(()),
            StoreBackend::Postgres(db) => db.ping().await,
        }
    }
}

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub cache: SharedMarketCache,
    pub placement: Arc<PlacementService>,
    pub pollers: SharedPollerSet,
    pub counters: SharedCounters,
    pub store: StoreBackend,
}

impl ApiState {
    pub fn new(
        cache: SharedMarketCache,
        placement: Arc<PlacementService>,
        pollers: SharedPollerSet,
        counters: SharedCounters,
        store: StoreBackend,
    ) -> Self {
        Self {
            cache,
            placement,
            pollers,
            counters,
            store,
        }
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Store liveness plus the cache population.
async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "store": state.store.label(),
                "markets_cached": state.cache.len(),
            })),
        ),
        Err(err) => {
            warn!(error = %err, "Store ping failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "degraded",
                    "store": state.store.label(),
                    "error": err.to_string(),
                })),
            )
        }
    }
}

/// GET /api/stats - Engine counter snapshot.
async fn stats(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.counters.snapshot())
}

/// GET /api/markets/{id}/state - Cache-first snapshot read. On a miss the
/// handler forces one out-of-band ingestion tick before answering, so a
/// configured market never serves a stale default.
async fn get_market_state(
    State(state): State<Arc<ApiState>>,
    Path(market_id): Path<String>,
) -> Result<Json<MarketStateResponse>, (StatusCode, Json<ApiError>)> {
    if let Some(snapshot) = state.cache.get_by_id(&market_id) {
        return Ok(Json(MarketStateResponse::from_snapshot(
            snapshot,
            SourceTag::Resync,
        )));
    }

    match state.pollers.force_tick(&market_id).await {
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ApiError::not_found(format!(
                "Unknown market: {}",
                market_id
            ))),
        )),
        Some(ran) => {
            if !ran {
                warn!(market_id = %market_id, "Forced fetch failed on a cache miss");
            }
            match state.cache.get_by_id(&market_id) {
                Some(snapshot) => Ok(Json(MarketStateResponse::from_snapshot(
                    snapshot,
                    SourceTag::Live,
                ))),
                None => Err((
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(ApiError::new(
                        "upstream_unavailable",
                        format!("No state available for market: {}", market_id),
                    )),
                )),
            }
        }
    }
}

/// POST /api/bets - Synchronous placement. The caller learns the outcome
/// in the response: an accepted slip's wager id, or the rejection reason.
async fn place_bet(State(state): State<Arc<ApiState>>, Json(request): Json<BetRequest>) -> Response {
    match state.placement.place(request).await {
        Ok(wager) => (StatusCode::OK, Json(BetAccepted { wager_id: wager.id })).into_response(),
        Err(err) if err.is_rejection() => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(RejectedResponse {
                rejected: err.to_string(),
            }),
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "Placement failed on a store fault");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::internal(format!("Store error: {}", err))),
            )
                .into_response()
        }
    }
}

/// POST /api/admin/markets/{id}/poll - Force one ingestion tick out of
/// schedule. Answers as soon as the command is queued.
async fn force_poll(
    State(state): State<Arc<ApiState>>,
    Path(market_id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    match state.pollers.kick(&market_id).await {
        Some(true) => {
            info!(market_id = %market_id, "Manual poll requested");
            Ok(StatusCode::ACCEPTED)
        }
        Some(false) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiError::internal(format!(
                "Poller for {} is not running",
                market_id
            ))),
        )),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ApiError::not_found(format!(
                "Unknown market: {}",
                market_id
            ))),
        )),
    }
}

// ============================================================================
// Router Configuration
// ============================================================================

/// Create the API router with all endpoints.
pub fn create_api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/stats", get(stats))
        .route("/api/markets/{id}/state", get(get_market_state))
        .route("/api/bets", post(place_bet))
        .route("/api/admin/markets/{id}/poll", post(force_poll))
        .with_state(state)
}

/// Serve the API on an already-bound listener.
pub async fn run_api_server(
    listener: tokio::net::TcpListener,
    state: Arc<ApiState>,
) -> anyhow::Result<()> {
    use tower_http::cors::{Any, CorsLayer};

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = create_api_router(state).layer(cors);

    axum::serve(listener, app).await?;
    Ok(())
}

/// Bind the API address and spawn the server as a background task.
/// Returns the bound address (port 0 resolves here).
pub async fn spawn_api_server(
    config: &ApiConfig,
    state: Arc<ApiState>,
) -> anyhow::Result<(SocketAddr, JoinHandle<anyhow::Result<()>>)> {
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind API server on {}", config.bind_addr))?;
    let addr = listener.local_addr()?;
    info!(addr = %addr, "Operational API listening");

    let handle = tokio::spawn(async move { run_api_server(listener, state).await });
    Ok((addr, handle))
}
