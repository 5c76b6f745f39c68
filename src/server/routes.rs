//! API route handlers.
//!
//! All endpoints return JSON. State is shared via `Arc<ServerState>`.
//! The analyze endpoint always returns whichever backends succeeded,
//! listing the ones that failed, rather than failing the request for
//! one backend's fault; resolve/calibrate return per-entity counts.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::engine::calibration::CalibrationRunReport;
use crate::engine::orchestrator::BackendFault;
use crate::engine::resolver::ResolutionReport;
use crate::engine::Engine;
use crate::storage::{PickFilter, Store};
use crate::types::{Calibration, ConsensusRecord, Pick, PickStatus, QuorumError};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct ServerState {
    pub engine: Engine,
    pub store: Arc<Store>,
}

pub type AppState = Arc<ServerState>;

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<QuorumError> for ApiError {
    fn from(e: QuorumError) -> Self {
        let status = match &e {
            QuorumError::MarketData { .. } => StatusCode::BAD_GATEWAY,
            QuorumError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub symbol: String,
}

#[derive(Debug, Serialize)]
pub struct AnalyzeResponse {
    pub symbol: String,
    pub picks: Vec<Pick>,
    pub consensus: Option<ConsensusRecord>,
    pub failed_backends: Vec<BackendFault>,
}

#[derive(Debug, Deserialize)]
pub struct PicksQuery {
    pub symbol: Option<String>,
    pub status: Option<String>,
    pub backend: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ConsensusQuery {
    pub symbol: String,
}

#[derive(Debug, Deserialize)]
pub struct CalibrateRequest {
    /// A backend id, or "all".
    pub backend: String,
}

#[derive(Debug, Deserialize)]
pub struct CalibrationQuery {
    pub backend: String,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// POST /api/analyze
pub async fn analyze(
    State(state): State<AppState>,
    Json(request): Json<AnalyzeRequest>,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    let symbol = request.symbol.trim().to_uppercase();
    if symbol.is_empty() {
        return Err(ApiError::bad_request("symbol must not be empty"));
    }

    let outcome = state.engine.orchestrator.generate_picks(&symbol).await?;
    Ok(Json(AnalyzeResponse {
        symbol,
        picks: outcome.picks,
        consensus: outcome.consensus,
        failed_backends: outcome.failures,
    }))
}

/// GET /api/picks
pub async fn get_picks(
    State(state): State<AppState>,
    Query(query): Query<PicksQuery>,
) -> Result<Json<Vec<Pick>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(|s| s.parse::<PickStatus>())
        .transpose()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let picks = state
        .store
        .query_picks(&PickFilter {
            symbol: query.symbol.map(|s| s.to_uppercase()),
            status,
            backend_id: query.backend,
            limit: query.limit,
        })
        .await?;

    Ok(Json(picks))
}

/// GET /api/consensus
pub async fn get_consensus(
    State(state): State<AppState>,
    Query(query): Query<ConsensusQuery>,
) -> Result<Json<ConsensusRecord>, ApiError> {
    let symbol = query.symbol.to_uppercase();
    state
        .store
        .latest_consensus(&symbol)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no consensus for {symbol}")))
}

/// POST /api/resolve-expired
pub async fn resolve_expired(
    State(state): State<AppState>,
) -> Result<Json<ResolutionReport>, ApiError> {
    let report = state.engine.resolver.resolve_expired().await?;
    Ok(Json(report))
}

/// POST /api/calibrate
pub async fn calibrate(
    State(state): State<AppState>,
    Json(request): Json<CalibrateRequest>,
) -> Result<Json<CalibrationRunReport>, ApiError> {
    let backends = if request.backend == "all" {
        state.store.backends_with_settled_picks().await?
    } else {
        vec![request.backend]
    };

    let report = state.engine.calibration.run_all(&backends).await;
    Ok(Json(report))
}

/// GET /api/calibration
pub async fn get_calibration(
    State(state): State<AppState>,
    Query(query): Query<CalibrationQuery>,
) -> Result<Json<Calibration>, ApiError> {
    state
        .store
        .latest_calibration(&query.backend)
        .await?
        .map(Json)
        .ok_or_else(|| {
            ApiError::not_found(format!("no calibration for backend {}", query.backend))
        })
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}
