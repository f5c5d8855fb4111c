//! Request handlers.

use crate::error::ApiError;
use crate::state::AppState;
use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
};
use keel_data::LedgerStats;
use keel_domain::{PositionRecord, ReconcileMode, ReconciliationReport};
use keel_execution::gate::GateStatus;
use keel_execution::stream::SessionStatus;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Liveness and readiness.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub ready: bool,
}

/// Operator view of the core.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub gate: GateStatus,
    pub last_report: Option<ReconciliationReport>,
    pub sessions: Vec<SessionStatus>,
    pub rate_limit_hold_ms: Option<u64>,
    pub ledger: LedgerStats,
}

/// Body of a forced reconciliation.
#[derive(Debug, Deserialize)]
pub struct ReconcileRequest {
    pub mode: ReconcileMode,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        ready: state.core.gate().is_ready(),
    })
}

/// GET /api/v1/status
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let core = &state.core;
    Json(StatusResponse {
        gate: core.gate().status().await,
        last_report: core.reconciler().last_report().await,
        sessions: core.streams().session_states().await,
        rate_limit_hold_ms: core.streams().rate_limit_hold().map(|d| d.as_millis() as u64),
        ledger: core.ledger().stats(),
    })
}

/// GET /api/v1/positions
pub async fn positions(State(state): State<AppState>) -> Result<Json<Vec<PositionRecord>>, ApiError> {
    Ok(Json(state.core.store().positions().await?))
}

/// POST /api/v1/reconcile
pub async fn reconcile(
    State(state): State<AppState>,
    body: Result<Json<ReconcileRequest>, JsonRejection>,
) -> Result<Json<ReconciliationReport>, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    info!(mode = %request.mode, "Forced reconciliation requested");
    let report = state.core.reconcile_handle().reconcile(request.mode).await?;
    Ok(Json(report))
}
