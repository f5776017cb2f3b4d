use super::*;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use core_types::{FeeEvent, FeeTotals, TrackedAsset};
use cycle_orchestrator::{CycleOutcome, Readiness};
use fee_tracker::SyncStatus;
use serde::Deserialize;

use crate::context::{FlushReport, HealthSnapshot};

const DEFAULT_FEE_LIMIT: usize = 100;
const MAX_FEE_LIMIT: usize = 500;

pub(super) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/state/totals", get(totals))
        .route("/state/assets", get(assets))
        .route("/state/fees", get(fees))
        .route("/state/attestation", get(attestation))
        .route("/state/sync", get(sync))
        .route("/state/readiness", get(readiness))
        .route("/control/flush", post(flush))
        .route("/control/cycle", post(cycle))
        .with_state(state)
}

/// Ledger and disk failures surface as 502.
#[derive(Debug)]
pub(super) struct ApiError(anyhow::Error);

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({"ok": false, "error": format!("{:#}", self.0)})),
        )
            .into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct FeesQuery {
    pub(super) limit: Option<usize>,
}

pub(super) async fn health(State(state): State<AppState>) -> Json<HealthSnapshot> {
    Json(state.ctx.health())
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

pub(super) async fn totals(State(state): State<AppState>) -> Json<FeeTotals> {
    Json(state.ctx.get_totals())
}

async fn assets(State(state): State<AppState>) -> Json<Vec<TrackedAsset>> {
    Json(state.ctx.get_tracked_assets())
}

pub(super) async fn fees(
    State(state): State<AppState>,
    Query(query): Query<FeesQuery>,
) -> Json<Vec<FeeEvent>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_FEE_LIMIT)
        .clamp(1, MAX_FEE_LIMIT);
    Json(state.ctx.get_fee_records(limit))
}

async fn attestation(State(state): State<AppState>) -> Json<audit_chain::Attestation> {
    Json(state.ctx.get_attestation())
}

async fn sync(State(state): State<AppState>) -> Result<Json<SyncStatus>, ApiError> {
    Ok(Json(state.ctx.verify_sync_status().await?))
}

pub(super) async fn readiness(State(state): State<AppState>) -> Json<Readiness> {
    Json(state.ctx.check_cycle_readiness())
}

pub(super) async fn flush(State(state): State<AppState>) -> Result<Json<FlushReport>, ApiError> {
    let report = state.ctx.force_flush().await?;
    tracing::info!(processed = report.poll.processed, "manual flush");
    Ok(Json(report))
}

async fn cycle(State(state): State<AppState>) -> Json<CycleOutcome> {
    tracing::info!("manual cycle trigger");
    Json(state.ctx.execute_cycle().await)
}
