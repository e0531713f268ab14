//! Operator HTTP API - health, open positions and the emergency halt

use axum::{
    extract::State,
    http::StatusCode,
    routing::get,
    Json, Router,
};
use market_data::{MarketDataSource, PositionRecord, SourceHealth};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::portfolio::PortfolioSnapshot;
use crate::position::PositionManager;
use crate::risk::{EmergencyHalt, RiskController};

#[derive(Clone)]
pub struct ApiState {
    pub risk: Arc<RiskController>,
    pub positions: Arc<PositionManager>,
    pub source: Arc<dyn MarketDataSource>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub halt: Option<EmergencyHalt>,
    pub sources: Vec<SourceHealth>,
    pub open_positions: usize,
    pub portfolio: PortfolioSnapshot,
}

#[derive(Debug, Serialize)]
pub struct HaltStatus {
    pub halted: bool,
    pub halt: Option<EmergencyHalt>,
}

#[derive(Debug, Deserialize)]
pub struct HaltRequest {
    pub reason: String,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/health", get(health))
        .route("/v1/positions", get(list_positions))
        .route("/v1/halt", get(halt_status).post(set_halt).delete(clear_halt))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness only
async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let halt = state.risk.halt_status().await;
    let source = state.source.health().await;
    let portfolio = state.risk.portfolio().read().await.snapshot();

    let status = if halt.is_some() {
        "halted"
    } else if !source.is_healthy {
        "degraded"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status: status.to_string(),
        halt,
        sources: vec![source],
        open_positions: portfolio.positions.len(),
        portfolio,
    })
}

async fn list_positions(State(state): State<ApiState>) -> Json<Vec<PositionRecord>> {
    Json(state.positions.open_positions().await)
}

async fn halt_status(State(state): State<ApiState>) -> Json<HaltStatus> {
    let halt = state.risk.halt_status().await;
    Json(HaltStatus {
        halted: halt.is_some(),
        halt,
    })
}

/// POST /v1/halt - block new entries
async fn set_halt(
    State(state): State<ApiState>,
    Json(request): Json<HaltRequest>,
) -> Result<Json<HaltStatus>, (StatusCode, String)> {
    let reason = request.reason.trim();
    if reason.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "reason must not be empty".to_string()));
    }
    info!("Operator requested emergency halt: {}", reason);
    let halt = state.risk.halt(reason).await;
    Ok(Json(HaltStatus {
        halted: true,
        halt: Some(halt),
    }))
}

/// DELETE /v1/halt - operator clears the halt
async fn clear_halt(State(state): State<ApiState>) -> Json<HaltStatus> {
    state.risk.clear_halt().await;
    Json(HaltStatus {
        halted: false,
        halt: None,
    })
}
