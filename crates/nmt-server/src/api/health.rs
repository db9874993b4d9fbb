use axum::extract::State;
use axum::Json;

use nmt_engine::EngineStats;
use nmt_protocol::HealthStatus;

use crate::state::AppState;

pub async fn health_check(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(state.engine.health())
}

pub async fn stats(State(state): State<AppState>) -> Json<EngineStats> {
    Json(state.engine.stats())
}
