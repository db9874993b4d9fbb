use std::path::PathBuf;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use nmt_protocol::{ModelInfo, TranslateError};

use super::ApiError;
use crate::state::AppState;

pub async fn model_info(State(state): State<AppState>) -> Json<ModelInfo> {
    Json(state.engine.model_info())
}

#[derive(Debug, Deserialize, Default)]
pub struct ReloadRequest {
    /// 缺省时回落到启动参数里的模型目录
    pub model_dir: Option<PathBuf>,
}

pub async fn reload_model(
    State(state): State<AppState>,
    body: Option<Json<ReloadRequest>>,
) -> Result<Json<Value>, ApiError> {
    let dir = body
        .and_then(|Json(b)| b.model_dir)
        .or_else(|| state.model_dir.clone());

    let Some(dir) = dir else {
        return Err(ApiError::BadRequest(
            "no model_dir in request and server started without one".to_string(),
        ));
    };

    let version = state
        .engine
        .load_model_dir(&dir)
        .await
        .map_err(|e| ApiError::Engine(TranslateError::Compute(e.to_string())))?;

    Ok(Json(json!({ "status": "reloaded", "version": version })))
}

pub async fn clear_cache(State(state): State<AppState>) -> Json<Value> {
    state.engine.clear_cache();
    Json(json!({ "status": "cleared" }))
}
