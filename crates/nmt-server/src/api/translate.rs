use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use uuid::Uuid;

use nmt_protocol::language::SUPPORTED_LANGUAGES;
use nmt_protocol::{TranslationRequest, TranslationResponse};

use super::ApiError;
use crate::state::AppState;

pub async fn translate(
    State(state): State<AppState>,
    Json(request): Json<TranslationRequest>,
) -> Result<Json<TranslationResponse>, ApiError> {
    let request_id = Uuid::new_v4();
    tracing::debug!(
        %request_id,
        src = %request.source_language,
        tgt = %request.target_language,
        chars = request.text.chars().count(),
        "translate request"
    );

    let response = state.engine.translate(request).await?;

    tracing::debug!(
        %request_id,
        elapsed = response.processing_time,
        truncated = response.truncated,
        "translate done"
    );
    Ok(Json(response))
}

pub async fn languages() -> Json<Value> {
    let languages: Vec<Value> = SUPPORTED_LANGUAGES
        .iter()
        .map(|(code, name)| json!({ "code": code, "name": name }))
        .collect();
    Json(json!({ "languages": languages }))
}
