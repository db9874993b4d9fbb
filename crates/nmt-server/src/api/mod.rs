//! HTTP handlers - 薄胶水层，业务都在 nmt-engine 里

pub mod admin;
pub mod health;
pub mod translate;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use nmt_protocol::TranslateError;

/// handler 错误：引擎错误按固定映射出状态码，其余是 handler 自己的 400
pub enum ApiError {
    Engine(TranslateError),
    BadRequest(String),
}

impl From<TranslateError> for ApiError {
    fn from(e: TranslateError) -> Self {
        Self::Engine(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Engine(e) => {
                let status = match &e {
                    TranslateError::Validation(_) => StatusCode::BAD_REQUEST,
                    TranslateError::ModelNotLoaded => StatusCode::SERVICE_UNAVAILABLE,
                    TranslateError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                    TranslateError::Compute(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.to_string())
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
