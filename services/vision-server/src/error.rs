use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use modelops::ModelOpsError;
use serde::Serialize;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error: String,
}

#[derive(Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, error: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, error: msg.into() }
    }

    pub fn bad_gateway(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_GATEWAY, error: msg.into() }
    }

    pub fn payload_too_large(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::PAYLOAD_TOO_LARGE, error: msg.into() }
    }
}

impl From<ModelOpsError> for ApiError {
    fn from(e: ModelOpsError) -> Self {
        match e {
            ModelOpsError::NoModelLoaded => {
                ApiError::bad_request("No model loaded, call /load-model first")
            }
            ModelOpsError::Inference(_) => ApiError::internal("Image analysis failed"),
            e if e.is_client_error() => ApiError::bad_request(e.to_string()),
            e => ApiError::internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiErrorBody { error: &self.error })).into_response()
    }
}
