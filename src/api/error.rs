use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::detect::DetectError;

/// A `DetectError` on its way out of a handler.
#[derive(Debug)]
pub struct ApiError(pub DetectError);

impl From<DetectError> for ApiError {
    fn from(err: DetectError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            DetectError::UnknownEntity(_) | DetectError::FindingNotFound(_) => StatusCode::NOT_FOUND,
            DetectError::TierBusy(_) => StatusCode::CONFLICT,
            DetectError::Classification { .. }
            | DetectError::UnsuitableEntity { .. }
            | DetectError::InsufficientData { .. }
            | DetectError::Configuration(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DetectError::SourceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            DetectError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "request failed");
        }
        (
            status,
            Json(json!({
                "error": {
                    "kind": self.0.kind(),
                    "message": self.0.to_string(),
                }
            })),
        )
            .into_response()
    }
}
