use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

use stepchain_core::error::StepchainError;

/// Error half of every handler: an HTTP status and `{ "error": message }`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<StepchainError> for ApiError {
    fn from(err: StepchainError) -> Self {
        if err.is_input_error() {
            return Self::bad_request(err.to_string());
        }
        match err {
            StepchainError::RunNotFound(_) => Self::not_found(err.to_string()),
            other => {
                error!(error = %other, "Request failed");
                Self::internal(other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let invalid = ApiError::from(StepchainError::InvalidStep {
            step: "9".into(),
            total: 4,
        });
        assert_eq!(invalid.status, StatusCode::BAD_REQUEST);
        assert_eq!(invalid.message, "Invalid step: 9. Must be 1-4.");

        let missing = ApiError::from(StepchainError::RunNotFound("r1".into()));
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        let db = ApiError::from(StepchainError::Database("locked".into()));
        assert_eq!(db.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
