//! HTTP error mapping for the API surface.
//!
//! Every handler returns `Result<_, ApiError>`. Validation errors become 400,
//! auth errors 401/403, and anything else (substrate failures, `CoreError`)
//! becomes a 500 with a generic body — the server-side `tracing::error!` call
//! carries the detail, the client never sees it.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::errors::{AuthError, CoreError, ValidationError};

/// Uniform error type returned by every API handler.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Maps to 400.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Maps to 401/403.
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// Maps to 500; detail is logged, not returned.
    #[error(transparent)]
    Core(#[from] CoreError),
    /// Maps to 404 with no further detail leaked.
    #[error("not found")]
    NotFound,
    /// Catch-all for substrate/IO failures that have no typed variant.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<kube::Error> for ApiError {
    fn from(error: kube::Error) -> Self {
        Self::Internal(error.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, public_message) = match &self {
            Self::Validation(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            Self::Auth(AuthError::MissingToken) => {
                (StatusCode::UNAUTHORIZED, "no caller token presented".to_owned())
            }
            Self::Auth(AuthError::InvalidToken) => {
                (StatusCode::UNAUTHORIZED, "caller token was rejected".to_owned())
            }
            Self::Auth(e @ AuthError::AccessDenied { .. }) => (StatusCode::FORBIDDEN, e.to_string()),
            Self::NotFound | Self::Core(CoreError::NotFound { .. }) => {
                (StatusCode::NOT_FOUND, "not found".to_owned())
            }
            Self::Core(CoreError::GitOperationFailed { operation, .. }) if operation == "push" => {
                tracing::error!(error = %self, "git push failed");
                (StatusCode::BAD_GATEWAY, "push to upstream repository failed".to_owned())
            }
            Self::Core(_) | Self::Internal(_) => {
                tracing::error!(error = %self, "request failed with an internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_owned())
            }
        };

        (status, Json(json!({ "error": public_message }))).into_response()
    }
}
