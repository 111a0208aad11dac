use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Realm advertised in Basic auth challenges.
pub const AUTH_REALM: &str = "Authorization Required";

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Broadcast hub is not running")]
    HubUnavailable,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<syncdb_core::Error> for AppError {
    fn from(err: syncdb_core::Error) -> Self {
        match err {
            syncdb_core::Error::HubClosed => AppError::HubUnavailable,
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code) = match &self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            AppError::HubUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "HUB_UNAVAILABLE"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let body = Json(json!({
            "success": false,
            "error": {
                "code": error_code,
                "message": self.to_string(),
            }
        }));

        match self {
            AppError::Unauthorized => (
                status,
                [(
                    header::WWW_AUTHENTICATE,
                    format!("Basic realm=\"{}\"", AUTH_REALM),
                )],
                body,
            )
                .into_response(),
            _ => (status, body).into_response(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
