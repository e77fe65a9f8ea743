use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use super::data::{ApiError, ApiResponse};
use crate::error::{ErrorKind, ServiceError};

/// The HTTP-boundary error: a `ServiceError` rendered as the uniform
/// envelope with the status its kind maps to.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct Error(#[from] pub ServiceError);

impl From<crate::database::Error> for Error {
    fn from(err: crate::database::Error) -> Self {
        Self(err.into())
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self(err.into())
    }
}

#[must_use]
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Invalid => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::ResourceExceeded | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = status_for(self.0.kind);

        // Internals are logged in full but never echoed verbatim to
        // clients in release builds.
        let message = if self.0.kind == ErrorKind::Internal && !cfg!(debug_assertions) {
            "internal error".to_string()
        } else {
            self.0.message.clone()
        };

        let details = if cfg!(debug_assertions) {
            Some(serde_json::json!({ "kind": self.0.kind }))
        } else {
            None
        };

        let body: ApiResponse<()> = ApiResponse {
            success: false,
            data: None,
            error: Some(ApiError {
                code: self.0.kind.as_str().to_string(),
                message,
                details,
            }),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_documented_statuses() {
        assert_eq!(status_for(ErrorKind::Invalid), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(ErrorKind::InsufficientFunds),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(status_for(ErrorKind::Conflict), StatusCode::CONFLICT);
        assert_eq!(
            status_for(ErrorKind::RateLimited),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_for(ErrorKind::Unavailable),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_for(ErrorKind::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status_for(ErrorKind::ResourceExceeded),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
