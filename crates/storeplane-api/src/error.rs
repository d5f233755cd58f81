//! Error types for the intent API

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the intent layer, mapped onto HTTP statuses.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Malformed request: bad name pattern, unknown engine, invalid body
    #[error("{0}")]
    InvalidRequest(String),

    /// Caller is not allowed to see or act on the resource
    #[error("{0}")]
    Forbidden(String),

    /// Resource does not exist
    #[error("{0}")]
    NotFound(String),

    /// Name exists under a different owner or engine
    #[error("{0}")]
    Conflict(String),

    /// Per-owner store cap reached
    #[error("{0}")]
    QuotaExceeded(String),

    /// Write endpoint token bucket exhausted
    #[error("rate limit exceeded for {0}")]
    RateLimited(String),

    /// Cluster API call exceeded its deadline
    #[error("upstream timed out: {0}")]
    Timeout(String),

    /// Cluster API failure
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "INVALID_REQUEST",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            ApiError::RateLimited(_) => "RATE_LIMITED",
            ApiError::Timeout(_) => "UPSTREAM_TIMEOUT",
            ApiError::Upstream(_) => "UPSTREAM_ERROR",
        }
    }
}

/// JSON error body
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub detail: String,
    pub code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            detail: self.to_string(),
            code: self.code(),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<kube::Error> for ApiError {
    fn from(error: kube::Error) -> Self {
        match &error {
            kube::Error::Api(ae) if ae.code == 404 => ApiError::NotFound(error.to_string()),
            kube::Error::Api(ae) if ae.code == 409 => ApiError::Conflict(error.to_string()),
            _ => ApiError::Upstream(error.to_string()),
        }
    }
}

/// Result type for API handlers
pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::InvalidRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::Forbidden("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::Conflict("x".into()).status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::QuotaExceeded("x".into()).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::RateLimited("x".into()).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn test_quota_and_rate_limit_codes_differ() {
        assert_eq!(ApiError::QuotaExceeded("x".into()).code(), "QUOTA_EXCEEDED");
        assert_eq!(ApiError::RateLimited("x".into()).code(), "RATE_LIMITED");
    }
}
