use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde_json::{json, Value};

/// Closed error taxonomy. Every failure surfaced by the engine or the HTTP
/// layer carries exactly one of these codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    RateLimited,
    ValidationError,
    SsrfBlocked,
    RobotsBlocked,
    DnsResolutionFailed,
    FetchTimeout,
    FetchError,
    JobNotFound,
    JobNotReady,
    UnsupportedJobType,
    SearchNotConfigured,
    SearchError,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::SsrfBlocked => "SSRF_BLOCKED",
            ErrorCode::RobotsBlocked => "ROBOTS_BLOCKED",
            ErrorCode::DnsResolutionFailed => "DNS_RESOLUTION_FAILED",
            ErrorCode::FetchTimeout => "FETCH_TIMEOUT",
            ErrorCode::FetchError => "FETCH_ERROR",
            ErrorCode::JobNotFound => "JOB_NOT_FOUND",
            ErrorCode::JobNotReady => "JOB_NOT_READY",
            ErrorCode::UnsupportedJobType => "UNSUPPORTED_JOB_TYPE",
            ErrorCode::SearchNotConfigured => "SEARCH_NOT_CONFIGURED",
            ErrorCode::SearchError => "SEARCH_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::ValidationError => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::SsrfBlocked => StatusCode::FORBIDDEN,
            ErrorCode::RobotsBlocked => StatusCode::FORBIDDEN,
            ErrorCode::DnsResolutionFailed => StatusCode::BAD_REQUEST,
            ErrorCode::FetchTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::FetchError => StatusCode::BAD_GATEWAY,
            ErrorCode::JobNotFound => StatusCode::NOT_FOUND,
            ErrorCode::JobNotReady => StatusCode::BAD_REQUEST,
            ErrorCode::UnsupportedJobType => StatusCode::BAD_REQUEST,
            ErrorCode::SearchNotConfigured => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::SearchError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A surfaced API error. Rendered as the shared JSON envelope
/// `{"error":{"code","message","request_id","details"}}`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{}: {}", .code.as_str(), .message)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
    pub request_id: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        ApiError {
            code,
            message: message.into(),
            details: json!({}),
            request_id: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn job_not_found() -> Self {
        Self::new(ErrorCode::JobNotFound, "No job with given ID")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.code.as_str(),
                "message": self.message,
                "request_id": self.request_id,
                "details": self.details,
            }
        });
        (self.code.status(), Json(body)).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!(error = %err, "Database error");
        ApiError::internal("Database error")
    }
}

impl From<redis::RedisError> for ApiError {
    fn from(err: redis::RedisError) -> Self {
        tracing::error!(error = %err, "Redis error");
        ApiError::internal("Cache backend error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorCode::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::SsrfBlocked.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            ErrorCode::RateLimited.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ErrorCode::DnsResolutionFailed.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ErrorCode::FetchTimeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ErrorCode::FetchError.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ErrorCode::ValidationError.status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn test_code_strings() {
        assert_eq!(ErrorCode::SsrfBlocked.as_str(), "SSRF_BLOCKED");
        assert_eq!(ErrorCode::JobNotReady.as_str(), "JOB_NOT_READY");
        assert_eq!(
            ErrorCode::DnsResolutionFailed.as_str(),
            "DNS_RESOLUTION_FAILED"
        );
    }
}
