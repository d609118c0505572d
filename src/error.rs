use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use utoipa::ToSchema;

use crate::validation::ValidationError;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("missing idempotency key: send the Idempotency-Key header or the idempotency_key field")]
    MissingIdempotencyKey,

    #[error("malformed submission: {0}")]
    MalformedSubmission(#[from] ValidationError),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("failed to publish transaction: {0}")]
    PublishFailed(String),

    #[error("internal server error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::MissingIdempotencyKey => StatusCode::BAD_REQUEST,
            GatewayError::MalformedSubmission(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::PublishFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::MissingIdempotencyKey => "MISSING_IDEMPOTENCY_KEY",
            GatewayError::MalformedSubmission(_) => "MALFORMED_SUBMISSION",
            GatewayError::Unauthorized(_) => "UNAUTHORIZED",
            GatewayError::Forbidden(_) => "FORBIDDEN",
            GatewayError::PublishFailed(_) => "PUBLISH_FAILED",
            GatewayError::Internal(_) => "INTERNAL",
        }
    }

    /// Whether the caller may retry with the same idempotency key.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::PublishFailed(_) | GatewayError::Internal(_))
    }

    pub fn field(&self) -> Option<&'static str> {
        match self {
            GatewayError::MalformedSubmission(e) => Some(e.field),
            GatewayError::MissingIdempotencyKey => Some("idempotency_key"),
            _ => None,
        }
    }

    pub fn detail(&self) -> ErrorDetail {
        ErrorDetail {
            code: self.code().to_string(),
            message: self.to_string(),
            field: self.field().map(str::to_string),
            retryable: self.is_retryable(),
        }
    }
}

/// Machine-readable error description, also used for batch items.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub retryable: bool,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut body = json!({
            "error": self.to_string(),
            "code": self.code(),
            "status": status.as_u16(),
            "retryable": self.is_retryable(),
        });
        if let Some(field) = self.field() {
            body["field"] = json!(field);
        }

        if self.is_retryable() {
            (status, [(header::RETRY_AFTER, "1")], Json(body)).into_response()
        } else {
            (status, Json(body)).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_status_code() {
        assert_eq!(
            GatewayError::MissingIdempotencyKey.status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_malformed_submission_carries_field() {
        let error = GatewayError::from(ValidationError::new("amount", "must be greater than zero"));
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(error.field(), Some("amount"));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_auth_error_status_codes() {
        assert_eq!(
            GatewayError::Unauthorized("no token".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::Forbidden("missing role".into()).status_code(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_publish_failed_is_retryable() {
        let error = GatewayError::PublishFailed("broker down".into());
        assert_eq!(error.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn test_retryable_response_sets_retry_after() {
        let response = GatewayError::PublishFailed("timeout".into()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "1");
    }

    #[tokio::test]
    async fn test_malformed_response_body() {
        let response =
            GatewayError::from(ValidationError::new("user_id", "must not be empty")).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "MALFORMED_SUBMISSION");
        assert_eq!(body["field"], "user_id");
        assert_eq!(body["retryable"], false);
    }
}
