use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use utoipa::ToSchema;

use crate::domain::{TransactionId, TransactionSubmission};
use crate::error::GatewayError;
use crate::middleware::auth::Caller;
use crate::use_cases::{BatchOutcome, Operation, SubmitOutcome};
use crate::validation::ValidationError;
use crate::AppState;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const IDEMPOTENCY_CACHE_HEADER: &str = "x-idempotency-cache";

#[derive(Debug, Serialize, ToSchema)]
pub struct SubmitResponse {
    pub transaction_id: TransactionId,
    #[schema(example = "accepted")]
    pub status: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub replayed: bool,
}

impl From<SubmitOutcome> for SubmitResponse {
    fn from(outcome: SubmitOutcome) -> Self {
        let receipt = outcome.receipt;
        Self {
            transaction_id: receipt.transaction_id,
            status: receipt.status,
            message: receipt.message,
            timestamp: receipt.timestamp,
            replayed: outcome.replayed,
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/v1/transactions",
    request_body = TransactionSubmission,
    params(
        ("Idempotency-Key" = Option<String>, Header, description = "Client idempotency key; takes precedence over the body field")
    ),
    responses(
        (status = 202, description = "Transaction accepted", body = SubmitResponse),
        (status = 200, description = "Replay of an earlier acceptance", body = SubmitResponse),
        (status = 400, description = "Missing idempotency key or malformed submission"),
        (status = 401, description = "Missing or invalid bearer token"),
        (status = 403, description = "Caller lacks a submit role"),
        (status = 503, description = "Event log unavailable, retry with the same key")
    ),
    security(("bearer_auth" = [])),
    tag = "Transactions"
)]
pub async fn submit_transaction(
    State(state): State<AppState>,
    caller: Caller,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    state.gateway.authorize(&caller, Operation::Submit)?;
    let submission: TransactionSubmission = parse_body(&body)?;
    let key = header_key(&headers)?;

    // Detached so a client disconnect cannot interrupt publish and cache write.
    let gateway = state.gateway.clone();
    let outcome = tokio::spawn(async move {
        gateway.submit(&caller, key.as_deref(), submission).await
    })
    .await
    .map_err(|e| GatewayError::Internal(format!("submission task failed: {e}")))??;

    if outcome.replayed {
        let mut response = (StatusCode::OK, Json(SubmitResponse::from(outcome))).into_response();
        response
            .headers_mut()
            .insert(IDEMPOTENCY_CACHE_HEADER, HeaderValue::from_static("true"));
        Ok(response)
    } else {
        Ok((StatusCode::ACCEPTED, Json(SubmitResponse::from(outcome))).into_response())
    }
}

#[utoipa::path(
    post,
    path = "/api/v1/transactions/batch",
    request_body = Vec<TransactionSubmission>,
    params(
        ("Idempotency-Key" = Option<String>, Header, description = "Batch key; items without their own key use `<key>:<index>`")
    ),
    responses(
        (status = 202, description = "Per-item results", body = BatchOutcome),
        (status = 400, description = "Body is not a non-empty array within the size limit"),
        (status = 401, description = "Missing or invalid bearer token"),
        (status = 403, description = "Caller lacks a batch role")
    ),
    security(("bearer_auth" = [])),
    tag = "Transactions"
)]
pub async fn submit_batch(
    State(state): State<AppState>,
    caller: Caller,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    state.gateway.authorize(&caller, Operation::Batch)?;
    let items: serde_json::Value = parse_body(&body)?;
    let key = header_key(&headers)?;

    let gateway = state.gateway.clone();
    let outcome = tokio::spawn(async move {
        gateway.submit_batch(&caller, key.as_deref(), items).await
    })
    .await
    .map_err(|e| GatewayError::Internal(format!("batch task failed: {e}")))??;

    Ok((StatusCode::ACCEPTED, Json(outcome)).into_response())
}

fn header_key(headers: &HeaderMap) -> Result<Option<String>, GatewayError> {
    let Some(value) = headers.get(IDEMPOTENCY_KEY_HEADER) else {
        return Ok(None);
    };
    value.to_str().map(|key| Some(key.to_string())).map_err(|_| {
        GatewayError::MalformedSubmission(ValidationError::new(
            "idempotency_key",
            "Idempotency-Key header must be visible ASCII",
        ))
    })
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, GatewayError> {
    serde_json::from_slice(body).map_err(|e| {
        GatewayError::MalformedSubmission(ValidationError::new(
            "body",
            format!("is not valid JSON: {e}"),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unparseable_body_names_the_body_field() {
        let err = parse_body::<TransactionSubmission>(b"{\"amount\": ").unwrap_err();
        assert_eq!(err.field(), Some("body"));
        assert_eq!(err.code(), "MALFORMED_SUBMISSION");
    }

    #[test]
    fn header_key_is_read_case_insensitively() {
        let mut headers = HeaderMap::new();
        headers.insert("Idempotency-Key", HeaderValue::from_static("abc"));
        assert_eq!(header_key(&headers).unwrap().as_deref(), Some("abc"));
        assert_eq!(header_key(&HeaderMap::new()).unwrap(), None);
    }

    #[test]
    fn non_ascii_header_key_is_malformed() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Idempotency-Key",
            HeaderValue::from_bytes(b"caf\xe9").unwrap(),
        );
        let err = header_key(&headers).unwrap_err();
        assert_eq!(err.field(), Some("idempotency_key"));
        assert_eq!(err.code(), "MALFORMED_SUBMISSION");
    }
}
