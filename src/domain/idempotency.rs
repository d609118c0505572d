use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::transaction::{AcceptedTransaction, TransactionId};

pub const ACCEPTED_MESSAGE: &str = "Transaction queued for processing";

/// Response body returned for an accepted submission and replayed verbatim
/// for retries carrying the same idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TransactionReceipt {
    pub transaction_id: TransactionId,
    #[schema(example = "accepted")]
    pub status: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl TransactionReceipt {
    pub fn for_event(event: &AcceptedTransaction) -> Self {
        Self {
            transaction_id: event.id.clone(),
            status: "accepted".to_string(),
            message: ACCEPTED_MESSAGE.to_string(),
            timestamp: event.timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyStatus {
    Accepted,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub status: IdempotencyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<TransactionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<TransactionReceipt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn accepted(receipt: TransactionReceipt) -> Self {
        Self {
            status: IdempotencyStatus::Accepted,
            transaction_id: Some(receipt.transaction_id.clone()),
            response: Some(receipt),
            failure_reason: None,
            created_at: Utc::now(),
        }
    }

    pub fn failed(transaction_id: TransactionId, reason: impl Into<String>) -> Self {
        Self {
            status: IdempotencyStatus::Failed,
            transaction_id: Some(transaction_id),
            response: None,
            failure_reason: Some(reason.into()),
            created_at: Utc::now(),
        }
    }

    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.created_at + ttl <= now
    }

    /// The receipt to replay, if this record is a successful acceptance.
    pub fn replayable_receipt(&self) -> Option<&TransactionReceipt> {
        match self.status {
            IdempotencyStatus::Accepted => self.response.as_ref(),
            IdempotencyStatus::Failed => None,
        }
    }
}
