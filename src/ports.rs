//! Seams between the pipeline and its external collaborators.
//!
//! Every collaborator is an explicit trait; concrete implementations live in
//! `adapters` and are chosen when the process wires itself up.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::domain::{AccountRisk, IdempotencyRecord, ProcessedTransaction};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("idempotency store unavailable: {0}")]
    Unavailable(String),
    #[error("idempotency store timed out after {0:?}")]
    Timeout(Duration),
    #[error("corrupt idempotency record: {0}")]
    Corrupt(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Key/value cache with per-key expiry. Read-your-writes on a single node.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError>;

    async fn set(
        &self,
        key: &str,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum EventLogError {
    #[error("event log unavailable: {0}")]
    Unavailable(String),
    #[error("event log timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to encode event: {0}")]
    Encode(String),
    #[error("malformed log entry {id}: {reason}")]
    Malformed { id: String, reason: String },
}

impl From<redis::RedisError> for EventLogError {
    fn from(err: redis::RedisError) -> Self {
        EventLogError::Unavailable(err.to_string())
    }
}

/// A record as handed to the log: routing key, serialized payload and
/// headers that consumers may inspect without decoding the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub key: String,
    pub payload: String,
    pub headers: BTreeMap<String, String>,
}

impl EventRecord {
    pub fn json<T: serde::Serialize>(
        key: &str,
        value: &T,
        headers: BTreeMap<String, String>,
    ) -> Result<Self, EventLogError> {
        let payload =
            serde_json::to_string(value).map_err(|e| EventLogError::Encode(e.to_string()))?;
        Ok(Self {
            key: key.to_string(),
            payload,
            headers,
        })
    }
}

/// Acknowledgement returned once the log has durably accepted a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub topic: String,
    pub partition: u32,
    pub offset: String,
}

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Returns only after the log acknowledged the record.
    async fn publish(&self, topic: &str, record: EventRecord)
        -> Result<PublishReceipt, EventLogError>;

    async fn ping(&self) -> Result<(), EventLogError> {
        Ok(())
    }
}

/// One record handed to a consumer; `ack` it once handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: u32,
    pub offset: String,
    pub record: EventRecord,
}

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Waits at most `block` for up to `max` records across all partitions.
    async fn poll(&self, max: usize, block: Duration) -> Result<Vec<Delivery>, EventLogError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), EventLogError>;
}

/// Stable partition assignment: the same key maps to the same partition in
/// every process.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    prefix % partitions.max(1)
}

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(String),
    #[error("stored row could not be decoded: {0}")]
    Decode(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        RepositoryError::Database(err.to_string())
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted,
    /// Same transaction ID or idempotency key already stored.
    Duplicate,
}

#[async_trait]
pub trait TransactionRepository: Send + Sync {
    async fn save(&self, processed: &ProcessedTransaction) -> RepositoryResult<SaveOutcome>;

    async fn get_by_id(&self, id: &str) -> RepositoryResult<Option<ProcessedTransaction>>;

    async fn account_risk(&self, account_id: &str) -> RepositoryResult<Option<AccountRisk>>;
}
