//! Idempotent ingestion of transaction submissions.
//!
//! A submission is authorized, its idempotency key resolved, its fields
//! validated, and only then is the idempotency store consulted. A key whose
//! accepted record is still within the TTL replays the cached receipt; any
//! other state leads to a fresh acceptance that is published to the ingest
//! topic and only afterwards remembered in the store.
//!
//! Store trouble never fails a submission: a lookup error is a miss and a
//! write error after a successful publish is logged. There is no in-process
//! lock, so two first-time submissions racing on one key may both publish.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use utoipa::ToSchema;

use crate::config::GatewayConfig;
use crate::domain::{
    AcceptedTransaction, IdempotencyRecord, TransactionId, TransactionReceipt,
    TransactionSubmission,
};
use crate::error::{ErrorDetail, GatewayError};
use crate::metrics::PipelineMetrics;
use crate::middleware::auth::Caller;
use crate::ports::{EventLog, EventLogError, EventRecord, IdempotencyStore, PublishReceipt, StoreError};
use crate::validation::{validate_idempotency_key, ValidationError};

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub ingest_topic: String,
    pub idempotency_ttl: Duration,
    pub store_timeout: Duration,
    pub publish_timeout: Duration,
    pub submit_roles: Vec<String>,
    pub batch_roles: Vec<String>,
    pub max_batch_size: usize,
}

impl GatewaySettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            ingest_topic: config.ingest_topic.clone(),
            idempotency_ttl: config.idempotency_ttl,
            store_timeout: config.store_timeout,
            publish_timeout: config.publish_timeout,
            submit_roles: config.submit_roles.clone(),
            batch_roles: config.batch_roles.clone(),
            max_batch_size: config.max_batch_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Submit,
    Batch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOutcome {
    pub receipt: TransactionReceipt,
    pub replayed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum BatchItemStatus {
    Accepted,
    Replayed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct BatchItemResult {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub outcome: BatchItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<TransactionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

/// Per-item results of a batch; `accepted` includes replays.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct BatchOutcome {
    pub accepted: usize,
    pub failed: usize,
    pub results: Vec<BatchItemResult>,
}

pub struct IngestionGateway {
    store: Arc<dyn IdempotencyStore>,
    log: Arc<dyn EventLog>,
    metrics: Arc<PipelineMetrics>,
    settings: GatewaySettings,
    record_ttl: chrono::Duration,
}

impl IngestionGateway {
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        log: Arc<dyn EventLog>,
        metrics: Arc<PipelineMetrics>,
        settings: GatewaySettings,
    ) -> Self {
        let record_ttl = chrono::Duration::from_std(settings.idempotency_ttl)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        Self {
            store,
            log,
            metrics,
            settings,
            record_ttl,
        }
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Role check; runs before anything touches the store or the log.
    pub fn authorize(&self, caller: &Caller, operation: Operation) -> Result<(), GatewayError> {
        let allowed = match operation {
            Operation::Submit => &self.settings.submit_roles,
            Operation::Batch => &self.settings.batch_roles,
        };
        if caller.has_any_role(allowed) {
            return Ok(());
        }

        tracing::warn!(subject = %caller.subject, ?operation, "Caller lacks a required role");
        self.metrics.record_failed("forbidden");
        Err(GatewayError::Forbidden(format!(
            "one of the roles {} is required",
            allowed.join(", ")
        )))
    }

    pub async fn submit(
        &self,
        caller: &Caller,
        header_key: Option<&str>,
        submission: TransactionSubmission,
    ) -> Result<SubmitOutcome, GatewayError> {
        self.authorize(caller, Operation::Submit)?;
        self.ingest(header_key, submission).await
    }

    pub async fn submit_batch(
        &self,
        caller: &Caller,
        batch_key: Option<&str>,
        body: serde_json::Value,
    ) -> Result<BatchOutcome, GatewayError> {
        self.authorize(caller, Operation::Batch)?;

        let items = match body {
            serde_json::Value::Array(items) => items,
            _ => return Err(batch_error("must be a JSON array of transactions".to_string())),
        };
        if items.is_empty() {
            return Err(batch_error("must contain at least one transaction".to_string()));
        }
        if items.len() > self.settings.max_batch_size {
            return Err(batch_error(format!(
                "must contain at most {} transactions",
                self.settings.max_batch_size
            )));
        }

        let batch_key = match batch_key.map(str::trim).filter(|key| !key.is_empty()) {
            Some(key) => Some(validate_idempotency_key(key)?),
            None => None,
        };

        // Sequential on purpose: items for one account keep their order.
        let mut results = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            results.push(self.ingest_batch_item(index, batch_key.as_deref(), item).await);
        }

        let failed = results
            .iter()
            .filter(|result| result.outcome == BatchItemStatus::Failed)
            .count();
        tracing::info!(
            items = results.len(),
            failed,
            "Processed transaction batch"
        );

        Ok(BatchOutcome {
            accepted: results.len() - failed,
            failed,
            results,
        })
    }

    async fn ingest_batch_item(
        &self,
        index: usize,
        batch_key: Option<&str>,
        item: serde_json::Value,
    ) -> BatchItemResult {
        let submission: TransactionSubmission = match serde_json::from_value(item) {
            Ok(submission) => submission,
            Err(e) => {
                let error = GatewayError::MalformedSubmission(ValidationError::new(
                    "batch",
                    format!("item is not a valid transaction: {e}"),
                ));
                self.metrics.record_failed(failure_reason(&error));
                return BatchItemResult::failed(index, None, &error);
            }
        };

        let own_key = submission
            .idempotency_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string);
        let derived_key = match (&own_key, batch_key) {
            (None, Some(batch_key)) => Some(format!("{batch_key}:{index}")),
            _ => None,
        };
        let reported_key = own_key.or_else(|| derived_key.clone());

        match self.ingest(derived_key.as_deref(), submission).await {
            Ok(outcome) => BatchItemResult {
                index,
                idempotency_key: reported_key,
                outcome: if outcome.replayed {
                    BatchItemStatus::Replayed
                } else {
                    BatchItemStatus::Accepted
                },
                transaction_id: Some(outcome.receipt.transaction_id),
                error: None,
            },
            Err(error) => BatchItemResult::failed(index, reported_key, &error),
        }
    }

    /// Everything after authorization, shared by single and batch submissions.
    async fn ingest(
        &self,
        header_key: Option<&str>,
        submission: TransactionSubmission,
    ) -> Result<SubmitOutcome, GatewayError> {
        let result = self.try_ingest(header_key, submission).await;
        if let Err(error) = &result {
            self.metrics.record_failed(failure_reason(error));
        }
        result
    }

    async fn try_ingest(
        &self,
        header_key: Option<&str>,
        submission: TransactionSubmission,
    ) -> Result<SubmitOutcome, GatewayError> {
        let key = resolve_idempotency_key(header_key, submission.idempotency_key.as_deref())?;
        let validated = submission.validate()?;

        if let Some(receipt) = self.lookup(&key).await {
            tracing::info!(
                idempotency_key = %key,
                transaction_id = %receipt.transaction_id,
                "Replaying cached response"
            );
            return Ok(SubmitOutcome {
                receipt,
                replayed: true,
            });
        }

        let event = AcceptedTransaction::accept(key, validated);
        let published = self.publish(&event).await?;
        tracing::info!(
            transaction_id = %event.id,
            idempotency_key = %event.idempotency_key,
            partition = published.partition,
            offset = %published.offset,
            "Transaction accepted"
        );

        let receipt = TransactionReceipt::for_event(&event);
        self.remember(&event.idempotency_key, IdempotencyRecord::accepted(receipt.clone()))
            .await;
        self.metrics
            .record_ingested(&event.currency, event.transaction_type.as_str());

        Ok(SubmitOutcome {
            receipt,
            replayed: false,
        })
    }

    /// A replayable receipt, or `None` when the submission must proceed.
    async fn lookup(&self, key: &str) -> Option<TransactionReceipt> {
        let result = match timeout(self.settings.store_timeout, self.store.get(key)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.settings.store_timeout)),
        };

        match result {
            Ok(Some(record)) if record.is_expired(self.record_ttl, Utc::now()) => {
                self.metrics.record_lookup("expired");
                None
            }
            Ok(Some(record)) => match record.replayable_receipt() {
                Some(receipt) => {
                    self.metrics.record_lookup("hit");
                    Some(receipt.clone())
                }
                None => {
                    tracing::debug!(idempotency_key = %key, "Previous attempt failed, retrying");
                    self.metrics.record_lookup("failed");
                    None
                }
            },
            Ok(None) => {
                self.metrics.record_lookup("miss");
                None
            }
            Err(e) => {
                tracing::warn!(idempotency_key = %key, error = %e, "Idempotency lookup failed, treating as new");
                self.metrics.record_lookup("error");
                None
            }
        }
    }

    async fn publish(&self, event: &AcceptedTransaction) -> Result<PublishReceipt, GatewayError> {
        let topic = &self.settings.ingest_topic;
        let record = EventRecord::json(event.partition_key(), event, event.headers())
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        let start = Instant::now();
        let result = match timeout(self.settings.publish_timeout, self.log.publish(topic, record)).await {
            Ok(result) => result,
            Err(_) => Err(EventLogError::Timeout(self.settings.publish_timeout)),
        };
        self.metrics.record_publish(topic, result.is_ok(), start.elapsed());

        match result {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                tracing::error!(
                    transaction_id = %event.id,
                    idempotency_key = %event.idempotency_key,
                    error = %e,
                    "Failed to publish transaction"
                );
                // Nothing is written: a concurrent acceptance under this key must survive.
                Err(GatewayError::PublishFailed(e.to_string()))
            }
        }
    }

    async fn remember(&self, key: &str, record: IdempotencyRecord) {
        let ttl = self.settings.idempotency_ttl;
        let result = match timeout(self.settings.store_timeout, self.store.set(key, &record, ttl)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.settings.store_timeout)),
        };

        self.metrics.record_store_write(result.is_ok());
        if let Err(e) = result {
            tracing::warn!(
                idempotency_key = %key,
                error = %e,
                "Failed to write idempotency record"
            );
        }
    }
}

impl BatchItemResult {
    fn failed(index: usize, idempotency_key: Option<String>, error: &GatewayError) -> Self {
        Self {
            index,
            idempotency_key,
            outcome: BatchItemStatus::Failed,
            transaction_id: None,
            error: Some(error.detail()),
        }
    }
}

/// The header wins; a body key that disagrees with it is rejected.
fn resolve_idempotency_key(
    header_key: Option<&str>,
    body_key: Option<&str>,
) -> Result<String, GatewayError> {
    let header_key = header_key.map(str::trim).filter(|key| !key.is_empty());
    let body_key = body_key.map(str::trim).filter(|key| !key.is_empty());

    let key = match (header_key, body_key) {
        (Some(header), Some(body)) if header != body => {
            return Err(GatewayError::MalformedSubmission(ValidationError::new(
                "idempotency_key",
                "Idempotency-Key header and body idempotency_key differ",
            )))
        }
        (Some(header), _) => header,
        (None, Some(body)) => body,
        (None, None) => return Err(GatewayError::MissingIdempotencyKey),
    };

    Ok(validate_idempotency_key(key)?)
}

fn batch_error(message: String) -> GatewayError {
    GatewayError::MalformedSubmission(ValidationError::new("batch", message))
}

fn failure_reason(error: &GatewayError) -> &'static str {
    match error {
        GatewayError::MissingIdempotencyKey => "missing_idempotency_key",
        GatewayError::MalformedSubmission(_) => "validation",
        GatewayError::Unauthorized(_) => "unauthorized",
        GatewayError::Forbidden(_) => "forbidden",
        GatewayError::PublishFailed(_) => "publish",
        GatewayError::Internal(_) => "internal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryEventLog, InMemoryIdempotencyStore};
    use crate::domain::{IdempotencyStatus, TransactionStatus};
    use crate::ports::partition_for;
    use async_trait::async_trait;
    use bigdecimal::BigDecimal;
    use serde_json::json;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TOPIC: &str = "transactions.raw";

    struct Harness {
        store: Arc<InMemoryIdempotencyStore>,
        log: InMemoryEventLog,
        metrics: Arc<PipelineMetrics>,
        gateway: IngestionGateway,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let log = InMemoryEventLog::new(6);
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let settings = GatewaySettings {
            ingest_topic: TOPIC.to_string(),
            idempotency_ttl: Duration::from_secs(86_400),
            store_timeout: Duration::from_millis(50),
            publish_timeout: Duration::from_millis(50),
            submit_roles: vec!["submitter".to_string(), "operator".to_string()],
            batch_roles: vec!["operator".to_string()],
            max_batch_size: 5,
        };
        let gateway = IngestionGateway::new(
            store.clone(),
            Arc::new(log.clone()),
            metrics.clone(),
            settings,
        );
        Harness {
            store,
            log,
            metrics,
            gateway,
        }
    }

    fn caller(roles: &[&str]) -> Caller {
        Caller {
            subject: "U".to_string(),
            account_id: Some("A".to_string()),
            roles: roles.iter().map(|role| role.to_string()).collect(),
        }
    }

    fn submission(key: Option<&str>, account: &str, amount: &str) -> TransactionSubmission {
        TransactionSubmission {
            idempotency_key: key.map(str::to_string),
            account_id: Some(account.to_string()),
            user_id: Some("U".to_string()),
            amount: Some(BigDecimal::from_str(amount).unwrap()),
            currency: Some("USD".to_string()),
            transaction_type: Some("purchase".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn first_submission_is_published_and_cached() {
        let h = harness();
        let outcome = h
            .gateway
            .submit(&caller(&["submitter"]), None, submission(Some("k1"), "A", "50.00"))
            .await
            .unwrap();

        assert!(!outcome.replayed);
        assert_eq!(outcome.receipt.status, "accepted");

        let published = h.log.published(TOPIC);
        assert_eq!(published.len(), 1);
        let (partition, record) = &published[0];
        assert_eq!(record.key, "A");
        assert_eq!(*partition, partition_for("A", 6));
        assert_eq!(record.headers.get("idempotency_key").map(String::as_str), Some("k1"));
        assert_eq!(record.headers.get("user_id").map(String::as_str), Some("U"));

        let event: AcceptedTransaction = serde_json::from_str(&record.payload).unwrap();
        assert_eq!(event.id, outcome.receipt.transaction_id);
        assert_eq!(event.status, TransactionStatus::Pending);
        assert_eq!(event.amount, BigDecimal::from(50));

        let cached = h.store.record("k1").unwrap();
        assert_eq!(cached.status, IdempotencyStatus::Accepted);
        assert_eq!(cached.replayable_receipt(), Some(&outcome.receipt));
    }

    #[tokio::test]
    async fn retry_with_same_key_replays_without_publishing() {
        let h = harness();
        let submitter = caller(&["submitter"]);

        let first = h
            .gateway
            .submit(&submitter, None, submission(Some("k1"), "A", "50.00"))
            .await
            .unwrap();
        let second = h
            .gateway
            .submit(&submitter, None, submission(Some("k1"), "A", "50.00"))
            .await
            .unwrap();

        assert!(second.replayed);
        assert_eq!(second.receipt, first.receipt);
        assert_eq!(h.log.published(TOPIC).len(), 1);
        assert_eq!(h.metrics.lookup_count("hit"), 1);
    }

    #[tokio::test]
    async fn replay_ignores_changed_payload() {
        let h = harness();
        let submitter = caller(&["submitter"]);

        let first = h
            .gateway
            .submit(&submitter, None, submission(Some("k1"), "A", "50.00"))
            .await
            .unwrap();
        let second = h
            .gateway
            .submit(&submitter, None, submission(Some("k1"), "A", "75.00"))
            .await
            .unwrap();

        assert!(second.replayed);
        assert_eq!(second.receipt.transaction_id, first.receipt.transaction_id);
        assert_eq!(h.log.published(TOPIC).len(), 1);
    }

    #[tokio::test]
    async fn non_positive_amount_never_reaches_store_or_log() {
        for amount in ["0", "-5", "-0.01"] {
            let h = harness();
            let err = h
                .gateway
                .submit(&caller(&["submitter"]), None, submission(Some("k1"), "A", amount))
                .await
                .unwrap_err();

            assert!(
                matches!(&err, GatewayError::MalformedSubmission(e) if e.field == "amount"),
                "amount {amount} gave {err:?}"
            );
            assert_eq!(h.store.get_calls(), 0);
            assert_eq!(h.log.publish_calls(), 0);
        }
    }

    #[tokio::test]
    async fn missing_key_is_rejected_before_lookup() {
        let h = harness();
        let err = h
            .gateway
            .submit(&caller(&["submitter"]), Some("  "), submission(None, "A", "10"))
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::MissingIdempotencyKey));
        assert_eq!(h.store.get_calls(), 0);
        assert_eq!(h.metrics.failed_count("missing_idempotency_key"), 1);
    }

    #[tokio::test]
    async fn header_key_is_used_and_must_match_body() {
        let h = harness();
        let submitter = caller(&["submitter"]);

        let outcome = h
            .gateway
            .submit(&submitter, Some("hdr-1"), submission(None, "A", "10"))
            .await
            .unwrap();
        assert!(!outcome.replayed);
        assert!(h.store.record("hdr-1").is_some());

        let same = h
            .gateway
            .submit(&submitter, Some("hdr-1"), submission(Some("hdr-1"), "A", "10"))
            .await
            .unwrap();
        assert!(same.replayed);

        let err = h
            .gateway
            .submit(&submitter, Some("hdr-2"), submission(Some("other"), "A", "10"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::MalformedSubmission(e) if e.field == "idempotency_key"));
    }

    #[tokio::test]
    async fn one_account_stays_on_one_partition_in_order() {
        let h = harness();
        let submitter = caller(&["submitter"]);

        for i in 0..5 {
            let key = format!("k{i}");
            h.gateway
                .submit(&submitter, None, submission(Some(&key), "acct-7", &format!("{}", i + 1)))
                .await
                .unwrap();
        }
        h.gateway
            .submit(&submitter, None, submission(Some("other"), "acct-8", "1"))
            .await
            .unwrap();

        let for_account: Vec<(u32, AcceptedTransaction)> = h
            .log
            .published(TOPIC)
            .into_iter()
            .filter(|(_, record)| record.key == "acct-7")
            .map(|(partition, record)| (partition, serde_json::from_str(&record.payload).unwrap()))
            .collect();

        assert_eq!(for_account.len(), 5);
        let partition = for_account[0].0;
        assert!(for_account.iter().all(|(p, _)| *p == partition));
        let keys: Vec<&str> = for_account
            .iter()
            .map(|(_, event)| event.idempotency_key.as_str())
            .collect();
        assert_eq!(keys, vec!["k0", "k1", "k2", "k3", "k4"]);
    }

    #[tokio::test]
    async fn record_older_than_ttl_is_treated_as_absent() {
        let h = harness();
        let mut stale = IdempotencyRecord::accepted(TransactionReceipt {
            transaction_id: TransactionId::generate(Utc::now() - chrono::Duration::hours(25)),
            status: "accepted".to_string(),
            message: "queued".to_string(),
            timestamp: Utc::now() - chrono::Duration::hours(25),
        });
        stale.created_at = Utc::now() - chrono::Duration::hours(25);
        let stale_id = stale.transaction_id.clone().unwrap();
        h.store.insert("k1", stale, Duration::from_secs(3600));

        let outcome = h
            .gateway
            .submit(&caller(&["submitter"]), None, submission(Some("k1"), "A", "50"))
            .await
            .unwrap();

        assert!(!outcome.replayed);
        assert_ne!(outcome.receipt.transaction_id, stale_id);
        assert_eq!(h.log.published(TOPIC).len(), 1);
        assert_eq!(h.metrics.lookup_count("expired"), 1);
    }

    #[tokio::test]
    async fn caller_without_role_is_forbidden_before_lookup() {
        let h = harness();
        let err = h
            .gateway
            .submit(&caller(&["viewer"]), None, submission(Some("k1"), "A", "50"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden(_)));

        let err = h
            .gateway
            .submit_batch(&caller(&["submitter"]), None, json!([]))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden(_)));

        assert_eq!(h.store.get_calls(), 0);
        assert_eq!(h.log.publish_calls(), 0);
    }

    #[tokio::test]
    async fn batch_reports_each_item_independently() {
        let h = harness();
        let body = json!([
            {"idempotency_key": "b-1", "account_id": "A", "user_id": "U", "amount": 10, "currency": "USD", "type": "purchase"},
            {"idempotency_key": "b-2", "account_id": "A", "user_id": "U", "amount": -5, "currency": "USD", "type": "purchase"},
            {"idempotency_key": "b-3", "account_id": "B", "user_id": "U", "amount": "12.50", "currency": "EUR", "type": "transfer"}
        ]);

        let outcome = h
            .gateway
            .submit_batch(&caller(&["operator"]), None, body)
            .await
            .unwrap();

        assert_eq!(outcome.accepted, 2);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.results[0].outcome, BatchItemStatus::Accepted);
        assert_eq!(outcome.results[1].outcome, BatchItemStatus::Failed);
        assert_eq!(outcome.results[1].idempotency_key.as_deref(), Some("b-2"));
        let error = outcome.results[1].error.as_ref().unwrap();
        assert_eq!(error.code, "MALFORMED_SUBMISSION");
        assert_eq!(error.field.as_deref(), Some("amount"));
        assert_eq!(outcome.results[2].outcome, BatchItemStatus::Accepted);
        assert_eq!(h.log.published(TOPIC).len(), 2);
    }

    #[tokio::test]
    async fn batch_derives_item_keys_and_replays_on_retry() {
        let h = harness();
        let operator = caller(&["operator"]);
        let body = json!([
            {"account_id": "A", "user_id": "U", "amount": 1, "currency": "USD", "type": "deposit"},
            {"account_id": "A", "user_id": "U", "amount": 2, "currency": "USD", "type": "deposit"}
        ]);

        let first = h
            .gateway
            .submit_batch(&operator, Some("batch-9"), body.clone())
            .await
            .unwrap();
        assert_eq!(first.results[0].idempotency_key.as_deref(), Some("batch-9:0"));
        assert_eq!(first.results[1].idempotency_key.as_deref(), Some("batch-9:1"));

        let retry = h
            .gateway
            .submit_batch(&operator, Some("batch-9"), body)
            .await
            .unwrap();
        assert_eq!(retry.accepted, 2);
        assert!(retry
            .results
            .iter()
            .all(|result| result.outcome == BatchItemStatus::Replayed));
        assert_eq!(h.log.published(TOPIC).len(), 2);
    }

    #[tokio::test]
    async fn batch_item_without_any_key_fails_alone() {
        let h = harness();
        let body = json!([
            {"account_id": "A", "user_id": "U", "amount": 1, "currency": "USD", "type": "deposit"},
            "not an object"
        ]);

        let outcome = h
            .gateway
            .submit_batch(&caller(&["operator"]), None, body)
            .await
            .unwrap();

        assert_eq!(outcome.failed, 2);
        assert_eq!(
            outcome.results[0].error.as_ref().unwrap().code,
            "MISSING_IDEMPOTENCY_KEY"
        );
        assert_eq!(
            outcome.results[1].error.as_ref().unwrap().field.as_deref(),
            Some("batch")
        );
    }

    #[tokio::test]
    async fn batch_shape_errors_reject_the_whole_call() {
        let h = harness();
        let operator = caller(&["operator"]);
        let item = json!({"account_id": "A", "user_id": "U", "amount": 1, "currency": "USD", "type": "deposit"});

        for body in [json!({"items": []}), json!([]), json!(vec![item; 6])] {
            let err = h
                .gateway
                .submit_batch(&operator, Some("b"), body)
                .await
                .unwrap_err();
            assert!(matches!(err, GatewayError::MalformedSubmission(e) if e.field == "batch"));
        }
        assert_eq!(h.log.publish_calls(), 0);
    }

    #[tokio::test]
    async fn unavailable_store_degrades_to_fresh_acceptance() {
        let h = harness();
        h.store.set_available(false);

        let outcome = h
            .gateway
            .submit(&caller(&["submitter"]), None, submission(Some("k1"), "A", "50"))
            .await
            .unwrap();

        assert!(!outcome.replayed);
        assert_eq!(h.log.published(TOPIC).len(), 1);
        assert_eq!(h.metrics.lookup_count("error"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_times_out_and_submission_still_succeeds() {
        let h = harness();
        h.store.set_latency(Some(Duration::from_secs(5)));

        let outcome = h
            .gateway
            .submit(&caller(&["submitter"]), None, submission(Some("k1"), "A", "50"))
            .await
            .unwrap();

        assert!(!outcome.replayed);
        assert_eq!(h.log.published(TOPIC).len(), 1);
        assert_eq!(h.metrics.lookup_count("error"), 1);
    }

    #[tokio::test]
    async fn publish_failure_caches_nothing() {
        let h = harness();
        let submitter = caller(&["submitter"]);
        h.log.fail_publishes(true);

        let err = h
            .gateway
            .submit(&submitter, None, submission(Some("k1"), "A", "50"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PublishFailed(_)));
        assert!(err.is_retryable());
        assert!(h.store.record("k1").is_none());

        h.log.fail_publishes(false);
        let retry = h
            .gateway
            .submit(&submitter, None, submission(Some("k1"), "A", "50"))
            .await
            .unwrap();
        assert!(!retry.replayed);
        assert_eq!(h.log.published(TOPIC).len(), 1);
        assert_eq!(h.metrics.lookup_count("miss"), 2);
    }

    #[tokio::test]
    async fn failed_record_is_retried_as_new_attempt() {
        let h = harness();
        let earlier = TransactionId::generate(Utc::now());
        h.store.insert(
            "k1",
            IdempotencyRecord::failed(earlier.clone(), "broker down"),
            Duration::from_secs(3600),
        );

        let outcome = h
            .gateway
            .submit(&caller(&["submitter"]), None, submission(Some("k1"), "A", "50"))
            .await
            .unwrap();

        assert!(!outcome.replayed);
        assert_ne!(outcome.receipt.transaction_id, earlier);
        assert_eq!(h.log.published(TOPIC).len(), 1);
        assert_eq!(h.metrics.lookup_count("failed"), 1);
        assert_eq!(
            h.store.record("k1").unwrap().status,
            IdempotencyStatus::Accepted
        );
    }

    /// Reports a miss for the first `misses` lookups, as a store does while
    /// another request's acceptance has not been written yet.
    struct RacingStore {
        inner: InMemoryIdempotencyStore,
        misses: AtomicUsize,
    }

    impl RacingStore {
        fn new(misses: usize) -> Self {
            Self {
                inner: InMemoryIdempotencyStore::new(),
                misses: AtomicUsize::new(misses),
            }
        }
    }

    #[async_trait]
    impl IdempotencyStore for RacingStore {
        async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
            let forced_miss = self
                .misses
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if forced_miss {
                return Ok(None);
            }
            self.inner.get(key).await
        }

        async fn set(
            &self,
            key: &str,
            record: &IdempotencyRecord,
            ttl: Duration,
        ) -> Result<(), StoreError> {
            self.inner.set(key, record, ttl).await
        }
    }

    fn racing_gateway(store: Arc<RacingStore>, log: &InMemoryEventLog) -> IngestionGateway {
        IngestionGateway::new(
            store,
            Arc::new(log.clone()),
            Arc::new(PipelineMetrics::new().unwrap()),
            GatewaySettings {
                ingest_topic: TOPIC.to_string(),
                idempotency_ttl: Duration::from_secs(86_400),
                store_timeout: Duration::from_millis(50),
                publish_timeout: Duration::from_millis(50),
                submit_roles: vec!["submitter".to_string()],
                batch_roles: vec!["operator".to_string()],
                max_batch_size: 5,
            },
        )
    }

    #[tokio::test]
    async fn concurrent_first_submissions_leave_a_replayable_record() {
        let store = Arc::new(RacingStore::new(2));
        let log = InMemoryEventLog::new(6);
        let gateway = racing_gateway(store.clone(), &log);
        let submitter = caller(&["submitter"]);

        let (first, second) = tokio::join!(
            gateway.submit(&submitter, None, submission(Some("k1"), "A", "50")),
            gateway.submit(&submitter, None, submission(Some("k1"), "A", "50")),
        );
        let ids = [
            first.unwrap().receipt.transaction_id,
            second.unwrap().receipt.transaction_id,
        ];
        assert!(log.published(TOPIC).len() <= 2);

        let cached = store.inner.record("k1").unwrap();
        assert_eq!(cached.status, IdempotencyStatus::Accepted);

        let retry = gateway
            .submit(&submitter, None, submission(Some("k1"), "A", "50"))
            .await
            .unwrap();
        assert!(retry.replayed);
        assert!(ids.contains(&retry.receipt.transaction_id));
        assert_eq!(log.published(TOPIC).len(), 2);
    }

    #[tokio::test]
    async fn racing_publish_failure_keeps_earlier_acceptance() {
        let store = Arc::new(RacingStore::new(2));
        let log = InMemoryEventLog::new(6);
        let gateway = racing_gateway(store.clone(), &log);
        let submitter = caller(&["submitter"]);

        let accepted = gateway
            .submit(&submitter, None, submission(Some("k1"), "A", "50"))
            .await
            .unwrap();

        log.fail_publishes(true);
        let err = gateway
            .submit(&submitter, None, submission(Some("k1"), "A", "50"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PublishFailed(_)));
        log.fail_publishes(false);

        let retry = gateway
            .submit(&submitter, None, submission(Some("k1"), "A", "50"))
            .await
            .unwrap();
        assert!(retry.replayed);
        assert_eq!(retry.receipt.transaction_id, accepted.receipt.transaction_id);
        assert_eq!(log.published(TOPIC).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_timeout_is_retryable() {
        let h = harness();
        h.log.set_latency(Some(Duration::from_secs(5)));

        let err = h
            .gateway
            .submit(&caller(&["submitter"]), None, submission(Some("k1"), "A", "50"))
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::PublishFailed(_)));
        assert_eq!(h.metrics.failed_count("publish"), 1);
    }

    #[test]
    fn resolves_keys() {
        assert_eq!(resolve_idempotency_key(Some(" a "), None).unwrap(), "a");
        assert_eq!(resolve_idempotency_key(None, Some("b")).unwrap(), "b");
        assert_eq!(resolve_idempotency_key(Some("c"), Some("c")).unwrap(), "c");
        assert!(matches!(
            resolve_idempotency_key(None, Some("")),
            Err(GatewayError::MissingIdempotencyKey)
        ));
        assert!(matches!(
            resolve_idempotency_key(Some("has space"), None),
            Err(GatewayError::MalformedSubmission(_))
        ));
    }
}
