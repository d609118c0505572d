//! Scores accepted transactions and republishes them as processed events.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::info;

use crate::config::ScoringConfig;
use crate::domain::{AcceptedTransaction, Decision, ProcessedTransaction, RiskLevel, TransactionType};
use crate::ports::{Delivery, EventLog, EventRecord};
use crate::services::consumer::{EventHandler, HandlerError};

const BASE_SCORE: f64 = 0.1;
const HIGH_AMOUNT_WEIGHT: f64 = 0.7;
const TRANSFER_WEIGHT: f64 = 0.4;
const WITHDRAWAL_WEIGHT: f64 = 0.2;
const INVALID_SCORE: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct RiskRules {
    pub high_amount_threshold: BigDecimal,
    pub flag_threshold: f64,
}

impl Default for RiskRules {
    fn default() -> Self {
        Self {
            high_amount_threshold: BigDecimal::from(10_000),
            flag_threshold: 0.7,
        }
    }
}

impl RiskRules {
    pub fn from_config(config: &ScoringConfig) -> Self {
        Self {
            high_amount_threshold: config.high_amount_threshold.clone(),
            flag_threshold: config.flag_threshold,
        }
    }

    /// Downstream sanity checks; the gateway already enforces most of these.
    pub fn check(&self, tx: &AcceptedTransaction) -> Result<(), String> {
        if tx.amount <= BigDecimal::from(0) {
            return Err("amount must be positive".to_string());
        }
        if tx.currency.trim().is_empty() {
            return Err("currency is required".to_string());
        }
        if tx.user_id.trim().is_empty() {
            return Err("user_id is required".to_string());
        }
        Ok(())
    }

    /// Additive weights capped at 1.0, rounded to two decimals.
    pub fn score(&self, tx: &AcceptedTransaction) -> f64 {
        let mut score = BASE_SCORE;
        if tx.amount > self.high_amount_threshold {
            score += HIGH_AMOUNT_WEIGHT;
        }
        match tx.transaction_type {
            TransactionType::Transfer => score += TRANSFER_WEIGHT,
            TransactionType::Withdrawal => score += WITHDRAWAL_WEIGHT,
            _ => {}
        }
        (score.min(1.0) * 100.0).round() / 100.0
    }

    pub fn decide(&self, is_valid: bool, score: f64) -> Decision {
        if !is_valid {
            Decision::Rejected
        } else if score >= self.flag_threshold {
            Decision::Flagged
        } else {
            Decision::Approved
        }
    }

    pub fn evaluate(&self, tx: AcceptedTransaction) -> ProcessedTransaction {
        let (is_valid, failure_reason, risk_score) = match self.check(&tx) {
            Ok(()) => (true, None, self.score(&tx)),
            Err(reason) => (false, Some(reason), INVALID_SCORE),
        };
        let decision = self.decide(is_valid, risk_score);

        ProcessedTransaction {
            transaction: tx,
            is_valid,
            risk_score,
            risk_level: RiskLevel::from_score(risk_score),
            decision,
            flagged: decision == Decision::Flagged,
            failure_reason,
            processed_at: Utc::now(),
        }
    }
}

pub struct RiskScorer {
    rules: RiskRules,
    log: Arc<dyn EventLog>,
    processed_topic: String,
    publish_timeout: Duration,
}

impl RiskScorer {
    pub fn new(
        rules: RiskRules,
        log: Arc<dyn EventLog>,
        processed_topic: impl Into<String>,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            rules,
            log,
            processed_topic: processed_topic.into(),
            publish_timeout,
        }
    }
}

#[async_trait]
impl EventHandler for RiskScorer {
    fn name(&self) -> &'static str {
        "risk_scoring"
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let tx: AcceptedTransaction = serde_json::from_str(&delivery.record.payload)
            .map_err(|e| HandlerError::Poison(format!("undecodable transaction: {e}")))?;

        let processed = self.rules.evaluate(tx);
        let record = EventRecord::json(processed.partition_key(), &processed, processed.headers())
            .map_err(|e| HandlerError::Poison(e.to_string()))?;

        match timeout(self.publish_timeout, self.log.publish(&self.processed_topic, record)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(HandlerError::Retryable(e.to_string())),
            Err(_) => return Err(HandlerError::Retryable("publish timed out".to_string())),
        }

        info!(
            transaction_id = %processed.transaction.id,
            risk_score = processed.risk_score,
            risk_level = processed.risk_level.as_str(),
            decision = %processed.decision,
            "Transaction scored"
        );
        Ok(())
    }
}
