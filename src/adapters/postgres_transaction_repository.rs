//! Postgres implementation of TransactionRepository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::BTreeMap;

use crate::domain::{
    AcceptedTransaction, AccountRisk, Decision, ProcessedTransaction, TransactionId,
    TransactionStatus,
};
use crate::ports::{RepositoryError, RepositoryResult, SaveOutcome, TransactionRepository};

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS processed_transactions (
        id TEXT PRIMARY KEY,
        idempotency_key TEXT NOT NULL UNIQUE,
        account_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        amount NUMERIC NOT NULL,
        currency TEXT NOT NULL,
        transaction_type TEXT NOT NULL,
        category TEXT,
        merchant TEXT,
        reference TEXT,
        status TEXT NOT NULL,
        submitted_at TIMESTAMPTZ NOT NULL,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
        is_valid BOOLEAN NOT NULL,
        risk_score DOUBLE PRECISION NOT NULL,
        risk_level TEXT NOT NULL,
        decision TEXT NOT NULL,
        flagged BOOLEAN NOT NULL,
        failure_reason TEXT,
        processed_at TIMESTAMPTZ NOT NULL,
        stored_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
"#;

const CREATE_ACCOUNT_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_processed_transactions_account
        ON processed_transactions (account_id, submitted_at)
"#;

const CREATE_RISK_METRICS: &str = r#"
    CREATE TABLE IF NOT EXISTS risk_metrics (
        account_id TEXT PRIMARY KEY,
        max_risk_score DOUBLE PRECISION NOT NULL,
        risk_level TEXT NOT NULL,
        total_flagged BIGINT NOT NULL DEFAULT 0,
        total_rejected BIGINT NOT NULL DEFAULT 0,
        last_updated TIMESTAMPTZ NOT NULL
    )
"#;

/// Postgres-backed store for scored transactions.
#[derive(Clone)]
pub struct PostgresTransactionRepository {
    pool: PgPool,
}

impl PostgresTransactionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the tables and the account index if they do not exist yet.
    pub async fn ensure_schema(&self) -> RepositoryResult<()> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_ACCOUNT_INDEX).execute(&self.pool).await?;
        sqlx::query(CREATE_RISK_METRICS).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn ping(&self) -> RepositoryResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl TransactionRepository for PostgresTransactionRepository {
    async fn save(&self, processed: &ProcessedTransaction) -> RepositoryResult<SaveOutcome> {
        let tx = &processed.transaction;
        let mut db_tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO processed_transactions (
                id, idempotency_key, account_id, user_id, amount, currency,
                transaction_type, category, merchant, reference, status, submitted_at,
                metadata, is_valid, risk_score, risk_level, decision, flagged,
                failure_reason, processed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(tx.id.as_str())
        .bind(&tx.idempotency_key)
        .bind(&tx.account_id)
        .bind(&tx.user_id)
        .bind(&tx.amount)
        .bind(&tx.currency)
        .bind(tx.transaction_type.as_str())
        .bind(&tx.category)
        .bind(&tx.merchant)
        .bind(&tx.reference)
        .bind(processed.decision.as_str())
        .bind(tx.timestamp)
        .bind(Json(&tx.metadata))
        .bind(processed.is_valid)
        .bind(processed.risk_score)
        .bind(processed.risk_level.as_str())
        .bind(processed.decision.as_str())
        .bind(processed.flagged)
        .bind(&processed.failure_reason)
        .bind(processed.processed_at)
        .execute(&mut *db_tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(SaveOutcome::Duplicate);
        }

        // Same transaction as the insert, so a redelivery never counts twice.
        sqlx::query(
            r#"
            INSERT INTO risk_metrics (
                account_id, max_risk_score, risk_level, total_flagged, total_rejected, last_updated
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (account_id) DO UPDATE SET
                max_risk_score = GREATEST(risk_metrics.max_risk_score, EXCLUDED.max_risk_score),
                risk_level = CASE
                    WHEN GREATEST(risk_metrics.max_risk_score, EXCLUDED.max_risk_score) > 0.7 THEN 'high'
                    WHEN GREATEST(risk_metrics.max_risk_score, EXCLUDED.max_risk_score) > 0.4 THEN 'medium'
                    ELSE 'low'
                END,
                total_flagged = risk_metrics.total_flagged + EXCLUDED.total_flagged,
                total_rejected = risk_metrics.total_rejected + EXCLUDED.total_rejected,
                last_updated = EXCLUDED.last_updated
            "#,
        )
        .bind(&tx.account_id)
        .bind(processed.risk_score)
        .bind(processed.risk_level.as_str())
        .bind(i64::from(processed.decision == Decision::Flagged))
        .bind(i64::from(processed.decision == Decision::Rejected))
        .bind(processed.processed_at)
        .execute(&mut *db_tx)
        .await?;

        db_tx.commit().await?;
        Ok(SaveOutcome::Inserted)
    }

    async fn get_by_id(&self, id: &str) -> RepositoryResult<Option<ProcessedTransaction>> {
        let row = sqlx::query_as::<_, ProcessedRow>(
            r#"
            SELECT id, idempotency_key, account_id, user_id, amount, currency,
                transaction_type, category, merchant, reference, submitted_at, metadata,
                is_valid, risk_score, risk_level, decision, flagged, failure_reason, processed_at
            FROM processed_transactions WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ProcessedRow::into_domain).transpose()
    }

    async fn account_risk(&self, account_id: &str) -> RepositoryResult<Option<AccountRisk>> {
        let row = sqlx::query_as::<_, RiskRow>(
            r#"
            SELECT account_id, max_risk_score, risk_level, total_flagged, total_rejected, last_updated
            FROM risk_metrics WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RiskRow::into_domain).transpose()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RiskRow {
    account_id: String,
    max_risk_score: f64,
    risk_level: String,
    total_flagged: i64,
    total_rejected: i64,
    last_updated: DateTime<Utc>,
}

impl RiskRow {
    fn into_domain(self) -> RepositoryResult<AccountRisk> {
        Ok(AccountRisk {
            account_id: self.account_id,
            max_risk_score: self.max_risk_score,
            risk_level: decode_label("risk_level", self.risk_level)?,
            total_flagged: self.total_flagged,
            total_rejected: self.total_rejected,
            last_updated: self.last_updated,
        })
    }
}

/// Internal row type for SQLx. Not exposed outside the adapter.
#[derive(Debug, sqlx::FromRow)]
struct ProcessedRow {
    id: String,
    idempotency_key: String,
    account_id: String,
    user_id: String,
    amount: bigdecimal::BigDecimal,
    currency: String,
    transaction_type: String,
    category: Option<String>,
    merchant: Option<String>,
    reference: Option<String>,
    submitted_at: DateTime<Utc>,
    metadata: Json<BTreeMap<String, String>>,
    is_valid: bool,
    risk_score: f64,
    risk_level: String,
    decision: String,
    flagged: bool,
    failure_reason: Option<String>,
    processed_at: DateTime<Utc>,
}

/// Enum columns hold the same lowercase names the JSON events use.
fn decode_label<T: DeserializeOwned>(column: &str, raw: String) -> RepositoryResult<T> {
    serde_json::from_value(serde_json::Value::String(raw))
        .map_err(|e| RepositoryError::Decode(format!("{column}: {e}")))
}

impl ProcessedRow {
    fn into_domain(self) -> RepositoryResult<ProcessedTransaction> {
        Ok(ProcessedTransaction {
            transaction: AcceptedTransaction {
                id: TransactionId::from(self.id),
                idempotency_key: self.idempotency_key,
                account_id: self.account_id,
                user_id: self.user_id,
                amount: self.amount,
                currency: self.currency,
                transaction_type: decode_label("transaction_type", self.transaction_type)?,
                category: self.category,
                merchant: self.merchant,
                reference: self.reference,
                status: TransactionStatus::Pending,
                timestamp: self.submitted_at,
                metadata: self.metadata.0,
            },
            is_valid: self.is_valid,
            risk_score: self.risk_score,
            risk_level: decode_label("risk_level", self.risk_level)?,
            decision: decode_label("decision", self.decision)?,
            flagged: self.flagged,
            failure_reason: self.failure_reason,
            processed_at: self.processed_at,
        })
    }
}
