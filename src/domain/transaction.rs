//! Transaction submission and the accepted event published to the event log.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::validation::{
    self, optional_text, required_text, ValidationError, CURRENCY_MAX_LEN, FREE_TEXT_MAX_LEN,
    IDENTIFIER_MAX_LEN,
};

pub const TRANSACTION_TYPES: &[&str] = &["purchase", "transfer", "withdrawal", "deposit", "refund"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Purchase,
    Transfer,
    Withdrawal,
    Deposit,
    Refund,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Purchase => "purchase",
            TransactionType::Transfer => "transfer",
            TransactionType::Withdrawal => "withdrawal",
            TransactionType::Deposit => "deposit",
            TransactionType::Refund => "refund",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        validation::validate_enum("type", value, TRANSACTION_TYPES)?;
        Ok(match value {
            "purchase" => TransactionType::Purchase,
            "transfer" => TransactionType::Transfer,
            "withdrawal" => TransactionType::Withdrawal,
            "deposit" => TransactionType::Deposit,
            _ => TransactionType::Refund,
        })
    }
}

/// Incoming submission as sent by clients. Required fields are optional on
/// the wire so that a missing field is reported by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct TransactionSubmission {
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    #[schema(value_type = Option<String>, example = "50.00")]
    pub amount: Option<BigDecimal>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default, rename = "type")]
    pub transaction_type: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub merchant: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, String>>,
}

/// A submission that passed gateway validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedSubmission {
    pub account_id: String,
    pub user_id: String,
    pub amount: BigDecimal,
    pub currency: String,
    pub transaction_type: TransactionType,
    pub category: Option<String>,
    pub merchant: Option<String>,
    pub reference: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl TransactionSubmission {
    /// Field-level validation. The idempotency key is resolved separately
    /// because it may also arrive in a header.
    pub fn validate(&self) -> Result<ValidatedSubmission, ValidationError> {
        let account_id = required_text("account_id", self.account_id.as_deref(), IDENTIFIER_MAX_LEN)?;
        let user_id = required_text("user_id", self.user_id.as_deref(), IDENTIFIER_MAX_LEN)?;

        let amount = self
            .amount
            .clone()
            .ok_or_else(|| ValidationError::new("amount", "must be provided"))?;
        validation::validate_positive_amount(&amount)?;

        let currency = required_text("currency", self.currency.as_deref(), CURRENCY_MAX_LEN)?;
        let transaction_type: TransactionType =
            required_text("type", self.transaction_type.as_deref(), FREE_TEXT_MAX_LEN)?
                .to_lowercase()
                .parse()?;

        let metadata = self.metadata.clone().unwrap_or_default();
        validation::validate_metadata(&metadata)?;

        Ok(ValidatedSubmission {
            account_id,
            user_id,
            amount,
            currency,
            transaction_type,
            category: optional_text("category", self.category.as_deref(), FREE_TEXT_MAX_LEN)?,
            merchant: optional_text("merchant", self.merchant.as_deref(), FREE_TEXT_MAX_LEN)?,
            reference: optional_text("reference", self.reference.as_deref(), FREE_TEXT_MAX_LEN)?,
            metadata,
        })
    }
}

/// Server-generated identifier: `txn_<utc timestamp, microseconds>_<8 hex>`.
/// Sorting the strings sorts by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn generate(at: DateTime<Utc>) -> Self {
        let entropy = Uuid::new_v4().simple().to_string();
        Self(format!(
            "txn_{}_{}",
            at.format("%Y%m%d%H%M%S%6f"),
            &entropy[..8]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TransactionId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
}

/// The event published to the ingest topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedTransaction {
    pub id: TransactionId,
    pub idempotency_key: String,
    pub account_id: String,
    pub user_id: String,
    pub amount: BigDecimal,
    pub currency: String,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub status: TransactionStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl AcceptedTransaction {
    pub fn accept(idempotency_key: String, submission: ValidatedSubmission) -> Self {
        let now = Utc::now();
        Self {
            id: TransactionId::generate(now),
            idempotency_key,
            account_id: submission.account_id,
            user_id: submission.user_id,
            amount: submission.amount,
            currency: submission.currency,
            transaction_type: submission.transaction_type,
            category: submission.category,
            merchant: submission.merchant,
            reference: submission.reference,
            status: TransactionStatus::Pending,
            timestamp: now,
            metadata: submission.metadata,
        }
    }

    /// Always the account: one account's events stay on one ordered partition.
    pub fn partition_key(&self) -> &str {
        &self.account_id
    }

    pub fn headers(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("idempotency_key".to_string(), self.idempotency_key.clone()),
            ("user_id".to_string(), self.user_id.clone()),
            ("currency".to_string(), self.currency.clone()),
            ("type".to_string(), self.transaction_type.to_string()),
        ])
    }
}
