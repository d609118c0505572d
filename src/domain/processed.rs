//! Events produced by the scoring stage and the alerts derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::transaction::AcceptedTransaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score > 0.7 {
            RiskLevel::High
        } else if score > 0.4 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approved,
    Flagged,
    Rejected,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approved => "approved",
            Decision::Flagged => "flagged",
            Decision::Rejected => "rejected",
        }
    }

    pub fn needs_alert(&self) -> bool {
        !matches!(self, Decision::Approved)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Running risk summary for one account, updated with every stored transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRisk {
    pub account_id: String,
    /// Highest score seen so far; `risk_level` is derived from it.
    pub max_risk_score: f64,
    pub risk_level: RiskLevel,
    pub total_flagged: i64,
    pub total_rejected: i64,
    pub last_updated: DateTime<Utc>,
}

impl AccountRisk {
    pub fn first(processed: &ProcessedTransaction) -> Self {
        Self {
            account_id: processed.transaction.account_id.clone(),
            max_risk_score: processed.risk_score,
            risk_level: RiskLevel::from_score(processed.risk_score),
            total_flagged: i64::from(processed.decision == Decision::Flagged),
            total_rejected: i64::from(processed.decision == Decision::Rejected),
            last_updated: processed.processed_at,
        }
    }

    pub fn record(&mut self, processed: &ProcessedTransaction) {
        self.max_risk_score = self.max_risk_score.max(processed.risk_score);
        self.risk_level = RiskLevel::from_score(self.max_risk_score);
        self.total_flagged += i64::from(processed.decision == Decision::Flagged);
        self.total_rejected += i64::from(processed.decision == Decision::Rejected);
        self.last_updated = processed.processed_at;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedTransaction {
    #[serde(flatten)]
    pub transaction: AcceptedTransaction,
    pub is_valid: bool,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub decision: Decision,
    pub flagged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub processed_at: DateTime<Utc>,
}

impl ProcessedTransaction {
    pub fn partition_key(&self) -> &str {
        self.transaction.partition_key()
    }

    pub fn headers(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("transaction_id".to_string(), self.transaction.id.to_string()),
            ("risk_level".to_string(), self.risk_level.as_str().to_string()),
            ("decision".to_string(), self.decision.to_string()),
        ])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    HighRisk,
    RejectedTransaction,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::HighRisk => "high_risk",
            AlertType::RejectedTransaction => "rejected_transaction",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.9 {
            Severity::Critical
        } else if score >= 0.7 {
            Severity::High
        } else {
            Severity::Medium
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Severity::Medium => "Medium",
            Severity::High => "High",
            Severity::Critical => "Critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    pub transaction_id: String,
    pub account_id: String,
    pub user_id: String,
    pub risk_score: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Alert {
    /// `None` for events that do not warrant a notification.
    pub fn for_processed(processed: &ProcessedTransaction) -> Option<Self> {
        let tx = &processed.transaction;
        let (alert_type, message) = match processed.decision {
            Decision::Approved => return None,
            Decision::Flagged => (
                AlertType::HighRisk,
                format!(
                    "{} {} {} scored {:.2} ({} risk)",
                    tx.transaction_type,
                    tx.amount,
                    tx.currency,
                    processed.risk_score,
                    processed.risk_level.as_str()
                ),
            ),
            Decision::Rejected => (
                AlertType::RejectedTransaction,
                format!(
                    "{} {} {} rejected: {}",
                    tx.transaction_type,
                    tx.amount,
                    tx.currency,
                    processed.failure_reason.as_deref().unwrap_or("validation failed")
                ),
            ),
        };

        let mut metadata = tx.metadata.clone();
        if let Some(merchant) = &tx.merchant {
            metadata.insert("merchant".to_string(), merchant.clone());
        }

        Some(Self {
            id: Uuid::new_v4(),
            alert_type,
            severity: Severity::from_score(processed.risk_score),
            message,
            transaction_id: tx.id.to_string(),
            account_id: tx.account_id.clone(),
            user_id: tx.user_id.clone(),
            risk_score: processed.risk_score,
            timestamp: Utc::now(),
            metadata,
        })
    }

    /// Chat-friendly rendering used by the webhook notifier.
    pub fn render_text(&self) -> String {
        let mut text = format!(
            "🚨 *{} Alert* ({})\n{}",
            self.severity.label(),
            self.alert_type.as_str(),
            self.message
        );
        text.push_str(&format!("\nTransaction: {}", self.transaction_id));
        text.push_str(&format!("\nAccount: {}", self.account_id));
        text.push_str(&format!("\nUser: {}", self.user_id));
        text
    }
}
