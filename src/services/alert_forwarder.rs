//! Best-effort chat notifications for flagged and rejected transactions.

use async_trait::async_trait;
use failsafe::futures::CircuitBreaker as FuturesCircuitBreaker;
use failsafe::{backoff, failure_policy, Config, Error as FailsafeError, StateMachine};
use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::AlertConfig;
use crate::domain::{Alert, ProcessedTransaction};
use crate::metrics::PipelineMetrics;
use crate::ports::Delivery;
use crate::services::consumer::{EventHandler, HandlerError};

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("webhook responded with status {0}")]
    Status(u16),
    #[error("circuit breaker open: {0}")]
    CircuitBreakerOpen(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError>;
}

/// Posts `{"text": ...}` to a Slack-compatible incoming webhook.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
    circuit_breaker: StateMachine<failure_policy::ConsecutiveFailures<backoff::EqualJittered>, ()>,
}

impl WebhookNotifier {
    pub fn new(
        url: String,
        timeout: Duration,
        failure_threshold: u32,
        reset_timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(timeout).build()?;

        let backoff = backoff::equal_jittered(reset_timeout, reset_timeout * 2);
        let policy = failure_policy::consecutive_failures(failure_threshold, backoff);
        let circuit_breaker = Config::new().failure_policy(policy).build();

        Ok(Self {
            client,
            url,
            circuit_breaker,
        })
    }

    pub fn from_config(config: &AlertConfig) -> Result<Self, NotifyError> {
        Self::new(
            config.webhook_url.clone(),
            config.timeout,
            config.failure_threshold,
            config.reset_timeout,
        )
    }

    pub fn circuit_state(&self) -> String {
        if self.circuit_breaker.is_call_permitted() {
            "closed".to_string()
        } else {
            "open".to_string()
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        let client = self.client.clone();
        let url = self.url.clone();
        let payload = json!({ "text": alert.render_text() });

        let result = self
            .circuit_breaker
            .call(async move {
                let response = client.post(&url).json(&payload).send().await?;
                if !response.status().is_success() {
                    return Err(NotifyError::Status(response.status().as_u16()));
                }
                Ok(())
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(FailsafeError::Rejected) => Err(NotifyError::CircuitBreakerOpen(
                "alert webhook circuit breaker is open".to_string(),
            )),
            Err(FailsafeError::Inner(e)) => Err(e),
        }
    }
}

pub struct AlertForwarder {
    notifier: Arc<dyn Notifier>,
    metrics: Arc<PipelineMetrics>,
}

impl AlertForwarder {
    pub fn new(notifier: Arc<dyn Notifier>, metrics: Arc<PipelineMetrics>) -> Self {
        Self { notifier, metrics }
    }
}

#[async_trait]
impl EventHandler for AlertForwarder {
    fn name(&self) -> &'static str {
        "alert_forwarder"
    }

    /// Never asks for redelivery: a lost alert is logged and counted.
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let processed: ProcessedTransaction = serde_json::from_str(&delivery.record.payload)
            .map_err(|e| HandlerError::Poison(format!("undecodable processed event: {e}")))?;

        let alert = match Alert::for_processed(&processed) {
            Some(alert) => alert,
            None => return Ok(()),
        };

        match self.notifier.notify(&alert).await {
            Ok(()) => {
                self.metrics.record_alert(true);
                info!(
                    transaction_id = %alert.transaction_id,
                    alert_type = alert.alert_type.as_str(),
                    "Alert sent"
                );
            }
            Err(e) => {
                self.metrics.record_alert(false);
                warn!(
                    transaction_id = %alert.transaction_id,
                    error = %e,
                    "Failed to send alert"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AcceptedTransaction, TransactionSubmission};
    use crate::ports::EventRecord;
    use crate::services::risk_scorer::RiskRules;
    use bigdecimal::BigDecimal;
    use mockito::Matcher;
    use std::collections::BTreeMap;

    fn processed(amount: i64) -> ProcessedTransaction {
        let validated = TransactionSubmission {
            account_id: Some("A".to_string()),
            user_id: Some("U".to_string()),
            amount: Some(BigDecimal::from(amount)),
            currency: Some("USD".to_string()),
            transaction_type: Some("purchase".to_string()),
            ..Default::default()
        }
        .validate()
        .unwrap();
        RiskRules::default().evaluate(AcceptedTransaction::accept("k1".to_string(), validated))
    }

    fn delivery(processed: &ProcessedTransaction) -> Delivery {
        Delivery {
            topic: "transactions.processed".to_string(),
            partition: 0,
            offset: "0-0".to_string(),
            record: EventRecord::json("A", processed, BTreeMap::new()).unwrap(),
        }
    }

    fn notifier(url: String, threshold: u32) -> Arc<WebhookNotifier> {
        Arc::new(
            WebhookNotifier::new(
                url,
                Duration::from_secs(5),
                threshold,
                Duration::from_secs(60),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn posts_flagged_transactions_as_chat_text() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_body(Matcher::Regex(r"High Alert\* \(high_risk\)".to_string()))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let forwarder = AlertForwarder::new(
            notifier(format!("{}/hook", server.url()), 3),
            metrics.clone(),
        );

        forwarder.handle(&delivery(&processed(20_000))).await.unwrap();

        mock.assert_async().await;
        assert_eq!(metrics.alert_count(true), 1);
    }

    #[tokio::test]
    async fn approved_transactions_send_nothing() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .expect(0)
            .create_async()
            .await;

        let forwarder = AlertForwarder::new(
            notifier(format!("{}/hook", server.url()), 3),
            Arc::new(PipelineMetrics::new().unwrap()),
        );
        forwarder.handle(&delivery(&processed(50))).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn webhook_failures_are_swallowed_and_open_the_circuit() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let webhook = notifier(format!("{}/hook", server.url()), 1);
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let forwarder = AlertForwarder::new(webhook.clone(), metrics.clone());

        forwarder.handle(&delivery(&processed(20_000))).await.unwrap();
        assert_eq!(webhook.circuit_state(), "open");
        forwarder.handle(&delivery(&processed(20_000))).await.unwrap();

        mock.assert_async().await;
        assert_eq!(metrics.alert_count(false), 2);
    }

    #[tokio::test]
    async fn rejected_transactions_alert_with_reason() {
        let mut tx = processed(5);
        tx = RiskRules::default().evaluate({
            let mut inner = tx.transaction;
            inner.amount = BigDecimal::from(0);
            inner
        });

        let alert = Alert::for_processed(&tx).unwrap();
        let text = alert.render_text();
        assert!(text.starts_with("🚨 *Critical Alert* (rejected_transaction)"));
        assert!(text.contains("amount must be positive"));
        assert!(text.contains("Account: A"));
    }
}
