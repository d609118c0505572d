//! Persists processed transactions; the conflict-ignoring insert absorbs
//! duplicate deliveries.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::domain::ProcessedTransaction;
use crate::ports::{Delivery, SaveOutcome, TransactionRepository};
use crate::services::consumer::{EventHandler, HandlerError};

pub struct StorageWriter {
    repository: Arc<dyn TransactionRepository>,
}

impl StorageWriter {
    pub fn new(repository: Arc<dyn TransactionRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl EventHandler for StorageWriter {
    fn name(&self) -> &'static str {
        "storage"
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let processed: ProcessedTransaction = serde_json::from_str(&delivery.record.payload)
            .map_err(|e| HandlerError::Poison(format!("undecodable processed event: {e}")))?;

        match self.repository.save(&processed).await {
            Ok(SaveOutcome::Inserted) => {
                info!(transaction_id = %processed.transaction.id, "Stored transaction");
                Ok(())
            }
            Ok(SaveOutcome::Duplicate) => {
                debug!(transaction_id = %processed.transaction.id, "Duplicate delivery ignored");
                Ok(())
            }
            Err(e) => Err(HandlerError::Retryable(e.to_string())),
        }
    }
}
