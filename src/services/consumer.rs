//! Poll, handle, acknowledge: the loop every downstream stage runs.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::metrics::PipelineMetrics;
use crate::ports::{Delivery, EventLogError, EventSource};

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum HandlerError {
    /// Left unacknowledged; the entry stays pending for redelivery.
    #[error("retryable failure: {0}")]
    Retryable(String),
    /// Acknowledged and dropped so it cannot block its partition.
    #[error("poison message: {0}")]
    Poison(String),
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stage name used in logs and metrics.
    fn name(&self) -> &'static str;

    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError>;
}

pub struct ConsumerLoop {
    source: Arc<dyn EventSource>,
    handler: Arc<dyn EventHandler>,
    metrics: Arc<PipelineMetrics>,
    batch_size: usize,
    block: Duration,
}

impl ConsumerLoop {
    pub fn new(
        source: Arc<dyn EventSource>,
        handler: Arc<dyn EventHandler>,
        metrics: Arc<PipelineMetrics>,
        batch_size: usize,
        block: Duration,
    ) -> Self {
        Self {
            source,
            handler,
            metrics,
            batch_size: batch_size.max(1),
            block,
        }
    }

    /// Runs until `shutdown` flips to true. A delivery that is being handled
    /// when shutdown arrives is finished first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let stage = self.handler.name();
        info!(stage, "Consumer started");

        while !*shutdown.borrow() {
            let backoff = match self.poll_and_handle().await {
                Ok(summary) if summary.delivered == 0 => {
                    tokio::task::yield_now().await;
                    false
                }
                // Redelivered entries come straight back; pause instead of spinning on them.
                Ok(summary) => summary.retried == summary.delivered,
                Err(e) => {
                    error!(stage, error = %e, "Consumer poll failed");
                    true
                }
            };

            if backoff {
                tokio::select! {
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        info!(stage, "Consumer stopped");
    }

    /// One poll plus handling of everything it returned.
    pub async fn run_once(&self) -> Result<usize, EventLogError> {
        Ok(self.poll_and_handle().await?.delivered)
    }

    async fn poll_and_handle(&self) -> Result<PollSummary, EventLogError> {
        let stage = self.handler.name();
        let deliveries = self.source.poll(self.batch_size, self.block).await?;
        let mut retried = 0;

        for delivery in &deliveries {
            match self.handler.handle(delivery).await {
                Ok(()) => {
                    self.source.ack(delivery).await?;
                    self.metrics.record_consumed(stage, "ok");
                    debug!(stage, offset = %delivery.offset, partition = delivery.partition, "Handled");
                }
                Err(HandlerError::Poison(reason)) => {
                    warn!(
                        stage,
                        offset = %delivery.offset,
                        partition = delivery.partition,
                        reason = %reason,
                        "Dropping poison message"
                    );
                    self.source.ack(delivery).await?;
                    self.metrics.record_consumed(stage, "poison");
                }
                Err(HandlerError::Retryable(reason)) => {
                    warn!(
                        stage,
                        offset = %delivery.offset,
                        partition = delivery.partition,
                        reason = %reason,
                        "Handling failed, leaving entry pending"
                    );
                    self.metrics.record_consumed(stage, "retry");
                    retried += 1;
                }
            }
        }

        Ok(PollSummary {
            delivered: deliveries.len(),
            retried,
        })
    }
}

struct PollSummary {
    delivered: usize,
    retried: usize,
}
