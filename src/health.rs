use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio::time::timeout;
use utoipa::ToSchema;

use crate::ports::{EventLog, IdempotencyStore};

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    #[schema(value_type = Object)]
    pub dependencies: HashMap<String, DependencyStatus>,
}

impl HealthResponse {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencyStatus {
    Healthy { status: String, latency_ms: u64 },
    Unhealthy { status: String, error: String },
}

impl DependencyStatus {
    fn healthy(start: Instant) -> Self {
        DependencyStatus::Healthy {
            status: "healthy".to_string(),
            latency_ms: start.elapsed().as_millis() as u64,
        }
    }

    fn unhealthy(error: impl ToString) -> Self {
        DependencyStatus::Unhealthy {
            status: "unhealthy".to_string(),
            error: error.to_string(),
        }
    }
}

#[async_trait]
pub trait DependencyChecker: Send + Sync {
    fn name(&self) -> &'static str;

    /// A failing critical dependency makes the whole service unhealthy.
    fn critical(&self) -> bool;

    async fn check(&self) -> DependencyStatus;
}

pub struct IdempotencyStoreChecker {
    store: Arc<dyn IdempotencyStore>,
}

impl IdempotencyStoreChecker {
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DependencyChecker for IdempotencyStoreChecker {
    fn name(&self) -> &'static str {
        "idempotency_store"
    }

    // Lookups degrade to a miss, so intake keeps working without the store.
    fn critical(&self) -> bool {
        false
    }

    async fn check(&self) -> DependencyStatus {
        let start = Instant::now();
        match self.store.ping().await {
            Ok(()) => DependencyStatus::healthy(start),
            Err(e) => DependencyStatus::unhealthy(e),
        }
    }
}

pub struct EventLogChecker {
    log: Arc<dyn EventLog>,
}

impl EventLogChecker {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self { log }
    }
}

#[async_trait]
impl DependencyChecker for EventLogChecker {
    fn name(&self) -> &'static str {
        "event_log"
    }

    fn critical(&self) -> bool {
        true
    }

    async fn check(&self) -> DependencyStatus {
        let start = Instant::now();
        match self.log.ping().await {
            Ok(()) => DependencyStatus::healthy(start),
            Err(e) => DependencyStatus::unhealthy(e),
        }
    }
}

pub struct HealthService {
    checkers: Vec<Arc<dyn DependencyChecker>>,
    started: Instant,
}

impl HealthService {
    pub fn new(checkers: Vec<Arc<dyn DependencyChecker>>) -> Self {
        Self {
            checkers,
            started: Instant::now(),
        }
    }

    pub fn for_gateway(store: Arc<dyn IdempotencyStore>, log: Arc<dyn EventLog>) -> Self {
        Self::new(vec![
            Arc::new(IdempotencyStoreChecker::new(store)),
            Arc::new(EventLogChecker::new(log)),
        ])
    }

    pub async fn check_health(&self) -> HealthResponse {
        let mut checks = JoinSet::new();
        for checker in &self.checkers {
            let checker = Arc::clone(checker);
            checks.spawn(async move {
                let status = timeout(CHECK_TIMEOUT, checker.check())
                    .await
                    .unwrap_or_else(|_| DependencyStatus::unhealthy("timeout"));
                (checker.name(), checker.critical(), status)
            });
        }

        let mut results = Vec::with_capacity(self.checkers.len());
        while let Some(joined) = checks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!(error = %e, "Health check task failed"),
            }
        }

        let mut has_critical_failure = false;
        let mut has_non_critical_failure = false;
        let mut dependencies = HashMap::new();
        for (name, critical, status) in results {
            if matches!(status, DependencyStatus::Unhealthy { .. }) {
                if critical {
                    has_critical_failure = true;
                } else {
                    has_non_critical_failure = true;
                }
            }
            dependencies.insert(name.to_string(), status);
        }

        let status = if has_critical_failure {
            "unhealthy"
        } else if has_non_critical_failure {
            "degraded"
        } else {
            "healthy"
        };

        HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.started.elapsed().as_secs(),
            dependencies,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryEventLog, InMemoryIdempotencyStore};

    fn service() -> (Arc<InMemoryIdempotencyStore>, InMemoryEventLog, HealthService) {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let log = InMemoryEventLog::new(2);
        let health = HealthService::for_gateway(store.clone(), Arc::new(log.clone()));
        (store, log, health)
    }

    #[tokio::test]
    async fn healthy_when_every_dependency_answers() {
        let (_, _, health) = service();
        let response = health.check_health().await;
        assert!(response.is_healthy());
        assert_eq!(response.dependencies.len(), 2);
    }

    #[tokio::test]
    async fn store_outage_only_degrades() {
        let (store, _, health) = service();
        store.set_available(false);
        let response = health.check_health().await;
        assert_eq!(response.status, "degraded");
        assert!(matches!(
            response.dependencies.get("idempotency_store"),
            Some(DependencyStatus::Unhealthy { .. })
        ));
    }

    #[tokio::test]
    async fn event_log_outage_is_unhealthy() {
        let (_, log, health) = service();
        log.fail_publishes(true);
        assert_eq!(health.check_health().await.status, "unhealthy");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_dependency_times_out() {
        let (store, _, health) = service();
        store.set_latency(Some(Duration::from_secs(30)));
        let response = health.check_health().await;
        assert_eq!(response.status, "degraded");
        match response.dependencies.get("idempotency_store") {
            Some(DependencyStatus::Unhealthy { error, .. }) => assert_eq!(error, "timeout"),
            other => panic!("unexpected status: {other:?}"),
        }
    }
}
