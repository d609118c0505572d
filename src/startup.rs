//! Process wiring for each subcommand and the `config --check` report.

use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::adapters::{
    PostgresTransactionRepository, RedisEventLog, RedisEventSource, RedisIdempotencyStore,
};
use crate::config::{AlertConfig, EventLogConfig, GatewayConfig, ScoringConfig, StorageConfig};
use crate::health::HealthService;
use crate::metrics::PipelineMetrics;
use crate::middleware::auth::JwtVerifier;
use crate::ports::{EventLog, IdempotencyStore};
use crate::services::{
    AlertForwarder, ConsumerLoop, EventHandler, RiskRules, RiskScorer, StorageWriter,
    WebhookNotifier,
};
use crate::use_cases::{GatewaySettings, IngestionGateway};
use crate::{create_app, AppOptions, AppState};

const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn serve_gateway(
    config: GatewayConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let metrics = Arc::new(PipelineMetrics::new().context("Failed to initialize metrics")?);

    let store: Arc<dyn IdempotencyStore> = Arc::new(
        RedisIdempotencyStore::connect(&config.redis_url)
            .await
            .context("Failed to connect to the idempotency store")?,
    );
    let log: Arc<dyn EventLog> = Arc::new(
        RedisEventLog::connect(
            &config.event_log.url,
            config.event_log.partitions,
            config.event_log.max_len,
        )
        .await
        .context("Failed to connect to the event log")?,
    );

    let gateway = IngestionGateway::new(
        store.clone(),
        log.clone(),
        metrics.clone(),
        GatewaySettings::from_config(&config),
    );
    let state = AppState {
        gateway: Arc::new(gateway),
        verifier: Arc::new(JwtVerifier::new(&config.jwt_secret)),
        metrics,
        health: Arc::new(HealthService::for_gateway(store, log)),
    };
    let app = create_app(state, AppOptions::from_config(&config));

    let address = config.bind_address();
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {address}"))?;
    tracing::info!(
        address = %address,
        topic = %config.ingest_topic,
        partitions = config.event_log.partitions,
        "Ingestion gateway listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")?;

    tracing::info!("Ingestion gateway stopped");
    Ok(())
}

pub async fn run_scoring(config: ScoringConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
    let metrics = Arc::new(PipelineMetrics::new().context("Failed to initialize metrics")?);
    let log = RedisEventLog::connect(
        &config.event_log.url,
        config.event_log.partitions,
        config.event_log.max_len,
    )
    .await
    .context("Failed to connect to the event log")?;

    let scorer = RiskScorer::new(
        RiskRules::from_config(&config),
        Arc::new(log),
        config.processed_topic.clone(),
        config.publish_timeout,
    );

    run_consumer(
        &config.event_log,
        &config.ingest_topic,
        &config.group,
        Arc::new(scorer),
        metrics,
        shutdown,
    )
    .await
}

pub async fn run_storage(config: StorageConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
    let metrics = Arc::new(PipelineMetrics::new().context("Failed to initialize metrics")?);
    let pool = create_pool(&config.database_url, config.max_connections).await?;

    let repository = PostgresTransactionRepository::new(pool);
    repository
        .ensure_schema()
        .await
        .context("Failed to prepare the processed_transactions table")?;
    tracing::info!("Database schema ready");

    run_consumer(
        &config.event_log,
        &config.processed_topic,
        &config.group,
        Arc::new(StorageWriter::new(Arc::new(repository))),
        metrics,
        shutdown,
    )
    .await
}

pub async fn run_alerts(config: AlertConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
    let metrics = Arc::new(PipelineMetrics::new().context("Failed to initialize metrics")?);
    let notifier =
        WebhookNotifier::from_config(&config).context("Failed to build the webhook client")?;
    let forwarder = AlertForwarder::new(Arc::new(notifier), metrics.clone());

    run_consumer(
        &config.event_log,
        &config.processed_topic,
        &config.group,
        Arc::new(forwarder),
        metrics,
        shutdown,
    )
    .await
}

async fn run_consumer(
    event_log: &EventLogConfig,
    topic: &str,
    group: &str,
    handler: Arc<dyn EventHandler>,
    metrics: Arc<PipelineMetrics>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let consumer = event_log.consumer_for(group);
    let source = RedisEventSource::connect(
        &event_log.url,
        topic,
        event_log.partitions,
        group,
        &consumer,
    )
    .await
    .with_context(|| format!("Failed to join consumer group {group} on {topic}"))?;
    tracing::info!(topic, group, consumer = %consumer, stage = handler.name(), "Consumer connected");

    ConsumerLoop::new(
        Arc::new(source),
        handler,
        metrics,
        event_log.poll_batch,
        event_log.poll_block,
    )
    .run(shutdown)
    .await;
    Ok(())
}

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
        .context("Failed to connect to the database")
}

/// Outcome of one configuration or connectivity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
}

impl CheckResult {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            ok: true,
            detail: detail.into(),
        }
    }

    fn fail(name: &'static str, error: &anyhow::Error) -> Self {
        Self {
            name,
            ok: false,
            detail: format!("{error:#}"),
        }
    }

    fn from_result(name: &'static str, result: Result<String>) -> Self {
        match result {
            Ok(detail) => Self::pass(name, detail),
            Err(e) => Self::fail(name, &e),
        }
    }
}

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub checks: Vec<CheckResult>,
}

impl ValidationReport {
    pub fn push(&mut self, check: CheckResult) {
        self.checks.push(check);
    }

    pub fn is_valid(&self) -> bool {
        self.checks.iter().all(|check| check.ok)
    }

    pub fn print(&self) {
        println!("\n=== Pipeline Validation Report ===");
        for check in &self.checks {
            println!("{:<22} {}  {}", check.name, status(check.ok), check.detail);
        }
        println!("\nOverall Status: {}", if self.is_valid() { "✅ PASS" } else { "❌ FAIL" });
        println!("==================================\n");
    }
}

fn status(ok: bool) -> &'static str {
    if ok {
        "✅ OK"
    } else {
        "❌ FAIL"
    }
}

/// Validates every component configuration present in the environment and,
/// with `connectivity`, reaches out to the backing services.
///
/// Storage and alert settings are only checked when their required variable
/// is set, since a host usually runs a subset of the stages.
pub async fn validate_environment(connectivity: bool) -> ValidationReport {
    let mut report = ValidationReport::default();

    match GatewayConfig::from_env() {
        Ok(config) => {
            report.push(CheckResult::pass(
                "gateway config",
                format!("listening on {}", config.bind_address()),
            ));
            if connectivity {
                report.push(CheckResult::from_result(
                    "idempotency store",
                    check_redis(&config.redis_url).await,
                ));
                report.push(CheckResult::from_result(
                    "event log",
                    check_redis(&config.event_log.url).await,
                ));
            }
        }
        Err(e) => report.push(CheckResult::fail("gateway config", &e)),
    }

    report.push(CheckResult::from_result(
        "scoring config",
        ScoringConfig::from_env().map(|config| {
            format!("{} -> {}", config.ingest_topic, config.processed_topic)
        }),
    ));

    if std::env::var("DATABASE_URL").is_ok() {
        match StorageConfig::from_env() {
            Ok(config) => {
                report.push(CheckResult::pass(
                    "storage config",
                    crate::cli::mask_password(&config.database_url),
                ));
                if connectivity {
                    report.push(CheckResult::from_result(
                        "database",
                        check_database(&config).await,
                    ));
                }
            }
            Err(e) => report.push(CheckResult::fail("storage config", &e)),
        }
    }

    if std::env::var("ALERT_WEBHOOK_URL").is_ok() {
        report.push(CheckResult::from_result(
            "alert config",
            AlertConfig::from_env().map(|config| {
                format!(
                    "circuit opens after {} failures",
                    config.failure_threshold
                )
            }),
        ));
    }

    report
}

async fn check_redis(redis_url: &str) -> Result<String> {
    let client = redis::Client::open(redis_url).context("Invalid Redis URL")?;

    let mut conn = tokio::time::timeout(CHECK_TIMEOUT, client.get_multiplexed_async_connection())
        .await
        .context("Timed out connecting to Redis")?
        .context("Failed to connect to Redis")?;

    redis::cmd("PING")
        .query_async::<_, String>(&mut conn)
        .await
        .context("Redis PING failed")?;

    Ok(crate::cli::mask_password(redis_url))
}

async fn check_database(config: &StorageConfig) -> Result<String> {
    let pool = tokio::time::timeout(CHECK_TIMEOUT, create_pool(&config.database_url, 1))
        .await
        .context("Timed out connecting to the database")??;
    PostgresTransactionRepository::new(pool)
        .ping()
        .await
        .context("Database query failed")?;
    Ok("SELECT 1 succeeded".to_string())
}
