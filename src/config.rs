//! Environment-driven configuration, one struct per pipeline component.
//!
//! Every struct has `from_env` (loads `.env` first) and `from_lookup`, which
//! takes any variable source so tests do not touch the process environment.
//! Values are validated eagerly: a bad setting fails at startup.

use anyhow::{bail, Context, Result};
use bigdecimal::BigDecimal;
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const MIN_JWT_SECRET_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        match lookup("LOG_FORMAT").as_deref().map(str::trim) {
            Some(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Connection and consumption settings shared by every stage.
#[derive(Debug, Clone)]
pub struct EventLogConfig {
    pub url: String,
    pub partitions: u32,
    pub max_len: usize,
    pub poll_batch: usize,
    pub poll_block: Duration,
    pub consumer_name: Option<String>,
}

impl EventLogConfig {
    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let redis_url = lookup("REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string());
        let config = Self {
            url: lookup("EVENT_LOG_URL").unwrap_or(redis_url),
            partitions: parse_or(lookup, "EVENT_LOG_PARTITIONS", 6)?,
            max_len: parse_or(lookup, "EVENT_LOG_MAX_LEN", 1_000_000)?,
            poll_batch: parse_or(lookup, "EVENT_LOG_POLL_BATCH", 100)?,
            poll_block: Duration::from_millis(parse_or(lookup, "EVENT_LOG_POLL_BLOCK_MS", 1000)?),
            consumer_name: lookup("CONSUMER_NAME").filter(|name| !name.trim().is_empty()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_url("EVENT_LOG_URL", &self.url, &["redis", "rediss"])?;
        if self.partitions == 0 {
            bail!("EVENT_LOG_PARTITIONS must be greater than 0");
        }
        if self.poll_batch == 0 {
            bail!("EVENT_LOG_POLL_BATCH must be greater than 0");
        }
        Ok(())
    }

    /// Consumer identity within `group`; random when not configured so that
    /// replicas do not share a pending list by accident.
    pub fn consumer_for(&self, group: &str) -> String {
        match &self.consumer_name {
            Some(name) => name.clone(),
            None => format!("{}-{}", group, &uuid::Uuid::new_v4().simple().to_string()[..8]),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub redis_url: String,
    pub event_log: EventLogConfig,
    pub ingest_topic: String,
    pub idempotency_ttl: Duration,
    pub store_timeout: Duration,
    pub publish_timeout: Duration,
    pub jwt_secret: String,
    pub submit_roles: Vec<String>,
    pub batch_roles: Vec<String>,
    pub max_batch_size: usize,
    pub max_request_bytes: usize,
    pub log_request_body: bool,
    pub metrics_enabled: bool,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let config = Self {
            host: lookup("HTTP_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(&lookup, "HTTP_PORT", 8080)?,
            redis_url: lookup("REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            event_log: EventLogConfig::from_lookup(&lookup)?,
            ingest_topic: lookup("INGEST_TOPIC").unwrap_or_else(|| "transactions.raw".to_string()),
            idempotency_ttl: Duration::from_secs(parse_or(&lookup, "IDEMPOTENCY_TTL_SECS", 86_400)?),
            store_timeout: Duration::from_millis(parse_or(&lookup, "STORE_TIMEOUT_MS", 2000)?),
            publish_timeout: Duration::from_millis(parse_or(&lookup, "PUBLISH_TIMEOUT_MS", 5000)?),
            jwt_secret: jwt_secret(&lookup)?,
            submit_roles: roles(&lookup, "SUBMIT_ROLES", "submitter,operator"),
            batch_roles: roles(&lookup, "BATCH_ROLES", "operator"),
            max_batch_size: parse_or(&lookup, "MAX_BATCH_SIZE", 500)?,
            max_request_bytes: parse_or(&lookup, "MAX_REQUEST_BYTES", 1_048_576)?,
            log_request_body: parse_or(&lookup, "LOG_REQUEST_BODY", false)?,
            metrics_enabled: parse_or(&lookup, "METRICS_ENABLED", true)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            bail!("HTTP_PORT must be greater than 0");
        }
        validate_url("REDIS_URL", &self.redis_url, &["redis", "rediss"])?;
        validate_topic("INGEST_TOPIC", &self.ingest_topic)?;
        if self.idempotency_ttl.is_zero() {
            bail!("IDEMPOTENCY_TTL_SECS must be greater than 0");
        }
        if self.store_timeout.is_zero() || self.publish_timeout.is_zero() {
            bail!("STORE_TIMEOUT_MS and PUBLISH_TIMEOUT_MS must be greater than 0");
        }
        if self.submit_roles.is_empty() || self.batch_roles.is_empty() {
            bail!("SUBMIT_ROLES and BATCH_ROLES must name at least one role");
        }
        if self.max_batch_size == 0 {
            bail!("MAX_BATCH_SIZE must be greater than 0");
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct ScoringConfig {
    pub event_log: EventLogConfig,
    pub ingest_topic: String,
    pub processed_topic: String,
    pub group: String,
    pub publish_timeout: Duration,
    pub high_amount_threshold: BigDecimal,
    pub flag_threshold: f64,
}

impl ScoringConfig {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let config = Self {
            event_log: EventLogConfig::from_lookup(&lookup)?,
            ingest_topic: lookup("INGEST_TOPIC").unwrap_or_else(|| "transactions.raw".to_string()),
            processed_topic: processed_topic(&lookup),
            group: lookup("SCORING_GROUP").unwrap_or_else(|| "risk-scoring".to_string()),
            publish_timeout: Duration::from_millis(parse_or(&lookup, "PUBLISH_TIMEOUT_MS", 5000)?),
            high_amount_threshold: parse_or(&lookup, "HIGH_AMOUNT_THRESHOLD", BigDecimal::from(10_000))?,
            flag_threshold: parse_or(&lookup, "FLAG_THRESHOLD", 0.7)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_topic("INGEST_TOPIC", &self.ingest_topic)?;
        validate_topic("PROCESSED_TOPIC", &self.processed_topic)?;
        if self.ingest_topic == self.processed_topic {
            bail!("INGEST_TOPIC and PROCESSED_TOPIC must differ");
        }
        if !(0.0..=1.0).contains(&self.flag_threshold) {
            bail!("FLAG_THRESHOLD must be between 0.0 and 1.0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub event_log: EventLogConfig,
    pub processed_topic: String,
    pub group: String,
    pub database_url: String,
    pub max_connections: u32,
}

impl StorageConfig {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let config = Self {
            event_log: EventLogConfig::from_lookup(&lookup)?,
            processed_topic: processed_topic(&lookup),
            group: lookup("STORAGE_GROUP").unwrap_or_else(|| "storage".to_string()),
            database_url: lookup("DATABASE_URL").context("DATABASE_URL must be set")?,
            max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 5)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_topic("PROCESSED_TOPIC", &self.processed_topic)?;
        validate_url("DATABASE_URL", &self.database_url, &["postgres", "postgresql"])?;
        if self.max_connections == 0 {
            bail!("DATABASE_MAX_CONNECTIONS must be greater than 0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub event_log: EventLogConfig,
    pub processed_topic: String,
    pub group: String,
    pub webhook_url: String,
    pub timeout: Duration,
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl AlertConfig {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let config = Self {
            event_log: EventLogConfig::from_lookup(&lookup)?,
            processed_topic: processed_topic(&lookup),
            group: lookup("ALERT_GROUP").unwrap_or_else(|| "alert-forwarder".to_string()),
            webhook_url: lookup("ALERT_WEBHOOK_URL").context("ALERT_WEBHOOK_URL must be set")?,
            timeout: Duration::from_millis(parse_or(&lookup, "ALERT_TIMEOUT_MS", 5000)?),
            failure_threshold: parse_or(&lookup, "ALERT_FAILURE_THRESHOLD", 3)?,
            reset_timeout: Duration::from_secs(parse_or(&lookup, "ALERT_RESET_TIMEOUT_SECS", 60)?),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_topic("PROCESSED_TOPIC", &self.processed_topic)?;
        validate_url("ALERT_WEBHOOK_URL", &self.webhook_url, &["http", "https"])?;
        if self.failure_threshold == 0 {
            bail!("ALERT_FAILURE_THRESHOLD must be greater than 0");
        }
        Ok(())
    }
}

/// The signing secret on its own, for the token subcommand.
pub fn jwt_secret_from_env() -> Result<String> {
    dotenv().ok();
    jwt_secret(&|name: &str| env::var(name).ok())
}

fn jwt_secret(lookup: &impl Fn(&str) -> Option<String>) -> Result<String> {
    let secret = lookup("JWT_SECRET").context("JWT_SECRET must be set")?;
    if secret.len() < MIN_JWT_SECRET_LEN {
        bail!("JWT_SECRET must be at least {MIN_JWT_SECRET_LEN} characters");
    }
    Ok(secret)
}

fn processed_topic(lookup: &impl Fn(&str) -> Option<String>) -> String {
    lookup("PROCESSED_TOPIC").unwrap_or_else(|| "transactions.processed".to_string())
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{name} has an invalid value {raw:?}: {e}")),
        _ => Ok(default),
    }
}

fn roles(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: &str) -> Vec<String> {
    lookup(name)
        .unwrap_or_else(|| default.to_string())
        .split(',')
        .map(str::trim)
        .filter(|role| !role.is_empty())
        .map(str::to_string)
        .collect()
}

fn validate_url(name: &str, raw: &str, schemes: &[&str]) -> Result<()> {
    let parsed = url::Url::parse(raw).with_context(|| format!("{name} is not a valid URL"))?;
    if !schemes.contains(&parsed.scheme()) {
        bail!("{name} must use one of the schemes {schemes:?}");
    }
    Ok(())
}

fn validate_topic(name: &str, topic: &str) -> Result<()> {
    if topic.trim().is_empty() || topic.contains(char::is_whitespace) {
        bail!("{name} must be a non-empty name without whitespace");
    }
    Ok(())
}
