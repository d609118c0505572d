//! Prometheus counters owned by an explicitly constructed registry.
//!
//! One `PipelineMetrics` is built at startup and handed to the gateway, the
//! stage workers and the HTTP layer; nothing registers into a global.

use axum::{
    extract::{MatchedPath, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct PipelineMetrics {
    registry: Registry,
    http_requests: IntCounterVec,
    http_duration: HistogramVec,
    transactions_ingested: IntCounterVec,
    transactions_failed: IntCounterVec,
    idempotency_lookups: IntCounterVec,
    idempotency_writes: IntCounterVec,
    events_published: IntCounterVec,
    publish_duration: HistogramVec,
    events_consumed: IntCounterVec,
    alerts_sent: IntCounterVec,
}

fn counter(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, prometheus::Error> {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn histogram(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<HistogramVec, prometheus::Error> {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help), labels)?;
    registry.register(Box::new(histogram.clone()))?;
    Ok(histogram)
}

impl PipelineMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        Ok(Self {
            http_requests: counter(
                &registry,
                "http_requests_total",
                "Total number of HTTP requests",
                &["method", "endpoint", "status"],
            )?,
            http_duration: histogram(
                &registry,
                "http_request_duration_seconds",
                "Duration of HTTP requests",
                &["method", "endpoint"],
            )?,
            transactions_ingested: counter(
                &registry,
                "transactions_ingested_total",
                "Transactions accepted by the gateway",
                &["currency", "type"],
            )?,
            transactions_failed: counter(
                &registry,
                "transactions_failed_total",
                "Submissions the gateway did not accept",
                &["reason"],
            )?,
            idempotency_lookups: counter(
                &registry,
                "idempotency_lookups_total",
                "Idempotency store lookups by result",
                &["result"],
            )?,
            idempotency_writes: counter(
                &registry,
                "idempotency_writes_total",
                "Idempotency store writes by status",
                &["status"],
            )?,
            events_published: counter(
                &registry,
                "events_published_total",
                "Records published to the event log",
                &["topic", "status"],
            )?,
            publish_duration: histogram(
                &registry,
                "event_publish_duration_seconds",
                "Duration of event log publishes",
                &["topic"],
            )?,
            events_consumed: counter(
                &registry,
                "events_consumed_total",
                "Records handled by pipeline stages",
                &["stage", "status"],
            )?,
            alerts_sent: counter(
                &registry,
                "alerts_sent_total",
                "Alert notifications by delivery status",
                &["status"],
            )?,
            registry,
        })
    }

    pub fn record_http(&self, method: &str, endpoint: &str, status: u16, elapsed: Duration) {
        self.http_requests
            .with_label_values(&[method, endpoint, &status.to_string()])
            .inc();
        self.http_duration
            .with_label_values(&[method, endpoint])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_ingested(&self, currency: &str, transaction_type: &str) {
        self.transactions_ingested
            .with_label_values(&[currency, transaction_type])
            .inc();
    }

    pub fn record_failed(&self, reason: &str) {
        self.transactions_failed.with_label_values(&[reason]).inc();
    }

    pub fn record_lookup(&self, result: &str) {
        self.idempotency_lookups.with_label_values(&[result]).inc();
    }

    pub fn record_store_write(&self, ok: bool) {
        let status = if ok { "ok" } else { "error" };
        self.idempotency_writes.with_label_values(&[status]).inc();
    }

    pub fn record_publish(&self, topic: &str, ok: bool, elapsed: Duration) {
        let status = if ok { "success" } else { "failed" };
        self.events_published
            .with_label_values(&[topic, status])
            .inc();
        self.publish_duration
            .with_label_values(&[topic])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_consumed(&self, stage: &str, status: &str) {
        self.events_consumed
            .with_label_values(&[stage, status])
            .inc();
    }

    pub fn record_alert(&self, delivered: bool) {
        let status = if delivered { "delivered" } else { "failed" };
        self.alerts_sent.with_label_values(&[status]).inc();
    }

    pub fn lookup_count(&self, result: &str) -> u64 {
        self.idempotency_lookups.with_label_values(&[result]).get()
    }

    pub fn failed_count(&self, reason: &str) -> u64 {
        self.transactions_failed.with_label_values(&[reason]).get()
    }

    pub fn consumed_count(&self, stage: &str, status: &str) -> u64 {
        self.events_consumed.with_label_values(&[stage, status]).get()
    }

    pub fn alert_count(&self, delivered: bool) -> u64 {
        let status = if delivered { "delivered" } else { "failed" };
        self.alerts_sent.with_label_values(&[status]).get()
    }

    /// Prometheus text exposition of everything in the registry.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub async fn metrics_handler(State(metrics): State<Arc<PipelineMetrics>>) -> Response {
    match metrics.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Records request counts and latency by matched route.
pub async fn track_http_metrics(
    State(metrics): State<Arc<PipelineMetrics>>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;
    metrics.record_http(&method, &endpoint, response.status().as_u16(), start.elapsed());
    response
}
