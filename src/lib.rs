pub mod adapters;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod health;
pub mod metrics;
pub mod middleware;
pub mod ports;
pub mod services;
pub mod startup;
pub mod use_cases;
pub mod utils;
pub mod validation;

use axum::{
    extract::{DefaultBodyLimit, FromRef},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::config::GatewayConfig;
use crate::health::HealthService;
use crate::metrics::PipelineMetrics;
use crate::middleware::auth::JwtVerifier;
use crate::middleware::request_logger::{request_logger_middleware, RequestLogSettings};
use crate::use_cases::IngestionGateway;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<IngestionGateway>,
    pub verifier: Arc<JwtVerifier>,
    pub metrics: Arc<PipelineMetrics>,
    pub health: Arc<HealthService>,
}

impl FromRef<AppState> for Arc<JwtVerifier> {
    fn from_ref(state: &AppState) -> Self {
        state.verifier.clone()
    }
}

impl FromRef<AppState> for Arc<PipelineMetrics> {
    fn from_ref(state: &AppState) -> Self {
        state.metrics.clone()
    }
}

/// Router-level switches that do not belong to the gateway itself.
#[derive(Debug, Clone, Copy)]
pub struct AppOptions {
    pub metrics_enabled: bool,
    pub log_request_body: bool,
    pub max_request_bytes: usize,
}

impl AppOptions {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            metrics_enabled: config.metrics_enabled,
            log_request_body: config.log_request_body,
            max_request_bytes: config.max_request_bytes,
        }
    }
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            log_request_body: false,
            max_request_bytes: 1024 * 1024,
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::transactions::submit_transaction,
        handlers::transactions::submit_batch,
        handlers::health,
    ),
    components(schemas(
        domain::TransactionSubmission,
        domain::TransactionId,
        handlers::transactions::SubmitResponse,
        use_cases::BatchOutcome,
        use_cases::BatchItemResult,
        use_cases::BatchItemStatus,
        error::ErrorDetail,
        health::HealthResponse,
    )),
    modifiers(&BearerAuth),
    tags(
        (name = "Transactions", description = "Idempotent transaction intake"),
        (name = "Health", description = "Dependency status")
    )
)]
pub struct ApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

pub fn create_app(state: AppState, options: AppOptions) -> Router {
    let mut router = Router::new()
        .route(
            "/api/v1/transactions",
            post(handlers::transactions::submit_transaction),
        )
        .route(
            "/api/v1/transactions/batch",
            post(handlers::transactions::submit_batch),
        )
        .route("/health", get(handlers::health))
        .route(
            "/api-docs/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        );

    if options.metrics_enabled {
        router = router.route("/metrics", get(metrics::metrics_handler));
    }

    let log_settings = RequestLogSettings {
        log_body: options.log_request_body,
        max_body_bytes: options.max_request_bytes,
    };

    router
        .layer(DefaultBodyLimit::max(options.max_request_bytes))
        .layer(axum::middleware::from_fn_with_state(
            log_settings,
            request_logger_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.metrics.clone(),
            metrics::track_http_metrics,
        ))
        .with_state(state)
}
