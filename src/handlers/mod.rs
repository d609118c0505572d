pub mod transactions;

use crate::health::HealthResponse;
use crate::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "All dependencies healthy", body = HealthResponse),
        (status = 503, description = "Degraded or unhealthy", body = HealthResponse)
    ),
    tag = "Health"
)]
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let response = state.health.check_health().await;

    let status_code = if response.is_healthy() {
        StatusCode::OK
    } else {
        tracing::warn!(status = %response.status, "Health check failed");
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(response))
}
