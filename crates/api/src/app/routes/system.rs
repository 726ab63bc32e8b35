use std::sync::Arc;

use axum::{Json, extract::Extension, response::IntoResponse};

use crate::app::dto::HealthResponse;
use crate::app::services::AppServices;

pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        mode: services.mode,
        consumers: services.pool.len(),
        shutting_down: services.pool.is_shutting_down(),
    })
}

/// Pool aggregate plus per-tenant breakdown.
pub async fn metrics(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    Json(services.pool.metrics())
}
