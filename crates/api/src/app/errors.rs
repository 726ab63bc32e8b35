use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use creditflow_infra::{CreditServiceError, PoolError};

pub fn pool_error_to_response(err: PoolError) -> axum::response::Response {
    match &err {
        PoolError::CapacityExhausted { .. } => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "capacity_exhausted", err.to_string())
        }
        PoolError::ShuttingDown => json_error(StatusCode::SERVICE_UNAVAILABLE, "shutting_down", err.to_string()),
        PoolError::Consumer { .. } => json_error(StatusCode::BAD_GATEWAY, "consumer_start_failed", err.to_string()),
    }
}

pub fn credit_error_to_response(err: CreditServiceError) -> axum::response::Response {
    match err {
        CreditServiceError::PaymentRequired {
            required,
            available,
            reason,
        } => (
            StatusCode::PAYMENT_REQUIRED,
            axum::Json(json!({
                "error": "payment_required",
                "message": reason,
                "requiredCredits": required,
                "availableCredits": available,
            })),
        )
            .into_response(),
        other @ CreditServiceError::NoEntity { .. } => json_error(StatusCode::NOT_FOUND, "no_entity", other.to_string()),
        other @ CreditServiceError::ConfigNotFound { .. } => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "config_not_found", other.to_string())
        }
        other if other.is_transient() => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", other.to_string())
        }
        other => json_error(StatusCode::INTERNAL_SERVER_ERROR, "credit_error", other.to_string()),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn parse_tenant(raw: &str) -> Result<creditflow_core::TenantId, axum::response::Response> {
    creditflow_core::TenantId::parse(raw)
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, "invalid_tenant", e.to_string()))
}
