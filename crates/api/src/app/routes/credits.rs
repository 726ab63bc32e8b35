use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub async fn check(
    Extension(services): Extension<Arc<AppServices>>,
    Path(tenant): Path<String>,
    Json(body): Json<dto::CheckCreditsRequest>,
) -> axum::response::Response {
    let tenant_id = match errors::parse_tenant(&tenant) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match services
        .credits
        .check_credits(&tenant_id, body.user_id.as_ref(), &body.operation_code, body.required_credits)
        .await
    {
        Ok(check) => (StatusCode::OK, Json(check)).into_response(),
        Err(e) => errors::credit_error_to_response(e),
    }
}

pub async fn deduct(
    Extension(services): Extension<Arc<AppServices>>,
    Path(tenant): Path<String>,
    Json(body): Json<dto::DeductCreditsRequest>,
) -> axum::response::Response {
    let tenant_id = match errors::parse_tenant(&tenant) {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    match services.credits.deduct_credits_for_operation(body.into_request(tenant_id)).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => errors::credit_error_to_response(e),
    }
}
