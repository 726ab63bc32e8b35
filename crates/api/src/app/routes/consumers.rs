use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub async fn warm_start(
    Extension(services): Extension<Arc<AppServices>>,
    Path(tenant): Path<String>,
) -> axum::response::Response {
    let tenant_id = match errors::parse_tenant(&tenant) {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    match services.pool.get_consumer(&tenant_id).await {
        Ok(consumer) => (
            StatusCode::OK,
            Json(dto::ConsumerStarted {
                tenant_id,
                consumer_name: consumer.consumer_name().to_string(),
                group: consumer.group().to_string(),
                state: consumer.state(),
            }),
        )
            .into_response(),
        Err(e) => errors::pool_error_to_response(e),
    }
}

pub async fn remove(
    Extension(services): Extension<Arc<AppServices>>,
    Path(tenant): Path<String>,
) -> axum::response::Response {
    let tenant_id = match errors::parse_tenant(&tenant) {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    if services.pool.remove_consumer(&tenant_id).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("no consumer for tenant {tenant_id}"))
    }
}
