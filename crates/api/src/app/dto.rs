use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use creditflow_core::{EntityId, OperationCode, TenantId, UserId};
use creditflow_credits::Credits;
use creditflow_infra::DeductionRequest;
use creditflow_infra::consumer::ConnectionState;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckCreditsRequest {
    pub user_id: Option<UserId>,
    pub operation_code: OperationCode,
    pub required_credits: Option<Credits>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeductCreditsRequest {
    pub user_id: Option<UserId>,
    pub operation_code: OperationCode,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    #[serde(default)]
    pub details: JsonValue,
    pub request_id: Option<String>,
    pub entity_id: Option<EntityId>,
}

impl DeductCreditsRequest {
    pub fn into_request(self, tenant_id: TenantId) -> DeductionRequest {
        let mut request = DeductionRequest::new(tenant_id, self.user_id, self.operation_code).with_details(self.details);
        request.resource_type = self.resource_type;
        request.resource_id = self.resource_id;
        if let Some(request_id) = self.request_id {
            request = request.with_request_id(request_id);
        }
        if let Some(entity) = self.entity_id {
            request = request.with_entity(entity);
        }
        request
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerStarted {
    pub tenant_id: TenantId,
    pub consumer_name: String,
    pub group: String,
    pub state: ConnectionState,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub mode: &'static str,
    pub consumers: usize,
    pub shutting_down: bool,
}
