//! Append-only audit trail of credit mutations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use creditflow_core::{EntityId, OperationCode, TenantId, UserId};

use crate::{Credits, IdempotencyKey, OperationKind};

/// Which path produced an activity entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivitySource {
    Event,
    Request,
}

impl ActivitySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivitySource::Event => "event",
            ActivitySource::Request => "request",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    pub activity_id: Uuid,
    pub tenant_id: TenantId,
    pub entity_id: EntityId,
    pub user_id: Option<UserId>,
    pub operation_code: OperationCode,
    pub kind: OperationKind,
    pub credits: Credits,
    pub balance_after: Credits,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub idempotency_key: IdempotencyKey,
    pub source: ActivitySource,
    #[serde(default)]
    pub details: JsonValue,
    pub recorded_at: DateTime<Utc>,
}

impl ActivityRecord {
    pub fn new(
        tenant_id: TenantId,
        entity_id: EntityId,
        operation_code: OperationCode,
        kind: OperationKind,
        credits: Credits,
        idempotency_key: IdempotencyKey,
        source: ActivitySource,
    ) -> Self {
        Self {
            activity_id: Uuid::now_v7(),
            tenant_id,
            entity_id,
            user_id: None,
            operation_code,
            kind,
            credits,
            balance_after: 0,
            resource_type: None,
            resource_id: None,
            idempotency_key,
            source,
            details: JsonValue::Null,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_user(mut self, user_id: Option<UserId>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_resource(mut self, resource_type: Option<String>, resource_id: Option<String>) -> Self {
        self.resource_type = resource_type;
        self.resource_id = resource_id;
        self
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = details;
        self
    }

    /// Stamp the post-mutation balance and commit time.
    pub fn settled(mut self, balance_after: Credits, at: DateTime<Utc>) -> Self {
        self.balance_after = balance_after;
        self.recorded_at = at;
        self
    }
}
