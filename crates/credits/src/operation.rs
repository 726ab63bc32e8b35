use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use creditflow_core::{EntityId, EventId, OperationCode, TenantId};

use crate::Credits;

/// Unique key of one ledger mutation.
///
/// A key that was already committed turns a repeated mutation into a replay of the
/// stored [`LedgerOperation`], which keeps redelivered events and retried requests
/// from charging twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Key for an operation performed on behalf of a bus event.
    pub fn for_event(event_id: &EventId, operation: &OperationCode) -> Self {
        Self(format!("{event_id}:{operation}"))
    }

    /// Key for a synchronous request; a fresh request id is generated when the
    /// caller has none.
    pub fn for_request(request_id: Option<&str>, operation: &OperationCode) -> Self {
        let request_id = request_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
        Self(format!("{request_id}:{operation}"))
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Allocate,
    Consume,
    Deactivate,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Allocate => "allocate",
            OperationKind::Consume => "consume",
            OperationKind::Deactivate => "deactivate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allocate" => Some(OperationKind::Allocate),
            "consume" => Some(OperationKind::Consume),
            "deactivate" => Some(OperationKind::Deactivate),
            _ => None,
        }
    }
}

/// A committed ledger mutation, stored under its [`IdempotencyKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerOperation {
    pub tenant_id: TenantId,
    pub key: IdempotencyKey,
    pub entity_id: EntityId,
    pub kind: OperationKind,
    pub amount: Credits,
    /// Available balance right after the mutation.
    pub remaining_credits: Credits,
    pub recorded_at: DateTime<Utc>,
}
