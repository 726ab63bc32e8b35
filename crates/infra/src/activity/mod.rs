//! Credit activity trail: one append-only entry per committed ledger mutation.
//!
//! Entries are written by the ledger store inside the same commit as the balance
//! change; this module only exposes the read side plus a standalone `record` used
//! by stores that do not share a transaction with the trail.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use creditflow_core::{EntityId, OperationCode, TenantId};
use creditflow_credits::{ActivityRecord, Credits};

pub use in_memory::InMemoryActivityRecorder;
pub use postgres::PostgresActivityRecorder;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ActivityError {
    #[error("activity store unavailable: {0}")]
    Unavailable(String),

    #[error("activity store error: {0}")]
    Storage(String),
}

impl ActivityError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ActivityError::Unavailable(_))
    }
}

/// Consumption totals of one operation code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationUsage {
    pub operation_code: OperationCode,
    pub operations: u64,
    pub credits: Credits,
}

#[async_trait]
pub trait ActivityRecorder: Send + Sync {
    async fn record(&self, record: ActivityRecord) -> Result<(), ActivityError>;

    /// Most recent first.
    async fn list_for_entity(
        &self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        limit: usize,
    ) -> Result<Vec<ActivityRecord>, ActivityError>;

    /// Consumption per operation code since `since`, sorted by operation code.
    async fn usage_summary(
        &self,
        tenant_id: &TenantId,
        since: DateTime<Utc>,
    ) -> Result<Vec<OperationUsage>, ActivityError>;
}
