//! Event idempotency ledger.
//!
//! One [`EventProcessingRecord`] per `(event id, event type, tenant)`. The consumer
//! claims a message before running its handler ([`EventIdempotencyStore::claim`])
//! and records the terminal outcome afterwards. A `completed` record is final:
//! neither `claim` nor `record_result` ever moves it to another status.
//!
//! Records expire after a retention window. Expiry only reclaims storage; the
//! ledger's operation keys keep handlers idempotent past it.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use creditflow_core::{EntityId, EventId, TenantId};
use creditflow_events::TenantEvent;

pub use in_memory::InMemoryIdempotencyStore;
pub use postgres::PostgresIdempotencyStore;

pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Error message carried by a claimed, not yet finished attempt.
pub const ATTEMPT_IN_PROGRESS: &str = "attempt in progress";

#[derive(Debug, Clone, thiserror::Error)]
pub enum IdempotencyError {
    #[error("idempotency store unavailable: {0}")]
    Unavailable(String),

    #[error("idempotency store error: {0}")]
    Storage(String),
}

impl IdempotencyError {
    pub fn is_transient(&self) -> bool {
        matches!(self, IdempotencyError::Unavailable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingKey {
    pub event_id: EventId,
    pub event_type: String,
    pub tenant_id: TenantId,
}

impl ProcessingKey {
    pub fn new(event_id: EventId, event_type: impl Into<String>, tenant_id: TenantId) -> Self {
        Self {
            event_id,
            event_type: event_type.into(),
            tenant_id,
        }
    }

    /// Key of a normalized event; known kinds use their canonical name.
    pub fn for_event(event: &TenantEvent) -> Self {
        Self::new(event.id.clone(), event.kind().as_str(), event.tenant_id.clone())
    }
}

impl std::fmt::Display for ProcessingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.event_type, self.event_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Completed,
    Failed,
    Skipped,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
            ProcessingStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(ProcessingStatus::Completed),
            "failed" => Some(ProcessingStatus::Failed),
            "skipped" => Some(ProcessingStatus::Skipped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventProcessingRecord {
    #[serde(flatten)]
    pub key: ProcessingKey,
    pub entity_id: Option<EntityId>,
    pub status: ProcessingStatus,
    pub processed_at: DateTime<Utc>,
    /// Number of claims so far.
    pub retry_count: u32,
    pub result: JsonValue,
    pub error_message: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl EventProcessingRecord {
    pub fn is_completed(&self) -> bool {
        self.status == ProcessingStatus::Completed
    }
}

/// Terminal outcome to record for one event.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingResult {
    pub status: ProcessingStatus,
    pub result: JsonValue,
    pub error_message: Option<String>,
}

impl ProcessingResult {
    pub fn completed(result: JsonValue) -> Self {
        Self {
            status: ProcessingStatus::Completed,
            result,
            error_message: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ProcessingStatus::Failed,
            result: JsonValue::Null,
            error_message: Some(error.into()),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: ProcessingStatus::Skipped,
            result: JsonValue::Null,
            error_message: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The event was already applied; skip it.
    AlreadyCompleted(EventProcessingRecord),
    /// Attempt number `attempt` (1-based) may proceed.
    Claimed { attempt: u32 },
}

#[async_trait]
pub trait EventIdempotencyStore: Send + Sync {
    /// Whether a `completed` record exists. `failed`/`skipped` records do not count.
    async fn has_processed(&self, key: &ProcessingKey) -> Result<bool, IdempotencyError>;

    /// Start an attempt: create the record (or bump `retry_count`) with status
    /// `failed` until a terminal result is written.
    async fn claim(
        &self,
        key: &ProcessingKey,
        entity_id: Option<&EntityId>,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, IdempotencyError>;

    /// Write the outcome. Returns the stored record, which is the earlier one when
    /// the event had already completed.
    async fn record_result(
        &self,
        key: &ProcessingKey,
        entity_id: Option<&EntityId>,
        result: ProcessingResult,
        now: DateTime<Utc>,
    ) -> Result<EventProcessingRecord, IdempotencyError>;

    async fn get(&self, key: &ProcessingKey) -> Result<Option<EventProcessingRecord>, IdempotencyError>;

    /// Delete records whose `expires_at <= now`; returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, IdempotencyError>;
}

pub(crate) fn default_retention() -> Duration {
    Duration::days(DEFAULT_RETENTION_DAYS)
}
