//! Stream bus contract and its implementations.
//!
//! The contract is the subset of a stream pub/sub every tenant consumer relies on:
//! consumer groups, per-message acknowledgement, redelivery of entries that were
//! read but never acknowledged, and an append-only dead-letter stream.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use creditflow_events::{PAYLOAD_FIELD, StreamMessage, TenantEvent};

pub use in_memory::InMemoryStreamBus;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamBus;

/// Suffix of the dead-letter stream paired with every source stream.
pub const DLQ_SUFFIX: &str = ":dlq";

pub fn dead_letter_stream(stream: &str) -> String {
    format!("{stream}{DLQ_SUFFIX}")
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("stream bus connection error: {0}")]
    Connection(String),

    #[error("stream bus command error: {0}")]
    Command(String),

    #[error("stream bus reply could not be decoded: {0}")]
    Decode(String),

    #[error("unknown consumer group {group} on stream {stream}")]
    UnknownGroup { stream: String, group: String },
}

impl BusError {
    /// Whether reconnecting and retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Connection(_) | BusError::Command(_))
    }
}

/// Parameters of one consumer-group read.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub group: String,
    pub consumer: String,
    pub streams: Vec<String>,
    /// Upper bound on returned entries.
    pub count: usize,
    /// How long to wait for new entries when nothing is pending.
    pub block: Duration,
    /// Read-but-unacknowledged entries idle at least this long are claimed and
    /// returned before any new entry.
    pub pending_idle: Duration,
}

/// Metadata attached to a dead-lettered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub reason: String,
    pub attempts: u32,
    pub tenant_id: Option<String>,
}

#[async_trait]
pub trait StreamBus: Send + Sync {
    /// Create the consumer group (and the stream) if missing. Idempotent.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BusError>;

    /// Pending entries first (see [`ReadRequest::pending_idle`]), otherwise new ones.
    async fn read_group(&self, request: &ReadRequest) -> Result<Vec<StreamMessage>, BusError>;

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, BusError>;

    /// Append raw fields, returning the new entry id.
    async fn append(&self, stream: &str, fields: Vec<(String, String)>) -> Result<String, BusError>;

    async fn ping(&self) -> Result<(), BusError>;

    /// Append a normalized event in wire form.
    async fn publish(&self, stream: &str, event: &TenantEvent) -> Result<String, BusError> {
        let payload = serde_json::to_string(&event.to_wire())
            .map_err(|e| BusError::Decode(format!("event serialization failed: {e}")))?;
        self.append(
            stream,
            vec![
                ("tenant_id".to_string(), event.tenant_id.to_string()),
                ("event_type".to_string(), event.event_type.clone()),
                (PAYLOAD_FIELD.to_string(), payload),
            ],
        )
        .await
    }

    /// Copy `message` to its stream's dead-letter stream. The caller still has to
    /// acknowledge the original.
    async fn dead_letter(&self, message: &StreamMessage, letter: &DeadLetter) -> Result<String, BusError> {
        let mut fields = vec![
            ("original_stream".to_string(), message.stream.clone()),
            ("original_message_id".to_string(), message.id.clone()),
            ("reason".to_string(), letter.reason.clone()),
            ("attempts".to_string(), letter.attempts.to_string()),
            ("failed_at".to_string(), Utc::now().to_rfc3339()),
        ];
        if let Some(tenant) = &letter.tenant_id {
            fields.push(("tenant_id".to_string(), tenant.clone()));
        }
        if let Some(payload) = message.fields.get(PAYLOAD_FIELD) {
            fields.push((PAYLOAD_FIELD.to_string(), payload.clone()));
        }
        self.append(&dead_letter_stream(&message.stream), fields).await
    }
}

pub(crate) fn fields_to_map(fields: Vec<(String, String)>) -> HashMap<String, String> {
    fields.into_iter().collect()
}
