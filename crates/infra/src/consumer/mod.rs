//! Per-tenant event consumption.
//!
//! - `state`: connection lifecycle of one consumer
//! - `metrics`: lock-free counters
//! - `handlers`: `event_type` routing and the built-in handlers
//! - `tenant_consumer`: the read → dedup → dispatch → record → ack loop

pub mod handlers;
pub mod metrics;
pub mod state;
pub mod tenant_consumer;

use std::sync::Arc;
use std::time::Duration;

use creditflow_core::TenantId;

use crate::event_bus::{BusError, StreamBus};
use crate::idempotency::{EventIdempotencyStore, IdempotencyError};
use crate::retry::RetryPolicy;

pub use handlers::{EventHandler, HandlerError, HandlerOutcome, HandlerRegistry};
pub use metrics::{ConsumerMetrics, ConsumerMetricsSnapshot};
pub use state::ConnectionState;
pub use tenant_consumer::{BatchReport, MessageOutcome, TenantEventConsumer};

pub const DEFAULT_CONSUMER_GROUP: &str = "crm-credit-sync";

pub const DEFAULT_STREAMS: [&str; 4] = [
    "crm:credit-events",
    "crm:org-events",
    "crm:user-events",
    "crm:role-events",
];

/// Tenant consumer configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Base consumer group; each tenant joins `"{consumer_group}:{tenant}"`.
    pub consumer_group: String,
    pub streams: Vec<String>,
    /// Max entries per read.
    pub batch_size: usize,
    /// How long one read waits for new entries.
    pub block: Duration,
    /// Streams of one batch processed concurrently.
    pub worker_count: usize,
    /// Attempts beyond this are dead-lettered.
    pub max_retries: u32,
    pub processing_timeout: Duration,
    /// Unacknowledged entries idle this long are redelivered.
    pub pending_idle: Duration,
    /// Consecutive failed polls before the consumer backs off in `Reconnecting`.
    pub failure_threshold: u32,
    pub reconnect: RetryPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            streams: DEFAULT_STREAMS.iter().map(|s| s.to_string()).collect(),
            batch_size: 10,
            block: Duration::from_millis(2000),
            worker_count: 4,
            max_retries: 5,
            processing_timeout: Duration::from_secs(30),
            pending_idle: Duration::from_secs(60),
            failure_threshold: 3,
            reconnect: RetryPolicy::exponential(u32::MAX, Duration::from_millis(500), Duration::from_secs(30)),
        }
    }
}

impl ConsumerConfig {
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = group.into();
        self
    }

    pub fn with_streams<I, S>(mut self, streams: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.streams = streams.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers.max(1);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    pub fn with_pending_idle(mut self, idle: Duration) -> Self {
        self.pending_idle = idle;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_reconnect(mut self, policy: RetryPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Consumer group joined by `tenant_id`.
    pub fn group_for(&self, tenant_id: &TenantId) -> String {
        format!("{}:{}", self.consumer_group, tenant_id)
    }
}

/// Shared collaborators of every tenant consumer.
#[derive(Clone)]
pub struct ConsumerDeps {
    pub bus: Arc<dyn StreamBus>,
    pub idempotency: Arc<dyn EventIdempotencyStore>,
    pub handlers: Arc<HandlerRegistry>,
}

impl std::fmt::Debug for ConsumerDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerDeps")
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),

    #[error("consumer for tenant {tenant_id} cannot move from {from} to {to}")]
    InvalidTransition {
        tenant_id: TenantId,
        from: ConnectionState,
        to: ConnectionState,
    },
}

impl ConsumerError {
    pub fn is_transient(&self) -> bool {
        match self {
            ConsumerError::Bus(e) => e.is_transient() || matches!(e, BusError::UnknownGroup { .. }),
            ConsumerError::Idempotency(e) => e.is_transient(),
            ConsumerError::InvalidTransition { .. } => false,
        }
    }
}
