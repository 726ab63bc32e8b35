//! Bounded pool of tenant consumers.
//!
//! The pool is the only owner allowed to create or drop a [`TenantEventConsumer`].
//! Consumers are created lazily on first demand (or warm-started), evicted by a
//! periodic cleanup when their connection dropped or they went idle, and drained
//! together on shutdown.

mod manager;
mod metrics;

use std::time::Duration;

use creditflow_core::TenantId;

use crate::consumer::{ConsumerConfig, ConsumerError};

pub use manager::{CleanupReport, ConsumerPoolManager, WarmStartReport};
pub use metrics::{HitRates, PoolMetrics, TenantConsumerMetrics};

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Hard bound on live consumers. Exceeding it fails instead of evicting.
    pub max_consumers: usize,
    pub cleanup_interval: Duration,
    /// Active consumers with no activity for this long are evicted.
    pub idle_timeout: Duration,
    /// Consumers stuck in `Reconnecting` longer than this are evicted.
    pub reconnect_grace: Duration,
    pub consumer: ConsumerConfig,
    /// Rough footprint of one idle consumer, in bytes.
    pub consumer_memory_bytes: u64,
    /// Rough footprint of one in-flight message, in bytes.
    pub message_memory_bytes: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_consumers: 100,
            cleanup_interval: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(1800),
            reconnect_grace: Duration::from_secs(300),
            consumer: ConsumerConfig::default(),
            consumer_memory_bytes: 64 * 1024,
            message_memory_bytes: 16 * 1024,
        }
    }
}

impl PoolConfig {
    pub fn with_max_consumers(mut self, max: usize) -> Self {
        self.max_consumers = max;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_reconnect_grace(mut self, grace: Duration) -> Self {
        self.reconnect_grace = grace;
        self
    }

    pub fn with_consumer(mut self, consumer: ConsumerConfig) -> Self {
        self.consumer = consumer;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("consumer pool is full ({max} consumers), cannot start tenant {tenant_id}")]
    CapacityExhausted { max: usize, tenant_id: TenantId },

    #[error("consumer pool is shutting down")]
    ShuttingDown,

    #[error("consumer for tenant {tenant_id} failed to start: {source}")]
    Consumer {
        tenant_id: TenantId,
        #[source]
        source: ConsumerError,
    },
}

impl PoolError {
    pub fn is_transient(&self) -> bool {
        match self {
            PoolError::Consumer { source, .. } => source.is_transient(),
            PoolError::CapacityExhausted { .. } | PoolError::ShuttingDown => false,
        }
    }
}
