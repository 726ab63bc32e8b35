use std::collections::BTreeMap;

use serde::Serialize;

use crate::consumer::{ConnectionState, ConsumerMetricsSnapshot};

/// Aggregate pool metrics, as served on the metrics endpoint.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetrics {
    pub total_consumers: usize,
    pub active_consumers: usize,
    pub hit_rates: HitRates,
    /// Bus calls issued by all live consumers.
    pub api_calls: u64,
    pub errors: u64,
    /// Order-of-magnitude footprint, in bytes.
    pub memory_estimate: u64,
    pub consumers_created: u64,
    pub consumers_evicted: u64,
    pub per_tenant: BTreeMap<String, TenantConsumerMetrics>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HitRates {
    /// Credit-config resolutions served from cache.
    pub config_cache: f64,
    /// Tenant messages that were already applied.
    pub idempotency: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantConsumerMetrics {
    pub state: ConnectionState,
    pub idle_secs: u64,
    #[serde(flatten)]
    pub counters: ConsumerMetricsSnapshot,
}
