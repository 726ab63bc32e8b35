//! Process configuration read from the environment.

use std::str::FromStr;
use std::time::Duration;

use creditflow_core::TenantId;

use crate::consumer::{ConsumerConfig, DEFAULT_CONSUMER_GROUP, DEFAULT_STREAMS};
use crate::idempotency::DEFAULT_RETENTION_DAYS;
use crate::pool::PoolConfig;

pub const DEFAULT_BUS_URL: &str = "redis://localhost:6379";
pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";
/// Upper bound for `IDEMPOTENCY_RETENTION_DAYS` (a hundred years).
pub const MAX_RETENTION_DAYS: i64 = 36_500;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("{0} must be set")]
    Missing(&'static str),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub bus_url: String,
    /// Postgres + Redis stores instead of the in-memory ones.
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub pool: PoolConfig,
    pub idempotency_retention_days: i64,
    pub strict_credit_config: bool,
    /// Tenants whose consumers start with the process.
    pub warm_tenants: Vec<TenantId>,
    pub http_addr: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bus_url: DEFAULT_BUS_URL.to_string(),
            use_persistent_stores: false,
            database_url: None,
            pool: PoolConfig::default(),
            idempotency_retention_days: DEFAULT_RETENTION_DAYS,
            strict_credit_config: false,
            warm_tenants: Vec::new(),
            http_addr: DEFAULT_HTTP_ADDR.to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or blank keys take their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let use_persistent_stores = parse(&get, "USE_PERSISTENT_STORES")?.unwrap_or(false);
        let database_url = get("DATABASE_URL");
        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let consumer = ConsumerConfig::default()
            .with_group(get("CONSUMER_GROUP").unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string()))
            .with_streams(
                get("EVENT_STREAMS")
                    .map(|raw| list(&raw))
                    .unwrap_or_else(|| DEFAULT_STREAMS.iter().map(|s| s.to_string()).collect()),
            )
            .with_batch_size(positive(&get, "CONSUMER_BATCH_SIZE")?.unwrap_or(10))
            .with_block(Duration::from_millis(parse(&get, "CONSUMER_BLOCK_MS")?.unwrap_or(2000)))
            .with_worker_count(positive(&get, "CONSUMER_WORKERS")?.unwrap_or(4))
            .with_max_retries(parse(&get, "EVENT_MAX_RETRIES")?.unwrap_or(5))
            .with_processing_timeout(Duration::from_millis(
                positive(&get, "EVENT_PROCESSING_TIMEOUT_MS")?.unwrap_or(30_000),
            ));

        let pool = PoolConfig::default()
            .with_max_consumers(positive(&get, "MAX_CONSUMERS")?.unwrap_or(100))
            .with_cleanup_interval(Duration::from_secs(
                positive(&get, "CLEANUP_INTERVAL_SECS")?.unwrap_or(300),
            ))
            .with_idle_timeout(Duration::from_secs(
                positive(&get, "CONSUMER_IDLE_TIMEOUT_SECS")?.unwrap_or(1800),
            ))
            .with_consumer(consumer);

        let warm_tenants = get("WARM_TENANTS")
            .map(|raw| {
                list(&raw)
                    .iter()
                    .map(|t| {
                        TenantId::parse(t).map_err(|_| ConfigError::Invalid {
                            key: "WARM_TENANTS",
                            value: t.clone(),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            bus_url: get("STREAM_BUS_URL")
                .or_else(|| get("REDIS_URL"))
                .unwrap_or_else(|| DEFAULT_BUS_URL.to_string()),
            use_persistent_stores,
            database_url,
            pool,
            idempotency_retention_days: retention_days(&get)?,
            strict_credit_config: parse(&get, "STRICT_CREDIT_CONFIG")?.unwrap_or(false),
            warm_tenants,
            http_addr: get("HTTP_ADDR").unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string()),
        })
    }

    pub fn idempotency_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.idempotency_retention_days.clamp(1, MAX_RETENTION_DAYS))
    }
}

fn retention_days(get: &impl Fn(&str) -> Option<String>) -> Result<i64, ConfigError> {
    const KEY: &str = "IDEMPOTENCY_RETENTION_DAYS";
    match positive::<i64>(get, KEY)? {
        Some(days) if days > MAX_RETENTION_DAYS => Err(ConfigError::Invalid {
            key: KEY,
            value: days.to_string(),
        }),
        days => Ok(days.unwrap_or(DEFAULT_RETENTION_DAYS)),
    }
}

fn parse<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError> {
    get(key)
        .map(|value| value.parse::<T>().map_err(|_| ConfigError::Invalid { key, value }))
        .transpose()
}

fn positive<T>(get: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    match parse::<T>(get, key)? {
        Some(v) if v <= T::default() => Err(ConfigError::Invalid {
            key,
            value: get(key).unwrap_or_default(),
        }),
        other => Ok(other),
    }
}

fn list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
