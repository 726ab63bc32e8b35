//! Credit cost configuration: storage port plus the caching resolver.

pub mod in_memory;
pub mod postgres;
pub mod resolver;

use async_trait::async_trait;

use creditflow_core::OperationCode;
use creditflow_credits::CreditConfig;

pub use in_memory::InMemoryCreditConfigStore;
pub use postgres::PostgresCreditConfigStore;
pub use resolver::{CacheStats, CreditConfigResolver, ResolveError, ResolvedCost, SyncReport};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigStoreError {
    #[error("invalid credit config: {0}")]
    Invalid(String),

    #[error("config store unavailable: {0}")]
    Unavailable(String),

    #[error("config store error: {0}")]
    Storage(String),
}

impl ConfigStoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ConfigStoreError::Unavailable(_))
    }
}

/// Persistence of [`CreditConfig`] rows.
///
/// Stores are dumb: they never apply precedence. Superseded rows are kept and
/// masked at resolution time.
#[async_trait]
pub trait CreditConfigStore: Send + Sync {
    /// Every row (active or not) for an operation code, any scope.
    async fn configs_for_operation(&self, operation_code: &OperationCode) -> Result<Vec<CreditConfig>, ConfigStoreError>;

    /// Insert or replace by `config_id`.
    async fn upsert(&self, config: CreditConfig) -> Result<(), ConfigStoreError>;

    /// Returns whether a row was removed.
    async fn delete(&self, config_id: &str) -> Result<bool, ConfigStoreError>;

    /// Rows in global scope (`is_global` or tenant-less).
    async fn list_global(&self) -> Result<Vec<CreditConfig>, ConfigStoreError>;
}
