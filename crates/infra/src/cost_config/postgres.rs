use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use creditflow_core::{EntityId, OperationCode, TenantId};
use creditflow_credits::{ConfigSource, CreditConfig};

use super::{ConfigStoreError, CreditConfigStore};
use crate::db::{SqlFailure, classify};

const COLUMNS: &str = "config_id, operation_code, tenant_id, entity_id, credit_cost, is_global, \
                       source, overrides_global, is_active, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresCreditConfigStore {
    pool: Arc<PgPool>,
}

impl PostgresCreditConfigStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

fn map_error(operation: &str, err: sqlx::Error) -> ConfigStoreError {
    match classify(operation, err) {
        SqlFailure::Unavailable(msg) => ConfigStoreError::Unavailable(msg),
        SqlFailure::CheckViolation(msg) => ConfigStoreError::Invalid(msg),
        SqlFailure::UniqueViolation(msg) | SqlFailure::Other(msg) => ConfigStoreError::Storage(msg),
    }
}

fn row_to_config(row: &PgRow) -> Result<CreditConfig, ConfigStoreError> {
    let decode = |e: sqlx::Error| ConfigStoreError::Storage(format!("failed to decode credit config: {e}"));
    let source: String = row.try_get("source").map_err(decode)?;
    let tenant: Option<String> = row.try_get("tenant_id").map_err(decode)?;
    let entity: Option<String> = row.try_get("entity_id").map_err(decode)?;
    let operation: String = row.try_get("operation_code").map_err(decode)?;

    Ok(CreditConfig {
        config_id: row.try_get("config_id").map_err(decode)?,
        operation_code: OperationCode::from(operation.as_str()),
        tenant_id: tenant.as_deref().map(TenantId::from),
        entity_id: entity.as_deref().map(EntityId::from),
        credit_cost: row.try_get("credit_cost").map_err(decode)?,
        is_global: row.try_get("is_global").map_err(decode)?,
        source: ConfigSource::parse(&source)
            .ok_or_else(|| ConfigStoreError::Storage(format!("unknown config source: {source}")))?,
        overrides_global: row.try_get("overrides_global").map_err(decode)?,
        is_active: row.try_get("is_active").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

#[async_trait]
impl CreditConfigStore for PostgresCreditConfigStore {
    #[instrument(skip(self), fields(operation_code = %operation_code), err)]
    async fn configs_for_operation(&self, operation_code: &OperationCode) -> Result<Vec<CreditConfig>, ConfigStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM credit_configs WHERE operation_code = $1"
        ))
        .bind(operation_code.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_error("configs_for_operation", e))?;

        rows.iter().map(row_to_config).collect()
    }

    #[instrument(skip(self, config), fields(config_id = %config.config_id, operation_code = %config.operation_code), err)]
    async fn upsert(&self, config: CreditConfig) -> Result<(), ConfigStoreError> {
        config
            .validate()
            .map_err(|e| ConfigStoreError::Invalid(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO credit_configs (
                config_id, operation_code, tenant_id, entity_id, credit_cost, is_global,
                source, overrides_global, is_active, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (config_id) DO UPDATE SET
                operation_code = EXCLUDED.operation_code,
                tenant_id = EXCLUDED.tenant_id,
                entity_id = EXCLUDED.entity_id,
                credit_cost = EXCLUDED.credit_cost,
                is_global = EXCLUDED.is_global,
                source = EXCLUDED.source,
                overrides_global = EXCLUDED.overrides_global,
                is_active = EXCLUDED.is_active,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&config.config_id)
        .bind(config.operation_code.as_str())
        .bind(config.tenant_id.as_ref().map(|t| t.as_str()))
        .bind(config.entity_id.as_ref().map(|e| e.as_str()))
        .bind(config.credit_cost)
        .bind(config.is_global)
        .bind(config.source.as_str())
        .bind(config.overrides_global)
        .bind(config.is_active)
        .bind(config.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_error("upsert_config", e))?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, config_id: &str) -> Result<bool, ConfigStoreError> {
        let result = sqlx::query("DELETE FROM credit_configs WHERE config_id = $1")
            .bind(config_id)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_error("delete_config", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn list_global(&self) -> Result<Vec<CreditConfig>, ConfigStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM credit_configs WHERE is_global OR tenant_id IS NULL ORDER BY config_id"
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_error("list_global_configs", e))?;

        rows.iter().map(row_to_config).collect()
    }
}
