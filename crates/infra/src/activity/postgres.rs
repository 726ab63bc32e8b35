use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row};
use tracing::instrument;

use creditflow_core::{EntityId, OperationCode, TenantId, UserId};
use creditflow_credits::{ActivityRecord, ActivitySource, IdempotencyKey, OperationKind};

use super::{ActivityError, ActivityRecorder, OperationUsage};
use crate::db::{SqlFailure, classify};

/// Postgres-backed activity trail (`credit_activity`).
#[derive(Debug, Clone)]
pub struct PostgresActivityRecorder {
    pool: Arc<PgPool>,
}

impl PostgresActivityRecorder {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

fn map_error(operation: &str, err: sqlx::Error) -> ActivityError {
    match classify(operation, err) {
        SqlFailure::Unavailable(msg) => ActivityError::Unavailable(msg),
        SqlFailure::UniqueViolation(msg) | SqlFailure::CheckViolation(msg) | SqlFailure::Other(msg) => {
            ActivityError::Storage(msg)
        }
    }
}

/// Insert one activity row on any executor (pool or open transaction).
pub(crate) async fn insert_activity<'e, E>(executor: E, record: &ActivityRecord) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO credit_activity (
            activity_id,
            tenant_id,
            entity_id,
            user_id,
            operation_code,
            kind,
            credits,
            balance_after,
            resource_type,
            resource_id,
            idempotency_key,
            source,
            details,
            recorded_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        "#,
    )
    .bind(record.activity_id)
    .bind(record.tenant_id.as_str())
    .bind(record.entity_id.as_str())
    .bind(record.user_id.as_ref().map(|u| u.as_str()))
    .bind(record.operation_code.as_str())
    .bind(record.kind.as_str())
    .bind(record.credits)
    .bind(record.balance_after)
    .bind(record.resource_type.as_deref())
    .bind(record.resource_id.as_deref())
    .bind(record.idempotency_key.as_str())
    .bind(record.source.as_str())
    .bind(&record.details)
    .bind(record.recorded_at)
    .execute(executor)
    .await?;
    Ok(())
}

fn activity_from_row(row: &PgRow) -> Result<ActivityRecord, sqlx::Error> {
    let kind: String = row.try_get("kind")?;
    let source: String = row.try_get("source")?;
    let user_id: Option<String> = row.try_get("user_id")?;

    Ok(ActivityRecord {
        activity_id: row.try_get("activity_id")?,
        tenant_id: TenantId::from(row.try_get::<String, _>("tenant_id")?.as_str()),
        entity_id: EntityId::from(row.try_get::<String, _>("entity_id")?.as_str()),
        user_id: user_id.as_deref().map(UserId::from),
        operation_code: OperationCode::from(row.try_get::<String, _>("operation_code")?.as_str()),
        kind: OperationKind::parse(&kind)
            .ok_or_else(|| sqlx::Error::Decode(format!("unknown activity kind: {kind}").into()))?,
        credits: row.try_get("credits")?,
        balance_after: row.try_get("balance_after")?,
        resource_type: row.try_get("resource_type")?,
        resource_id: row.try_get("resource_id")?,
        idempotency_key: IdempotencyKey::from_raw(row.try_get::<String, _>("idempotency_key")?),
        source: if source == "event" {
            ActivitySource::Event
        } else {
            ActivitySource::Request
        },
        details: row.try_get("details")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

#[async_trait]
impl ActivityRecorder for PostgresActivityRecorder {
    #[instrument(skip(self, record), fields(tenant_id = %record.tenant_id, entity_id = %record.entity_id), err)]
    async fn record(&self, record: ActivityRecord) -> Result<(), ActivityError> {
        insert_activity(&*self.pool, &record)
            .await
            .map_err(|e| map_error("record_activity", e))
    }

    #[instrument(skip(self), err)]
    async fn list_for_entity(
        &self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        limit: usize,
    ) -> Result<Vec<ActivityRecord>, ActivityError> {
        let rows = sqlx::query(
            r#"
            SELECT *
            FROM credit_activity
            WHERE tenant_id = $1 AND entity_id = $2
            ORDER BY recorded_at DESC
            LIMIT $3
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(entity_id.as_str())
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_error("list_activity", e))?;

        rows.iter()
            .map(activity_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ActivityError::Storage(format!("failed to decode activity row: {e}")))
    }

    #[instrument(skip(self), err)]
    async fn usage_summary(
        &self,
        tenant_id: &TenantId,
        since: DateTime<Utc>,
    ) -> Result<Vec<OperationUsage>, ActivityError> {
        let rows = sqlx::query(
            r#"
            SELECT operation_code, COUNT(*) AS operations, COALESCE(SUM(credits), 0)::BIGINT AS credits
            FROM credit_activity
            WHERE tenant_id = $1 AND kind = 'consume' AND recorded_at >= $2
            GROUP BY operation_code
            ORDER BY operation_code
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(since)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_error("usage_summary", e))?;

        rows.iter()
            .map(|row| {
                Ok(OperationUsage {
                    operation_code: OperationCode::from(row.try_get::<String, _>("operation_code")?.as_str()),
                    operations: row.try_get::<i64, _>("operations")?.max(0) as u64,
                    credits: row.try_get("credits")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| ActivityError::Storage(format!("failed to decode usage row: {e}")))
    }
}
