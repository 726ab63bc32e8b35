//! Postgres idempotency ledger (`event_processing` table).
//!
//! Both writes are single upserts guarded by `WHERE status <> 'completed'`, so a
//! completed record can't be downgraded even by concurrent workers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{Span, instrument};

use creditflow_core::{EntityId, EventId, TenantId};

use super::{
    ATTEMPT_IN_PROGRESS, ClaimOutcome, EventIdempotencyStore, EventProcessingRecord, IdempotencyError, ProcessingKey,
    ProcessingResult, ProcessingStatus, default_retention,
};
use crate::db::{SqlFailure, classify};

const COLUMNS: &str = "event_id, event_type, tenant_id, entity_id, status, processed_at, retry_count, \
                       result, error_message, expires_at";

#[derive(Debug, Clone)]
pub struct PostgresIdempotencyStore {
    pool: Arc<PgPool>,
    retention: Duration,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            retention: default_retention(),
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    async fn select(&self, key: &ProcessingKey) -> Result<Option<EventProcessingRecord>, IdempotencyError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM event_processing WHERE event_id = $1 AND event_type = $2 AND tenant_id = $3"
        ))
        .bind(key.event_id.as_str())
        .bind(&key.event_type)
        .bind(key.tenant_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_error("get_processing_record", e))?;

        row.as_ref().map(row_to_record).transpose()
    }
}

fn map_error(operation: &str, err: sqlx::Error) -> IdempotencyError {
    match classify(operation, err) {
        SqlFailure::Unavailable(msg) => IdempotencyError::Unavailable(msg),
        SqlFailure::UniqueViolation(msg) | SqlFailure::CheckViolation(msg) | SqlFailure::Other(msg) => {
            IdempotencyError::Storage(msg)
        }
    }
}

fn row_to_record(row: &PgRow) -> Result<EventProcessingRecord, IdempotencyError> {
    let decode = |e: sqlx::Error| IdempotencyError::Storage(format!("failed to decode processing record: {e}"));
    let status: String = row.try_get("status").map_err(decode)?;
    let event_id: String = row.try_get("event_id").map_err(decode)?;
    let tenant_id: String = row.try_get("tenant_id").map_err(decode)?;
    let entity_id: Option<String> = row.try_get("entity_id").map_err(decode)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(decode)?;

    Ok(EventProcessingRecord {
        key: ProcessingKey::new(
            EventId::from(event_id.as_str()),
            row.try_get::<String, _>("event_type").map_err(decode)?,
            TenantId::from(tenant_id.as_str()),
        ),
        entity_id: entity_id.as_deref().map(EntityId::from),
        status: ProcessingStatus::parse(&status)
            .ok_or_else(|| IdempotencyError::Storage(format!("unknown processing status: {status}")))?,
        processed_at: row.try_get("processed_at").map_err(decode)?,
        retry_count: retry_count.max(0) as u32,
        result: row.try_get::<Option<JsonValue>, _>("result").map_err(decode)?.unwrap_or(JsonValue::Null),
        error_message: row.try_get("error_message").map_err(decode)?,
        expires_at: row.try_get("expires_at").map_err(decode)?,
    })
}

#[async_trait]
impl EventIdempotencyStore for PostgresIdempotencyStore {
    #[instrument(skip(self), fields(key = %key), err)]
    async fn has_processed(&self, key: &ProcessingKey) -> Result<bool, IdempotencyError> {
        let found = sqlx::query(
            r#"
            SELECT 1 FROM event_processing
            WHERE event_id = $1 AND event_type = $2 AND tenant_id = $3 AND status = 'completed'
            "#,
        )
        .bind(key.event_id.as_str())
        .bind(&key.event_type)
        .bind(key.tenant_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_error("has_processed", e))?;

        Ok(found.is_some())
    }

    #[instrument(skip(self, entity_id, now), fields(key = %key, attempt = tracing::field::Empty), err)]
    async fn claim(
        &self,
        key: &ProcessingKey,
        entity_id: Option<&EntityId>,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, IdempotencyError> {
        let claimed = sqlx::query(
            r#"
            INSERT INTO event_processing (
                event_id, event_type, tenant_id, entity_id, status, processed_at,
                retry_count, result, error_message, expires_at
            )
            VALUES ($1, $2, $3, $4, 'failed', $5, 1, 'null'::jsonb, $6, $7)
            ON CONFLICT (event_id, event_type, tenant_id) DO UPDATE SET
                retry_count = event_processing.retry_count + 1,
                status = 'failed',
                processed_at = EXCLUDED.processed_at,
                error_message = EXCLUDED.error_message,
                expires_at = EXCLUDED.expires_at,
                entity_id = COALESCE(event_processing.entity_id, EXCLUDED.entity_id)
            WHERE event_processing.status <> 'completed'
            RETURNING retry_count
            "#,
        )
        .bind(key.event_id.as_str())
        .bind(&key.event_type)
        .bind(key.tenant_id.as_str())
        .bind(entity_id.map(|e| e.as_str()))
        .bind(now)
        .bind(ATTEMPT_IN_PROGRESS)
        .bind(now + self.retention)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_error("claim_event", e))?;

        if let Some(row) = claimed {
            let attempt: i32 = row
                .try_get("retry_count")
                .map_err(|e| IdempotencyError::Storage(format!("failed to decode retry_count: {e}")))?;
            Span::current().record("attempt", attempt);
            return Ok(ClaimOutcome::Claimed {
                attempt: attempt.max(1) as u32,
            });
        }

        // The guarded upsert only skips completed rows.
        match self.select(key).await? {
            Some(record) => Ok(ClaimOutcome::AlreadyCompleted(record)),
            None => Err(IdempotencyError::Storage(format!(
                "processing record {key} vanished during claim"
            ))),
        }
    }

    #[instrument(skip(self, entity_id, result, now), fields(key = %key, status = result.status.as_str()), err)]
    async fn record_result(
        &self,
        key: &ProcessingKey,
        entity_id: Option<&EntityId>,
        result: ProcessingResult,
        now: DateTime<Utc>,
    ) -> Result<EventProcessingRecord, IdempotencyError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO event_processing (
                event_id, event_type, tenant_id, entity_id, status, processed_at,
                retry_count, result, error_message, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 0, $7, $8, $9)
            ON CONFLICT (event_id, event_type, tenant_id) DO UPDATE SET
                status = EXCLUDED.status,
                processed_at = EXCLUDED.processed_at,
                result = EXCLUDED.result,
                error_message = EXCLUDED.error_message,
                expires_at = EXCLUDED.expires_at,
                entity_id = COALESCE(EXCLUDED.entity_id, event_processing.entity_id)
            WHERE event_processing.status <> 'completed'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(key.event_id.as_str())
        .bind(&key.event_type)
        .bind(key.tenant_id.as_str())
        .bind(entity_id.map(|e| e.as_str()))
        .bind(result.status.as_str())
        .bind(now)
        .bind(&result.result)
        .bind(result.error_message.as_deref())
        .bind(now + self.retention)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_error("record_result", e))?;

        match row {
            Some(row) => row_to_record(&row),
            None => self.select(key).await?.ok_or_else(|| {
                IdempotencyError::Storage(format!("processing record {key} vanished during update"))
            }),
        }
    }

    async fn get(&self, key: &ProcessingKey) -> Result<Option<EventProcessingRecord>, IdempotencyError> {
        self.select(key).await
    }

    #[instrument(skip(self), fields(purged = tracing::field::Empty), err)]
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, IdempotencyError> {
        let result = sqlx::query("DELETE FROM event_processing WHERE expires_at <= $1")
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_error("purge_expired", e))?;

        Span::current().record("purged", result.rows_affected());
        Ok(result.rows_affected())
    }
}
