//! Postgres-backed credit ledger.
//!
//! `commit` runs in one transaction:
//! 1. insert the operation key (`ON CONFLICT DO NOTHING`); an existing key turns
//!    the commit into a replay and the transaction is rolled back
//! 2. write the row with a version guard: `INSERT ... ON CONFLICT DO NOTHING` when
//!    creating (expected version 0), `UPDATE ... WHERE version = $expected` otherwise;
//!    zero affected rows means another writer won and the caller retries
//! 3. insert the activity entry
//!
//! The table's `CHECK (used_credits <= allocated_credits)` backs the balance
//! invariant at the database level as well.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use creditflow_core::{EntityId, TenantId};
use creditflow_credits::{EntityCredit, IdempotencyKey, LedgerOperation, OperationKind};

use super::store::{CommitOutcome, CreditLedgerStore, LedgerCommit, LedgerStoreError};
use crate::activity::postgres::insert_activity;
use crate::db::{SqlFailure, classify};

#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

fn map_error(operation: &str, err: sqlx::Error) -> LedgerStoreError {
    match classify(operation, err) {
        SqlFailure::Unavailable(msg) => LedgerStoreError::Unavailable(msg),
        SqlFailure::CheckViolation(msg) => LedgerStoreError::Corrupt(msg),
        SqlFailure::UniqueViolation(msg) | SqlFailure::Other(msg) => LedgerStoreError::Storage(msg),
    }
}

fn row_to_credit(row: &PgRow) -> Result<EntityCredit, LedgerStoreError> {
    let decode = |e: sqlx::Error| LedgerStoreError::Corrupt(format!("failed to decode ledger row: {e}"));
    let tenant: String = row.try_get("tenant_id").map_err(decode)?;
    let entity: String = row.try_get("entity_id").map_err(decode)?;
    let version: i64 = row.try_get("version").map_err(decode)?;

    EntityCredit::restore(
        TenantId::from(tenant.as_str()),
        EntityId::from(entity.as_str()),
        row.try_get("external_ref").map_err(decode)?,
        row.try_get("allocated_credits").map_err(decode)?,
        row.try_get("used_credits").map_err(decode)?,
        row.try_get("is_active").map_err(decode)?,
        row.try_get("expires_at").map_err(decode)?,
        version.max(0) as u64,
        row.try_get("updated_at").map_err(decode)?,
    )
    .map_err(|e| LedgerStoreError::Corrupt(e.to_string()))
}

fn row_to_operation(row: &PgRow) -> Result<LedgerOperation, LedgerStoreError> {
    let decode = |e: sqlx::Error| LedgerStoreError::Corrupt(format!("failed to decode operation row: {e}"));
    let kind: String = row.try_get("kind").map_err(decode)?;

    Ok(LedgerOperation {
        tenant_id: TenantId::from(row.try_get::<String, _>("tenant_id").map_err(decode)?.as_str()),
        key: IdempotencyKey::from_raw(row.try_get::<String, _>("idempotency_key").map_err(decode)?),
        entity_id: EntityId::from(row.try_get::<String, _>("entity_id").map_err(decode)?.as_str()),
        kind: OperationKind::parse(&kind)
            .ok_or_else(|| LedgerStoreError::Corrupt(format!("unknown operation kind: {kind}")))?,
        amount: row.try_get("amount").map_err(decode)?,
        remaining_credits: row.try_get("remaining_credits").map_err(decode)?,
        recorded_at: row.try_get("recorded_at").map_err(decode)?,
    })
}

async fn select_operation<'e, E>(
    executor: E,
    tenant_id: &TenantId,
    key: &IdempotencyKey,
) -> Result<Option<LedgerOperation>, LedgerStoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        SELECT tenant_id, idempotency_key, entity_id, kind, amount, remaining_credits, recorded_at
        FROM credit_operations
        WHERE tenant_id = $1 AND idempotency_key = $2
        "#,
    )
    .bind(tenant_id.as_str())
    .bind(key.as_str())
    .fetch_optional(executor)
    .await
    .map_err(|e| map_error("find_operation", e))?;

    row.as_ref().map(row_to_operation).transpose()
}

async fn write_row(tx: &mut Transaction<'_, Postgres>, expected: u64, row: &EntityCredit) -> Result<u64, sqlx::Error> {
    let result = match expected {
        0 => {
            sqlx::query(
                r#"
                INSERT INTO entity_credits (
                    tenant_id, entity_id, external_ref, allocated_credits, used_credits,
                    is_active, expires_at, version, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (tenant_id, entity_id) DO NOTHING
                "#,
            )
            .bind(row.tenant_id().as_str())
            .bind(row.entity_id().as_str())
            .bind(row.external_ref())
            .bind(row.allocated_credits())
            .bind(row.used_credits())
            .bind(row.is_active())
            .bind(row.expires_at())
            .bind(row.version() as i64)
            .bind(row.updated_at())
            .execute(&mut **tx)
            .await?
        }
        version => {
            sqlx::query(
                r#"
                UPDATE entity_credits
                SET external_ref = $3,
                    allocated_credits = $4,
                    used_credits = $5,
                    is_active = $6,
                    expires_at = $7,
                    version = $8,
                    updated_at = $9
                WHERE tenant_id = $1 AND entity_id = $2 AND version = $10
                "#,
            )
            .bind(row.tenant_id().as_str())
            .bind(row.entity_id().as_str())
            .bind(row.external_ref())
            .bind(row.allocated_credits())
            .bind(row.used_credits())
            .bind(row.is_active())
            .bind(row.expires_at())
            .bind(row.version() as i64)
            .bind(row.updated_at())
            .bind(version as i64)
            .execute(&mut **tx)
            .await?
        }
    };
    Ok(result.rows_affected())
}

#[async_trait]
impl CreditLedgerStore for PostgresLedgerStore {
    #[instrument(skip(self), fields(tenant_id = %tenant_id, entity = %entity), err)]
    async fn load(&self, tenant_id: &TenantId, entity: &EntityId) -> Result<Option<EntityCredit>, LedgerStoreError> {
        let row = sqlx::query(
            r#"
            SELECT tenant_id, entity_id, external_ref, allocated_credits, used_credits,
                   is_active, expires_at, version, updated_at
            FROM entity_credits
            WHERE tenant_id = $1 AND (entity_id = $2 OR external_ref = $2)
            ORDER BY (entity_id = $2) DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(entity.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_error("load_entity_credit", e))?;

        row.as_ref().map(row_to_credit).transpose()
    }

    async fn find_operation(
        &self,
        tenant_id: &TenantId,
        key: &IdempotencyKey,
    ) -> Result<Option<LedgerOperation>, LedgerStoreError> {
        select_operation(&*self.pool, tenant_id, key).await
    }

    #[instrument(
        skip(self, commit),
        fields(
            tenant_id = %commit.row.tenant_id(),
            entity_id = %commit.row.entity_id(),
            key = %commit.operation.key,
            expected = ?commit.expected,
            outcome = tracing::field::Empty
        ),
        err
    )]
    async fn commit(&self, commit: LedgerCommit) -> Result<CommitOutcome, LedgerStoreError> {
        let expected = commit.expected_version()?;
        let span = Span::current();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_error("begin_transaction", e))?;

        let op = &commit.operation;
        let inserted = sqlx::query(
            r#"
            INSERT INTO credit_operations (
                tenant_id, idempotency_key, entity_id, kind, amount, remaining_credits, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant_id, idempotency_key) DO NOTHING
            "#,
        )
        .bind(op.tenant_id.as_str())
        .bind(op.key.as_str())
        .bind(op.entity_id.as_str())
        .bind(op.kind.as_str())
        .bind(op.amount)
        .bind(op.remaining_credits)
        .bind(op.recorded_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_error("insert_operation", e))?
        .rows_affected();

        if inserted == 0 {
            let existing = select_operation(&mut *tx, &op.tenant_id, &op.key).await?;
            tx.rollback().await.map_err(|e| map_error("rollback", e))?;
            span.record("outcome", "replayed");
            return match existing {
                Some(existing) => Ok(CommitOutcome::Replayed(existing)),
                // Key row vanished between the insert and the read; let the caller retry.
                None => Err(LedgerStoreError::Conflict {
                    entity_id: commit.row.entity_id().clone(),
                    expected: commit.expected,
                }),
            };
        }

        let written = write_row(&mut tx, expected, &commit.row)
            .await
            .map_err(|e| map_error("write_entity_credit", e))?;
        if written == 0 {
            tx.rollback().await.map_err(|e| map_error("rollback", e))?;
            return Err(LedgerStoreError::Conflict {
                entity_id: commit.row.entity_id().clone(),
                expected: commit.expected,
            });
        }

        if let Some(activity) = &commit.activity {
            insert_activity(&mut *tx, activity)
                .await
                .map_err(|e| map_error("insert_activity", e))?;
        }

        tx.commit().await.map_err(|e| map_error("commit_transaction", e))?;
        span.record("outcome", "committed");
        Ok(CommitOutcome::Committed)
    }
}
