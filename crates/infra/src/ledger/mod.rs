//! Credit ledger: the only component allowed to mutate `EntityCredit` rows.
//!
//! Every mutation is planned against a freshly loaded row and committed with a
//! compare-and-swap on the row version together with its idempotency key
//! ([`store::LedgerCommit`]). A lost race reloads and re-plans, up to the
//! configured [`RetryPolicy`]; a key that was already committed short-circuits to
//! the stored result, so a repeated call never charges twice.

pub mod in_memory;
pub mod postgres;
pub mod store;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use creditflow_core::{EntityId, EventId, ExpectedVersion, OperationCode, TenantId, UserId};
use creditflow_credits::{
    ActivityRecord, ActivitySource, BalanceSnapshot, CreditError, Credits, EntityCredit, IdempotencyKey,
    LedgerOperation, OperationKind,
};

use crate::retry::RetryPolicy;

pub use in_memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;
pub use store::{CommitOutcome, CreditLedgerStore, LedgerCommit, LedgerStoreError};

/// Operation code recorded on allocation activity entries.
pub const ALLOCATE_OPERATION: &str = "credit.allocate";
/// Operation code recorded on deactivation activity entries.
pub const DEACTIVATE_OPERATION: &str = "credit.deactivate";

#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    /// Business outcome (insufficient credits, no allocation, ...). Never retried.
    #[error(transparent)]
    Credit(#[from] CreditError),

    #[error("ledger row {entity_id} stayed contended after {attempts} attempts")]
    ContentionExhausted { entity_id: EntityId, attempts: u32 },

    #[error(transparent)]
    Store(#[from] LedgerStoreError),
}

impl LedgerError {
    /// Infrastructure trouble the caller should retry with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            LedgerError::Credit(_) => false,
            LedgerError::ContentionExhausted { .. } => true,
            LedgerError::Store(e) => e.is_transient(),
        }
    }

    pub fn credit(&self) -> Option<&CreditError> {
        match self {
            LedgerError::Credit(e) => Some(e),
            _ => None,
        }
    }
}

/// Who/what a consumption is charged for.
#[derive(Debug, Clone)]
pub struct ConsumeContext {
    pub key: IdempotencyKey,
    pub operation_code: OperationCode,
    pub user_id: Option<UserId>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub details: JsonValue,
    pub source: ActivitySource,
}

impl ConsumeContext {
    pub fn new(key: IdempotencyKey, operation_code: OperationCode, source: ActivitySource) -> Self {
        Self {
            key,
            operation_code,
            user_id: None,
            resource_type: None,
            resource_id: None,
            details: JsonValue::Null,
            source,
        }
    }

    /// Context keyed by `(event id, operation code)`.
    pub fn for_event(event_id: &EventId, operation_code: OperationCode) -> Self {
        let key = IdempotencyKey::for_event(event_id, &operation_code);
        Self::new(key, operation_code, ActivitySource::Event)
    }

    /// Context keyed by `(request id, operation code)`.
    pub fn for_request(request_id: Option<&str>, operation_code: OperationCode) -> Self {
        let key = IdempotencyKey::for_request(request_id, &operation_code);
        Self::new(key, operation_code, ActivitySource::Request)
    }

    pub fn with_user(mut self, user_id: Option<UserId>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_resource(mut self, resource_type: Option<String>, resource_id: Option<String>) -> Self {
        self.resource_type = resource_type;
        self.resource_id = resource_id;
        self
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = details;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeReceipt {
    pub success: bool,
    pub credits_deducted: Credits,
    pub remaining_credits: Credits,
    /// The key had already been committed; nothing was charged this time.
    pub replayed: bool,
}

/// Advisory result of [`CreditLedger::check_available`]; not a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Availability {
    pub allowed: bool,
    pub available_credits: Credits,
}

#[derive(Debug, Clone)]
pub struct AllocateRequest {
    pub entity_id: EntityId,
    pub amount: Credits,
    pub expires_at: Option<DateTime<Utc>>,
    pub external_ref: Option<String>,
    pub key: IdempotencyKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationReceipt {
    pub allocated_credits: Credits,
    pub available_credits: Credits,
    pub replayed: bool,
}

struct Applied {
    operation: LedgerOperation,
    replayed: bool,
}

pub struct CreditLedger {
    store: Arc<dyn CreditLedgerStore>,
    conflict_retry: RetryPolicy,
}

impl std::fmt::Debug for CreditLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditLedger")
            .field("conflict_retry", &self.conflict_retry)
            .finish_non_exhaustive()
    }
}

impl CreditLedger {
    pub fn new(store: Arc<dyn CreditLedgerStore>) -> Self {
        Self {
            store,
            conflict_retry: RetryPolicy::ledger_conflicts(),
        }
    }

    pub fn with_conflict_retry(mut self, policy: RetryPolicy) -> Self {
        self.conflict_retry = policy;
        self
    }

    pub async fn balance(&self, tenant_id: &TenantId, entity: &EntityId) -> Result<Option<BalanceSnapshot>, LedgerError> {
        Ok(self.store.load(tenant_id, entity).await?.map(|row| row.snapshot()))
    }

    pub async fn check_available(
        &self,
        tenant_id: &TenantId,
        entity: &EntityId,
        required: Credits,
    ) -> Result<Availability, LedgerError> {
        let Some(row) = self.store.load(tenant_id, entity).await? else {
            return Ok(Availability {
                allowed: false,
                available_credits: 0,
            });
        };

        let available = row.available_credits();
        Ok(Availability {
            allowed: row.ensure_consumable(Utc::now()).is_ok() && available >= required,
            available_credits: available,
        })
    }

    /// Debit `amount` from the entity's balance, atomically and at most once per key.
    pub async fn consume(
        &self,
        tenant_id: &TenantId,
        entity: &EntityId,
        amount: Credits,
        ctx: ConsumeContext,
    ) -> Result<ConsumeReceipt, LedgerError> {
        let applied = self
            .apply(tenant_id, entity, &ctx.key, |current, now| {
                let row = current.ok_or_else(|| CreditError::NoActiveAllocation {
                    tenant_id: tenant_id.clone(),
                    entity_id: entity.clone(),
                })?;
                let next = row.debit(amount, now)?;
                let remaining = next.available_credits();

                let activity = ActivityRecord::new(
                    tenant_id.clone(),
                    next.entity_id().clone(),
                    ctx.operation_code.clone(),
                    OperationKind::Consume,
                    amount,
                    ctx.key.clone(),
                    ctx.source,
                )
                .with_user(ctx.user_id.clone())
                .with_resource(ctx.resource_type.clone(), ctx.resource_id.clone())
                .with_details(ctx.details.clone())
                .settled(remaining, now);

                Ok(Some(LedgerCommit {
                    expected: ExpectedVersion::Exact(row.version()),
                    operation: operation(tenant_id, &ctx.key, &next, OperationKind::Consume, amount, now),
                    row: next,
                    activity: Some(activity),
                }))
            })
            .await?
            .ok_or_else(|| CreditError::NoActiveAllocation {
                tenant_id: tenant_id.clone(),
                entity_id: entity.clone(),
            })?;

        let receipt = ConsumeReceipt {
            success: true,
            credits_deducted: applied.operation.amount,
            remaining_credits: applied.operation.remaining_credits,
            replayed: applied.replayed,
        };
        info!(
            tenant_id = %tenant_id,
            entity_id = %entity,
            operation = %ctx.operation_code,
            key = %ctx.key,
            credits = receipt.credits_deducted,
            remaining = receipt.remaining_credits,
            replayed = receipt.replayed,
            "credits consumed"
        );
        Ok(receipt)
    }

    /// Add credits, creating the row on first allocation and reactivating it.
    pub async fn allocate(&self, tenant_id: &TenantId, request: AllocateRequest) -> Result<AllocationReceipt, LedgerError> {
        let AllocateRequest {
            entity_id,
            amount,
            expires_at,
            external_ref,
            key,
        } = request;

        let applied = self
            .apply(tenant_id, &entity_id, &key, |current, now| {
                let (expected, next) = match current {
                    Some(row) => (
                        ExpectedVersion::Exact(row.version()),
                        row.allocate(amount, expires_at, now)?
                            .with_external_ref(external_ref.clone()),
                    ),
                    None => (
                        ExpectedVersion::absent(),
                        EntityCredit::open(tenant_id.clone(), entity_id.clone(), external_ref.clone(), now)
                            .allocate(amount, expires_at, now)?,
                    ),
                };

                let activity = ActivityRecord::new(
                    tenant_id.clone(),
                    next.entity_id().clone(),
                    OperationCode::from(ALLOCATE_OPERATION),
                    OperationKind::Allocate,
                    amount,
                    key.clone(),
                    ActivitySource::Event,
                )
                .settled(next.available_credits(), now);

                Ok(Some(LedgerCommit {
                    expected,
                    operation: operation(tenant_id, &key, &next, OperationKind::Allocate, amount, now),
                    row: next,
                    activity: Some(activity),
                }))
            })
            .await?
            .ok_or(CreditError::InvalidAmount(amount))?;

        info!(
            tenant_id = %tenant_id,
            entity_id = %entity_id,
            amount,
            replayed = applied.replayed,
            "credits allocated"
        );

        let balance = self.balance(tenant_id, &entity_id).await?;
        Ok(AllocationReceipt {
            allocated_credits: balance.map(|b| b.allocated_credits).unwrap_or(applied.operation.amount),
            available_credits: applied.operation.remaining_credits,
            replayed: applied.replayed,
        })
    }

    /// Deactivate the entity's row. `None` when there is no row or it is
    /// already inactive.
    pub async fn deactivate(
        &self,
        tenant_id: &TenantId,
        entity: &EntityId,
        key: IdempotencyKey,
    ) -> Result<Option<BalanceSnapshot>, LedgerError> {
        let applied = self
            .apply(tenant_id, entity, &key, |current, now| {
                let Some(row) = current.filter(|r| r.is_active()) else {
                    return Ok(None);
                };
                let next = row.deactivate(now);
                let activity = ActivityRecord::new(
                    tenant_id.clone(),
                    next.entity_id().clone(),
                    OperationCode::from(DEACTIVATE_OPERATION),
                    OperationKind::Deactivate,
                    0,
                    key.clone(),
                    ActivitySource::Event,
                )
                .settled(next.available_credits(), now);

                Ok(Some(LedgerCommit {
                    expected: ExpectedVersion::Exact(row.version()),
                    operation: operation(tenant_id, &key, &next, OperationKind::Deactivate, 0, now),
                    row: next,
                    activity: Some(activity),
                }))
            })
            .await?;

        match applied {
            Some(a) if !a.replayed => Ok(self.balance(tenant_id, entity).await?),
            _ => Ok(None),
        }
    }

    /// Replay check, load, plan, compare-and-swap; re-plan on conflicts.
    ///
    /// `plan` returning `Ok(None)` means "nothing to write".
    async fn apply<F>(
        &self,
        tenant_id: &TenantId,
        entity: &EntityId,
        key: &IdempotencyKey,
        mut plan: F,
    ) -> Result<Option<Applied>, LedgerError>
    where
        F: FnMut(Option<&EntityCredit>, DateTime<Utc>) -> Result<Option<LedgerCommit>, LedgerError> + Send,
    {
        let mut retries = 0u32;
        loop {
            if let Some(operation) = self.store.find_operation(tenant_id, key).await? {
                return Ok(Some(Applied {
                    operation,
                    replayed: true,
                }));
            }

            let current = self.store.load(tenant_id, entity).await?;
            let Some(commit) = plan(current.as_ref(), Utc::now())? else {
                return Ok(None);
            };
            let operation = commit.operation.clone();

            match self.store.commit(commit).await {
                Ok(CommitOutcome::Committed) => {
                    return Ok(Some(Applied {
                        operation,
                        replayed: false,
                    }));
                }
                Ok(CommitOutcome::Replayed(operation)) => {
                    return Ok(Some(Applied {
                        operation,
                        replayed: true,
                    }));
                }
                Err(LedgerStoreError::Conflict { .. }) if self.conflict_retry.should_retry(retries) => {
                    retries += 1;
                    debug!(tenant_id = %tenant_id, entity_id = %entity, retries, "ledger conflict, re-planning");
                    tokio::time::sleep(self.conflict_retry.delay_for_attempt(retries)).await;
                }
                Err(LedgerStoreError::Conflict { entity_id, .. }) => {
                    return Err(LedgerError::ContentionExhausted {
                        entity_id,
                        attempts: retries + 1,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn operation(
    tenant_id: &TenantId,
    key: &IdempotencyKey,
    next: &EntityCredit,
    kind: OperationKind,
    amount: Credits,
    now: DateTime<Utc>,
) -> LedgerOperation {
    LedgerOperation {
        tenant_id: tenant_id.clone(),
        key: key.clone(),
        entity_id: next.entity_id().clone(),
        kind,
        amount,
        remaining_credits: next.available_credits(),
        recorded_at: now,
    }
}
