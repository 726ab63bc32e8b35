use async_trait::async_trait;

use creditflow_core::{EntityId, ExpectedVersion, TenantId};
use creditflow_credits::{ActivityRecord, EntityCredit, IdempotencyKey, LedgerOperation};

#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerStoreError {
    /// The row moved since it was read; reload and retry.
    #[error("ledger row {entity_id} changed concurrently (expected {expected:?})")]
    Conflict {
        entity_id: EntityId,
        expected: ExpectedVersion,
    },

    #[error("ledger store unavailable: {0}")]
    Unavailable(String),

    #[error("ledger store error: {0}")]
    Storage(String),

    #[error("corrupt ledger row: {0}")]
    Corrupt(String),

    /// Commits must name the version they were computed from.
    #[error("unversioned commit for ledger row {entity_id}")]
    Unversioned { entity_id: EntityId },
}

impl LedgerStoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerStoreError::Conflict { .. } | LedgerStoreError::Unavailable(_))
    }
}

/// One atomic ledger write.
///
/// Applied all-or-nothing: the row replaces the stored one only if the stored
/// version still matches `expected`, and the operation key is inserted in the same
/// step. A key that already exists makes the whole commit a no-op replay.
#[derive(Debug, Clone)]
pub struct LedgerCommit {
    pub expected: ExpectedVersion,
    pub row: EntityCredit,
    pub operation: LedgerOperation,
    pub activity: Option<ActivityRecord>,
}

impl LedgerCommit {
    /// The exact stored version this commit replaces (`0` for a new row).
    pub fn expected_version(&self) -> Result<u64, LedgerStoreError> {
        match self.expected {
            ExpectedVersion::Exact(version) => Ok(version),
            ExpectedVersion::Any => Err(LedgerStoreError::Unversioned {
                entity_id: self.row.entity_id().clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The operation key was already committed; nothing was written.
    Replayed(LedgerOperation),
}

/// Persistence port of [`super::CreditLedger`].
///
/// The only write path is [`CreditLedgerStore::commit`]; there is no plain
/// "save row" operation.
#[async_trait]
pub trait CreditLedgerStore: Send + Sync {
    /// Row of `entity` matched by internal id or external reference.
    async fn load(&self, tenant_id: &TenantId, entity: &EntityId) -> Result<Option<EntityCredit>, LedgerStoreError>;

    async fn find_operation(
        &self,
        tenant_id: &TenantId,
        key: &IdempotencyKey,
    ) -> Result<Option<LedgerOperation>, LedgerStoreError>;

    async fn commit(&self, commit: LedgerCommit) -> Result<CommitOutcome, LedgerStoreError>;
}
