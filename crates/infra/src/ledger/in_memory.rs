use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use creditflow_core::{EntityId, TenantId};
use creditflow_credits::{EntityCredit, IdempotencyKey, LedgerOperation};

use super::store::{CommitOutcome, CreditLedgerStore, LedgerCommit, LedgerStoreError};
use crate::activity::InMemoryActivityRecorder;

#[derive(Debug, Default)]
struct LedgerState {
    rows: HashMap<(TenantId, EntityId), EntityCredit>,
    operations: HashMap<(TenantId, IdempotencyKey), LedgerOperation>,
}

impl LedgerState {
    fn find(&self, tenant_id: &TenantId, entity: &EntityId) -> Option<&EntityCredit> {
        self.rows.get(&(tenant_id.clone(), entity.clone())).or_else(|| {
            self.rows
                .iter()
                .find(|((t, _), row)| t == tenant_id && row.matches(entity))
                .map(|(_, row)| row)
        })
    }
}

/// In-memory ledger; one mutex makes every commit a single atomic step.
#[derive(Debug)]
pub struct InMemoryLedgerStore {
    state: Mutex<LedgerState>,
    activity: Arc<InMemoryActivityRecorder>,
}

impl InMemoryLedgerStore {
    pub fn new(activity: Arc<InMemoryActivityRecorder>) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            activity,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LedgerState>, LedgerStoreError> {
        self.state
            .lock()
            .map_err(|_| LedgerStoreError::Storage("ledger lock poisoned".to_string()))
    }
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryActivityRecorder::new()))
    }
}

#[async_trait]
impl CreditLedgerStore for InMemoryLedgerStore {
    async fn load(&self, tenant_id: &TenantId, entity: &EntityId) -> Result<Option<EntityCredit>, LedgerStoreError> {
        Ok(self.lock()?.find(tenant_id, entity).cloned())
    }

    async fn find_operation(
        &self,
        tenant_id: &TenantId,
        key: &IdempotencyKey,
    ) -> Result<Option<LedgerOperation>, LedgerStoreError> {
        Ok(self.lock()?.operations.get(&(tenant_id.clone(), key.clone())).cloned())
    }

    async fn commit(&self, commit: LedgerCommit) -> Result<CommitOutcome, LedgerStoreError> {
        let expected = commit.expected_version()?;
        let mut state = self.lock()?;
        let tenant_id = commit.row.tenant_id().clone();
        let op_key = (tenant_id.clone(), commit.operation.key.clone());

        if let Some(existing) = state.operations.get(&op_key) {
            return Ok(CommitOutcome::Replayed(existing.clone()));
        }

        let row_key = (tenant_id, commit.row.entity_id().clone());
        let current = state.rows.get(&row_key).map(|r| r.version()).unwrap_or(0);
        if expected != current {
            return Err(LedgerStoreError::Conflict {
                entity_id: commit.row.entity_id().clone(),
                expected: commit.expected,
            });
        }

        if let Some(activity) = commit.activity {
            self.activity
                .append(activity)
                .map_err(|e| LedgerStoreError::Storage(e.to_string()))?;
        }
        state.rows.insert(row_key, commit.row);
        state.operations.insert(op_key, commit.operation);
        Ok(CommitOutcome::Committed)
    }
}
