use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use creditflow_core::{EntityId, OperationCode, TenantId};
use creditflow_credits::{ActivityRecord, Credits, OperationKind};

use super::{ActivityError, ActivityRecorder, OperationUsage};

#[derive(Debug, Default)]
pub struct InMemoryActivityRecorder {
    records: RwLock<Vec<ActivityRecord>>,
}

impl InMemoryActivityRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append synchronously; used by the in-memory ledger inside its commit.
    pub(crate) fn append(&self, record: ActivityRecord) -> Result<(), ActivityError> {
        self.records
            .write()
            .map_err(|_| ActivityError::Storage("activity lock poisoned".to_string()))?
            .push(record);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ActivityRecorder for InMemoryActivityRecorder {
    async fn record(&self, record: ActivityRecord) -> Result<(), ActivityError> {
        self.append(record)
    }

    async fn list_for_entity(
        &self,
        tenant_id: &TenantId,
        entity_id: &EntityId,
        limit: usize,
    ) -> Result<Vec<ActivityRecord>, ActivityError> {
        let records = self
            .records
            .read()
            .map_err(|_| ActivityError::Storage("activity lock poisoned".to_string()))?;

        Ok(records
            .iter()
            .rev()
            .filter(|r| &r.tenant_id == tenant_id && &r.entity_id == entity_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn usage_summary(
        &self,
        tenant_id: &TenantId,
        since: DateTime<Utc>,
    ) -> Result<Vec<OperationUsage>, ActivityError> {
        let records = self
            .records
            .read()
            .map_err(|_| ActivityError::Storage("activity lock poisoned".to_string()))?;

        let mut totals: BTreeMap<OperationCode, (u64, Credits)> = BTreeMap::new();
        for r in records.iter().filter(|r| {
            &r.tenant_id == tenant_id && r.kind == OperationKind::Consume && r.recorded_at >= since
        }) {
            let entry = totals.entry(r.operation_code.clone()).or_default();
            entry.0 += 1;
            entry.1 += r.credits;
        }

        Ok(totals
            .into_iter()
            .map(|(operation_code, (operations, credits))| OperationUsage {
                operation_code,
                operations,
                credits,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use creditflow_credits::{ActivitySource, IdempotencyKey};

    fn consume(tenant: &str, entity: &str, op: &str, credits: Credits) -> ActivityRecord {
        ActivityRecord::new(
            TenantId::from(tenant),
            EntityId::from(entity),
            OperationCode::from(op),
            OperationKind::Consume,
            credits,
            IdempotencyKey::from_raw(uuid::Uuid::now_v7().to_string()),
            ActivitySource::Request,
        )
    }

    #[tokio::test]
    async fn lists_newest_first_within_tenant_and_entity() {
        let rec = InMemoryActivityRecorder::new();
        rec.record(consume("T1", "E1", "crm.leads.create", 2)).await.unwrap();
        rec.record(consume("T1", "E1", "crm.tickets.create", 3)).await.unwrap();
        rec.record(consume("T2", "E1", "crm.leads.create", 9)).await.unwrap();

        let list = rec
            .list_for_entity(&TenantId::from("T1"), &EntityId::from("E1"), 10)
            .await
            .unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].operation_code.as_str(), "crm.tickets.create");
    }

    #[tokio::test]
    async fn usage_summary_totals_consumption_per_operation() {
        let rec = InMemoryActivityRecorder::new();
        rec.record(consume("T1", "E1", "crm.leads.create", 2)).await.unwrap();
        rec.record(consume("T1", "E2", "crm.leads.create", 2)).await.unwrap();
        rec.record(consume("T1", "E1", "crm.quotes.create", 5)).await.unwrap();

        let summary = rec
            .usage_summary(&TenantId::from("T1"), Utc::now() - chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(
            summary,
            vec![
                OperationUsage {
                    operation_code: OperationCode::from("crm.leads.create"),
                    operations: 2,
                    credits: 4,
                },
                OperationUsage {
                    operation_code: OperationCode::from("crm.quotes.create"),
                    operations: 1,
                    credits: 5,
                },
            ]
        );
    }
}
