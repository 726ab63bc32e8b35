use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;

use creditflow_core::EntityId;

use super::{
    ATTEMPT_IN_PROGRESS, ClaimOutcome, EventIdempotencyStore, EventProcessingRecord, IdempotencyError, ProcessingKey,
    ProcessingResult, ProcessingStatus, default_retention,
};

#[derive(Debug)]
pub struct InMemoryIdempotencyStore {
    records: Mutex<HashMap<ProcessingKey, EventProcessingRecord>>,
    retention: Duration,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::with_retention(default_retention())
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            retention,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<ProcessingKey, EventProcessingRecord>>, IdempotencyError> {
        self.records
            .lock()
            .map_err(|_| IdempotencyError::Storage("idempotency lock poisoned".to_string()))
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All records of one tenant (inspection helper).
    pub fn records_for(&self, tenant_id: &creditflow_core::TenantId) -> Vec<EventProcessingRecord> {
        self.records
            .lock()
            .map(|r| r.values().filter(|rec| &rec.key.tenant_id == tenant_id).cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventIdempotencyStore for InMemoryIdempotencyStore {
    async fn has_processed(&self, key: &ProcessingKey) -> Result<bool, IdempotencyError> {
        Ok(self.lock()?.get(key).is_some_and(|r| r.is_completed()))
    }

    async fn claim(
        &self,
        key: &ProcessingKey,
        entity_id: Option<&EntityId>,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, IdempotencyError> {
        let mut records = self.lock()?;
        let expires_at = now + self.retention;

        let record = records.entry(key.clone()).or_insert_with(|| EventProcessingRecord {
            key: key.clone(),
            entity_id: entity_id.cloned(),
            status: ProcessingStatus::Failed,
            processed_at: now,
            retry_count: 0,
            result: JsonValue::Null,
            error_message: None,
            expires_at,
        });

        if record.is_completed() {
            return Ok(ClaimOutcome::AlreadyCompleted(record.clone()));
        }

        record.retry_count += 1;
        record.status = ProcessingStatus::Failed;
        record.error_message = Some(ATTEMPT_IN_PROGRESS.to_string());
        record.processed_at = now;
        record.expires_at = expires_at;
        if record.entity_id.is_none() {
            record.entity_id = entity_id.cloned();
        }
        Ok(ClaimOutcome::Claimed {
            attempt: record.retry_count,
        })
    }

    async fn record_result(
        &self,
        key: &ProcessingKey,
        entity_id: Option<&EntityId>,
        result: ProcessingResult,
        now: DateTime<Utc>,
    ) -> Result<EventProcessingRecord, IdempotencyError> {
        let mut records = self.lock()?;
        let expires_at = now + self.retention;

        if let Some(existing) = records.get(key)
            && existing.is_completed()
        {
            return Ok(existing.clone());
        }

        let retry_count = records.get(key).map(|r| r.retry_count).unwrap_or(0);
        let stored_entity = records.get(key).and_then(|r| r.entity_id.clone());
        let record = EventProcessingRecord {
            key: key.clone(),
            entity_id: entity_id.cloned().or(stored_entity),
            status: result.status,
            processed_at: now,
            retry_count,
            result: result.result,
            error_message: result.error_message,
            expires_at,
        };
        records.insert(key.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, key: &ProcessingKey) -> Result<Option<EventProcessingRecord>, IdempotencyError> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, IdempotencyError> {
        let mut records = self.lock()?;
        let before = records.len();
        records.retain(|_, r| r.expires_at > now);
        Ok((before - records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use creditflow_core::{EventId, TenantId};
    use serde_json::json;

    fn key(event: &str) -> ProcessingKey {
        ProcessingKey::new(EventId::from(event), "credit.allocated", TenantId::from("T1"))
    }

    #[tokio::test]
    async fn failed_attempts_are_retried_and_counted() {
        let store = InMemoryIdempotencyStore::new();
        let k = key("e1");
        let now = Utc::now();

        assert_eq!(store.claim(&k, None, now).await.unwrap(), ClaimOutcome::Claimed { attempt: 1 });
        store
            .record_result(&k, None, ProcessingResult::failed("ledger unavailable"), now)
            .await
            .unwrap();
        assert!(!store.has_processed(&k).await.unwrap());

        assert_eq!(store.claim(&k, None, now).await.unwrap(), ClaimOutcome::Claimed { attempt: 2 });
        let rec = store
            .record_result(&k, None, ProcessingResult::completed(json!({"allocated": 100})), now)
            .await
            .unwrap();
        assert_eq!(rec.retry_count, 2);
        assert!(store.has_processed(&k).await.unwrap());
    }

    #[tokio::test]
    async fn completed_is_final() {
        let store = InMemoryIdempotencyStore::new();
        let k = key("e1");
        let now = Utc::now();

        store.claim(&k, None, now).await.unwrap();
        store
            .record_result(&k, None, ProcessingResult::completed(json!({"ok": true})), now)
            .await
            .unwrap();

        let again = store.claim(&k, None, now).await.unwrap();
        assert!(matches!(again, ClaimOutcome::AlreadyCompleted(r) if r.retry_count == 1));

        let kept = store
            .record_result(&k, None, ProcessingResult::failed("late failure"), now)
            .await
            .unwrap();
        assert_eq!(kept.status, ProcessingStatus::Completed);
        assert_eq!(kept.result, json!({"ok": true}));
    }

    #[tokio::test]
    async fn keys_are_scoped_by_tenant_and_type() {
        let store = InMemoryIdempotencyStore::new();
        let now = Utc::now();
        let k = key("e1");
        store.record_result(&k, None, ProcessingResult::completed(JsonValue::Null), now).await.unwrap();

        let other_tenant = ProcessingKey::new(EventId::from("e1"), "credit.allocated", TenantId::from("T2"));
        let other_type = ProcessingKey::new(EventId::from("e1"), "credit.consumed", TenantId::from("T1"));
        assert!(!store.has_processed(&other_tenant).await.unwrap());
        assert!(!store.has_processed(&other_type).await.unwrap());
    }

    #[tokio::test]
    async fn purge_drops_only_expired_records() {
        let store = InMemoryIdempotencyStore::with_retention(Duration::days(30));
        let then = Utc::now() - Duration::days(31);
        store.record_result(&key("old"), None, ProcessingResult::skipped("unknown"), then).await.unwrap();
        store.record_result(&key("new"), None, ProcessingResult::skipped("unknown"), Utc::now()).await.unwrap();

        assert_eq!(store.purge_expired(Utc::now()).await.unwrap(), 1);
        assert!(store.get(&key("old")).await.unwrap().is_none());
        assert!(store.get(&key("new")).await.unwrap().is_some());
    }
}
