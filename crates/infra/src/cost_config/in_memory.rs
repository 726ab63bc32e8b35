use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use creditflow_core::OperationCode;
use creditflow_credits::CreditConfig;

use super::{ConfigStoreError, CreditConfigStore};

#[derive(Debug, Default)]
pub struct InMemoryCreditConfigStore {
    configs: RwLock<HashMap<String, CreditConfig>>,
}

impl InMemoryCreditConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with `configs`.
    pub fn with_configs(configs: impl IntoIterator<Item = CreditConfig>) -> Self {
        let store = Self::new();
        if let Ok(mut map) = store.configs.write() {
            map.extend(configs.into_iter().map(|c| (c.config_id.clone(), c)));
        }
        store
    }

    pub fn len(&self) -> usize {
        self.configs.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> ConfigStoreError {
    ConfigStoreError::Storage("config store lock poisoned".to_string())
}

#[async_trait]
impl CreditConfigStore for InMemoryCreditConfigStore {
    async fn configs_for_operation(&self, operation_code: &OperationCode) -> Result<Vec<CreditConfig>, ConfigStoreError> {
        let map = self.configs.read().map_err(|_| poisoned())?;
        Ok(map
            .values()
            .filter(|c| &c.operation_code == operation_code)
            .cloned()
            .collect())
    }

    async fn upsert(&self, config: CreditConfig) -> Result<(), ConfigStoreError> {
        config
            .validate()
            .map_err(|e| ConfigStoreError::Invalid(e.to_string()))?;
        self.configs
            .write()
            .map_err(|_| poisoned())?
            .insert(config.config_id.clone(), config);
        Ok(())
    }

    async fn delete(&self, config_id: &str) -> Result<bool, ConfigStoreError> {
        Ok(self.configs.write().map_err(|_| poisoned())?.remove(config_id).is_some())
    }

    async fn list_global(&self) -> Result<Vec<CreditConfig>, ConfigStoreError> {
        let map = self.configs.read().map_err(|_| poisoned())?;
        let mut globals: Vec<_> = map.values().filter(|c| c.is_global_scope()).cloned().collect();
        globals.sort_by(|a, b| a.config_id.cmp(&b.config_id));
        Ok(globals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_negative_costs() {
        let store = InMemoryCreditConfigStore::new();
        let err = store
            .upsert(CreditConfig::global("crm.leads.create", -1))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigStoreError::Invalid(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn filters_by_operation_and_scope() {
        let store = InMemoryCreditConfigStore::with_configs([
            CreditConfig::global("crm.leads.create", 5).with_id("g1"),
            CreditConfig::tenant("crm.leads.create", "T1", 2).with_id("t1"),
            CreditConfig::global("crm.tickets.create", 1).with_id("g2"),
        ]);

        let leads = store
            .configs_for_operation(&OperationCode::from("crm.leads.create"))
            .await
            .unwrap();
        assert_eq!(leads.len(), 2);

        let globals: Vec<_> = store
            .list_global()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.config_id)
            .collect();
        assert_eq!(globals, vec!["g1".to_string(), "g2".to_string()]);

        assert!(store.delete("g2").await.unwrap());
        assert!(!store.delete("g2").await.unwrap());
    }
}
