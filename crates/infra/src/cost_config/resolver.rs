//! Caching front of the credit config precedence rules.
//!
//! Resolutions (including "nothing configured") are memoized per
//! `(operation, tenant, entity)` for a TTL. Every write that goes through the
//! resolver drops the cached entries of the affected operation code and bumps
//! its generation, so a read that started before the write cannot repopulate
//! the cache with what it saw. Expired entries are swept on insert once the
//! cache grows past [`SWEEP_THRESHOLD`] and on every [`CreditConfigResolver::evict_expired`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use creditflow_core::{EntityId, OperationCode, TenantId};
use creditflow_credits::{CreditConfig, Credits, PrecedenceRule, ResolveQuery, resolve_config};

use super::{ConfigStoreError, CreditConfigStore};

const DEFAULT_TTL: Duration = Duration::from_secs(60);
const SWEEP_THRESHOLD: usize = 4096;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    /// No active config exists for the operation at any scope.
    #[error("no credit cost configured for {operation_code}")]
    NotFound { operation_code: OperationCode },

    #[error(transparent)]
    Store(#[from] ConfigStoreError),
}

impl ResolveError {
    pub fn is_transient(&self) -> bool {
        match self {
            ResolveError::NotFound { .. } => false,
            ResolveError::Store(e) => e.is_transient(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ResolveError::NotFound { .. })
    }
}

/// Effective config and the precedence rule that selected it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedCost {
    pub config: CreditConfig,
    pub rule: PrecedenceRule,
}

impl ResolvedCost {
    pub fn credit_cost(&self) -> Credits {
        self.config.credit_cost
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub upserted: usize,
    pub deleted: usize,
}

type CacheKey = (OperationCode, TenantId, Option<EntityId>);

struct CacheEntry {
    resolved: Option<ResolvedCost>,
    fetched_at: Instant,
}

/// `(epoch, per-operation generation)` observed before a store read.
type Generation = (u64, u64);

#[derive(Default)]
struct Cache {
    entries: HashMap<CacheKey, CacheEntry>,
    generations: HashMap<OperationCode, u64>,
    epoch: u64,
}

impl Cache {
    fn generation(&self, operation_code: &OperationCode) -> Generation {
        (self.epoch, self.generations.get(operation_code).copied().unwrap_or(0))
    }

    fn sweep(&mut self, ttl: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.fetched_at.elapsed() < ttl);
        before - self.entries.len()
    }
}

pub struct CreditConfigResolver {
    store: Arc<dyn CreditConfigStore>,
    cache: RwLock<Cache>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for CreditConfigResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditConfigResolver")
            .field("ttl", &self.ttl)
            .field("stats", &self.cache_stats())
            .finish_non_exhaustive()
    }
}

impl CreditConfigResolver {
    pub fn new(store: Arc<dyn CreditConfigStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(Cache::default()),
            ttl: DEFAULT_TTL,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// `Duration::ZERO` disables caching.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Effective config for the query, or [`ResolveError::NotFound`].
    pub async fn resolve(
        &self,
        operation_code: &OperationCode,
        tenant_id: &TenantId,
        entity_id: Option<&EntityId>,
    ) -> Result<ResolvedCost, ResolveError> {
        self.try_resolve(operation_code, tenant_id, entity_id)
            .await?
            .ok_or_else(|| ResolveError::NotFound {
                operation_code: operation_code.clone(),
            })
    }

    /// Like [`Self::resolve`] with "nothing configured" as `None`.
    pub async fn try_resolve(
        &self,
        operation_code: &OperationCode,
        tenant_id: &TenantId,
        entity_id: Option<&EntityId>,
    ) -> Result<Option<ResolvedCost>, ConfigStoreError> {
        let key: CacheKey = (operation_code.clone(), tenant_id.clone(), entity_id.cloned());

        if let Some(cached) = self.cached(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let observed = self.cache.read().ok().map(|c| c.generation(operation_code));
        let configs = self.store.configs_for_operation(operation_code).await?;
        let query = ResolveQuery::new(operation_code, tenant_id, entity_id);
        let resolved = resolve_config(&configs, &query).map(|r| ResolvedCost {
            config: r.config.clone(),
            rule: r.rule,
        });

        match &resolved {
            Some(r) if r.rule.is_data_quality_fallback() => warn!(
                data_quality = true,
                operation_code = %operation_code,
                tenant_id = %tenant_id,
                entity_id = ?entity_id.map(|e| e.as_str()),
                config_id = %r.config.config_id,
                source = r.config.source.as_str(),
                "credit config resolved only by last-resort fallback; check source/tenant fields"
            ),
            Some(r) => debug!(
                operation_code = %operation_code,
                tenant_id = %tenant_id,
                rule = r.rule.as_str(),
                cost = r.config.credit_cost,
                "credit config resolved"
            ),
            None => debug!(operation_code = %operation_code, tenant_id = %tenant_id, "no credit config"),
        }

        if !self.ttl.is_zero()
            && let Some(observed) = observed
            && let Ok(mut cache) = self.cache.write()
        {
            if cache.generation(operation_code) != observed {
                debug!(operation_code = %operation_code, "config changed during resolution; not caching");
                return Ok(resolved);
            }
            if cache.entries.len() >= SWEEP_THRESHOLD {
                cache.sweep(self.ttl);
            }
            cache.entries.insert(
                key,
                CacheEntry {
                    resolved: resolved.clone(),
                    fetched_at: Instant::now(),
                },
            );
        }
        Ok(resolved)
    }

    fn cached(&self, key: &CacheKey) -> Option<Option<ResolvedCost>> {
        let cache = self.cache.read().ok()?;
        let entry = cache.entries.get(key)?;
        (entry.fetched_at.elapsed() < self.ttl).then(|| entry.resolved.clone())
    }

    /// Validate and store a config (admin edit or `credit_config.updated` event).
    pub async fn apply_update(&self, config: CreditConfig) -> Result<(), ConfigStoreError> {
        config
            .validate()
            .map_err(|e| ConfigStoreError::Invalid(e.to_string()))?;
        let operation_code = config.operation_code.clone();
        self.store.upsert(config).await?;
        self.invalidate_operation(&operation_code);
        Ok(())
    }

    pub async fn remove(&self, config_id: &str, operation_code: &OperationCode) -> Result<bool, ConfigStoreError> {
        let removed = self.store.delete(config_id).await?;
        self.invalidate_operation(operation_code);
        Ok(removed)
    }

    /// Replace the global defaults with `configs`.
    ///
    /// Given rows are upserted; stored global rows whose operation code is absent
    /// from `configs` are orphans and get deleted. Tenant/entity rows are never
    /// touched here.
    pub async fn sync_global_configs(&self, configs: Vec<CreditConfig>) -> Result<SyncReport, ConfigStoreError> {
        let mut report = SyncReport::default();
        let mut present: HashSet<OperationCode> = HashSet::new();

        for config in configs {
            if !config.is_global_scope() {
                warn!(
                    config_id = %config.config_id,
                    operation_code = %config.operation_code,
                    "skipping non-global row in global config sync"
                );
                continue;
            }
            present.insert(config.operation_code.clone());
            self.store.upsert(config).await?;
            report.upserted += 1;
        }

        for stale in self.store.list_global().await? {
            if !present.contains(&stale.operation_code) && self.store.delete(&stale.config_id).await? {
                report.deleted += 1;
            }
        }

        self.invalidate();
        info!(upserted = report.upserted, deleted = report.deleted, "global credit configs synced");
        Ok(report)
    }

    pub fn invalidate(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.entries.clear();
            cache.epoch += 1;
        }
    }

    pub fn invalidate_operation(&self, operation_code: &OperationCode) {
        if let Ok(mut cache) = self.cache.write() {
            cache.entries.retain(|(op, _, _), _| op != operation_code);
            *cache.generations.entry(operation_code.clone()).or_insert(0) += 1;
        }
    }

    /// Drop entries older than the TTL; returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        match self.cache.write() {
            Ok(mut cache) => cache.sweep(self.ttl),
            Err(_) => 0,
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            entries: self.cache.read().map(|c| c.entries.len()).unwrap_or(0),
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost_config::InMemoryCreditConfigStore;

    const OP: &str = "crm.leads.create";

    fn resolver(configs: Vec<CreditConfig>) -> (CreditConfigResolver, Arc<InMemoryCreditConfigStore>) {
        let store = Arc::new(InMemoryCreditConfigStore::with_configs(configs));
        (CreditConfigResolver::new(store.clone()), store)
    }

    #[tokio::test]
    async fn tenant_override_beats_global_and_other_tenants_fall_back() {
        let (resolver, _) = resolver(vec![
            CreditConfig::global(OP, 5).with_id("g"),
            CreditConfig::tenant(OP, "T1", 2).with_id("t1"),
        ]);
        let op = OperationCode::from(OP);

        let t1 = resolver.resolve(&op, &TenantId::from("T1"), None).await.unwrap();
        assert_eq!(t1.credit_cost(), 2);
        assert_eq!(t1.rule, PrecedenceRule::TenantOverride);

        let t2 = resolver.resolve(&op, &TenantId::from("T2"), None).await.unwrap();
        assert_eq!(t2.credit_cost(), 5);
        assert_eq!(t2.rule, PrecedenceRule::Global);
    }

    #[tokio::test]
    async fn not_found_only_when_nothing_matches_the_operation() {
        let (resolver, _) = resolver(vec![CreditConfig::global("crm.tickets.create", 1)]);
        let err = resolver
            .resolve(&OperationCode::from(OP), &TenantId::from("T1"), None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn cache_counts_hits_and_updates_invalidate() {
        let (resolver, _) = resolver(vec![CreditConfig::global(OP, 5).with_id("g")]);
        let op = OperationCode::from(OP);
        let tenant = TenantId::from("T1");

        resolver.resolve(&op, &tenant, None).await.unwrap();
        resolver.resolve(&op, &tenant, None).await.unwrap();
        let stats = resolver.cache_stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);

        resolver
            .apply_update(CreditConfig::tenant(OP, "T1", 3).with_id("t1"))
            .await
            .unwrap();
        assert_eq!(resolver.resolve(&op, &tenant, None).await.unwrap().credit_cost(), 3);
    }

    #[tokio::test]
    async fn missing_configs_are_cached_too() {
        let (resolver, store) = resolver(vec![]);
        let op = OperationCode::from(OP);
        let tenant = TenantId::from("T1");

        assert!(resolver.try_resolve(&op, &tenant, None).await.unwrap().is_none());
        // Written behind the resolver's back: stays invisible until invalidated.
        store.upsert(CreditConfig::global(OP, 4)).await.unwrap();
        assert!(resolver.try_resolve(&op, &tenant, None).await.unwrap().is_none());

        resolver.invalidate();
        assert_eq!(resolver.try_resolve(&op, &tenant, None).await.unwrap().map(|r| r.credit_cost()), Some(4));
    }

    #[tokio::test]
    async fn global_sync_deletes_orphans_but_keeps_tenant_rows() {
        let (resolver, store) = resolver(vec![
            CreditConfig::global(OP, 5).with_id("g-leads"),
            CreditConfig::global("crm.quotes.create", 7).with_id("g-quotes"),
            CreditConfig::tenant("crm.quotes.create", "T1", 1).with_id("t-quotes"),
        ]);

        let report = resolver
            .sync_global_configs(vec![
                CreditConfig::global(OP, 6).with_id("g-leads"),
                CreditConfig::tenant(OP, "T1", 9),
            ])
            .await
            .unwrap();
        assert_eq!(report, SyncReport { upserted: 1, deleted: 1 });
        assert_eq!(store.len(), 2);

        let quotes = resolver
            .resolve(&OperationCode::from("crm.quotes.create"), &TenantId::from("T1"), None)
            .await
            .unwrap();
        assert_eq!(quotes.config.config_id, "t-quotes");
    }

    #[tokio::test]
    async fn zero_ttl_disables_the_cache() {
        let (resolver, _) = resolver(vec![CreditConfig::global(OP, 5)]);
        let resolver = resolver.with_ttl(Duration::ZERO);
        let op = OperationCode::from(OP);

        resolver.resolve(&op, &TenantId::from("T1"), None).await.unwrap();
        resolver.resolve(&op, &TenantId::from("T1"), None).await.unwrap();
        assert_eq!(resolver.cache_stats().hits, 0);
        assert_eq!(resolver.cache_stats().entries, 0);
    }

    /// Takes its snapshot, then parks until released.
    struct GatedStore {
        inner: InMemoryCreditConfigStore,
        snapshot_taken: tokio::sync::Notify,
        release: tokio::sync::Notify,
        gated: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl CreditConfigStore for GatedStore {
        async fn configs_for_operation(&self, operation_code: &OperationCode) -> Result<Vec<CreditConfig>, ConfigStoreError> {
            let rows = self.inner.configs_for_operation(operation_code).await?;
            if self.gated.swap(false, Ordering::SeqCst) {
                self.snapshot_taken.notify_one();
                self.release.notified().await;
            }
            Ok(rows)
        }

        async fn upsert(&self, config: CreditConfig) -> Result<(), ConfigStoreError> {
            self.inner.upsert(config).await
        }

        async fn delete(&self, config_id: &str) -> Result<bool, ConfigStoreError> {
            self.inner.delete(config_id).await
        }

        async fn list_global(&self) -> Result<Vec<CreditConfig>, ConfigStoreError> {
            self.inner.list_global().await
        }
    }

    #[tokio::test]
    async fn update_during_a_read_is_not_masked_by_the_stale_result() {
        let store = Arc::new(GatedStore {
            inner: InMemoryCreditConfigStore::with_configs(vec![CreditConfig::global(OP, 5).with_id("g")]),
            snapshot_taken: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
            gated: std::sync::atomic::AtomicBool::new(true),
        });
        let resolver = Arc::new(CreditConfigResolver::new(store.clone()));
        let op = OperationCode::from(OP);

        let reader = {
            let resolver = resolver.clone();
            let op = op.clone();
            tokio::spawn(async move { resolver.resolve(&op, &TenantId::from("T1"), None).await })
        };
        store.snapshot_taken.notified().await;
        resolver
            .apply_update(CreditConfig::tenant(OP, "T1", 3).with_id("t1"))
            .await
            .unwrap();
        store.release.notify_one();

        // The in-flight read saw the old rows but must not cache them.
        assert_eq!(reader.await.unwrap().unwrap().credit_cost(), 5);
        assert_eq!(resolver.cache_stats().entries, 0);
        assert_eq!(resolver.resolve(&op, &TenantId::from("T1"), None).await.unwrap().credit_cost(), 3);
    }

    #[tokio::test]
    async fn expired_entries_are_evicted() {
        let (resolver, _) = resolver(vec![CreditConfig::global(OP, 5)]);
        let resolver = resolver.with_ttl(Duration::from_millis(20));
        let op = OperationCode::from(OP);

        for tenant in ["T1", "T2", "T3"] {
            resolver.resolve(&op, &TenantId::from(tenant), None).await.unwrap();
        }
        assert_eq!(resolver.evict_expired(), 0);
        assert_eq!(resolver.cache_stats().entries, 3);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(resolver.evict_expired(), 3);
        assert_eq!(resolver.cache_stats().entries, 0);
    }
}
