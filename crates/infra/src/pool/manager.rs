use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use creditflow_core::TenantId;

use super::metrics::{HitRates, PoolMetrics, TenantConsumerMetrics};
use super::{PoolConfig, PoolError};
use crate::consumer::{ConnectionState, ConsumerDeps, TenantEventConsumer};
use crate::cost_config::CreditConfigResolver;

/// Result of one cleanup tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub evicted: Vec<TenantId>,
    pub purged_records: u64,
    pub evicted_cache_entries: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmStartReport {
    pub started: Vec<TenantId>,
    pub failed: Vec<(TenantId, String)>,
}

struct CleanupTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// A capacity slot held while a consumer starts.
struct SlotReservation<'a> {
    reserved: &'a Mutex<usize>,
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        *reserved = reserved.saturating_sub(1);
    }
}

/// Owns the `tenant → consumer` map.
///
/// Lookups take a short read lock. Creation is serialized per tenant, so two
/// callers asking for the same new tenant get the same consumer while a slow
/// bus start for one tenant never holds up another. Capacity counts consumers in
/// the map plus creations still starting. Metrics only read a snapshot of the map.
pub struct ConsumerPoolManager {
    config: PoolConfig,
    deps: ConsumerDeps,
    config_cache: Option<Arc<CreditConfigResolver>>,
    consumers: RwLock<HashMap<TenantId, Arc<TenantEventConsumer>>>,
    creating: Mutex<HashMap<TenantId, Arc<tokio::sync::Mutex<()>>>>,
    reserved: Mutex<usize>,
    shutting_down: AtomicBool,
    cleanup: Mutex<Option<CleanupTask>>,
    created: AtomicU64,
    evicted: AtomicU64,
}

impl ConsumerPoolManager {
    pub fn new(config: PoolConfig, deps: ConsumerDeps) -> Self {
        Self {
            config,
            deps,
            config_cache: None,
            consumers: RwLock::new(HashMap::new()),
            creating: Mutex::new(HashMap::new()),
            reserved: Mutex::new(0),
            shutting_down: AtomicBool::new(false),
            cleanup: Mutex::new(None),
            created: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Report the resolver's cache hit rate in [`PoolMetrics`].
    pub fn with_config_cache(mut self, resolver: Arc<CreditConfigResolver>) -> Self {
        self.config_cache = Some(resolver);
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.consumers.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn lookup(&self, tenant_id: &TenantId) -> Option<Arc<TenantEventConsumer>> {
        self.consumers.read().ok()?.get(tenant_id).cloned()
    }

    fn snapshot(&self) -> Vec<Arc<TenantEventConsumer>> {
        self.consumers
            .read()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// The tenant's running consumer, created and started on first demand.
    pub async fn get_consumer(&self, tenant_id: &TenantId) -> Result<Arc<TenantEventConsumer>, PoolError> {
        if self.is_shutting_down() {
            return Err(PoolError::ShuttingDown);
        }
        if let Some(consumer) = self.lookup(tenant_id) {
            consumer.touch();
            return Ok(consumer);
        }

        let gate = self.creation_gate(tenant_id);
        let created = {
            let _creating = gate.lock().await;
            self.create_consumer(tenant_id).await
        };
        self.release_gate(tenant_id, gate);
        created
    }

    fn creation_gate(&self, tenant_id: &TenantId) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.creating.lock().unwrap_or_else(PoisonError::into_inner);
        gates.entry(tenant_id.clone()).or_default().clone()
    }

    fn release_gate(&self, tenant_id: &TenantId, gate: Arc<tokio::sync::Mutex<()>>) {
        let mut gates = self.creating.lock().unwrap_or_else(PoisonError::into_inner);
        // Ours and the map's are the last two references.
        if Arc::strong_count(&gate) <= 2 {
            gates.remove(tenant_id);
        }
    }

    async fn create_consumer(&self, tenant_id: &TenantId) -> Result<Arc<TenantEventConsumer>, PoolError> {
        if self.is_shutting_down() {
            return Err(PoolError::ShuttingDown);
        }
        if let Some(consumer) = self.lookup(tenant_id) {
            consumer.touch();
            return Ok(consumer);
        }
        let _slot = self.reserve_slot(tenant_id)?;

        let consumer = TenantEventConsumer::new(tenant_id.clone(), self.config.consumer.clone(), self.deps.clone());
        consumer.start().await.map_err(|source| PoolError::Consumer {
            tenant_id: tenant_id.clone(),
            source,
        })?;

        let inserted = match self.consumers.write() {
            // Checked under the map lock: `shutdown` raises the flag before draining.
            Ok(mut consumers) if !self.is_shutting_down() => {
                consumers.insert(tenant_id.clone(), consumer.clone());
                true
            }
            _ => false,
        };
        if !inserted {
            consumer.shutdown().await;
            return Err(PoolError::ShuttingDown);
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        info!(tenant_id = %tenant_id, group = consumer.group(), total = self.len(), "tenant consumer created");
        Ok(consumer)
    }

    fn reserve_slot(&self, tenant_id: &TenantId) -> Result<SlotReservation<'_>, PoolError> {
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        if self.len() + *reserved >= self.config.max_consumers {
            warn!(tenant_id = %tenant_id, max = self.config.max_consumers, "consumer pool at capacity");
            return Err(PoolError::CapacityExhausted {
                max: self.config.max_consumers,
                tenant_id: tenant_id.clone(),
            });
        }
        *reserved += 1;
        Ok(SlotReservation { reserved: &self.reserved })
    }

    /// Drain and drop the tenant's consumer. Returns whether one existed.
    pub async fn remove_consumer(&self, tenant_id: &TenantId) -> bool {
        let removed = self.consumers.write().ok().and_then(|mut m| m.remove(tenant_id));
        match removed {
            Some(consumer) => {
                consumer.shutdown().await;
                info!(tenant_id = %tenant_id, "tenant consumer removed");
                true
            }
            None => false,
        }
    }

    fn is_evictable(&self, consumer: &TenantEventConsumer) -> bool {
        match consumer.state() {
            ConnectionState::Disconnected => true,
            ConnectionState::Reconnecting => consumer.state_age() >= self.config.reconnect_grace,
            ConnectionState::Active => {
                consumer.in_flight() == 0 && consumer.idle_for() >= self.config.idle_timeout
            }
            ConnectionState::Connecting | ConnectionState::Draining => false,
        }
    }

    /// Evict consumers whose connection dropped without healing, or that went idle.
    pub async fn cleanup_inactive(&self) -> Vec<TenantId> {
        let victims: Vec<Arc<TenantEventConsumer>> = {
            let Ok(mut consumers) = self.consumers.write() else {
                return vec![];
            };
            let doomed: Vec<TenantId> = consumers
                .iter()
                .filter(|(_, c)| self.is_evictable(c))
                .map(|(tenant, _)| tenant.clone())
                .collect();
            doomed.iter().filter_map(|t| consumers.remove(t)).collect()
        };

        let mut evicted = Vec::with_capacity(victims.len());
        for consumer in victims {
            debug!(
                tenant_id = %consumer.tenant_id(),
                state = %consumer.state(),
                idle_secs = consumer.idle_for().as_secs(),
                "evicting tenant consumer"
            );
            consumer.shutdown().await;
            evicted.push(consumer.tenant_id().clone());
        }

        if !evicted.is_empty() {
            self.evicted.fetch_add(evicted.len() as u64, Ordering::Relaxed);
            info!(count = evicted.len(), remaining = self.len(), "evicted inactive tenant consumers");
        }
        evicted
    }

    /// One cleanup tick: evict inactive consumers, purge expired idempotency
    /// records and drop stale config cache entries.
    pub async fn run_maintenance(&self) -> CleanupReport {
        let evicted = self.cleanup_inactive().await;
        let purged_records = match self.deps.idempotency.purge_expired(Utc::now()).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "idempotency purge failed");
                0
            }
        };
        let evicted_cache_entries = self.config_cache.as_ref().map(|c| c.evict_expired()).unwrap_or(0);
        CleanupReport {
            evicted,
            purged_records,
            evicted_cache_entries,
        }
    }

    /// Run [`Self::run_maintenance`] every `cleanup_interval` until shutdown.
    pub fn start_cleanup(self: &Arc<Self>) {
        let Ok(mut slot) = self.cleanup.lock() else {
            return;
        };
        if slot.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return;
        }

        let (stop, mut stopped) = watch::channel(false);
        let pool: Weak<Self> = Arc::downgrade(self);
        let period = self.config.cleanup_interval;

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.tick().await;
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = ticks.tick() => {}
                }
                let Some(pool) = pool.upgrade() else { break };
                let report = pool.run_maintenance().await;
                debug!(evicted = report.evicted.len(), purged = report.purged_records, "pool cleanup tick");
            }
        });

        *slot = Some(CleanupTask { stop, handle });
        info!(interval_secs = period.as_secs(), "consumer pool cleanup scheduled");
    }

    /// Start consumers for known tenants ahead of demand. Failures are reported, not fatal.
    pub async fn warm_start(&self, tenants: &[TenantId]) -> WarmStartReport {
        let mut report = WarmStartReport::default();
        for tenant_id in tenants {
            match self.get_consumer(tenant_id).await {
                Ok(_) => report.started.push(tenant_id.clone()),
                Err(e) => {
                    warn!(tenant_id = %tenant_id, error = %e, "warm start failed");
                    report.failed.push((tenant_id.clone(), e.to_string()));
                }
            }
        }
        info!(started = report.started.len(), failed = report.failed.len(), "warm start finished");
        report
    }

    /// Stop the cleanup task and drain every consumer before returning.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let cleanup = self.cleanup.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = cleanup {
            task.stop.send_replace(true);
            if let Err(e) = task.handle.await {
                error!(error = %e, "pool cleanup task failed");
            }
        }

        let consumers: Vec<Arc<TenantEventConsumer>> = self
            .consumers
            .write()
            .map(|mut m| m.drain().map(|(_, c)| c).collect())
            .unwrap_or_default();

        let count = consumers.len();
        let mut draining = JoinSet::new();
        for consumer in consumers {
            draining.spawn(async move { consumer.shutdown().await });
        }
        while let Some(joined) = draining.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "consumer drain failed");
            }
        }
        info!(consumers = count, "consumer pool shut down");
    }

    pub fn metrics(&self) -> PoolMetrics {
        let consumers = self.snapshot();

        let mut metrics = PoolMetrics {
            total_consumers: consumers.len(),
            consumers_created: self.created.load(Ordering::Relaxed),
            consumers_evicted: self.evicted.load(Ordering::Relaxed),
            ..PoolMetrics::default()
        };

        let mut own_messages = 0u64;
        let mut duplicates = 0u64;
        let mut per_tenant = BTreeMap::new();
        for consumer in &consumers {
            let counters = consumer.metrics();
            let state = consumer.state();
            if state == ConnectionState::Active {
                metrics.active_consumers += 1;
            }
            metrics.api_calls += counters.bus_calls;
            metrics.errors += counters.errors + counters.failed;
            metrics.memory_estimate +=
                self.config.consumer_memory_bytes + counters.in_flight as u64 * self.config.message_memory_bytes;
            own_messages += counters.messages_read.saturating_sub(counters.foreign);
            duplicates += counters.duplicates;

            per_tenant.insert(
                consumer.tenant_id().to_string(),
                TenantConsumerMetrics {
                    state,
                    idle_secs: consumer.idle_for().as_secs(),
                    counters,
                },
            );
        }

        metrics.hit_rates = HitRates {
            config_cache: self.config_cache.as_ref().map(|r| r.cache_stats().hit_rate).unwrap_or(0.0),
            idempotency: if own_messages == 0 {
                0.0
            } else {
                duplicates as f64 / own_messages as f64
            },
        };
        metrics.per_tenant = per_tenant;
        metrics
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::consumer::{ConsumerConfig, HandlerRegistry};
    use crate::cost_config::InMemoryCreditConfigStore;
    use crate::event_bus::{BusError, InMemoryStreamBus, ReadRequest, StreamBus};
    use creditflow_events::StreamMessage;
    use crate::idempotency::InMemoryIdempotencyStore;
    use crate::ledger::{CreditLedger, InMemoryLedgerStore};
    use crate::read_model::Directory;
    use crate::retry::RetryPolicy;

    const STREAM: &str = "crm:credit-events";

    fn consumer_config() -> ConsumerConfig {
        ConsumerConfig::default()
            .with_streams([STREAM])
            .with_block(Duration::from_millis(10))
            .with_failure_threshold(1)
            .with_reconnect(RetryPolicy::fixed(u32::MAX, Duration::from_millis(10)))
    }

    fn pool_with(config: PoolConfig) -> (Arc<ConsumerPoolManager>, Arc<InMemoryStreamBus>) {
        let bus = Arc::new(InMemoryStreamBus::new());
        (pool_on(config, bus.clone()), bus)
    }

    fn pool_on(config: PoolConfig, bus: Arc<dyn StreamBus>) -> Arc<ConsumerPoolManager> {
        let ledger = Arc::new(CreditLedger::new(Arc::new(InMemoryLedgerStore::default())));
        let resolver = Arc::new(CreditConfigResolver::new(Arc::new(InMemoryCreditConfigStore::new())));
        let handlers = HandlerRegistry::with_defaults(ledger, resolver.clone(), Arc::new(Directory::in_memory()));
        let deps = ConsumerDeps {
            bus,
            idempotency: Arc::new(InMemoryIdempotencyStore::new()),
            handlers: Arc::new(handlers),
        };
        let pool = ConsumerPoolManager::new(config.with_consumer(consumer_config()), deps).with_config_cache(resolver);
        Arc::new(pool)
    }

    /// Parks `ensure_group` for groups of one tenant until released.
    struct StalledJoin {
        inner: InMemoryStreamBus,
        group_suffix: String,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl StreamBus for StalledJoin {
        async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BusError> {
            if group.ends_with(&self.group_suffix) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.ensure_group(stream, group).await
        }

        async fn read_group(&self, request: &ReadRequest) -> Result<Vec<StreamMessage>, BusError> {
            self.inner.read_group(request).await
        }

        async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, BusError> {
            self.inner.ack(stream, group, ids).await
        }

        async fn append(&self, stream: &str, fields: Vec<(String, String)>) -> Result<String, BusError> {
            self.inner.append(stream, fields).await
        }

        async fn ping(&self) -> Result<(), BusError> {
            self.inner.ping().await
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn third_tenant_fails_fast_at_capacity() {
        let (pool, _) = pool_with(PoolConfig::default().with_max_consumers(2));
        let t1 = pool.get_consumer(&TenantId::from("T1")).await.unwrap();
        pool.get_consumer(&TenantId::from("T2")).await.unwrap();

        let err = pool.get_consumer(&TenantId::from("T3")).await.unwrap_err();
        assert!(matches!(err, PoolError::CapacityExhausted { max: 2, .. }));
        assert!(!err.is_transient());

        // Existing tenants are untouched.
        assert_eq!(pool.len(), 2);
        let again = pool.get_consumer(&TenantId::from("T1")).await.unwrap();
        assert!(Arc::ptr_eq(&t1, &again));
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn slow_start_of_one_tenant_does_not_block_others() {
        let bus = Arc::new(StalledJoin {
            inner: InMemoryStreamBus::new(),
            group_suffix: ":SLOW".to_string(),
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let pool = pool_on(PoolConfig::default().with_max_consumers(2), bus.clone());

        let slow = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get_consumer(&TenantId::from("SLOW")).await })
        };
        bus.entered.notified().await;

        let fast = tokio::time::timeout(Duration::from_secs(1), pool.get_consumer(&TenantId::from("T2")))
            .await
            .expect("creation of another tenant waited on the slow start");
        assert!(fast.is_ok());

        // The starting consumer already holds a capacity slot.
        let err = pool.get_consumer(&TenantId::from("T3")).await.unwrap_err();
        assert!(matches!(err, PoolError::CapacityExhausted { max: 2, .. }));

        bus.release.notify_one();
        slow.await.unwrap().unwrap();
        assert_eq!(pool.len(), 2);
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_demand_creates_one_consumer() {
        let (pool, _) = pool_with(PoolConfig::default());
        let mut callers = JoinSet::new();
        for _ in 0..8 {
            let pool = pool.clone();
            callers.spawn(async move { pool.get_consumer(&TenantId::from("T1")).await.unwrap() });
        }

        let mut seen = Vec::new();
        while let Some(consumer) = callers.join_next().await {
            seen.push(consumer.unwrap());
        }
        assert!(seen.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(pool.metrics().consumers_created, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn failed_start_is_not_pooled() {
        let (pool, bus) = pool_with(PoolConfig::default());
        bus.set_offline(true);

        let err = pool.get_consumer(&TenantId::from("T1")).await.unwrap_err();
        assert!(err.is_transient());
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn remove_drains_the_consumer() {
        let (pool, _) = pool_with(PoolConfig::default());
        let consumer = pool.get_consumer(&TenantId::from("T1")).await.unwrap();

        assert!(pool.remove_consumer(&TenantId::from("T1")).await);
        assert!(!pool.remove_consumer(&TenantId::from("T1")).await);
        assert_eq!(consumer.state(), ConnectionState::Disconnected);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn cleanup_evicts_dropped_and_idle_consumers() {
        let (pool, _) = pool_with(PoolConfig::default());
        let dropped = pool.get_consumer(&TenantId::from("T1")).await.unwrap();
        pool.get_consumer(&TenantId::from("T2")).await.unwrap();
        dropped.shutdown().await;

        assert_eq!(pool.cleanup_inactive().await, vec![TenantId::from("T1")]);
        assert_eq!(pool.len(), 1);

        let (idle_pool, _) = pool_with(PoolConfig::default().with_idle_timeout(Duration::ZERO));
        idle_pool.get_consumer(&TenantId::from("T1")).await.unwrap();
        assert_eq!(idle_pool.cleanup_inactive().await.len(), 1);
        assert_eq!(idle_pool.metrics().consumers_evicted, 1);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn cleanup_evicts_consumers_that_do_not_heal() {
        let (pool, bus) = pool_with(PoolConfig::default().with_reconnect_grace(Duration::ZERO));
        let consumer = pool.get_consumer(&TenantId::from("T1")).await.unwrap();

        bus.set_offline(true);
        let watched = consumer.clone();
        wait_for(move || watched.state() == ConnectionState::Reconnecting).await;

        assert_eq!(pool.cleanup_inactive().await, vec![TenantId::from("T1")]);
        assert_eq!(consumer.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn shutdown_drains_everything_and_refuses_new_tenants() {
        let (pool, _) = pool_with(PoolConfig::default());
        pool.start_cleanup();
        let report = pool.warm_start(&[TenantId::from("T1"), TenantId::from("T2")]).await;
        assert_eq!(report.started.len(), 2);

        let consumers = pool.snapshot();
        pool.shutdown().await;

        assert!(pool.is_empty());
        assert!(consumers.iter().all(|c| c.state() == ConnectionState::Disconnected));
        assert!(matches!(
            pool.get_consumer(&TenantId::from("T3")).await,
            Err(PoolError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn metrics_aggregate_across_tenants() {
        let (pool, bus) = pool_with(PoolConfig::default());
        pool.get_consumer(&TenantId::from("T1")).await.unwrap();
        pool.get_consumer(&TenantId::from("T2")).await.unwrap();

        let event = json!({"id": "e1", "eventType": "credit.allocated", "tenantId": "T1", "entityId": "ORG-1", "data": {"amount": 50}});
        for _ in 0..2 {
            bus.append(STREAM, vec![("payload".to_string(), event.to_string())]).await.unwrap();
        }
        let watched = pool.clone();
        wait_for(move || {
            let m = watched.metrics();
            m.per_tenant["T1"].counters.duplicates == 1 && m.per_tenant["T2"].counters.foreign == 2
        })
        .await;

        let metrics = pool.metrics();
        assert_eq!((metrics.total_consumers, metrics.active_consumers), (2, 2));
        assert!(metrics.api_calls > 0);
        assert_eq!(metrics.hit_rates.idempotency, 0.5);
        assert!(metrics.memory_estimate >= 2 * pool.config().consumer_memory_bytes);

        let body = serde_json::to_value(&metrics).unwrap();
        for key in ["totalConsumers", "activeConsumers", "hitRates", "apiCalls", "errors", "memoryEstimate"] {
            assert!(body.get(key).is_some(), "missing {key}");
        }
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn maintenance_purges_expired_records() {
        let (pool, _) = pool_with(PoolConfig::default());
        let report = pool.run_maintenance().await;
        assert!(report.evicted.is_empty());
        assert_eq!(report.purged_records, 0);
        assert_eq!(report.evicted_cache_entries, 0);
    }
}
