use std::sync::Arc;

use creditflow_infra::config::SyncConfig;
use creditflow_infra::consumer::{ConsumerDeps, HandlerRegistry};
use creditflow_infra::cost_config::{CreditConfigResolver, CreditConfigStore, InMemoryCreditConfigStore};
use creditflow_infra::event_bus::{InMemoryStreamBus, StreamBus};
use creditflow_infra::idempotency::{EventIdempotencyStore, InMemoryIdempotencyStore};
use creditflow_infra::ledger::{CreditLedger, CreditLedgerStore, InMemoryLedgerStore};
use creditflow_infra::read_model::Directory;
use creditflow_infra::{ConsumerPoolManager, CreditService};

#[cfg(feature = "redis")]
use creditflow_infra::{
    cost_config::PostgresCreditConfigStore, db, event_bus::RedisStreamBus, idempotency::PostgresIdempotencyStore,
    ledger::PostgresLedgerStore,
};

/// Everything the HTTP layer and the process lifecycle need.
pub struct AppServices {
    pub pool: Arc<ConsumerPoolManager>,
    pub credits: Arc<CreditService>,
    pub ledger: Arc<CreditLedger>,
    pub resolver: Arc<CreditConfigResolver>,
    pub directory: Arc<Directory>,
    pub bus: Arc<dyn StreamBus>,
    /// `"in_memory"` or `"persistent"`.
    pub mode: &'static str,
}

/// Stores the services are assembled from.
struct Backends {
    bus: Arc<dyn StreamBus>,
    ledger: Arc<dyn CreditLedgerStore>,
    configs: Arc<dyn CreditConfigStore>,
    idempotency: Arc<dyn EventIdempotencyStore>,
    mode: &'static str,
}

pub async fn build_services(config: &SyncConfig) -> anyhow::Result<AppServices> {
    if config.use_persistent_stores {
        #[cfg(feature = "redis")]
        {
            return Ok(assemble(config, persistent_backends(config).await?));
        }
        #[cfg(not(feature = "redis"))]
        {
            tracing::warn!("USE_PERSISTENT_STORES=true but redis feature not enabled, falling back to in-memory");
        }
    }
    Ok(build_in_memory_services(config))
}

pub fn build_in_memory_services(config: &SyncConfig) -> AppServices {
    assemble(
        config,
        Backends {
            bus: Arc::new(InMemoryStreamBus::new()),
            ledger: Arc::new(InMemoryLedgerStore::default()),
            configs: Arc::new(InMemoryCreditConfigStore::new()),
            idempotency: Arc::new(InMemoryIdempotencyStore::with_retention(config.idempotency_retention())),
            mode: "in_memory",
        },
    )
}

#[cfg(feature = "redis")]
async fn persistent_backends(config: &SyncConfig) -> anyhow::Result<Backends> {
    let database_url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set when USE_PERSISTENT_STORES=true"))?;

    let pg = db::connect(database_url).await?;
    db::ensure_schema(&pg).await?;

    Ok(Backends {
        bus: Arc::new(RedisStreamBus::new(&config.bus_url)?),
        ledger: Arc::new(PostgresLedgerStore::new(pg.clone())),
        configs: Arc::new(PostgresCreditConfigStore::new(pg.clone())),
        idempotency: Arc::new(PostgresIdempotencyStore::new(pg).with_retention(config.idempotency_retention())),
        mode: "persistent",
    })
}

fn assemble(config: &SyncConfig, backends: Backends) -> AppServices {
    let ledger = Arc::new(CreditLedger::new(backends.ledger));
    let resolver = Arc::new(CreditConfigResolver::new(backends.configs));
    let directory = Arc::new(Directory::in_memory());

    let handlers = HandlerRegistry::with_defaults(ledger.clone(), resolver.clone(), directory.clone());
    let deps = ConsumerDeps {
        bus: backends.bus.clone(),
        idempotency: backends.idempotency,
        handlers: Arc::new(handlers),
    };
    let pool = Arc::new(ConsumerPoolManager::new(config.pool.clone(), deps).with_config_cache(resolver.clone()));

    let credits = Arc::new(
        CreditService::new(resolver.clone(), ledger.clone(), directory.clone())
            .with_strict_config(config.strict_credit_config),
    );

    tracing::info!(
        mode = backends.mode,
        max_consumers = config.pool.max_consumers,
        streams = ?config.pool.consumer.streams,
        "services assembled"
    );

    AppServices {
        pool,
        credits,
        ledger,
        resolver,
        directory,
        bus: backends.bus,
        mode: backends.mode,
    }
}
