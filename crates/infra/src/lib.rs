//! Infrastructure layer: stores, stream bus, credit ledger, tenant consumers and
//! the pool that owns them.
//!
//! Every store has an in-memory implementation (tests, dev mode) and a Postgres
//! one; the Redis Streams bus sits behind the `redis` feature.

pub mod activity;
pub mod config;
pub mod consumer;
pub mod cost_config;
pub mod credit_service;
pub mod db;
pub mod event_bus;
pub mod idempotency;
pub mod ledger;
pub mod pool;
pub mod read_model;
pub mod retry;


pub use credit_service::{CreditCheck, CreditService, CreditServiceError, DeductionOutcome, DeductionRequest};
pub use pool::{ConsumerPoolManager, PoolConfig, PoolError, PoolMetrics};
