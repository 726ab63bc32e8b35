//! `creditflow-credits`: the metered-credit domain.
//!
//! Pure state transitions and resolution rules; persistence and concurrency control
//! live in `creditflow-infra`.

pub mod activity;
pub mod balance;
pub mod config;
pub mod operation;

pub use activity::{ActivityRecord, ActivitySource};
pub use balance::{BalanceSnapshot, CreditError, Credits, EntityCredit};
pub use config::{ConfigSource, CreditConfig, PrecedenceRule, Resolution, ResolveQuery, resolve_config};
pub use operation::{IdempotencyKey, LedgerOperation, OperationKind};
