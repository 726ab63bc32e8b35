use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use creditflow_core::{DomainError, EntityId, TenantId};

/// Credit amount in whole units.
pub type Credits = i64;

/// Business outcomes of a credit transition.
///
/// These are normal results, not faults: callers surface them and never retry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CreditError {
    #[error("credit amount must be positive (got {0})")]
    InvalidAmount(Credits),

    #[error("no active credit allocation for entity {entity_id} in tenant {tenant_id}")]
    NoActiveAllocation { tenant_id: TenantId, entity_id: EntityId },

    #[error("credit allocation for entity {entity_id} expired at {expired_at}")]
    AllocationExpired {
        entity_id: EntityId,
        expired_at: DateTime<Utc>,
    },

    #[error("insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: Credits, available: Credits },
}

/// Ledger row: one credit balance per (tenant, entity).
///
/// Invariant: `0 <= used_credits <= allocated_credits`, so
/// `available() == allocated - used` is never negative. Rows are never deleted;
/// they are deactivated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityCredit {
    tenant_id: TenantId,
    entity_id: EntityId,
    /// External string identifier of the same entity (e.g. a company code).
    external_ref: Option<String>,
    allocated_credits: Credits,
    used_credits: Credits,
    is_active: bool,
    expires_at: Option<DateTime<Utc>>,
    /// Committed mutation count; 0 means "not yet persisted".
    version: u64,
    updated_at: DateTime<Utc>,
}

/// Read-only view of a balance, as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceSnapshot {
    pub allocated_credits: Credits,
    pub used_credits: Credits,
    pub available_credits: Credits,
    pub is_active: bool,
}

impl EntityCredit {
    /// A fresh, unpersisted row with nothing allocated.
    pub fn open(
        tenant_id: TenantId,
        entity_id: EntityId,
        external_ref: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id,
            entity_id,
            external_ref,
            allocated_credits: 0,
            used_credits: 0,
            is_active: true,
            expires_at: None,
            version: 0,
            updated_at: now,
        }
    }

    /// Rebuild a row from storage, validating the balance invariant.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        tenant_id: TenantId,
        entity_id: EntityId,
        external_ref: Option<String>,
        allocated_credits: Credits,
        used_credits: Credits,
        is_active: bool,
        expires_at: Option<DateTime<Utc>>,
        version: u64,
        updated_at: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        if allocated_credits < 0 || used_credits < 0 || used_credits > allocated_credits {
            return Err(DomainError::invariant(format!(
                "stored balance out of range (allocated: {allocated_credits}, used: {used_credits})"
            )));
        }
        Ok(Self {
            tenant_id,
            entity_id,
            external_ref,
            allocated_credits,
            used_credits,
            is_active,
            expires_at,
            version,
            updated_at,
        })
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn external_ref(&self) -> Option<&str> {
        self.external_ref.as_deref()
    }

    pub fn allocated_credits(&self) -> Credits {
        self.allocated_credits
    }

    pub fn used_credits(&self) -> Credits {
        self.used_credits
    }

    pub fn available_credits(&self) -> Credits {
        self.allocated_credits - self.used_credits
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Whether `key` names this entity, by internal id or external reference.
    pub fn matches(&self, key: &EntityId) -> bool {
        &self.entity_id == key || self.external_ref.as_deref() == Some(key.as_str())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn snapshot(&self) -> BalanceSnapshot {
        BalanceSnapshot {
            allocated_credits: self.allocated_credits,
            used_credits: self.used_credits,
            available_credits: self.available_credits(),
            is_active: self.is_active,
        }
    }

    /// Fails unless the row can currently be debited.
    pub fn ensure_consumable(&self, now: DateTime<Utc>) -> Result<(), CreditError> {
        if !self.is_active {
            return Err(CreditError::NoActiveAllocation {
                tenant_id: self.tenant_id.clone(),
                entity_id: self.entity_id.clone(),
            });
        }
        if let Some(expired_at) = self.expires_at.filter(|at| *at <= now) {
            return Err(CreditError::AllocationExpired {
                entity_id: self.entity_id.clone(),
                expired_at,
            });
        }
        Ok(())
    }

    /// Next state after debiting `amount`. A zero amount is a valid no-charge debit.
    pub fn debit(&self, amount: Credits, now: DateTime<Utc>) -> Result<Self, CreditError> {
        if amount < 0 {
            return Err(CreditError::InvalidAmount(amount));
        }
        self.ensure_consumable(now)?;

        let available = self.available_credits();
        if available < amount {
            return Err(CreditError::InsufficientCredits {
                required: amount,
                available,
            });
        }

        let mut next = self.clone();
        next.used_credits += amount;
        next.bump(now);
        Ok(next)
    }

    /// Next state after allocating `amount` more credits; reactivates the row.
    pub fn allocate(
        &self,
        amount: Credits,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Self, CreditError> {
        if amount <= 0 {
            return Err(CreditError::InvalidAmount(amount));
        }

        let mut next = self.clone();
        next.allocated_credits += amount;
        next.is_active = true;
        if expires_at.is_some() {
            next.expires_at = expires_at;
        }
        next.bump(now);
        Ok(next)
    }

    pub fn deactivate(&self, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.is_active = false;
        next.bump(now);
        next
    }

    pub fn with_external_ref(mut self, external_ref: Option<String>) -> Self {
        if external_ref.is_some() {
            self.external_ref = external_ref;
        }
        self
    }

    fn bump(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn row(allocated: Credits) -> EntityCredit {
        let now = Utc::now();
        let open = EntityCredit::open(TenantId::from("T1"), EntityId::from("E1"), None, now);
        if allocated == 0 {
            open
        } else {
            open.allocate(allocated, None, now).unwrap()
        }
    }

    #[test]
    fn debit_reduces_available_and_bumps_version() {
        let r = row(100);
        let next = r.debit(60, Utc::now()).unwrap();
        assert_eq!(next.used_credits(), 60);
        assert_eq!(next.available_credits(), 40);
        assert_eq!(next.version(), r.version() + 1);
    }

    #[test]
    fn debit_beyond_available_is_insufficient() {
        let r = row(100).debit(60, Utc::now()).unwrap();
        assert_eq!(
            r.debit(60, Utc::now()).unwrap_err(),
            CreditError::InsufficientCredits {
                required: 60,
                available: 40
            }
        );
    }

    #[test]
    fn inactive_row_has_no_active_allocation() {
        let r = row(100).deactivate(Utc::now());
        assert!(matches!(
            r.debit(1, Utc::now()),
            Err(CreditError::NoActiveAllocation { .. })
        ));
        // Allocation reactivates.
        let r = r.allocate(10, None, Utc::now()).unwrap();
        assert!(r.is_active());
        assert_eq!(r.available_credits(), 110);
    }

    #[test]
    fn expired_allocation_rejects_debits() {
        let now = Utc::now();
        let r = row(0)
            .allocate(50, Some(now - chrono::Duration::seconds(1)), now)
            .unwrap();
        assert!(matches!(
            r.debit(1, now),
            Err(CreditError::AllocationExpired { .. })
        ));
    }

    #[test]
    fn matches_internal_id_or_external_ref() {
        let r = EntityCredit::open(
            TenantId::from("T1"),
            EntityId::from("64f0c0ffee"),
            Some("ACME-01".to_string()),
            Utc::now(),
        );
        assert!(r.matches(&EntityId::from("64f0c0ffee")));
        assert!(r.matches(&EntityId::from("ACME-01")));
        assert!(!r.matches(&EntityId::from("OTHER")));
    }

    #[test]
    fn restore_rejects_overdrawn_rows() {
        let err = EntityCredit::restore(
            TenantId::from("T1"),
            EntityId::from("E1"),
            None,
            10,
            11,
            true,
            None,
            3,
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn non_positive_allocations_are_rejected() {
        assert_eq!(
            row(0).allocate(0, None, Utc::now()).unwrap_err(),
            CreditError::InvalidAmount(0)
        );
        assert_eq!(
            row(10).debit(-1, Utc::now()).unwrap_err(),
            CreditError::InvalidAmount(-1)
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: no sequence of debits overdraws a row, and
        /// available always equals allocated - used.
        #[test]
        fn debits_never_overdraw(
            allocated in 1i64..10_000i64,
            debits in prop::collection::vec(0i64..2_000i64, 0..40)
        ) {
            let mut current = row(allocated);
            for amount in debits {
                match current.debit(amount, Utc::now()) {
                    Ok(next) => current = next,
                    Err(CreditError::InsufficientCredits { required, available }) => {
                        prop_assert!(required > available);
                    }
                    Err(other) => prop_assert!(false, "unexpected error: {other:?}"),
                }
                prop_assert!(current.used_credits() <= current.allocated_credits());
                prop_assert_eq!(
                    current.available_credits(),
                    current.allocated_credits() - current.used_credits()
                );
            }
        }
    }
}
