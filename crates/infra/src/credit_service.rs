//! Synchronous credit path used by CRUD controllers.
//!
//! Resolves who pays (entity override, else the user's entity from the directory),
//! what it costs (config resolver), and debits the ledger. A failed charge is a
//! "payment required" outcome carrying the amounts involved.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{error, info, instrument, warn};

use creditflow_core::{EntityId, OperationCode, TenantId, UserId};
use creditflow_credits::{CreditError, Credits, PrecedenceRule};

use crate::cost_config::{CreditConfigResolver, ResolveError, ResolvedCost};
use crate::ledger::{ConsumeContext, CreditLedger, LedgerError};
use crate::read_model::{EntityLookupError, EntityResolver};

#[derive(Debug, thiserror::Error)]
pub enum CreditServiceError {
    /// The operation must not proceed (HTTP 402).
    #[error("payment required: {reason} (required {required}, available {available})")]
    PaymentRequired {
        required: Credits,
        available: Credits,
        reason: String,
    },

    #[error("no credit-holding entity for user {user_id:?} in tenant {tenant_id}")]
    NoEntity {
        tenant_id: TenantId,
        user_id: Option<UserId>,
    },

    /// Only raised in strict mode.
    #[error("no credit cost configured for {operation_code}")]
    ConfigNotFound { operation_code: OperationCode },

    #[error(transparent)]
    Ledger(LedgerError),

    #[error(transparent)]
    Resolve(ResolveError),

    #[error(transparent)]
    EntityLookup(#[from] EntityLookupError),

    #[error("charge failed ({charge}) and compensation failed: {reason}")]
    CompensationFailed {
        charge: Box<CreditServiceError>,
        reason: String,
    },
}

impl CreditServiceError {
    pub fn is_transient(&self) -> bool {
        match self {
            CreditServiceError::Ledger(e) => e.is_transient(),
            CreditServiceError::Resolve(e) => e.is_transient(),
            CreditServiceError::EntityLookup(_) => true,
            CreditServiceError::CompensationFailed { charge, .. } => charge.is_transient(),
            CreditServiceError::PaymentRequired { .. }
            | CreditServiceError::NoEntity { .. }
            | CreditServiceError::ConfigNotFound { .. } => false,
        }
    }

    pub fn is_payment_required(&self) -> bool {
        match self {
            CreditServiceError::PaymentRequired { .. } => true,
            CreditServiceError::CompensationFailed { charge, .. } => charge.is_payment_required(),
            _ => false,
        }
    }

    fn from_ledger(err: LedgerError, required: Credits) -> Self {
        match err {
            LedgerError::Credit(CreditError::InsufficientCredits { required, available }) => {
                CreditServiceError::PaymentRequired {
                    required,
                    available,
                    reason: "insufficient credits".to_string(),
                }
            }
            LedgerError::Credit(credit @ (CreditError::NoActiveAllocation { .. } | CreditError::AllocationExpired { .. })) => {
                CreditServiceError::PaymentRequired {
                    required,
                    available: 0,
                    reason: credit.to_string(),
                }
            }
            other => CreditServiceError::Ledger(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditCheck {
    pub allowed: bool,
    pub available_credits: Credits,
    pub required_credits: Credits,
}

/// A billable operation performed by a user.
#[derive(Debug, Clone)]
pub struct DeductionRequest {
    pub tenant_id: TenantId,
    pub user_id: Option<UserId>,
    pub operation_code: OperationCode,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub details: JsonValue,
    /// Caller's request id; retries with the same id are charged once.
    pub request_id: Option<String>,
    /// Charge this entity instead of the user's.
    pub entity_override: Option<EntityId>,
}

impl DeductionRequest {
    pub fn new(tenant_id: TenantId, user_id: Option<UserId>, operation_code: impl Into<OperationCode>) -> Self {
        Self {
            tenant_id,
            user_id,
            operation_code: operation_code.into(),
            resource_type: None,
            resource_id: None,
            details: JsonValue::Null,
            request_id: None,
            entity_override: None,
        }
    }

    pub fn with_resource(mut self, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = details;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_entity(mut self, entity_id: EntityId) -> Self {
        self.entity_override = Some(entity_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeductionOutcome {
    pub success: bool,
    pub credits_deducted: Credits,
    pub remaining_credits: Credits,
    pub entity_id: EntityId,
    /// Precedence rule that priced the operation; `None` when nothing is configured.
    pub rule: Option<PrecedenceRule>,
    pub replayed: bool,
}

pub struct CreditService {
    resolver: Arc<CreditConfigResolver>,
    ledger: Arc<CreditLedger>,
    entities: Arc<dyn EntityResolver>,
    strict_config: bool,
}

impl CreditService {
    pub fn new(resolver: Arc<CreditConfigResolver>, ledger: Arc<CreditLedger>, entities: Arc<dyn EntityResolver>) -> Self {
        Self {
            resolver,
            ledger,
            entities,
            strict_config: false,
        }
    }

    /// Treat an unconfigured operation as an error instead of free.
    pub fn with_strict_config(mut self, strict: bool) -> Self {
        self.strict_config = strict;
        self
    }

    async fn entity_for(
        &self,
        tenant_id: &TenantId,
        user_id: Option<&UserId>,
        entity_override: Option<&EntityId>,
    ) -> Result<EntityId, CreditServiceError> {
        if let Some(entity) = entity_override {
            return Ok(entity.clone());
        }
        let entity = match user_id {
            Some(user) => self.entities.entity_for_user(tenant_id, user).await?,
            None => None,
        };
        entity.ok_or_else(|| CreditServiceError::NoEntity {
            tenant_id: tenant_id.clone(),
            user_id: user_id.cloned(),
        })
    }

    async fn price(
        &self,
        operation_code: &OperationCode,
        tenant_id: &TenantId,
        entity_id: &EntityId,
    ) -> Result<Option<ResolvedCost>, CreditServiceError> {
        let resolved = self
            .resolver
            .try_resolve(operation_code, tenant_id, Some(entity_id))
            .await
            .map_err(|e| CreditServiceError::Resolve(e.into()))?;
        if resolved.is_none() && self.strict_config {
            return Err(CreditServiceError::ConfigNotFound {
                operation_code: operation_code.clone(),
            });
        }
        Ok(resolved)
    }

    async fn available(&self, tenant_id: &TenantId, entity_id: &EntityId) -> Result<Credits, CreditServiceError> {
        Ok(self
            .ledger
            .balance(tenant_id, entity_id)
            .await
            .map_err(CreditServiceError::Ledger)?
            .map(|b| b.available_credits)
            .unwrap_or(0))
    }

    /// Advisory check; the balance may change before the charge.
    /// `required = None` prices the operation through the resolver.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, operation = %operation_code), err)]
    pub async fn check_credits(
        &self,
        tenant_id: &TenantId,
        user_id: Option<&UserId>,
        operation_code: &OperationCode,
        required: Option<Credits>,
    ) -> Result<CreditCheck, CreditServiceError> {
        let entity = match self.entity_for(tenant_id, user_id, None).await {
            Ok(entity) => entity,
            Err(CreditServiceError::NoEntity { .. }) => {
                return Ok(CreditCheck {
                    allowed: false,
                    available_credits: 0,
                    required_credits: required.unwrap_or(0),
                });
            }
            Err(e) => return Err(e),
        };

        let required = match required {
            Some(amount) => amount,
            None => self
                .price(operation_code, tenant_id, &entity)
                .await?
                .map(|r| r.credit_cost())
                .unwrap_or(0),
        };
        if required == 0 {
            return Ok(CreditCheck {
                allowed: true,
                available_credits: self.available(tenant_id, &entity).await?,
                required_credits: 0,
            });
        }

        let availability = self
            .ledger
            .check_available(tenant_id, &entity, required)
            .await
            .map_err(CreditServiceError::Ledger)?;
        Ok(CreditCheck {
            allowed: availability.allowed,
            available_credits: availability.available_credits,
            required_credits: required,
        })
    }

    /// Price and charge one operation.
    #[instrument(
        skip(self, request),
        fields(tenant_id = %request.tenant_id, operation = %request.operation_code),
        err
    )]
    pub async fn deduct_credits_for_operation(
        &self,
        request: DeductionRequest,
    ) -> Result<DeductionOutcome, CreditServiceError> {
        let tenant_id = request.tenant_id.clone();
        let entity = self
            .entity_for(&tenant_id, request.user_id.as_ref(), request.entity_override.as_ref())
            .await?;

        let resolved = self.price(&request.operation_code, &tenant_id, &entity).await?;
        let rule = resolved.as_ref().map(|r| r.rule);
        let cost = resolved.as_ref().map(|r| r.credit_cost()).unwrap_or(0);

        if cost == 0 {
            return Ok(DeductionOutcome {
                success: true,
                credits_deducted: 0,
                remaining_credits: self.available(&tenant_id, &entity).await?,
                entity_id: entity,
                rule,
                replayed: false,
            });
        }

        let ctx = ConsumeContext::for_request(request.request_id.as_deref(), request.operation_code.clone())
            .with_user(request.user_id.clone())
            .with_resource(request.resource_type.clone(), request.resource_id.clone())
            .with_details(request.details.clone());

        let receipt = self
            .ledger
            .consume(&tenant_id, &entity, cost, ctx)
            .await
            .map_err(|e| CreditServiceError::from_ledger(e, cost))?;

        info!(
            entity_id = %entity,
            credits = receipt.credits_deducted,
            remaining = receipt.remaining_credits,
            "operation charged"
        );
        Ok(DeductionOutcome {
            success: receipt.success,
            credits_deducted: receipt.credits_deducted,
            remaining_credits: receipt.remaining_credits,
            entity_id: entity,
            rule,
            replayed: receipt.replayed,
        })
    }

    /// Charge for a write the caller already performed; undo it via `compensate`
    /// if the charge fails.
    pub async fn charge_after_write<F, Fut, E>(
        &self,
        request: DeductionRequest,
        compensate: F,
    ) -> Result<DeductionOutcome, CreditServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let resource = request.resource_id.clone();
        match self.deduct_credits_for_operation(request).await {
            Ok(outcome) => Ok(outcome),
            Err(charge) => {
                warn!(resource = ?resource, error = %charge, "charge failed, compensating dependent write");
                match compensate().await {
                    Ok(()) => Err(charge),
                    Err(e) => {
                        error!(resource = ?resource, error = %e, "compensation failed");
                        Err(CreditServiceError::CompensationFailed {
                            charge: Box::new(charge),
                            reason: e.to_string(),
                        })
                    }
                }
            }
        }
    }
}
