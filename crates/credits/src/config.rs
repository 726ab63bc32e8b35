//! Credit cost configuration and its precedence rules.
//!
//! Global defaults, tenant overrides and entity overrides are synced from
//! independent sources, so at any moment any subset of them may exist. Resolution
//! walks [`PrecedenceRule::ORDER`] and returns the first rule with a match; a cost
//! is only "not found" when no active config for the operation exists at all.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use creditflow_core::{DomainError, DomainResult, EntityId, OperationCode, TenantId};

use crate::Credits;

/// Where a config row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Global,
    Tenant,
    Entity,
}

impl ConfigSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigSource::Global => "global",
            ConfigSource::Tenant => "tenant",
            ConfigSource::Entity => "entity",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "global" => Some(ConfigSource::Global),
            "tenant" => Some(ConfigSource::Tenant),
            "entity" => Some(ConfigSource::Entity),
            _ => None,
        }
    }
}

/// Credit cost of one operation code at some scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditConfig {
    pub config_id: String,
    pub operation_code: OperationCode,
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    #[serde(default)]
    pub entity_id: Option<EntityId>,
    pub credit_cost: Credits,
    #[serde(default)]
    pub is_global: bool,
    pub source: ConfigSource,
    #[serde(default)]
    pub overrides_global: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl CreditConfig {
    fn base(operation_code: OperationCode, credit_cost: Credits, source: ConfigSource) -> Self {
        Self {
            config_id: uuid::Uuid::now_v7().to_string(),
            operation_code,
            tenant_id: None,
            entity_id: None,
            credit_cost,
            is_global: false,
            source,
            overrides_global: false,
            is_active: true,
            updated_at: Utc::now(),
        }
    }

    /// Global default for an operation.
    pub fn global(operation_code: impl Into<OperationCode>, credit_cost: Credits) -> Self {
        Self {
            is_global: true,
            ..Self::base(operation_code.into(), credit_cost, ConfigSource::Global)
        }
    }

    /// Tenant override (replaces the global default for this tenant).
    pub fn tenant(
        operation_code: impl Into<OperationCode>,
        tenant_id: impl Into<TenantId>,
        credit_cost: Credits,
    ) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            overrides_global: true,
            ..Self::base(operation_code.into(), credit_cost, ConfigSource::Tenant)
        }
    }

    /// Entity override inside a tenant.
    pub fn entity(
        operation_code: impl Into<OperationCode>,
        tenant_id: impl Into<TenantId>,
        entity_id: impl Into<EntityId>,
        credit_cost: Credits,
    ) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            entity_id: Some(entity_id.into()),
            overrides_global: true,
            ..Self::base(operation_code.into(), credit_cost, ConfigSource::Entity)
        }
    }

    pub fn with_id(mut self, config_id: impl Into<String>) -> Self {
        self.config_id = config_id.into();
        self
    }

    pub fn with_overrides_global(mut self, overrides_global: bool) -> Self {
        self.overrides_global = overrides_global;
        self
    }

    pub fn with_source(mut self, source: ConfigSource) -> Self {
        self.source = source;
        self
    }

    pub fn updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = at;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Tenant-less rows are global regardless of the `is_global` flag.
    pub fn is_global_scope(&self) -> bool {
        self.is_global || self.tenant_id.is_none()
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.credit_cost < 0 {
            return Err(DomainError::validation(format!(
                "credit cost must be >= 0 (got {})",
                self.credit_cost
            )));
        }
        if self.source == ConfigSource::Entity && self.entity_id.is_none() {
            return Err(DomainError::validation("entity-sourced config requires entityId"));
        }
        Ok(())
    }
}

/// Lookup parameters for [`resolve_config`].
#[derive(Debug, Clone, Copy)]
pub struct ResolveQuery<'a> {
    pub operation_code: &'a OperationCode,
    pub tenant_id: &'a TenantId,
    pub entity_id: Option<&'a EntityId>,
}

impl<'a> ResolveQuery<'a> {
    pub fn new(
        operation_code: &'a OperationCode,
        tenant_id: &'a TenantId,
        entity_id: Option<&'a EntityId>,
    ) -> Self {
        Self {
            operation_code,
            tenant_id,
            entity_id,
        }
    }
}

/// One level of the entity > tenant > global hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecedenceRule {
    /// `source = entity` config for the queried entity.
    EntitySpecific,
    /// Tenant config flagged `overrides_global`.
    TenantOverride,
    /// Any tenant config, override flag ignored (not bound to another entity).
    TenantScoped,
    /// `is_global` or tenant-less config.
    Global,
    /// Any config for the operation at all. Indicates misconfigured
    /// `source`/`tenant_id` fields.
    AnyMatch,
}

impl PrecedenceRule {
    /// Most specific first.
    pub const ORDER: [PrecedenceRule; 5] = [
        PrecedenceRule::EntitySpecific,
        PrecedenceRule::TenantOverride,
        PrecedenceRule::TenantScoped,
        PrecedenceRule::Global,
        PrecedenceRule::AnyMatch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PrecedenceRule::EntitySpecific => "entity_specific",
            PrecedenceRule::TenantOverride => "tenant_override",
            PrecedenceRule::TenantScoped => "tenant_scoped",
            PrecedenceRule::Global => "global",
            PrecedenceRule::AnyMatch => "any_match",
        }
    }

    /// Whether a match at this level should be reported as a data-quality issue.
    pub fn is_data_quality_fallback(&self) -> bool {
        matches!(self, PrecedenceRule::AnyMatch)
    }

    pub fn matches(&self, config: &CreditConfig, query: &ResolveQuery<'_>) -> bool {
        if !config.is_active || &config.operation_code != query.operation_code {
            return false;
        }

        let same_tenant = config.tenant_id.as_ref() == Some(query.tenant_id);

        match self {
            PrecedenceRule::EntitySpecific => match query.entity_id {
                Some(entity) => {
                    config.source == ConfigSource::Entity
                        && config.entity_id.as_ref() == Some(entity)
                        && config.tenant_id.as_ref().is_none_or(|t| t == query.tenant_id)
                }
                None => false,
            },
            PrecedenceRule::TenantOverride => {
                same_tenant && config.source == ConfigSource::Tenant && config.overrides_global
            }
            PrecedenceRule::TenantScoped => {
                same_tenant
                    && config
                        .entity_id
                        .as_ref()
                        .is_none_or(|e| Some(e) == query.entity_id)
            }
            PrecedenceRule::Global => config.is_global_scope(),
            PrecedenceRule::AnyMatch => true,
        }
    }
}

/// Outcome of a successful resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution<'a> {
    pub config: &'a CreditConfig,
    pub rule: PrecedenceRule,
}

/// Resolve the effective config for `query`, or `None` when nothing matches.
///
/// Within one rule the most recently updated config wins; equal timestamps fall
/// back to the smallest `config_id`, so storage order never matters.
pub fn resolve_config<'a>(
    configs: &'a [CreditConfig],
    query: &ResolveQuery<'_>,
) -> Option<Resolution<'a>> {
    PrecedenceRule::ORDER.iter().find_map(|rule| {
        configs
            .iter()
            .filter(|c| rule.matches(c, query))
            .min_by(|a, b| {
                b.updated_at
                    .cmp(&a.updated_at)
                    .then_with(|| a.config_id.cmp(&b.config_id))
            })
            .map(|config| Resolution {
                config,
                rule: *rule,
            })
    })
}
