//! Event handlers and their registry.
//!
//! Routing follows `event_type`: an exact registration wins, then the longest
//! matching `"prefix.*"` pattern, then `"*"`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value as JsonValue, json};

use creditflow_core::{EntityId, OperationCode, UserId};
use creditflow_credits::{ConfigSource, CreditConfig, IdempotencyKey};
use creditflow_events::{EnvelopeError, EventKind, TenantEvent};

use crate::cost_config::{ConfigStoreError, CreditConfigResolver};
use crate::ledger::{ALLOCATE_OPERATION, AllocateRequest, ConsumeContext, CreditLedger, DEACTIVATE_OPERATION, LedgerError};
use crate::read_model::Directory;

#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    Completed(JsonValue),
    /// Nothing to do for this event; acknowledged and recorded `skipped`.
    Skipped(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    /// Infrastructure trouble; the message stays unacknowledged for redelivery.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Business rejection (insufficient credits, no allocation, ...). Never retried.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("malformed event: {0}")]
    Malformed(#[from] EnvelopeError),
}

impl From<LedgerError> for HandlerError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Credit(e) => HandlerError::Rejected(e.to_string()),
            other => HandlerError::Transient(other.to_string()),
        }
    }
}

impl From<ConfigStoreError> for HandlerError {
    fn from(err: ConfigStoreError) -> Self {
        match err {
            ConfigStoreError::Invalid(msg) => HandlerError::Rejected(msg),
            other => HandlerError::Transient(other.to_string()),
        }
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Must be idempotent: the same event may be handled more than once.
    async fn handle(&self, event: &TenantEvent) -> Result<HandlerOutcome, HandlerError>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut patterns = self.patterns();
        patterns.sort();
        f.debug_struct("HandlerRegistry").field("patterns", &patterns).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in handlers for every recognized event kind.
    pub fn with_defaults(ledger: Arc<CreditLedger>, resolver: Arc<CreditConfigResolver>, directory: Arc<Directory>) -> Self {
        let mut registry = Self::new();
        registry.register(
            EventKind::CreditAllocated.as_str(),
            Arc::new(CreditAllocatedHandler::new(ledger.clone())),
        );
        registry.register(
            EventKind::CreditConsumed.as_str(),
            Arc::new(CreditConsumedHandler::new(ledger, resolver.clone())),
        );
        registry.register(
            EventKind::CreditConfigUpdated.as_str(),
            Arc::new(CreditConfigUpdatedHandler::new(resolver)),
        );

        let directory_handler: Arc<dyn EventHandler> = Arc::new(DirectoryHandler::new(directory));
        for kind in EventKind::KNOWN.iter().filter(|k| Directory::handles(k)) {
            registry.register(kind.as_str(), directory_handler.clone());
        }
        registry
    }

    /// Register for an exact event type, a `"prefix.*"` pattern or `"*"`.
    pub fn register(&mut self, pattern: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(pattern.into(), handler);
    }

    pub fn get(&self, event_type: &str) -> Option<Arc<dyn EventHandler>> {
        if let Some(h) = self.handlers.get(event_type) {
            return Some(h.clone());
        }

        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                event_type
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('.'))
                    .then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len);
        if let Some((_, handler)) = category {
            return Some(handler.clone());
        }

        self.handlers.get("*").cloned()
    }

    pub fn patterns(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

fn entity(event: &TenantEvent) -> Result<EntityId, EnvelopeError> {
    event.entity_id.clone().ok_or(EnvelopeError::MissingField("entityId"))
}

fn first_field<T: serde::de::DeserializeOwned>(
    event: &TenantEvent,
    keys: &[&'static str],
) -> Result<Option<T>, EnvelopeError> {
    for key in keys {
        if let Some(v) = event.field(*key)? {
            return Ok(Some(v));
        }
    }
    Ok(None)
}

/// `credit.allocated`: add credits to an entity (creates the row on first use).
/// A `deactivate: true` payload deactivates the allocation instead.
#[derive(Debug)]
pub struct CreditAllocatedHandler {
    ledger: Arc<CreditLedger>,
}

impl CreditAllocatedHandler {
    pub fn new(ledger: Arc<CreditLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl EventHandler for CreditAllocatedHandler {
    fn name(&self) -> &str {
        "credit-allocated"
    }

    async fn handle(&self, event: &TenantEvent) -> Result<HandlerOutcome, HandlerError> {
        let entity_id = entity(event)?;

        if first_field::<bool>(event, &["deactivate", "deactivated"])?.unwrap_or(false) {
            let key = IdempotencyKey::for_event(&event.id, &OperationCode::from(DEACTIVATE_OPERATION));
            let snapshot = self.ledger.deactivate(&event.tenant_id, &entity_id, key).await?;
            return Ok(HandlerOutcome::Completed(json!({
                "entityId": entity_id,
                "deactivated": snapshot.is_some(),
            })));
        }

        let amount: i64 = first_field(event, &["amount", "credits", "allocatedCredits"])?
            .ok_or(EnvelopeError::MissingField("amount"))?;
        let expires_at: Option<DateTime<Utc>> = first_field(event, &["expiresAt", "expires_at"])?;
        let external_ref: Option<String> = first_field(event, &["externalRef", "externalId", "external_ref"])?;

        let receipt = self
            .ledger
            .allocate(
                &event.tenant_id,
                AllocateRequest {
                    entity_id: entity_id.clone(),
                    amount,
                    expires_at,
                    external_ref,
                    key: IdempotencyKey::for_event(&event.id, &OperationCode::from(ALLOCATE_OPERATION)),
                },
            )
            .await?;

        Ok(HandlerOutcome::Completed(json!({
            "entityId": entity_id,
            "allocatedCredits": receipt.allocated_credits,
            "availableCredits": receipt.available_credits,
            "replayed": receipt.replayed,
        })))
    }
}

/// `credit.consumed`: charge an entity for an operation performed elsewhere.
///
/// The amount comes from the payload, or else from the operation's configured
/// cost. An operation with no configured cost completes without charging.
#[derive(Debug)]
pub struct CreditConsumedHandler {
    ledger: Arc<CreditLedger>,
    resolver: Arc<CreditConfigResolver>,
}

impl CreditConsumedHandler {
    pub fn new(ledger: Arc<CreditLedger>, resolver: Arc<CreditConfigResolver>) -> Self {
        Self { ledger, resolver }
    }
}

#[async_trait]
impl EventHandler for CreditConsumedHandler {
    fn name(&self) -> &str {
        "credit-consumed"
    }

    async fn handle(&self, event: &TenantEvent) -> Result<HandlerOutcome, HandlerError> {
        let entity_id = entity(event)?;
        let operation: String = first_field(event, &["operationCode", "operation_code", "operation"])?
            .ok_or(EnvelopeError::MissingField("operationCode"))?;
        let operation_code = OperationCode::parse(&operation).map_err(|e| EnvelopeError::InvalidField {
            field: "operationCode",
            reason: e.to_string(),
        })?;

        let amount = match first_field::<i64>(event, &["amount", "credits", "creditsUsed"])? {
            Some(amount) => amount,
            None => match self
                .resolver
                .try_resolve(&operation_code, &event.tenant_id, Some(&entity_id))
                .await?
            {
                Some(resolved) => resolved.credit_cost(),
                None => {
                    return Ok(HandlerOutcome::Completed(json!({
                        "entityId": entity_id,
                        "operationCode": operation_code,
                        "creditsDeducted": 0,
                        "reason": "no credit cost configured",
                    })));
                }
            },
        };
        if amount < 0 {
            return Err(EnvelopeError::InvalidField {
                field: "amount",
                reason: format!("must be >= 0 (got {amount})"),
            }
            .into());
        }

        let user_id: Option<String> = first_field(event, &["userId", "user_id"])?;
        let ctx = ConsumeContext::for_event(&event.id, operation_code.clone())
            .with_user(user_id.as_deref().map(UserId::from))
            .with_resource(
                first_field(event, &["resourceType", "resource_type"])?,
                first_field(event, &["resourceId", "resource_id"])?,
            )
            .with_details(JsonValue::Object(event.data.clone()));

        let receipt = self.ledger.consume(&event.tenant_id, &entity_id, amount, ctx).await?;
        Ok(HandlerOutcome::Completed(json!({
            "entityId": entity_id,
            "operationCode": operation_code,
            "creditsDeducted": receipt.credits_deducted,
            "remainingCredits": receipt.remaining_credits,
            "replayed": receipt.replayed,
        })))
    }
}

/// `credit_config.updated`: upsert a cost config and drop cached resolutions.
///
/// The config may be the payload itself or nested under `config`. A missing
/// `configId` is derived from the config's scope so redeliveries overwrite the
/// same row.
///
/// The event's tenant owns the config: a payload naming another tenant, or a
/// global row, is rejected. Global defaults only change through
/// [`CreditConfigResolver::sync_global_configs`].
#[derive(Debug)]
pub struct CreditConfigUpdatedHandler {
    resolver: Arc<CreditConfigResolver>,
}

impl CreditConfigUpdatedHandler {
    pub fn new(resolver: Arc<CreditConfigResolver>) -> Self {
        Self { resolver }
    }

    fn config_from(event: &TenantEvent) -> Result<CreditConfig, HandlerError> {
        let mut map = match event.data.get("config") {
            Some(JsonValue::Object(nested)) => nested.clone(),
            _ => event.data.clone(),
        };

        let is_global = map.get("isGlobal").and_then(JsonValue::as_bool).unwrap_or(false)
            || map.get("source").and_then(JsonValue::as_str) == Some(ConfigSource::Global.as_str());
        if is_global {
            return Err(HandlerError::Rejected(format!(
                "tenant {} cannot update global credit configs",
                event.tenant_id
            )));
        }
        match map.get("tenantId") {
            None | Some(JsonValue::Null) => {}
            Some(JsonValue::String(t)) if t.trim() == event.tenant_id.as_str() => {}
            Some(other) => {
                return Err(HandlerError::Rejected(format!(
                    "config for tenant {other} in an event of tenant {}",
                    event.tenant_id
                )));
            }
        }
        map.insert("tenantId".to_string(), json!(event.tenant_id));
        let entity_id = map
            .get("entityId")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .or_else(|| event.entity_id.as_ref().map(|e| e.to_string()));

        if !map.contains_key("source") {
            let source = if entity_id.is_some() {
                ConfigSource::Entity
            } else {
                ConfigSource::Tenant
            };
            map.insert("source".to_string(), json!(source.as_str()));
        }
        if let Some(entity_id) = &entity_id
            && !map.contains_key("entityId")
        {
            map.insert("entityId".to_string(), json!(entity_id));
        }
        if !map.contains_key("updatedAt") {
            let at = event.timestamp.unwrap_or_else(Utc::now);
            map.insert("updatedAt".to_string(), json!(at));
        }
        if !map.contains_key("configId") {
            let derived = format!(
                "{}:{}:{}:{}",
                map.get("source").and_then(JsonValue::as_str).unwrap_or("tenant"),
                map.get("tenantId").and_then(JsonValue::as_str).unwrap_or("-"),
                map.get("entityId").and_then(JsonValue::as_str).unwrap_or("-"),
                map.get("operationCode").and_then(JsonValue::as_str).unwrap_or("-"),
            );
            map.insert("configId".to_string(), json!(derived));
        }

        let config: CreditConfig = serde_json::from_value(JsonValue::Object(map)).map_err(|e| {
            EnvelopeError::InvalidField {
                field: "config",
                reason: e.to_string(),
            }
        })?;
        if config.is_global || config.tenant_id.as_ref() != Some(&event.tenant_id) {
            return Err(HandlerError::Rejected(format!(
                "config {} is not scoped to tenant {}",
                config.config_id, event.tenant_id
            )));
        }
        Ok(config)
    }
}

#[async_trait]
impl EventHandler for CreditConfigUpdatedHandler {
    fn name(&self) -> &str {
        "credit-config-updated"
    }

    async fn handle(&self, event: &TenantEvent) -> Result<HandlerOutcome, HandlerError> {
        let config = Self::config_from(event)?;
        let summary = json!({
            "configId": config.config_id,
            "operationCode": config.operation_code,
            "creditCost": config.credit_cost,
            "source": config.source,
            "isActive": config.is_active,
        });
        self.resolver.apply_update(config).await?;
        Ok(HandlerOutcome::Completed(summary))
    }
}

/// Organization, user and role events feed the tenant directory.
#[derive(Debug)]
pub struct DirectoryHandler {
    directory: Arc<Directory>,
}

impl DirectoryHandler {
    pub fn new(directory: Arc<Directory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl EventHandler for DirectoryHandler {
    fn name(&self) -> &str {
        "directory"
    }

    async fn handle(&self, event: &TenantEvent) -> Result<HandlerOutcome, HandlerError> {
        let update = self.directory.apply(event)?;
        if update.applied {
            Ok(HandlerOutcome::Completed(json!(update)))
        } else {
            Ok(HandlerOutcome::Skipped(format!("{} not in directory", update.target)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost_config::InMemoryCreditConfigStore;
    use crate::ledger::InMemoryLedgerStore;
    use creditflow_core::{EventId, TenantId};
    use serde_json::Map;

    struct Named(&'static str);

    #[async_trait]
    impl EventHandler for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn handle(&self, _event: &TenantEvent) -> Result<HandlerOutcome, HandlerError> {
            Ok(HandlerOutcome::Skipped(self.0.to_string()))
        }
    }

    fn services() -> (Arc<CreditLedger>, Arc<CreditConfigResolver>) {
        let ledger = Arc::new(CreditLedger::new(Arc::new(InMemoryLedgerStore::default())));
        let resolver = Arc::new(CreditConfigResolver::new(Arc::new(InMemoryCreditConfigStore::new())));
        (ledger, resolver)
    }

    fn event(kind: EventKind, id: &str, data: JsonValue) -> TenantEvent {
        let JsonValue::Object(map) = data else {
            return TenantEvent::new(EventId::from(id), &kind, TenantId::from("T1"), Map::new());
        };
        TenantEvent::new(EventId::from(id), &kind, TenantId::from("T1"), map).with_entity(EntityId::from("ORG-1"))
    }

    #[test]
    fn routing_prefers_exact_then_longest_category_then_wildcard() {
        let mut registry = HandlerRegistry::new();
        registry.register("credit.allocated", Arc::new(Named("exact")));
        registry.register("credit.*", Arc::new(Named("credit")));
        registry.register("role.permissions.*", Arc::new(Named("role-perms")));
        registry.register("role.*", Arc::new(Named("role")));
        registry.register("*", Arc::new(Named("any")));

        let name = |t: &str| registry.get(t).map(|h| h.name().to_string());
        assert_eq!(name("credit.allocated").as_deref(), Some("exact"));
        assert_eq!(name("credit.consumed").as_deref(), Some("credit"));
        assert_eq!(name("role.permissions.updated").as_deref(), Some("role-perms"));
        assert_eq!(name("role.assigned").as_deref(), Some("role"));
        assert_eq!(name("creditx.foo").as_deref(), Some("any"));
    }

    #[test]
    fn unknown_types_have_no_default_handler() {
        let (ledger, resolver) = services();
        let registry = HandlerRegistry::with_defaults(ledger, resolver, Arc::new(Directory::in_memory()));
        assert!(registry.get("invoice.paid").is_none());
        assert!(registry.get(EventKind::UserDeleted.as_str()).is_some());
    }

    #[tokio::test]
    async fn allocation_then_consumption_by_configured_cost() {
        let (ledger, resolver) = services();
        resolver
            .apply_update(CreditConfig::global("crm.leads.create", 5))
            .await
            .unwrap();

        let allocate = CreditAllocatedHandler::new(ledger.clone());
        allocate
            .handle(&event(EventKind::CreditAllocated, "e1", json!({"amount": 100})))
            .await
            .unwrap();

        let consume = CreditConsumedHandler::new(ledger.clone(), resolver);
        let outcome = consume
            .handle(&event(
                EventKind::CreditConsumed,
                "e2",
                json!({"operationCode": "crm.leads.create", "userId": "u1"}),
            ))
            .await
            .unwrap();
        let HandlerOutcome::Completed(v) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(v["creditsDeducted"], 5);
        assert_eq!(v["remainingCredits"], 95);
    }

    #[tokio::test]
    async fn overdraw_is_a_rejection_and_missing_entity_is_malformed() {
        let (ledger, resolver) = services();
        let consume = CreditConsumedHandler::new(ledger, resolver);

        let err = consume
            .handle(&event(
                EventKind::CreditConsumed,
                "e1",
                json!({"operationCode": "crm.leads.create", "amount": 1}),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Rejected(_)));

        let mut no_entity = event(EventKind::CreditConsumed, "e2", json!({"operationCode": "x", "amount": 1}));
        no_entity.entity_id = None;
        let err = consume.handle(&no_entity).await.unwrap_err();
        assert!(matches!(err, HandlerError::Malformed(EnvelopeError::MissingField("entityId"))));
    }

    #[tokio::test]
    async fn config_updates_derive_scope_and_are_idempotent() {
        let (_, resolver) = services();
        let handler = CreditConfigUpdatedHandler::new(resolver.clone());
        let mut ev = event(
            EventKind::CreditConfigUpdated,
            "c1",
            json!({"operationCode": "crm.quotes.create", "creditCost": 3, "overridesGlobal": true}),
        );
        ev.entity_id = None;

        handler.handle(&ev).await.unwrap();
        handler.handle(&ev).await.unwrap();

        let resolved = resolver
            .resolve(&OperationCode::from("crm.quotes.create"), &TenantId::from("T1"), None)
            .await
            .unwrap();
        assert_eq!(resolved.credit_cost(), 3);
        assert_eq!(resolved.config.source, ConfigSource::Tenant);
        assert_eq!(resolved.config.config_id, "tenant:T1:-:crm.quotes.create");
    }

    #[tokio::test]
    async fn config_updates_cannot_reach_other_tenants_or_globals() {
        let (_, resolver) = services();
        resolver
            .apply_update(CreditConfig::global("crm.leads.create", 5))
            .await
            .unwrap();
        let handler = CreditConfigUpdatedHandler::new(resolver.clone());

        let mut cross_tenant = event(
            EventKind::CreditConfigUpdated,
            "c1",
            json!({"operationCode": "crm.leads.create", "creditCost": 999, "tenantId": "T2", "overridesGlobal": true}),
        );
        cross_tenant.entity_id = None;
        let err = handler.handle(&cross_tenant).await.unwrap_err();
        assert!(matches!(err, HandlerError::Rejected(_)));

        let mut global = event(
            EventKind::CreditConfigUpdated,
            "c2",
            json!({"operationCode": "crm.leads.create", "creditCost": 0, "isGlobal": true}),
        );
        global.entity_id = None;
        let err = handler.handle(&global).await.unwrap_err();
        assert!(matches!(err, HandlerError::Rejected(_)));

        let mut nested_global = event(
            EventKind::CreditConfigUpdated,
            "c3",
            json!({"config": {"operationCode": "crm.leads.create", "creditCost": 0, "source": "global", "tenantId": null}}),
        );
        nested_global.entity_id = None;
        assert!(matches!(handler.handle(&nested_global).await, Err(HandlerError::Rejected(_))));

        for tenant in ["T1", "T2"] {
            let resolved = resolver
                .resolve(&OperationCode::from("crm.leads.create"), &TenantId::from(tenant), None)
                .await
                .unwrap();
            assert_eq!(resolved.credit_cost(), 5, "tenant {tenant}");
        }
    }
}
