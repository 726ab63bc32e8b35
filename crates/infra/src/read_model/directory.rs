//! Tenant directory read model: organizations, users and roles.
//!
//! Built from organization/user/role events. It also answers "which entity is
//! this user charged against" for the synchronous credit path.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use creditflow_core::{EntityId, TenantId, UserId};
use creditflow_events::{EnvelopeError, EventKind, TenantEvent};

use super::{InMemoryTenantStore, TenantStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub entity_id: EntityId,
    pub name: Option<String>,
    pub external_ref: Option<String>,
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryUser {
    pub user_id: UserId,
    pub entity_id: Option<EntityId>,
    pub email: Option<String>,
    pub is_active: bool,
    pub roles: BTreeSet<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub role_id: String,
    pub name: Option<String>,
    pub permissions: BTreeSet<String>,
    pub updated_at: DateTime<Utc>,
}

/// What an applied event changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryUpdate {
    pub target: String,
    /// `false` when the event referred to something the directory doesn't know.
    pub applied: bool,
}

impl DirectoryUpdate {
    fn applied(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            applied: true,
        }
    }

    fn ignored(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            applied: false,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EntityLookupError {
    #[error("entity lookup unavailable: {0}")]
    Unavailable(String),
}

/// Maps a user to the credit-holding entity they act for.
#[async_trait]
pub trait EntityResolver: Send + Sync {
    async fn entity_for_user(&self, tenant_id: &TenantId, user_id: &UserId)
    -> Result<Option<EntityId>, EntityLookupError>;
}

pub struct Directory {
    organizations: Arc<dyn TenantStore<EntityId, Organization>>,
    users: Arc<dyn TenantStore<UserId, DirectoryUser>>,
    roles: Arc<dyn TenantStore<String, Role>>,
}

impl std::fmt::Debug for Directory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directory").finish_non_exhaustive()
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl Directory {
    pub fn new(
        organizations: Arc<dyn TenantStore<EntityId, Organization>>,
        users: Arc<dyn TenantStore<UserId, DirectoryUser>>,
        roles: Arc<dyn TenantStore<String, Role>>,
    ) -> Self {
        Self {
            organizations,
            users,
            roles,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryTenantStore::new()),
            Arc::new(InMemoryTenantStore::new()),
            Arc::new(InMemoryTenantStore::new()),
        )
    }

    /// Whether [`Self::apply`] understands this kind of event.
    pub fn handles(kind: &EventKind) -> bool {
        matches!(
            kind,
            EventKind::OrganizationCreated
                | EventKind::OrganizationUpdated
                | EventKind::UserCreated
                | EventKind::UserDeactivated
                | EventKind::UserDeleted
                | EventKind::RoleAssigned
                | EventKind::RoleUnassigned
                | EventKind::RoleUpdated
                | EventKind::RolePermissionsUpdated
        )
    }

    /// Apply one directory event. Re-applying the same event is harmless.
    pub fn apply(&self, event: &TenantEvent) -> Result<DirectoryUpdate, EnvelopeError> {
        let tenant = &event.tenant_id;
        let at = event.timestamp.unwrap_or_else(Utc::now);

        match event.kind() {
            EventKind::OrganizationCreated | EventKind::OrganizationUpdated => {
                let entity_id = event.entity_id.clone().ok_or(EnvelopeError::MissingField("entityId"))?;
                let mut org = self.organizations.get(tenant, &entity_id).unwrap_or(Organization {
                    entity_id: entity_id.clone(),
                    name: None,
                    external_ref: None,
                    is_active: true,
                    updated_at: at,
                });
                if let Some(name) = text(event, &["name", "organizationName"])? {
                    org.name = Some(name);
                }
                if let Some(external) = text(event, &["externalRef", "externalId", "external_ref"])? {
                    org.external_ref = Some(external);
                }
                if let Some(active) = event.field::<bool>("isActive")? {
                    org.is_active = active;
                }
                org.updated_at = at;
                self.organizations.upsert(tenant, entity_id.clone(), org);
                Ok(DirectoryUpdate::applied(entity_id.as_str()))
            }
            EventKind::UserCreated => {
                let user_id = user_id(event)?;
                let roles: Option<BTreeSet<String>> = event.field("roles")?;
                let user = DirectoryUser {
                    user_id: user_id.clone(),
                    entity_id: event.entity_id.clone(),
                    email: text(event, &["email"])?,
                    is_active: true,
                    roles: roles.unwrap_or_default(),
                    updated_at: at,
                };
                self.users.upsert(tenant, user_id.clone(), user);
                Ok(DirectoryUpdate::applied(user_id.as_str()))
            }
            EventKind::UserDeactivated => {
                let user_id = user_id(event)?;
                Ok(self.update_user(tenant, &user_id, at, |u| u.is_active = false))
            }
            EventKind::UserDeleted => {
                let user_id = user_id(event)?;
                Ok(match self.users.remove(tenant, &user_id) {
                    Some(_) => DirectoryUpdate::applied(user_id.as_str()),
                    None => DirectoryUpdate::ignored(user_id.as_str()),
                })
            }
            EventKind::RoleAssigned => {
                let user_id = user_id(event)?;
                let role_id = role_id(event)?;
                Ok(self.update_user(tenant, &user_id, at, |u| {
                    u.roles.insert(role_id.clone());
                }))
            }
            EventKind::RoleUnassigned => {
                let user_id = user_id(event)?;
                let role_id = role_id(event)?;
                Ok(self.update_user(tenant, &user_id, at, |u| {
                    u.roles.remove(&role_id);
                }))
            }
            EventKind::RoleUpdated | EventKind::RolePermissionsUpdated => {
                let role_id = role_id(event)?;
                let permissions: Option<BTreeSet<String>> = event.field("permissions")?;
                if event.kind() == EventKind::RolePermissionsUpdated && permissions.is_none() {
                    return Err(EnvelopeError::MissingField("permissions"));
                }

                let mut role = self.roles.get(tenant, &role_id).unwrap_or(Role {
                    role_id: role_id.clone(),
                    name: None,
                    permissions: BTreeSet::new(),
                    updated_at: at,
                });
                if let Some(name) = text(event, &["name", "roleName"])? {
                    role.name = Some(name);
                }
                if let Some(permissions) = permissions {
                    role.permissions = permissions;
                }
                role.updated_at = at;
                self.roles.upsert(tenant, role_id.clone(), role);
                Ok(DirectoryUpdate::applied(role_id))
            }
            other => Ok(DirectoryUpdate::ignored(other.as_str())),
        }
    }

    fn update_user(
        &self,
        tenant: &TenantId,
        user_id: &UserId,
        at: DateTime<Utc>,
        change: impl FnOnce(&mut DirectoryUser),
    ) -> DirectoryUpdate {
        match self.users.get(tenant, user_id) {
            Some(mut user) => {
                change(&mut user);
                user.updated_at = at;
                self.users.upsert(tenant, user_id.clone(), user);
                DirectoryUpdate::applied(user_id.as_str())
            }
            None => DirectoryUpdate::ignored(user_id.as_str()),
        }
    }

    pub fn organization(&self, tenant_id: &TenantId, entity_id: &EntityId) -> Option<Organization> {
        self.organizations.get(tenant_id, entity_id)
    }

    pub fn organizations(&self, tenant_id: &TenantId) -> Vec<Organization> {
        self.organizations.list(tenant_id)
    }

    pub fn user(&self, tenant_id: &TenantId, user_id: &UserId) -> Option<DirectoryUser> {
        self.users.get(tenant_id, user_id)
    }

    pub fn role(&self, tenant_id: &TenantId, role_id: &str) -> Option<Role> {
        self.roles.get(tenant_id, &role_id.to_string())
    }

    /// Union of the permissions of the user's roles; empty for unknown or inactive users.
    pub fn permissions_for_user(&self, tenant_id: &TenantId, user_id: &UserId) -> BTreeSet<String> {
        let Some(user) = self.user(tenant_id, user_id).filter(|u| u.is_active) else {
            return BTreeSet::new();
        };
        user.roles
            .iter()
            .filter_map(|r| self.role(tenant_id, r))
            .flat_map(|r| r.permissions)
            .collect()
    }

    /// Drop everything known about a tenant (rebuild support).
    pub fn clear_tenant(&self, tenant_id: &TenantId) {
        self.organizations.clear_tenant(tenant_id);
        self.users.clear_tenant(tenant_id);
        self.roles.clear_tenant(tenant_id);
    }
}

#[async_trait]
impl EntityResolver for Directory {
    async fn entity_for_user(
        &self,
        tenant_id: &TenantId,
        user_id: &UserId,
    ) -> Result<Option<EntityId>, EntityLookupError> {
        Ok(self
            .user(tenant_id, user_id)
            .filter(|u| u.is_active)
            .and_then(|u| u.entity_id))
    }
}

fn text(event: &TenantEvent, keys: &[&'static str]) -> Result<Option<String>, EnvelopeError> {
    for key in keys {
        if let Some(value) = event.field::<String>(*key)? {
            let value = value.trim();
            if !value.is_empty() {
                return Ok(Some(value.to_string()));
            }
        }
    }
    Ok(None)
}

fn user_id(event: &TenantEvent) -> Result<UserId, EnvelopeError> {
    let raw = text(event, &["userId", "user_id"])?.ok_or(EnvelopeError::MissingField("userId"))?;
    UserId::parse(&raw).map_err(|e| EnvelopeError::InvalidField {
        field: "userId",
        reason: e.to_string(),
    })
}

fn role_id(event: &TenantEvent) -> Result<String, EnvelopeError> {
    text(event, &["roleId", "role_id", "role"])?.ok_or(EnvelopeError::MissingField("roleId"))
}
