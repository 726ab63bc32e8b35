/// Event kinds recognized by the tenant consumers.
///
/// Anything else is carried as [`EventKind::Unknown`] so that new producer-side
/// event types never break older consumers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    CreditAllocated,
    CreditConsumed,
    CreditConfigUpdated,
    OrganizationCreated,
    OrganizationUpdated,
    UserCreated,
    UserDeactivated,
    UserDeleted,
    RoleAssigned,
    RoleUnassigned,
    RoleUpdated,
    RolePermissionsUpdated,
    Unknown(String),
}

impl EventKind {
    /// Every recognized kind, in a stable order.
    pub const KNOWN: [EventKind; 12] = [
        EventKind::CreditAllocated,
        EventKind::CreditConsumed,
        EventKind::CreditConfigUpdated,
        EventKind::OrganizationCreated,
        EventKind::OrganizationUpdated,
        EventKind::UserCreated,
        EventKind::UserDeactivated,
        EventKind::UserDeleted,
        EventKind::RoleAssigned,
        EventKind::RoleUnassigned,
        EventKind::RoleUpdated,
        EventKind::RolePermissionsUpdated,
    ];

    /// Parse a producer event type (case-insensitive; `_`/`-` are accepted in place of `.`).
    pub fn from_type(event_type: &str) -> Self {
        let canonical = event_type.trim().to_ascii_lowercase().replace(['_', '-'], ".");
        match canonical.as_str() {
            "credit.allocated" | "credits.allocated" | "credit.allocation" => Self::CreditAllocated,
            "credit.consumed" | "credits.consumed" | "credit.consumption" => Self::CreditConsumed,
            "credit.config.updated" | "creditconfig.updated" => Self::CreditConfigUpdated,
            "organization.created" | "org.created" => Self::OrganizationCreated,
            "organization.updated" | "org.updated" => Self::OrganizationUpdated,
            "user.created" => Self::UserCreated,
            "user.deactivated" => Self::UserDeactivated,
            "user.deleted" => Self::UserDeleted,
            "role.assigned" => Self::RoleAssigned,
            "role.unassigned" => Self::RoleUnassigned,
            "role.updated" => Self::RoleUpdated,
            "role.permissions.updated" | "role.permission.updated" => Self::RolePermissionsUpdated,
            _ => Self::Unknown(event_type.to_string()),
        }
    }

    /// Stable event name used for handler routing and idempotency records.
    pub fn as_str(&self) -> &str {
        match self {
            Self::CreditAllocated => "credit.allocated",
            Self::CreditConsumed => "credit.consumed",
            Self::CreditConfigUpdated => "credit_config.updated",
            Self::OrganizationCreated => "organization.created",
            Self::OrganizationUpdated => "organization.updated",
            Self::UserCreated => "user.created",
            Self::UserDeactivated => "user.deactivated",
            Self::UserDeleted => "user.deleted",
            Self::RoleAssigned => "role.assigned",
            Self::RoleUnassigned => "role.unassigned",
            Self::RoleUpdated => "role.updated",
            Self::RolePermissionsUpdated => "role.permissions_updated",
            Self::Unknown(raw) => raw,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
