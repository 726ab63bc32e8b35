use creditflow_core::TenantId;

use crate::TenantEvent;

/// Helper trait for tenant-scoped messages.
///
/// Tenant consumers read shared streams; anything whose tenant does not match the
/// consumer's own tenant is acknowledged and ignored without being recorded.
pub trait TenantScoped {
    fn tenant_id(&self) -> &TenantId;

    fn belongs_to(&self, tenant_id: &TenantId) -> bool {
        self.tenant_id() == tenant_id
    }
}

impl TenantScoped for TenantEvent {
    fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }
}
