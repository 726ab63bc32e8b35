//! Tenant-isolated read models.

pub mod directory;
pub mod tenant_store;

pub use directory::{Directory, DirectoryUpdate, DirectoryUser, EntityLookupError, EntityResolver, Organization, Role};
pub use tenant_store::{InMemoryTenantStore, TenantStore};
