//! Strongly-typed identifiers used across the system.
//!
//! Identifiers arrive from an external organization/billing service, so they are
//! opaque strings rather than UUIDs. Construction trims whitespace and rejects
//! empty values.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Identifier of a tenant (multi-tenant boundary).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

/// Identifier of a credit-holding entity (organization, department, company code).
///
/// The same logical entity may be referenced by an internal id or by its external
/// code; ledger lookups accept either form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

/// Identifier of a user (actor identity).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

/// Identifier of an externally produced event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

/// Billable action code (e.g. `crm.leads.create`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationCode(String);

macro_rules! impl_string_id {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create an identifier, rejecting blank values.
            pub fn parse(value: impl AsRef<str>) -> Result<Self, DomainError> {
                let trimmed = value.as_ref().trim();
                if trimmed.is_empty() {
                    return Err(DomainError::invalid_id(concat!($name, ": empty")));
                }
                Ok(Self(trimmed.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        /// Infallible conversion for literals and values already validated upstream.
        ///
        /// Prefer `parse` at trust boundaries (envelopes, HTTP input).
        impl From<&str> for $t {
            fn from(value: &str) -> Self {
                Self(value.trim().to_string())
            }
        }
    };
}

impl_string_id!(TenantId, "TenantId");
impl_string_id!(EntityId, "EntityId");
impl_string_id!(UserId, "UserId");
impl_string_id!(EventId, "EventId");
impl_string_id!(OperationCode, "OperationCode");

impl EventId {
    /// Generate a fresh, time-ordered event id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }
}
