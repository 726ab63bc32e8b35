//! `creditflow-events`: the event contract shared with the external
//! organization/billing service.
//!
//! - `envelope`: normalization of producer envelopes into a flat [`TenantEvent`]
//! - `event`: the recognized [`EventKind`]s
//! - `message`: raw deliveries read from a stream ([`StreamMessage`])
//!
//! Nothing in this crate performs IO.

pub mod envelope;
pub mod event;
pub mod message;
pub mod tenant;

pub use envelope::{EnvelopeError, TenantEvent};
pub use event::EventKind;
pub use message::{PAYLOAD_FIELD, StreamMessage};
pub use tenant::TenantScoped;
