//! Envelope normalization.
//!
//! Producers publish `{id, eventType, tenantId, entityId?, timestamp, data}` but are
//! inconsistent about details: `data` may be an object or a JSON-encoded string,
//! identifiers may sit inside `data`, and older producers use snake_case keys.
//! [`TenantEvent::normalize`] folds all of these into one flat shape before dispatch.

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use creditflow_core::{EntityId, EventId, TenantId};

use crate::EventKind;

const ID_KEYS: &[&str] = &["id", "eventId", "event_id"];
const TYPE_KEYS: &[&str] = &["eventType", "event_type", "type"];
const TENANT_KEYS: &[&str] = &["tenantId", "tenant_id"];
const ENTITY_KEYS: &[&str] = &["entityId", "entity_id", "orgCode", "organizationId"];
const TIMESTAMP_KEYS: &[&str] = &["timestamp", "occurredAt", "occurred_at"];

/// Envelope could not be turned into a [`TenantEvent`].
///
/// Always a permanent condition: the message is recorded `skipped` and never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("envelope must be a JSON object")]
    NotAnObject,

    #[error("`data` field is not a JSON object or JSON-encoded object: {0}")]
    InvalidData(String),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// A normalized, flat event ready for handler dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantEvent {
    pub id: EventId,
    pub event_type: String,
    pub tenant_id: TenantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: Map<String, JsonValue>,
}

impl TenantEvent {
    pub fn new(
        id: EventId,
        kind: &EventKind,
        tenant_id: TenantId,
        data: Map<String, JsonValue>,
    ) -> Self {
        Self {
            id,
            event_type: kind.as_str().to_string(),
            tenant_id,
            entity_id: None,
            timestamp: Some(Utc::now()),
            data,
        }
    }

    pub fn with_entity(mut self, entity_id: EntityId) -> Self {
        self.entity_id = Some(entity_id);
        self
    }

    /// Parse and normalize a raw JSON envelope string.
    pub fn parse(raw: &str) -> Result<Self, EnvelopeError> {
        let value: JsonValue =
            serde_json::from_str(raw).map_err(|e| EnvelopeError::InvalidJson(e.to_string()))?;
        Self::normalize(value)
    }

    /// Normalize a JSON envelope (nested or flat `data`) into a flat event.
    pub fn normalize(value: JsonValue) -> Result<Self, EnvelopeError> {
        let JsonValue::Object(mut top) = value else {
            return Err(EnvelopeError::NotAnObject);
        };

        let mut data = match top.remove("data") {
            None | Some(JsonValue::Null) => Map::new(),
            Some(JsonValue::Object(map)) => map,
            Some(JsonValue::String(encoded)) => match serde_json::from_str::<JsonValue>(&encoded) {
                Ok(JsonValue::Object(map)) => map,
                Ok(other) => {
                    return Err(EnvelopeError::InvalidData(format!(
                        "decoded to {}",
                        json_kind(&other)
                    )));
                }
                Err(e) => return Err(EnvelopeError::InvalidData(e.to_string())),
            },
            Some(other) => return Err(EnvelopeError::InvalidData(json_kind(&other).to_string())),
        };

        let id = take_string(&mut top, &mut data, ID_KEYS, "id")?
            .ok_or(EnvelopeError::MissingField("id"))?;
        let event_type = take_string(&mut top, &mut data, TYPE_KEYS, "eventType")?
            .ok_or(EnvelopeError::MissingField("eventType"))?;
        let tenant = take_string(&mut top, &mut data, TENANT_KEYS, "tenantId")?
            .ok_or(EnvelopeError::MissingField("tenantId"))?;
        let entity = take_string(&mut top, &mut data, ENTITY_KEYS, "entityId")?;
        let timestamp = take_timestamp(&mut top, &mut data)?;

        // Remaining top-level fields are folded into `data`; nested values win.
        for (key, value) in top {
            data.entry(key).or_insert(value);
        }

        Ok(Self {
            id: EventId::parse(&id).map_err(|e| invalid("id", e))?,
            event_type,
            tenant_id: TenantId::parse(&tenant).map_err(|e| invalid("tenantId", e))?,
            entity_id: entity
                .map(|e| EntityId::parse(&e).map_err(|err| invalid("entityId", err)))
                .transpose()?,
            timestamp,
            data,
        })
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from_type(&self.event_type)
    }

    /// Deserialize an optional `data` field.
    pub fn field<T: DeserializeOwned>(&self, key: &'static str) -> Result<Option<T>, EnvelopeError> {
        match self.data.get(key) {
            None | Some(JsonValue::Null) => Ok(None),
            Some(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|e| EnvelopeError::InvalidField {
                    field: key,
                    reason: e.to_string(),
                }),
        }
    }

    /// Deserialize a required `data` field.
    pub fn required<T: DeserializeOwned>(&self, key: &'static str) -> Result<T, EnvelopeError> {
        self.field(key)?.ok_or(EnvelopeError::MissingField(key))
    }

    /// Wire form (nested `data` object), as producers publish it.
    pub fn to_wire(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

fn invalid(field: &'static str, err: impl core::fmt::Display) -> EnvelopeError {
    EnvelopeError::InvalidField {
        field,
        reason: err.to_string(),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Remove the first present alias from the top level, falling back to `data`.
fn take_raw(
    top: &mut Map<String, JsonValue>,
    data: &mut Map<String, JsonValue>,
    keys: &[&str],
) -> Option<JsonValue> {
    for key in keys {
        if let Some(v) = top.remove(*key) {
            if !v.is_null() {
                return Some(v);
            }
        }
    }
    keys.iter()
        .find_map(|key| data.get(*key).filter(|v| !v.is_null()).cloned())
}

fn take_string(
    top: &mut Map<String, JsonValue>,
    data: &mut Map<String, JsonValue>,
    keys: &[&str],
    field: &'static str,
) -> Result<Option<String>, EnvelopeError> {
    match take_raw(top, data, keys) {
        None => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(s)),
        Some(JsonValue::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(EnvelopeError::InvalidField {
            field,
            reason: format!("expected string, found {}", json_kind(&other)),
        }),
    }
}

fn take_timestamp(
    top: &mut Map<String, JsonValue>,
    data: &mut Map<String, JsonValue>,
) -> Result<Option<DateTime<Utc>>, EnvelopeError> {
    match take_raw(top, data, TIMESTAMP_KEYS) {
        None => Ok(None),
        Some(JsonValue::String(s)) => DateTime::parse_from_rfc3339(&s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| invalid("timestamp", e)),
        Some(JsonValue::Number(n)) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .map(Some)
            .ok_or_else(|| invalid("timestamp", "epoch millis out of range")),
        Some(other) => Err(invalid("timestamp", json_kind(&other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_object_data_is_flattened() {
        let ev = TenantEvent::normalize(json!({
            "id": "e1",
            "eventType": "credit.allocated",
            "tenantId": "T1",
            "entityId": "ORG-1",
            "timestamp": "2026-01-02T03:04:05Z",
            "data": { "amount": 100 }
        }))
        .unwrap();

        assert_eq!(ev.id.as_str(), "e1");
        assert_eq!(ev.kind(), EventKind::CreditAllocated);
        assert_eq!(ev.tenant_id.as_str(), "T1");
        assert_eq!(ev.entity_id.as_ref().map(|e| e.as_str()), Some("ORG-1"));
        assert_eq!(ev.required::<i64>("amount").unwrap(), 100);
        assert!(ev.timestamp.is_some());
    }

    #[test]
    fn string_encoded_data_is_decoded() {
        let ev = TenantEvent::normalize(json!({
            "id": "e2",
            "eventType": "credit.consumed",
            "tenantId": "T1",
            "data": "{\"amount\": 5, \"operationCode\": \"crm.leads.create\"}"
        }))
        .unwrap();

        assert_eq!(ev.required::<i64>("amount").unwrap(), 5);
        assert_eq!(
            ev.required::<String>("operationCode").unwrap(),
            "crm.leads.create"
        );
    }

    #[test]
    fn identifiers_nested_in_data_are_hoisted() {
        let ev = TenantEvent::normalize(json!({
            "eventType": "user.created",
            "data": { "eventId": "e3", "tenantId": "T9", "entityId": "ORG-2", "email": "a@b.c" }
        }))
        .unwrap();

        assert_eq!(ev.id.as_str(), "e3");
        assert_eq!(ev.tenant_id.as_str(), "T9");
        assert_eq!(ev.entity_id.unwrap().as_str(), "ORG-2");
    }

    #[test]
    fn extra_top_level_fields_fold_into_data() {
        let ev = TenantEvent::normalize(json!({
            "id": "e4",
            "type": "organization.created",
            "tenant_id": "T1",
            "name": "top",
            "data": { "name": "nested" }
        }))
        .unwrap();

        assert_eq!(ev.required::<String>("name").unwrap(), "nested");
        assert_eq!(ev.kind(), EventKind::OrganizationCreated);
    }

    #[test]
    fn epoch_millis_timestamps_are_accepted() {
        let ev = TenantEvent::normalize(json!({
            "id": "e5", "eventType": "x", "tenantId": "T1", "timestamp": 1_700_000_000_000i64
        }))
        .unwrap();
        assert_eq!(ev.timestamp.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn invalid_json_data_is_rejected() {
        let err = TenantEvent::normalize(json!({
            "id": "e6", "eventType": "credit.consumed", "tenantId": "T1", "data": "{not json"
        }))
        .unwrap_err();
        assert!(matches!(err, EnvelopeError::InvalidData(_)));
    }

    #[test]
    fn missing_tenant_is_rejected() {
        let err = TenantEvent::normalize(json!({ "id": "e7", "eventType": "x" })).unwrap_err();
        assert_eq!(err, EnvelopeError::MissingField("tenantId"));
    }

    #[test]
    fn non_object_envelope_is_rejected() {
        assert_eq!(TenantEvent::parse("[1,2]").unwrap_err(), EnvelopeError::NotAnObject);
        assert!(matches!(
            TenantEvent::parse("nope").unwrap_err(),
            EnvelopeError::InvalidJson(_)
        ));
    }

    #[test]
    fn wire_form_normalizes_back_to_the_same_event() {
        let ev = TenantEvent::new(
            EventId::from("e8"),
            &EventKind::CreditAllocated,
            TenantId::from("T1"),
            json!({ "amount": 10 }).as_object().cloned().unwrap(),
        )
        .with_entity(EntityId::from("ORG-1"));

        let back = TenantEvent::normalize(ev.to_wire()).unwrap();
        assert_eq!(back, ev);
    }
}
