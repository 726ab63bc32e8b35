use std::collections::HashMap;

use serde_json::{Map, Value as JsonValue};

use crate::{EnvelopeError, TenantEvent};

/// Field holding a complete JSON envelope.
pub const PAYLOAD_FIELD: &str = "payload";

/// A raw delivery read from a stream through a consumer group.
///
/// `fields` are the stream entry's field/value pairs. Producers either put a full
/// JSON envelope under [`PAYLOAD_FIELD`], or spread the envelope across fields
/// (`id`, `eventType`, `tenantId`, `data`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Stream key the entry was read from.
    pub stream: String,
    /// Bus-assigned entry id (e.g. `1700000000000-0`).
    pub id: String,
    pub fields: HashMap<String, String>,
    /// How many times the bus has delivered this entry (1 on first delivery).
    pub delivery_count: u32,
}

impl StreamMessage {
    pub fn new(stream: impl Into<String>, id: impl Into<String>, fields: HashMap<String, String>) -> Self {
        Self {
            stream: stream.into(),
            id: id.into(),
            fields,
            delivery_count: 1,
        }
    }

    /// Build a message carrying a full JSON envelope.
    pub fn with_payload(stream: impl Into<String>, id: impl Into<String>, payload: impl Into<String>) -> Self {
        let mut fields = HashMap::new();
        fields.insert(PAYLOAD_FIELD.to_string(), payload.into());
        Self::new(stream, id, fields)
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }

    /// Decode the entry into a normalized [`TenantEvent`].
    pub fn decode(&self) -> Result<TenantEvent, EnvelopeError> {
        if let Some(payload) = self.fields.get(PAYLOAD_FIELD) {
            return TenantEvent::parse(payload);
        }

        let object: Map<String, JsonValue> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
            .collect();
        TenantEvent::normalize(JsonValue::Object(object))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventKind;

    #[test]
    fn decodes_payload_field() {
        let msg = StreamMessage::with_payload(
            "crm:credit-events",
            "1-0",
            r#"{"id":"e1","eventType":"credit.allocated","tenantId":"T1","data":{"amount":100}}"#,
        );
        let ev = msg.decode().unwrap();
        assert_eq!(ev.kind(), EventKind::CreditAllocated);
        assert_eq!(ev.required::<i64>("amount").unwrap(), 100);
        assert!(!msg.is_redelivery());
    }

    #[test]
    fn decodes_spread_fields_with_string_data() {
        let mut fields = HashMap::new();
        fields.insert("id".to_string(), "e2".to_string());
        fields.insert("eventType".to_string(), "user.created".to_string());
        fields.insert("tenantId".to_string(), "T1".to_string());
        fields.insert("data".to_string(), r#"{"userId":"U1"}"#.to_string());

        let ev = StreamMessage::new("crm:user-events", "2-0", fields).decode().unwrap();
        assert_eq!(ev.required::<String>("userId").unwrap(), "U1");
    }

    #[test]
    fn malformed_data_field_fails_to_decode() {
        let mut fields = HashMap::new();
        fields.insert("id".to_string(), "e3".to_string());
        fields.insert("eventType".to_string(), "credit.consumed".to_string());
        fields.insert("tenantId".to_string(), "T1".to_string());
        fields.insert("data".to_string(), "{oops".to_string());

        let err = StreamMessage::new("s", "3-0", fields).decode().unwrap_err();
        assert!(matches!(err, EnvelopeError::InvalidData(_)));
    }
}
