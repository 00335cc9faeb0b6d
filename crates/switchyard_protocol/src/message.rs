use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::validation;

/// Well-known metadata keys.
pub mod meta {
    pub const IS_RESPONSE: &str = "isResponse";
    pub const ORIGINAL_MESSAGE_ID: &str = "originalMessageId";
    pub const USER_ID: &str = "userId";
    pub const SESSION_ID: &str = "sessionId";
    pub const JOB_IDS: &str = "jobIds";
    pub const SUCCESS: &str = "success";
}

/// A request or a reply travelling over the broker.
///
/// `metadata` is opaque apart from the keys in [`meta`]. It is kept as an
/// `Option` so a message without metadata round-trips without gaining an
/// empty object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BusMessage {
    pub id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    pub timestamp: DateTime<Utc>,
}

pub type IncomingMessage = BusMessage;
pub type OutgoingMessage = BusMessage;

impl BusMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set_meta(key, value);
        self
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value.into());
    }

    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.metadata.as_ref().and_then(|m| m.get(key))
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta(key).and_then(Value::as_str)
    }

    /// True only for an explicit boolean `isResponse: true`.
    pub fn is_response(&self) -> bool {
        matches!(self.meta(meta::IS_RESPONSE), Some(Value::Bool(true)))
    }

    /// Builds a reply tagged as a response, correlated to `original` and
    /// carrying its user and session ids along.
    pub fn response_to(original: &BusMessage, content: impl Into<String>) -> Self {
        let mut reply = BusMessage::new(content)
            .with_meta(meta::IS_RESPONSE, true)
            .with_meta(meta::ORIGINAL_MESSAGE_ID, original.id.clone());
        for key in [meta::USER_ID, meta::SESSION_ID] {
            if let Some(value) = original.meta(key) {
                reply.set_meta(key, value.clone());
            }
        }
        reply
    }

    /// Checks this message against the wire shape.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let value =
            serde_json::to_value(self).map_err(|e| ProtocolError::Serialize(e.to_string()))?;
        validation::validate_value(&value)
    }

    /// Parses and validates a raw broker payload.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        validation::validate_value(&value)?;
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Validates and serializes for publishing.
    pub fn to_vec(&self) -> Result<Vec<u8>, ProtocolError> {
        self.validate()?;
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialize(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_carries_correlation() {
        let original = BusMessage::new("hi")
            .with_meta(meta::USER_ID, "u1")
            .with_meta(meta::SESSION_ID, "s1")
            .with_meta("channel", "web");
        let reply = BusMessage::response_to(&original, "hello");

        assert!(reply.is_response());
        assert_ne!(reply.id, original.id);
        assert_eq!(reply.meta_str(meta::ORIGINAL_MESSAGE_ID), Some(original.id.as_str()));
        assert_eq!(reply.meta_str(meta::USER_ID), Some("u1"));
        assert_eq!(reply.meta_str(meta::SESSION_ID), Some("s1"));
        assert!(reply.meta("channel").is_none());
    }

    #[test]
    fn response_flag_must_be_boolean_true() {
        let msg = BusMessage::new("x").with_meta(meta::IS_RESPONSE, "true");
        assert!(!msg.is_response());
        let msg = BusMessage::new("x").with_meta(meta::IS_RESPONSE, false);
        assert!(!msg.is_response());
        assert!(!BusMessage::new("x").is_response());
    }

    #[test]
    fn publish_then_consume_preserves_record() {
        let sent = BusMessage::new("Calculate the average of 10, 20, 30")
            .with_meta(meta::USER_ID, "u1")
            .with_meta("nested", json!({"a": [1, 2, 3]}));
        let bytes = sent.to_vec().unwrap();
        let received = BusMessage::from_slice(&bytes).unwrap();
        assert_eq!(sent, received);

        let bare = BusMessage::new("no metadata");
        let received = BusMessage::from_slice(&bare.to_vec().unwrap()).unwrap();
        assert_eq!(bare, received);
        assert!(received.metadata.is_none());
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let err = BusMessage::from_slice(b"{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }
}
