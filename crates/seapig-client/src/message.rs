//! Seapig protocol message types
//!
//! Messages are JSON objects tagged by their `action` field.

use json_patch::Patch;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SyncError, SyncResult};

/// Document version as carried on the wire
pub type Version = u64;

/// An incremental or full document update
///
/// Shared by `object-update` (server to client) and `object-patch`
/// (producer to server). Carries either a `patch` against `old_version`
/// or a full `value`; a `value` of `false` means the producer is stalled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentUpdate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_version: Option<Version>,
    pub new_version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<Patch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl DocumentUpdate {
    /// Whether this update replaces the document instead of patching it
    pub fn is_full_sync(&self) -> bool {
        matches!(self.old_version, None | Some(0)) || self.value.is_some()
    }

    /// Whether this update announces a stalled producer
    pub fn is_stall(&self) -> bool {
        matches!(self.value, Some(Value::Bool(false)))
    }
}

/// Messages sent to the Seapig server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum ClientMessage {
    /// Announce the client option set, once per connection
    #[serde(rename = "client-options-set")]
    ClientOptionsSet { options: Value },

    /// Subscribe to a document id or pattern
    #[serde(rename = "object-consumer-register")]
    ObjectConsumerRegister {
        id: String,
        #[serde(rename = "known-version")]
        known_version: Version,
    },

    /// Declare ownership of a document id or pattern
    #[serde(rename = "object-producer-register")]
    ObjectProducerRegister {
        pattern: String,
        #[serde(rename = "known-version")]
        known_version: Version,
    },

    /// Push a producer update
    #[serde(rename = "object-patch")]
    ObjectPatch(DocumentUpdate),
}

/// Messages received from the Seapig server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum ServerMessage {
    /// Update for a subscribed document
    #[serde(rename = "object-update")]
    ObjectUpdate(DocumentUpdate),

    /// A wildcard child no longer exists
    #[serde(rename = "object-destroy")]
    ObjectDestroy { id: String },

    /// A consumer asked for a document this client produces
    #[serde(rename = "object-produce")]
    ObjectProduce { id: String },

    /// Any action this client does not understand
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    /// Create a consumer registration message
    pub fn consumer_register(id: &str, known_version: Version) -> Self {
        ClientMessage::ObjectConsumerRegister {
            id: id.to_string(),
            known_version,
        }
    }

    /// Create a producer registration message
    pub fn producer_register(pattern: &str, known_version: Version) -> Self {
        ClientMessage::ObjectProducerRegister {
            pattern: pattern.to_string(),
            known_version,
        }
    }

    /// Encode message to a JSON text frame
    pub fn encode(&self) -> SyncResult<String> {
        serde_json::to_string(self).map_err(SyncError::Encode)
    }
}

impl ServerMessage {
    /// Decode message from a JSON text frame
    pub fn decode(frame: &str) -> SyncResult<Self> {
        serde_json::from_str(frame).map_err(SyncError::MalformedMessage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_consumer_register_encoding() {
        let frame = ClientMessage::consumer_register("user.*", 0).encode().unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(
            value,
            json!({"action": "object-consumer-register", "id": "user.*", "known-version": 0})
        );
    }

    #[test]
    fn test_producer_register_encoding() {
        let frame = ClientMessage::producer_register("stats", 17).encode().unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(value["action"], "object-producer-register");
        assert_eq!(value["pattern"], "stats");
        assert_eq!(value["known-version"], 17);
    }

    #[test]
    fn test_object_patch_omits_absent_fields() {
        let msg = ClientMessage::ObjectPatch(DocumentUpdate {
            id: "stats".to_string(),
            old_version: Some(0),
            new_version: 3,
            patch: None,
            value: Some(json!({"x": 1})),
        });
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();

        assert_eq!(value["action"], "object-patch");
        assert_eq!(value["value"], json!({"x": 1}));
        assert!(value.get("patch").is_none());
    }

    #[test]
    fn test_object_update_decoding() {
        let frame = r#"{"action":"object-update","id":"user.42","old_version":4,"new_version":5,
            "patch":[{"op":"replace","path":"/name","value":"b"}]}"#;

        match ServerMessage::decode(frame).unwrap() {
            ServerMessage::ObjectUpdate(update) => {
                assert_eq!(update.id, "user.42");
                assert_eq!(update.old_version, Some(4));
                assert_eq!(update.new_version, 5);
                assert_eq!(update.patch.as_ref().map(|p| p.0.len()), Some(1));
                assert!(!update.is_full_sync());
            }
            other => panic!("Expected ObjectUpdate, got {:?}", other),
        }
    }

    #[test]
    fn test_full_sync_detection() {
        let update = |old_version, value| DocumentUpdate {
            id: "a".to_string(),
            old_version,
            new_version: 2,
            patch: None,
            value,
        };

        assert!(update(None, None).is_full_sync());
        assert!(update(Some(0), None).is_full_sync());
        assert!(update(Some(1), Some(json!({}))).is_full_sync());
        assert!(!update(Some(1), None).is_full_sync());
        assert!(update(Some(0), Some(json!(false))).is_stall());
    }

    #[test]
    fn test_unknown_action_decodes() {
        let decoded = ServerMessage::decode(r#"{"action":"server-motd","text":"hi"}"#).unwrap();
        assert!(matches!(decoded, ServerMessage::Unknown));
    }

    #[test]
    fn test_malformed_frame() {
        let err = ServerMessage::decode("not json").unwrap_err();
        assert!(matches!(err, SyncError::MalformedMessage(_)));

        let err = ServerMessage::decode(r#"{"action":"object-destroy"}"#).unwrap_err();
        assert!(matches!(err, SyncError::MalformedMessage(_)));
    }
}
