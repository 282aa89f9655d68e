//! Wire protocol for the collaboration server.
//!
//! All traffic is a single JSON envelope with a type tag and a
//! type-specific payload. Unknown or malformed envelopes are dropped by
//! the receiver and counted, never fatal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;
use crate::types::{ActivityEntry, MutationEvent, PresenceStatus};

/// Envelope type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    PresenceUpdate,
    Mutation,
    Activity,
    Heartbeat,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::PresenceUpdate => write!(f, "presence_update"),
            MessageType::Mutation => write!(f, "mutation"),
            MessageType::Activity => write!(f, "activity"),
            MessageType::Heartbeat => write!(f, "heartbeat"),
        }
    }
}

/// Payload of a `presence_update` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub status: PresenceStatus,
    /// Group the presence applies to; absent means personal scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editing_entity_id: Option<String>,
}

/// The transport-agnostic wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Heartbeat envelope for the current user.
    pub fn heartbeat(user_id: impl Into<String>, group_id: Option<String>) -> Self {
        Self {
            kind: MessageType::Heartbeat,
            payload: serde_json::json!({}),
            group_id,
            user_id: user_id.into(),
            timestamp: Utc::now(),
        }
    }

    /// Presence announcement for the current user.
    pub fn presence_update(
        user_id: impl Into<String>,
        payload: &PresencePayload,
    ) -> Result<Self> {
        Ok(Self {
            kind: MessageType::PresenceUpdate,
            payload: serde_json::to_value(payload)?,
            group_id: payload.scope.clone(),
            user_id: user_id.into(),
            timestamp: Utc::now(),
        })
    }

    /// Wrap a mutation event for broadcast.
    pub fn mutation(event: &MutationEvent) -> Result<Self> {
        Ok(Self {
            kind: MessageType::Mutation,
            payload: serde_json::to_value(event)?,
            group_id: event.group_id.clone(),
            user_id: event.origin_user_id.clone(),
            timestamp: event.origin_timestamp,
        })
    }

    /// Wrap an activity entry for broadcast.
    pub fn activity(entry: &ActivityEntry) -> Result<Self> {
        Ok(Self {
            kind: MessageType::Activity,
            payload: serde_json::to_value(entry)?,
            group_id: entry.group_id.clone(),
            user_id: entry.user_id.clone(),
            timestamp: entry.created_at,
        })
    }

    /// Decode an envelope from a text frame.
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode the envelope for the wire.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Typed view of a `presence_update` payload.
    pub fn presence_payload(&self) -> Result<PresencePayload> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Typed view of a `mutation` payload.
    pub fn mutation_event(&self) -> Result<MutationEvent> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Typed view of an `activity` payload.
    pub fn activity_entry(&self) -> Result<ActivityEntry> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityKind, MutationOp};

    #[test]
    fn test_envelope_wire_shape() {
        let payload = PresencePayload {
            status: PresenceStatus::Editing,
            scope: Some("grp-1".to_string()),
            editing_entity_id: Some("exp-7".to_string()),
        };
        let envelope = Envelope::presence_update("user-1", &payload).unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&envelope.encode().unwrap()).unwrap();

        assert_eq!(raw["type"], "presence_update");
        assert_eq!(raw["userId"], "user-1");
        assert_eq!(raw["groupId"], "grp-1");
        assert_eq!(raw["payload"]["status"], "editing");
        assert_eq!(raw["payload"]["editingEntityId"], "exp-7");
        assert!(raw["timestamp"].is_string());
    }

    #[test]
    fn test_mutation_round_trip() {
        let event = MutationEvent::new(
            MutationOp::Create,
            EntityKind::Expense,
            "exp-1",
            serde_json::json!({"amount": 42.0}),
            "user-2",
            None,
        );
        let envelope = Envelope::mutation(&event).unwrap();
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind, MessageType::Mutation);

        let recovered = decoded.mutation_event().unwrap();
        assert_eq!(recovered.id, event.id);
        assert_eq!(recovered.entity_id, "exp-1");
        assert_eq!(recovered.op, MutationOp::Create);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Envelope::decode("not json").is_err());
        assert!(Envelope::decode(r#"{"type": "mystery", "userId": "u"}"#).is_err());
    }

    #[test]
    fn test_wrong_payload_type_rejected() {
        let envelope = Envelope::heartbeat("user-1", None);
        assert!(envelope.mutation_event().is_err());
    }
}
