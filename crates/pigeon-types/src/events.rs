use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{DeliveryStatus, Message};

/// Addressing key for a real-time event. Conversation scopes reach
/// connections that have subscribed to that conversation; user scopes reach
/// every live connection belonging to that user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventScope {
    Conversation(Uuid),
    User(Uuid),
}

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, username: String },

    /// A new message was appended to a conversation
    MessageCreate { message: Message },

    /// A message moved forward in its delivery lifecycle
    MessageStatus {
        message_id: Uuid,
        conversation_id: Uuid,
        status: DeliveryStatus,
    },

    /// A user started typing in a conversation
    TypingStart {
        conversation_id: Uuid,
        user_id: Uuid,
    },

    /// A user came online or went offline
    PresenceUpdate {
        user_id: Uuid,
        online: bool,
        last_seen_at: Option<DateTime<Utc>>,
    },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Subscribe to events for specific conversations. The server only
    /// forwards conversation-scoped events for subscribed conversations;
    /// user-scoped events are always delivered.
    Subscribe { conversation_ids: Vec<Uuid> },

    /// Indicate typing in a conversation
    StartTyping { conversation_id: Uuid },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_and_data_tags() {
        let event = GatewayEvent::MessageStatus {
            message_id: Uuid::nil(),
            conversation_id: Uuid::nil(),
            status: DeliveryStatus::Read,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "MessageStatus");
        assert_eq!(json["data"]["status"], "read");
    }

    #[test]
    fn commands_round_trip() {
        let raw = r#"{"type":"Subscribe","data":{"conversation_ids":[]}}"#;
        let cmd: GatewayCommand = serde_json::from_str(raw).unwrap();
        match cmd {
            GatewayCommand::Subscribe { conversation_ids } => {
                assert!(conversation_ids.is_empty())
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
