use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub online: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// A pairwise conversation. Participants are stored in canonical order
/// (smaller id first), which makes (first, second) a uniqueness key for
/// the unordered pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub first_user_id: Uuid,
    pub second_user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.first_user_id == user_id || self.second_user_id == user_id
    }

    /// The other participant, or None if `user_id` is not in this conversation.
    pub fn partner_of(&self, user_id: Uuid) -> Option<Uuid> {
        if user_id == self.first_user_id {
            Some(self.second_user_id)
        } else if user_id == self.second_user_id {
            Some(self.first_user_id)
        } else {
            None
        }
    }
}

/// Delivery lifecycle of a message. Transitions are monotonic:
/// Sent -> Delivered -> Read, never backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            _ => None,
        }
    }
}

/// Opaque reference to an uploaded file. The upload service owns the
/// contents; the engine only records what it was told.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub url: String,
    pub name: String,
    pub size: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub reply_to_id: Option<Uuid>,
    pub status: DeliveryStatus,
    /// Per-conversation sequence number, the authoritative ordering
    /// tie-break when two messages share a timestamp.
    pub seq: i64,
    pub attachment: Option<AttachmentRef>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_status_orders_forward() {
        assert!(DeliveryStatus::Sent < DeliveryStatus::Delivered);
        assert!(DeliveryStatus::Delivered < DeliveryStatus::Read);
    }

    #[test]
    fn delivery_status_round_trips_through_str() {
        for status in [
            DeliveryStatus::Sent,
            DeliveryStatus::Delivered,
            DeliveryStatus::Read,
        ] {
            assert_eq!(DeliveryStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DeliveryStatus::parse("seen"), None);
    }
}
