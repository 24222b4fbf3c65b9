use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{AttachmentRef, Message, User};

// -- JWT Claims --

/// JWT claims shared between pigeon-api (REST middleware) and pigeon-gateway
/// (WebSocket authentication). Canonical definition lives here in
/// pigeon-types to eliminate duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub display_name: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub username: String,
    pub token: String,
}

// -- Conversations --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenConversationRequest {
    pub peer_id: Uuid,
}

/// One entry in the caller's conversation list: the conversation, the other
/// participant's identity and presence, and the caller's unread count.
#[derive(Debug, Serialize)]
pub struct ConversationSummary {
    pub conversation_id: Uuid,
    pub partner: User,
    pub unread_count: i64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub content: String,
    pub reply_to_id: Option<Uuid>,
    /// Client-supplied token making retried sends safe: re-sending with the
    /// same key returns the originally persisted message.
    pub idempotency_key: Option<String>,
    pub attachment: Option<AttachmentRef>,
}

#[derive(Debug, Serialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    /// Opaque cursor for fetching messages appended after this page.
    pub next_cursor: Option<String>,
}

// -- Receipts --

#[derive(Debug, Serialize)]
pub struct ReceiptResponse {
    pub message_id: Uuid,
    pub status: crate::models::DeliveryStatus,
}
