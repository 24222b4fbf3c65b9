use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use pigeon_db::models::NewMessage;
use pigeon_types::api::{Claims, MessagePage, SendMessageRequest};
use pigeon_types::events::{EventScope, GatewayEvent};
use pigeon_types::models::Conversation;

use crate::convert::{conversation_from_row, message_from_row};
use crate::error::ApiError;
use crate::{AppState, blocking};

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Opaque cursor from a previous page's `next_cursor`: fetch only
    /// messages appended after it. Reconnecting subscribers use this to
    /// close the gap the gateway does not persist.
    pub after: Option<String>,
}

fn default_limit() -> u32 {
    50
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let content = req.content.trim().to_string();
    if content.is_empty() {
        return Err(ApiError::invalid("message content must not be empty"));
    }

    let conversation = load_conversation(&state, conversation_id).await?;
    let Some(recipient_id) = conversation.partner_of(claims.sub) else {
        return Err(ApiError::invalid("sender is not a participant"));
    };

    // A reply target must exist and live in the same conversation.
    if let Some(reply_to_id) = req.reply_to_id {
        let db = state.db.clone();
        let rid = reply_to_id.to_string();
        let target = blocking(move || db.get_message(&rid)).await?;
        match target {
            Some(row) if row.conversation_id == conversation_id.to_string() => {}
            _ => {
                return Err(ApiError::invalid(
                    "reply target does not exist in this conversation",
                ));
            }
        }
    }

    let message_id = Uuid::new_v4();
    let created_at = Utc::now().to_rfc3339();

    let db = state.db.clone();
    let attachment = req.attachment.clone();
    let reply_to = req.reply_to_id.map(|id| id.to_string());
    let idempotency_key = req.idempotency_key.clone();
    let cid = conversation_id.to_string();
    let sender = claims.sub.to_string();
    let recipient = recipient_id.to_string();
    let (row, created) = blocking(move || {
        db.append_message(NewMessage {
            id: &message_id.to_string(),
            conversation_id: &cid,
            sender_id: &sender,
            recipient_id: &recipient,
            content: &content,
            reply_to_id: reply_to.as_deref(),
            idempotency_key: idempotency_key.as_deref(),
            attachment_url: attachment.as_ref().map(|a| a.url.as_str()),
            attachment_name: attachment.as_ref().map(|a| a.name.as_str()),
            attachment_size: attachment.as_ref().and_then(|a| a.size),
            created_at: &created_at,
        })
    })
    .await?;

    let message = message_from_row(row)?;

    // An idempotent replay changed nothing, so nothing is published.
    if created {
        state.dispatcher.publish(
            vec![
                EventScope::Conversation(conversation_id),
                EventScope::User(claims.sub),
            ],
            GatewayEvent::MessageCreate {
                message: message.clone(),
            },
        );
    }

    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let after_seq = match query.after.as_deref() {
        Some(cursor) => decode_cursor(cursor).ok_or_else(|| ApiError::invalid("malformed cursor"))?,
        None => 0,
    };

    let conversation = load_conversation(&state, conversation_id).await?;
    if !conversation.is_participant(claims.sub) {
        return Err(ApiError::invalid("not a participant of this conversation"));
    }

    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let limit = query.limit.min(200);
    let rows = blocking(move || db.list_messages(&cid, after_seq, limit)).await?;

    let messages = rows
        .into_iter()
        .map(message_from_row)
        .collect::<Result<Vec<_>, _>>()?;

    let next_cursor = messages.last().map(|m| encode_cursor(m.seq));

    Ok(Json(MessagePage {
        messages,
        next_cursor,
    }))
}

pub(crate) async fn load_conversation(
    state: &AppState,
    conversation_id: Uuid,
) -> Result<Conversation, ApiError> {
    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let row = blocking(move || db.get_conversation(&cid))
        .await?
        .ok_or(ApiError::NotFound("conversation"))?;
    conversation_from_row(row)
}

/// Cursors are base64 over the last-seen sequence number — opaque to
/// clients, trivially stable for the server.
fn encode_cursor(seq: i64) -> String {
    B64.encode(seq.to_string())
}

fn decode_cursor(cursor: &str) -> Option<i64> {
    let bytes = B64.decode(cursor).ok()?;
    String::from_utf8(bytes).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use pigeon_db::Database;
    use pigeon_gateway::dispatcher::Dispatcher;
    use pigeon_types::models::DeliveryStatus;

    use crate::error::ApiError;
    use crate::{AppStateInner, receipts};

    fn test_state() -> AppState {
        Arc::new(AppStateInner {
            db: Arc::new(Database::open_in_memory().unwrap()),
            dispatcher: Dispatcher::new(),
            jwt_secret: "test-secret".into(),
        })
    }

    fn seed_user(state: &AppState, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        state
            .db
            .create_user(&id.to_string(), name, name, "hash")
            .unwrap();
        id
    }

    fn seed_conversation(state: &AppState, a: Uuid, b: Uuid) -> Uuid {
        state
            .db
            .get_or_create_conversation(
                &Uuid::new_v4().to_string(),
                &a.to_string(),
                &b.to_string(),
                &Utc::now().to_rfc3339(),
            )
            .unwrap()
            .id
            .parse()
            .unwrap()
    }

    fn claims_for(user_id: Uuid) -> Claims {
        Claims {
            sub: user_id,
            username: "tester".into(),
            exp: 0,
        }
    }

    fn send_request(content: &str, reply_to_id: Option<Uuid>) -> SendMessageRequest {
        SendMessageRequest {
            content: content.into(),
            reply_to_id,
            idempotency_key: None,
            attachment: None,
        }
    }

    #[tokio::test]
    async fn empty_content_is_rejected_without_persisting() {
        let state = test_state();
        let alice = seed_user(&state, "alice");
        let bob = seed_user(&state, "bob");
        let conv = seed_conversation(&state, alice, bob);

        let result = send_message(
            State(state.clone()),
            Path(conv),
            Extension(claims_for(alice)),
            Json(send_request("   ", None)),
        )
        .await;

        assert!(matches!(result, Err(ApiError::InvalidArgument(_))));
        let rows = state.db.list_messages(&conv.to_string(), 0, 50).unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn reply_target_must_live_in_the_same_conversation() {
        let state = test_state();
        let alice = seed_user(&state, "alice");
        let bob = seed_user(&state, "bob");
        let carol = seed_user(&state, "carol");
        let conv_ab = seed_conversation(&state, alice, bob);
        let conv_ac = seed_conversation(&state, alice, carol);

        send_message(
            State(state.clone()),
            Path(conv_ab),
            Extension(claims_for(alice)),
            Json(send_request("original", None)),
        )
        .await
        .unwrap();
        let rows = state.db.list_messages(&conv_ab.to_string(), 0, 50).unwrap();
        let original_id: Uuid = rows[0].id.parse().unwrap();

        let result = send_message(
            State(state.clone()),
            Path(conv_ac),
            Extension(claims_for(alice)),
            Json(send_request("reply", Some(original_id))),
        )
        .await;

        assert!(matches!(result, Err(ApiError::InvalidArgument(_))));
        let rows = state.db.list_messages(&conv_ac.to_string(), 0, 50).unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn non_participant_sender_is_rejected() {
        let state = test_state();
        let alice = seed_user(&state, "alice");
        let bob = seed_user(&state, "bob");
        let mallory = seed_user(&state, "mallory");
        let conv = seed_conversation(&state, alice, bob);

        let result = send_message(
            State(state.clone()),
            Path(conv),
            Extension(claims_for(mallory)),
            Json(send_request("hi", None)),
        )
        .await;

        assert!(matches!(result, Err(ApiError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn first_contact_send_and_read_walkthrough() {
        let state = test_state();
        let u1 = seed_user(&state, "u1");
        let u2 = seed_user(&state, "u2");
        let conv = seed_conversation(&state, u1, u2);

        send_message(
            State(state.clone()),
            Path(conv),
            Extension(claims_for(u1)),
            Json(send_request("hi", None)),
        )
        .await
        .unwrap();

        let rows = state.db.list_messages(&conv.to_string(), 0, 50).unwrap();
        let row = &rows[0];
        assert_eq!(row.status, "sent");
        assert_eq!(row.seq, 1);
        assert_eq!(state.db.unread_count(&conv.to_string(), &u2.to_string()).unwrap(), 1);

        let message_id: Uuid = row.id.parse().unwrap();
        receipts::mark_read(
            State(state.clone()),
            Path(message_id),
            Extension(claims_for(u2)),
        )
        .await
        .unwrap();

        let row = state.db.get_message(&message_id.to_string()).unwrap().unwrap();
        assert_eq!(
            DeliveryStatus::parse(&row.status),
            Some(DeliveryStatus::Read)
        );
        assert_eq!(state.db.unread_count(&conv.to_string(), &u2.to_string()).unwrap(), 0);
    }

    #[test]
    fn cursor_round_trips() {
        for seq in [0, 1, 42, i64::MAX] {
            assert_eq!(decode_cursor(&encode_cursor(seq)), Some(seq));
        }
    }

    #[test]
    fn garbage_cursors_are_rejected() {
        assert_eq!(decode_cursor("not base64 at all!"), None);
        assert_eq!(decode_cursor(&B64.encode("not-a-number")), None);
    }
}
