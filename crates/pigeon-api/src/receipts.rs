use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use tracing::debug;
use uuid::Uuid;

use pigeon_types::api::{Claims, ReceiptResponse};
use pigeon_types::events::{EventScope, GatewayEvent};
use pigeon_types::models::DeliveryStatus;

use crate::error::ApiError;
use crate::messages::load_conversation;
use crate::{AppState, blocking};

/// SENT -> DELIVERED acknowledgment from the recipient.
pub async fn mark_delivered(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let (conversation_id, prior) = authorize_receipt(&state, message_id, claims.sub).await?;

    let db = state.db.clone();
    let mid = message_id.to_string();
    let changed = blocking(move || db.mark_delivered(&mid)).await?;

    let status = if changed {
        DeliveryStatus::Delivered
    } else {
        // Late or duplicate acknowledgment; the lifecycle never rewinds.
        debug!("Delivered ack for {} was a no-op (status {:?})", message_id, prior);
        prior
    };

    if changed {
        publish_status(&state, message_id, conversation_id, claims.sub, status);
    }

    Ok(Json(ReceiptResponse { message_id, status }))
}

/// {SENT, DELIVERED} -> READ acknowledgment from the recipient. Also
/// resets the recipient's unread counter to the messages still below READ.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let (conversation_id, prior) = authorize_receipt(&state, message_id, claims.sub).await?;

    let db = state.db.clone();
    let mid = message_id.to_string();
    let changed = blocking(move || db.mark_read(&mid)).await?;

    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let me = claims.sub.to_string();
    let remaining = blocking(move || db.reset_unread(&cid, &me)).await?;
    debug!(
        "{} read {} in {}: {} unread remaining",
        claims.sub, message_id, conversation_id, remaining
    );

    let status = if changed { DeliveryStatus::Read } else { prior };

    if changed {
        publish_status(&state, message_id, conversation_id, claims.sub, status);
    }

    Ok(Json(ReceiptResponse { message_id, status }))
}

/// A receipt is valid only from the non-sender participant of the message's
/// conversation. Returns the conversation id and the message's current
/// status.
async fn authorize_receipt(
    state: &AppState,
    message_id: Uuid,
    actor: Uuid,
) -> Result<(Uuid, DeliveryStatus), ApiError> {
    let db = state.db.clone();
    let mid = message_id.to_string();
    let row = blocking(move || db.get_message(&mid))
        .await?
        .ok_or(ApiError::NotFound("message"))?;

    let conversation_id: Uuid = row
        .conversation_id
        .parse()
        .map_err(|e| anyhow::anyhow!("corrupt conversation id on message: {}", e))?;
    let status = DeliveryStatus::parse(&row.status)
        .ok_or_else(|| anyhow::anyhow!("corrupt status '{}' on message", row.status))?;

    let conversation = load_conversation(state, conversation_id).await?;
    if !conversation.is_participant(actor) {
        return Err(ApiError::invalid("not a participant of this conversation"));
    }
    if row.sender_id == actor.to_string() {
        return Err(ApiError::invalid(
            "only the recipient may acknowledge a message",
        ));
    }

    Ok((conversation_id, status))
}

/// Every effective transition is announced to the conversation and to the
/// acknowledging user's other sessions.
fn publish_status(
    state: &AppState,
    message_id: Uuid,
    conversation_id: Uuid,
    actor: Uuid,
    status: DeliveryStatus,
) {
    state.dispatcher.publish(
        vec![
            EventScope::Conversation(conversation_id),
            EventScope::User(actor),
        ],
        GatewayEvent::MessageStatus {
            message_id,
            conversation_id,
            status,
        },
    );
}
