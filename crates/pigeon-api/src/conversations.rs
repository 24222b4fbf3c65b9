use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use pigeon_types::api::{Claims, ConversationSummary, OpenConversationRequest};

use crate::convert::{conversation_from_row, user_from_row};
use crate::error::ApiError;
use crate::{AppState, blocking};

/// Resolve (or lazily create) the single conversation between the caller
/// and a peer. Both argument orders land on the same row; a creation race
/// is absorbed by the uniqueness key in the store.
pub async fn open_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<OpenConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.peer_id == claims.sub {
        return Err(ApiError::invalid(
            "cannot open a conversation with yourself",
        ));
    }

    let db = state.db.clone();
    let peer_id = req.peer_id.to_string();
    if blocking(move || db.get_user_by_id(&peer_id))
        .await?
        .is_none()
    {
        return Err(ApiError::NotFound("user"));
    }

    let db = state.db.clone();
    let me = claims.sub.to_string();
    let peer = req.peer_id.to_string();
    let row = blocking(move || {
        db.get_or_create_conversation(
            &Uuid::new_v4().to_string(),
            &me,
            &peer,
            &Utc::now().to_rfc3339(),
        )
    })
    .await?;

    info!(
        "{} ({}) opened conversation {} with {}",
        claims.username, claims.sub, row.id, req.peer_id
    );

    Ok(Json(conversation_from_row(row)?))
}

/// The caller's conversation list: partner identity, live presence, and
/// unread count per conversation.
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let me = claims.sub.to_string();
    let rows = blocking(move || db.list_conversations(&me)).await?;

    let mut summaries = Vec::with_capacity(rows.len());
    for row in rows {
        let partner_id: Uuid = row
            .partner
            .id
            .parse()
            .map_err(|e| anyhow::anyhow!("corrupt partner id '{}': {}", row.partner.id, e))?;
        let online = state.dispatcher.is_online(partner_id).await;

        summaries.push(ConversationSummary {
            conversation_id: row
                .conversation_id
                .parse()
                .map_err(|e| anyhow::anyhow!("corrupt conversation id: {}", e))?,
            partner: user_from_row(row.partner, online)?,
            unread_count: row.unread_count,
            created_at: crate::convert::parse_timestamp(&row.created_at)?,
        });
    }

    Ok(Json(summaries))
}

/// Hide-for-self deletion: the conversation disappears from the caller's
/// list only. History and the other participant are untouched, and any new
/// message makes it resurface.
pub async fn hide_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let row = blocking(move || db.get_conversation(&cid))
        .await?
        .ok_or(ApiError::NotFound("conversation"))?;

    let conversation = conversation_from_row(row)?;
    if !conversation.is_participant(claims.sub) {
        return Err(ApiError::invalid("not a participant of this conversation"));
    }

    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let me = claims.sub.to_string();
    blocking(move || db.hide_conversation(&cid, &me)).await?;

    Ok(StatusCode::NO_CONTENT)
}
