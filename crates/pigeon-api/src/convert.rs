//! Row -> API model conversion. Rows carry stringly-typed SQLite values;
//! anything that fails to parse here is corrupt data, surfaced as an
//! internal error rather than patched over.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use pigeon_db::models::{ConversationRow, MessageRow, UserRow};
use pigeon_types::models::{AttachmentRef, Conversation, DeliveryStatus, Message, User};

use crate::error::ApiError;

pub fn conversation_from_row(row: ConversationRow) -> Result<Conversation, ApiError> {
    Ok(Conversation {
        id: parse_uuid(&row.id, "conversation id")?,
        first_user_id: parse_uuid(&row.first_user_id, "first participant")?,
        second_user_id: parse_uuid(&row.second_user_id, "second participant")?,
        created_at: parse_timestamp(&row.created_at)?,
    })
}

pub fn message_from_row(row: MessageRow) -> Result<Message, ApiError> {
    let status = DeliveryStatus::parse(&row.status)
        .ok_or_else(|| anyhow!("corrupt status '{}' on message '{}'", row.status, row.id))?;

    let attachment = match row.attachment_url {
        Some(url) => Some(AttachmentRef {
            url,
            name: row.attachment_name.unwrap_or_default(),
            size: row.attachment_size,
        }),
        None => None,
    };

    Ok(Message {
        id: parse_uuid(&row.id, "message id")?,
        conversation_id: parse_uuid(&row.conversation_id, "conversation id")?,
        sender_id: parse_uuid(&row.sender_id, "sender id")?,
        content: row.content,
        reply_to_id: row
            .reply_to_id
            .as_deref()
            .map(|id| parse_uuid(id, "reply target"))
            .transpose()?,
        status,
        seq: row.seq,
        attachment,
        created_at: parse_timestamp(&row.created_at)?,
    })
}

pub fn user_from_row(row: UserRow, online: bool) -> Result<User, ApiError> {
    let last_seen_at = row
        .last_seen_at
        .as_deref()
        .map(parse_timestamp)
        .transpose()?;

    Ok(User {
        id: parse_uuid(&row.id, "user id")?,
        username: row.username,
        display_name: row.display_name,
        avatar_url: row.avatar_url,
        online,
        last_seen_at,
    })
}

fn parse_uuid(raw: &str, what: &str) -> Result<Uuid, ApiError> {
    raw.parse()
        .map_err(|e| ApiError::Internal(anyhow!("corrupt {} '{}': {}", what, raw, e)))
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ApiError> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // SQLite defaults store "YYYY-MM-DD HH:MM:SS" without timezone.
            // Parse as naive UTC and convert.
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .map(|ndt| ndt.and_utc())
        })
        .map_err(|e| ApiError::Internal(anyhow!("corrupt timestamp '{}': {}", raw, e)))
}
