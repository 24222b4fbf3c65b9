/// Database row types — these map directly to SQLite rows.
/// Distinct from pigeon-types API models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub password: String,
    pub avatar_url: Option<String>,
    pub last_seen_at: Option<String>,
}

pub struct ConversationRow {
    pub id: String,
    pub first_user_id: String,
    pub second_user_id: String,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub reply_to_id: Option<String>,
    pub status: String,
    pub seq: i64,
    pub attachment_url: Option<String>,
    pub attachment_name: Option<String>,
    pub attachment_size: Option<i64>,
    pub created_at: String,
}

/// One row of the conversation-list query: the conversation joined with the
/// partner's identity and the caller's unread count.
pub struct ConversationListRow {
    pub conversation_id: String,
    pub created_at: String,
    pub partner: UserRow,
    pub unread_count: i64,
}

/// Fields of a message append, bundled to keep the insert signature sane.
pub struct NewMessage<'a> {
    pub id: &'a str,
    pub conversation_id: &'a str,
    pub sender_id: &'a str,
    /// The non-sender participant, whose unread counter is incremented.
    pub recipient_id: &'a str,
    pub content: &'a str,
    pub reply_to_id: Option<&'a str>,
    pub idempotency_key: Option<&'a str>,
    pub attachment_url: Option<&'a str>,
    pub attachment_name: Option<&'a str>,
    pub attachment_size: Option<i64>,
    pub created_at: &'a str,
}
