use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id              TEXT PRIMARY KEY,
            username        TEXT NOT NULL UNIQUE,
            display_name    TEXT NOT NULL,
            password        TEXT NOT NULL,
            avatar_url      TEXT,
            last_seen_at    TEXT,
            created_at      TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Participants in canonical order: (first, second) is the
        -- uniqueness key for the unordered pair.
        CREATE TABLE IF NOT EXISTS conversations (
            id              TEXT PRIMARY KEY,
            first_user_id   TEXT NOT NULL REFERENCES users(id),
            second_user_id  TEXT NOT NULL REFERENCES users(id),
            created_at      TEXT NOT NULL,
            UNIQUE(first_user_id, second_user_id)
        );

        CREATE TABLE IF NOT EXISTS messages (
            id               TEXT PRIMARY KEY,
            conversation_id  TEXT NOT NULL REFERENCES conversations(id),
            sender_id        TEXT NOT NULL REFERENCES users(id),
            content          TEXT NOT NULL,
            reply_to_id      TEXT REFERENCES messages(id),
            status           TEXT NOT NULL DEFAULT 'sent'
                             CHECK (status IN ('sent', 'delivered', 'read')),
            seq              INTEGER NOT NULL,
            idempotency_key  TEXT,
            attachment_url   TEXT,
            attachment_name  TEXT,
            attachment_size  INTEGER,
            created_at       TEXT NOT NULL,
            UNIQUE(conversation_id, seq),
            UNIQUE(conversation_id, idempotency_key)
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at);

        CREATE TABLE IF NOT EXISTS unread_counts (
            conversation_id  TEXT NOT NULL REFERENCES conversations(id),
            user_id          TEXT NOT NULL REFERENCES users(id),
            count            INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (conversation_id, user_id)
        );

        -- Hide-for-self chat deletion: a marker row suppresses the
        -- conversation from one participant's list; messages are untouched.
        CREATE TABLE IF NOT EXISTS hidden_conversations (
            conversation_id  TEXT NOT NULL REFERENCES conversations(id),
            user_id          TEXT NOT NULL REFERENCES users(id),
            PRIMARY KEY (conversation_id, user_id)
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
