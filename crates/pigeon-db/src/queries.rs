use crate::Database;
use crate::models::{ConversationListRow, ConversationRow, MessageRow, NewMessage, UserRow};
use anyhow::Result;
use rusqlite::Row;

impl Database {
    // -- Users --

    pub fn create_user(
        &self,
        id: &str,
        username: &str,
        display_name: &str,
        password_hash: &str,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, display_name, password) VALUES (?1, ?2, ?3, ?4)",
                (id, username, display_name, password_hash),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, username, display_name, password, avatar_url, last_seen_at
                 FROM users WHERE username = ?1",
            )?;
            stmt.query_row([username], user_from_row).optional()
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, username, display_name, password, avatar_url, last_seen_at
                 FROM users WHERE id = ?1",
            )?;
            stmt.query_row([id], user_from_row).optional()
        })
    }

    /// Stamp the moment a user's last connection closed.
    pub fn set_last_seen(&self, user_id: &str, at: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE users SET last_seen_at = ?2 WHERE id = ?1",
                (user_id, at),
            )?;
            Ok(())
        })
    }

    // -- Conversations --

    /// Resolve the single conversation for an unordered user pair, creating
    /// it on first contact. The pair is canonicalized (lexicographically
    /// smaller id first) before lookup, and creation goes through
    /// INSERT OR IGNORE under the (first, second) uniqueness key: the loser
    /// of a concurrent creation race re-reads the winner's row.
    pub fn get_or_create_conversation(
        &self,
        new_id: &str,
        user_a: &str,
        user_b: &str,
        created_at: &str,
    ) -> Result<ConversationRow> {
        let (first, second) = if user_a <= user_b {
            (user_a, user_b)
        } else {
            (user_b, user_a)
        };

        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO conversations (id, first_user_id, second_user_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                (new_id, first, second, created_at),
            )?;

            let mut stmt = conn.prepare(
                "SELECT id, first_user_id, second_user_id, created_at
                 FROM conversations WHERE first_user_id = ?1 AND second_user_id = ?2",
            )?;
            let row = stmt.query_row([first, second], conversation_from_row)?;
            Ok(row)
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, first_user_id, second_user_id, created_at
                 FROM conversations WHERE id = ?1",
            )?;
            stmt.query_row([id], conversation_from_row).optional()
        })
    }

    /// Conversation list for one user: partner identity and unread count in
    /// a single query (avoids N+1), hidden conversations excluded.
    pub fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationListRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.created_at,
                        u.id, u.username, u.display_name, u.password, u.avatar_url, u.last_seen_at,
                        COALESCE(n.count, 0)
                 FROM conversations c
                 JOIN users u ON u.id = CASE WHEN c.first_user_id = ?1
                                             THEN c.second_user_id
                                             ELSE c.first_user_id END
                 LEFT JOIN unread_counts n
                        ON n.conversation_id = c.id AND n.user_id = ?1
                 WHERE (c.first_user_id = ?1 OR c.second_user_id = ?1)
                   AND c.id NOT IN (SELECT conversation_id FROM hidden_conversations
                                    WHERE user_id = ?1)
                 ORDER BY c.created_at DESC",
            )?;

            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(ConversationListRow {
                        conversation_id: row.get(0)?,
                        created_at: row.get(1)?,
                        partner: UserRow {
                            id: row.get(2)?,
                            username: row.get(3)?,
                            display_name: row.get(4)?,
                            password: row.get(5)?,
                            avatar_url: row.get(6)?,
                            last_seen_at: row.get(7)?,
                        },
                        unread_count: row.get(8)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Ids of every user sharing a conversation with `user_id`. Presence
    /// changes fan out to exactly this set.
    pub fn partner_ids(&self, user_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT CASE WHEN first_user_id = ?1 THEN second_user_id ELSE first_user_id END
                 FROM conversations
                 WHERE first_user_id = ?1 OR second_user_id = ?1",
            )?;
            let rows = stmt
                .query_map([user_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(rows)
        })
    }

    /// Hide-for-self deletion: suppress the conversation from this user's
    /// list without touching messages or the other participant.
    pub fn hide_conversation(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO hidden_conversations (conversation_id, user_id)
                 VALUES (?1, ?2)",
                (conversation_id, user_id),
            )?;
            Ok(())
        })
    }

    // -- Messages --

    /// Append a message. In one transaction: idempotency-key lookup, next
    /// per-conversation sequence number, insert with status 'sent',
    /// recipient unread-counter increment, and clearing of hide markers so
    /// the conversation resurfaces for both participants.
    ///
    /// Returns the persisted row and whether it was newly created — false
    /// means the idempotency key matched an earlier send and nothing was
    /// written or counted.
    pub fn append_message(&self, new: NewMessage<'_>) -> Result<(MessageRow, bool)> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            if let Some(key) = new.idempotency_key {
                let existing = tx
                    .prepare(
                        "SELECT id, conversation_id, sender_id, content, reply_to_id, status, seq,
                                attachment_url, attachment_name, attachment_size, created_at
                         FROM messages WHERE conversation_id = ?1 AND idempotency_key = ?2",
                    )?
                    .query_row((new.conversation_id, key), message_from_row)
                    .optional()?;

                if let Some(row) = existing {
                    return Ok((row, false));
                }
            }

            let seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?1",
                [new.conversation_id],
                |row| row.get(0),
            )?;

            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, content, reply_to_id,
                                       status, seq, idempotency_key,
                                       attachment_url, attachment_name, attachment_size, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'sent', ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    new.id,
                    new.conversation_id,
                    new.sender_id,
                    new.content,
                    new.reply_to_id,
                    seq,
                    new.idempotency_key,
                    new.attachment_url,
                    new.attachment_name,
                    new.attachment_size,
                    new.created_at,
                ],
            )?;

            tx.execute(
                "INSERT INTO unread_counts (conversation_id, user_id, count)
                 VALUES (?1, ?2, 1)
                 ON CONFLICT(conversation_id, user_id) DO UPDATE SET count = count + 1",
                (new.conversation_id, new.recipient_id),
            )?;

            tx.execute(
                "DELETE FROM hidden_conversations WHERE conversation_id = ?1",
                [new.conversation_id],
            )?;

            tx.commit()?;

            Ok((
                MessageRow {
                    id: new.id.to_string(),
                    conversation_id: new.conversation_id.to_string(),
                    sender_id: new.sender_id.to_string(),
                    content: new.content.to_string(),
                    reply_to_id: new.reply_to_id.map(str::to_string),
                    status: "sent".to_string(),
                    seq,
                    attachment_url: new.attachment_url.map(str::to_string),
                    attachment_name: new.attachment_name.map(str::to_string),
                    attachment_size: new.attachment_size,
                    created_at: new.created_at.to_string(),
                },
                true,
            ))
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, sender_id, content, reply_to_id, status, seq,
                        attachment_url, attachment_name, attachment_size, created_at
                 FROM messages WHERE id = ?1",
            )?;
            stmt.query_row([id], message_from_row).optional()
        })
    }

    /// Messages after sequence `after_seq`, ascending (created_at, seq).
    /// `after_seq = 0` fetches from the beginning.
    pub fn list_messages(
        &self,
        conversation_id: &str,
        after_seq: i64,
        limit: u32,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, sender_id, content, reply_to_id, status, seq,
                        attachment_url, attachment_name, attachment_size, created_at
                 FROM messages
                 WHERE conversation_id = ?1 AND seq > ?2
                 ORDER BY created_at ASC, seq ASC
                 LIMIT ?3",
            )?;

            let rows = stmt
                .query_map(rusqlite::params![conversation_id, after_seq, limit], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Delivery state --

    /// SENT -> DELIVERED. The guarded UPDATE makes backward or repeated
    /// transitions a no-op; returns whether anything changed.
    pub fn mark_delivered(&self, message_id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET status = 'delivered' WHERE id = ?1 AND status = 'sent'",
                [message_id],
            )?;
            Ok(changed > 0)
        })
    }

    /// {SENT, DELIVERED} -> READ.
    pub fn mark_read(&self, message_id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET status = 'read'
                 WHERE id = ?1 AND status IN ('sent', 'delivered')",
                [message_id],
            )?;
            Ok(changed > 0)
        })
    }

    // -- Unread counters --

    pub fn unread_count(&self, conversation_id: &str, user_id: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn
                .query_row(
                    "SELECT count FROM unread_counts
                     WHERE conversation_id = ?1 AND user_id = ?2",
                    (conversation_id, user_id),
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0);
            Ok(count)
        })
    }

    /// Reset the counter to the number of messages from the other
    /// participant still below READ, and return it. Called after mark_read
    /// so the counter converges with the recount definition even if
    /// acknowledgments arrive out of order.
    pub fn reset_unread(&self, conversation_id: &str, user_id: &str) -> Result<i64> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let remaining: i64 = tx.query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE conversation_id = ?1 AND sender_id != ?2 AND status != 'read'",
                (conversation_id, user_id),
                |row| row.get(0),
            )?;

            tx.execute(
                "INSERT INTO unread_counts (conversation_id, user_id, count)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(conversation_id, user_id) DO UPDATE SET count = excluded.count",
                rusqlite::params![conversation_id, user_id, remaining],
            )?;

            tx.commit()?;
            Ok(remaining)
        })
    }
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        display_name: row.get(2)?,
        password: row.get(3)?,
        avatar_url: row.get(4)?,
        last_seen_at: row.get(5)?,
    })
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        first_user_id: row.get(1)?,
        second_user_id: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        content: row.get(3)?,
        reply_to_id: row.get(4)?,
        status: row.get(5)?,
        seq: row.get(6)?,
        attachment_url: row.get(7)?,
        attachment_name: row.get(8)?,
        attachment_size: row.get(9)?,
        created_at: row.get(10)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn test_db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn add_user(db: &Database, name: &str) -> String {
        let id = Uuid::new_v4().to_string();
        db.create_user(&id, name, name, "hash").unwrap();
        id
    }

    fn open_conversation(db: &Database, a: &str, b: &str) -> String {
        let now = chrono::Utc::now().to_rfc3339();
        db.get_or_create_conversation(&Uuid::new_v4().to_string(), a, b, &now)
            .unwrap()
            .id
    }

    fn send(db: &Database, conversation: &str, sender: &str, recipient: &str, content: &str) -> MessageRow {
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let (row, created) = db
            .append_message(NewMessage {
                id: &id,
                conversation_id: conversation,
                sender_id: sender,
                recipient_id: recipient,
                content,
                reply_to_id: None,
                idempotency_key: None,
                attachment_url: None,
                attachment_name: None,
                attachment_size: None,
                created_at: &now,
            })
            .unwrap();
        assert!(created);
        row
    }

    #[test]
    fn conversation_is_canonical_for_both_argument_orders() {
        let db = test_db();
        let alice = add_user(&db, "alice");
        let bob = add_user(&db, "bob");

        let c1 = open_conversation(&db, &alice, &bob);
        let c2 = open_conversation(&db, &bob, &alice);
        assert_eq!(c1, c2);

        let row = db.get_conversation(&c1).unwrap().unwrap();
        assert!(row.first_user_id <= row.second_user_id);
    }

    #[test]
    fn losing_creation_race_adopts_existing_row() {
        let db = test_db();
        let alice = add_user(&db, "alice");
        let bob = add_user(&db, "bob");
        let now = chrono::Utc::now().to_rfc3339();

        let winner = db
            .get_or_create_conversation(&Uuid::new_v4().to_string(), &alice, &bob, &now)
            .unwrap();
        // Second create with a fresh id must not insert a second row.
        let loser = db
            .get_or_create_conversation(&Uuid::new_v4().to_string(), &bob, &alice, &now)
            .unwrap();
        assert_eq!(winner.id, loser.id);
    }

    #[test]
    fn sequence_numbers_increase_and_listing_is_ordered() {
        let db = test_db();
        let alice = add_user(&db, "alice");
        let bob = add_user(&db, "bob");
        let conv = open_conversation(&db, &alice, &bob);

        let m1 = send(&db, &conv, &alice, &bob, "one");
        let m2 = send(&db, &conv, &bob, &alice, "two");
        let m3 = send(&db, &conv, &alice, &bob, "three");
        assert_eq!((m1.seq, m2.seq, m3.seq), (1, 2, 3));

        let listed = db.list_messages(&conv, 0, 50).unwrap();
        let seqs: Vec<i64> = listed.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        // Repeatable without intervening writes
        let again = db.list_messages(&conv, 0, 50).unwrap();
        assert_eq!(again.len(), listed.len());
        assert!(again.iter().zip(&listed).all(|(a, b)| a.id == b.id));
    }

    #[test]
    fn cursor_skips_already_seen_messages() {
        let db = test_db();
        let alice = add_user(&db, "alice");
        let bob = add_user(&db, "bob");
        let conv = open_conversation(&db, &alice, &bob);

        send(&db, &conv, &alice, &bob, "one");
        let m2 = send(&db, &conv, &alice, &bob, "two");
        let m3 = send(&db, &conv, &alice, &bob, "three");

        let tail = db.list_messages(&conv, m2.seq - 1, 50).unwrap();
        let ids: Vec<&str> = tail.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec![m2.id.as_str(), m3.id.as_str()]);
    }

    #[test]
    fn idempotency_key_returns_original_message() {
        let db = test_db();
        let alice = add_user(&db, "alice");
        let bob = add_user(&db, "bob");
        let conv = open_conversation(&db, &alice, &bob);
        let now = chrono::Utc::now().to_rfc3339();

        fn annotate<'a, F: Fn(&'a str) -> NewMessage<'a>>(f: F) -> F {
            f
        }
        let make = annotate(|id| NewMessage {
            id,
            conversation_id: &conv,
            sender_id: &alice,
            recipient_id: &bob,
            content: "hello",
            reply_to_id: None,
            idempotency_key: Some("send-1"),
            attachment_url: None,
            attachment_name: None,
            attachment_size: None,
            created_at: &now,
        });

        let first_id = Uuid::new_v4().to_string();
        let (first, created) = db.append_message(make(&first_id)).unwrap();
        assert!(created);

        let retry_id = Uuid::new_v4().to_string();
        let (retry, created) = db.append_message(make(&retry_id)).unwrap();
        assert!(!created);
        assert_eq!(retry.id, first.id);

        // The retry wrote nothing and counted nothing.
        assert_eq!(db.list_messages(&conv, 0, 50).unwrap().len(), 1);
        assert_eq!(db.unread_count(&conv, &bob).unwrap(), 1);
    }

    #[test]
    fn delivery_status_never_moves_backward() {
        let db = test_db();
        let alice = add_user(&db, "alice");
        let bob = add_user(&db, "bob");
        let conv = open_conversation(&db, &alice, &bob);
        let msg = send(&db, &conv, &alice, &bob, "hi");

        assert!(db.mark_delivered(&msg.id).unwrap());
        assert!(db.mark_read(&msg.id).unwrap());

        // Late or duplicate acknowledgments are no-ops.
        assert!(!db.mark_delivered(&msg.id).unwrap());
        assert!(!db.mark_read(&msg.id).unwrap());

        let row = db.get_message(&msg.id).unwrap().unwrap();
        assert_eq!(row.status, "read");
    }

    #[test]
    fn read_skips_delivered_when_acks_jump_ahead() {
        let db = test_db();
        let alice = add_user(&db, "alice");
        let bob = add_user(&db, "bob");
        let conv = open_conversation(&db, &alice, &bob);
        let msg = send(&db, &conv, &alice, &bob, "hi");

        assert!(db.mark_read(&msg.id).unwrap());
        let row = db.get_message(&msg.id).unwrap().unwrap();
        assert_eq!(row.status, "read");
    }

    #[test]
    fn unread_counter_tracks_recount_definition() {
        let db = test_db();
        let alice = add_user(&db, "alice");
        let bob = add_user(&db, "bob");
        let conv = open_conversation(&db, &alice, &bob);

        let m1 = send(&db, &conv, &alice, &bob, "one");
        let m2 = send(&db, &conv, &alice, &bob, "two");
        assert_eq!(db.unread_count(&conv, &bob).unwrap(), 2);
        assert_eq!(db.unread_count(&conv, &alice).unwrap(), 0);

        db.mark_read(&m1.id).unwrap();
        assert_eq!(db.reset_unread(&conv, &bob).unwrap(), 1);

        db.mark_read(&m2.id).unwrap();
        assert_eq!(db.reset_unread(&conv, &bob).unwrap(), 0);
        assert_eq!(db.unread_count(&conv, &bob).unwrap(), 0);
    }

    #[test]
    fn hidden_conversation_resurfaces_on_new_message() {
        let db = test_db();
        let alice = add_user(&db, "alice");
        let bob = add_user(&db, "bob");
        let conv = open_conversation(&db, &alice, &bob);
        send(&db, &conv, &alice, &bob, "hello");

        db.hide_conversation(&conv, &bob).unwrap();
        assert!(db.list_conversations(&bob).unwrap().is_empty());
        // The other participant still sees it.
        assert_eq!(db.list_conversations(&alice).unwrap().len(), 1);

        send(&db, &conv, &alice, &bob, "you there?");
        let listed = db.list_conversations(&bob).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].unread_count, 2);
        assert_eq!(listed[0].partner.id, alice);
    }

    #[test]
    fn partner_ids_cover_every_conversation_peer() {
        let db = test_db();
        let alice = add_user(&db, "alice");
        let bob = add_user(&db, "bob");
        let carol = add_user(&db, "carol");
        open_conversation(&db, &alice, &bob);
        open_conversation(&db, &carol, &alice);

        let mut partners = db.partner_ids(&alice).unwrap();
        partners.sort();
        let mut expected = vec![bob, carol];
        expected.sort();
        assert_eq!(partners, expected);
    }

    #[test]
    fn last_seen_is_stamped() {
        let db = test_db();
        let alice = add_user(&db, "alice");
        let at = chrono::Utc::now().to_rfc3339();

        db.set_last_seen(&alice, &at).unwrap();
        let row = db.get_user_by_id(&alice).unwrap().unwrap();
        assert_eq!(row.last_seen_at.as_deref(), Some(at.as_str()));
    }
}
