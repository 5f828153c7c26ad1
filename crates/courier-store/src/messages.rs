use std::collections::BTreeSet;

use rusqlite::params;
use uuid::Uuid;

use courier_shared::{Message, MessageId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};

const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, content, timestamp, read";

impl Database {
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        self.conn().execute(
            "INSERT INTO messages (id, sender_id, receiver_id, content, timestamp, read)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.id.to_string(),
                user_param(message.sender_id),
                user_param(message.receiver_id),
                message.content,
                message.timestamp,
                message.read,
            ],
        )?;
        Ok(())
    }

    /// Unread messages addressed to `receiver`, oldest first. Messages stamped
    /// in the same second keep their insertion order.
    pub fn get_unread_messages(&self, receiver: UserId) -> Result<Vec<Message>> {
        self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE receiver_id = ?1 AND read = 0
                 ORDER BY timestamp ASC, rowid ASC"
            ),
            params![user_param(receiver)],
        )
    }

    /// Both directions of the conversation between two users, oldest first.
    pub fn get_conversation(&self, a: UserId, b: UserId) -> Result<Vec<Message>> {
        self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE (sender_id = ?1 AND receiver_id = ?2)
                    OR (sender_id = ?2 AND receiver_id = ?1)
                 ORDER BY timestamp ASC, rowid ASC"
            ),
            params![user_param(a), user_param(b)],
        )
    }

    /// Flip `read` to true. Returns `true` only for the call that performed
    /// the transition; later calls for the same message return `false`.
    pub fn mark_message_read(&self, id: MessageId) -> Result<bool> {
        let id = id.to_string();
        let affected = self.conn().execute(
            "UPDATE messages SET read = 1 WHERE id = ?1 AND read = 0",
            params![id],
        )?;
        if affected > 0 {
            return Ok(true);
        }

        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM messages WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        if exists {
            Ok(false)
        } else {
            Err(StoreError::NotFound)
        }
    }

    pub fn get_unread_sender_ids(&self, receiver: UserId) -> Result<BTreeSet<UserId>> {
        let mut stmt = self.conn().prepare(
            "SELECT DISTINCT sender_id FROM messages WHERE receiver_id = ?1 AND read = 0",
        )?;
        let rows = stmt.query_map(params![user_param(receiver)], |row| {
            row.get::<_, i64>(0).map(user_from_column)
        })?;

        let mut senders = BTreeSet::new();
        for row in rows {
            senders.insert(row?);
        }
        Ok(senders)
    }

    fn query_messages(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map(params, row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}

// SQLite integers are signed; user ids round-trip through their bit pattern.
fn user_param(id: UserId) -> i64 {
    id.0 as i64
}

fn user_from_column(raw: i64) -> UserId {
    UserId(raw as u64)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Message {
        id: MessageId(id),
        sender_id: user_from_column(row.get(1)?),
        receiver_id: user_from_column(row.get(2)?),
        content: row.get(3)?,
        timestamp: row.get(4)?,
        read: row.get(5)?,
    })
}
