//! v001 -- Initial schema creation.
//!
//! A single `messages` table. Users live in the authentication service, so
//! sender and receiver are plain integers with no foreign key.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id          TEXT PRIMARY KEY NOT NULL,  -- UUID v4, server generated
    sender_id   INTEGER NOT NULL,
    receiver_id INTEGER NOT NULL,
    content     TEXT NOT NULL,
    timestamp   INTEGER NOT NULL,           -- Unix seconds, server assigned
    read        INTEGER NOT NULL DEFAULT 0  -- boolean 0/1, flips once
);

-- Backlog lookups on reconnect and unread-sender summaries.
CREATE INDEX IF NOT EXISTS idx_messages_inbox
    ON messages(receiver_id, read, timestamp);

CREATE INDEX IF NOT EXISTS idx_messages_pair
    ON messages(sender_id, receiver_id, timestamp);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
