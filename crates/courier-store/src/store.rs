//! The async storage contract the hub depends on.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use courier_shared::{Message, MessageId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};

/// Durable, append-only record of messages and their read state.
///
/// Every ordered result is oldest first. Implementations must make `save`
/// durable before returning: the hub relies on it to guarantee that a
/// message accepted from a sender can always be replayed later.
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    async fn save(&self, message: &Message) -> Result<()>;

    /// Unread messages addressed to `user`, oldest first.
    async fn fetch_unread(&self, user: UserId) -> Result<Vec<Message>>;

    /// Flip the read flag. `Ok(true)` only for the call that performed the
    /// transition.
    async fn mark_read(&self, id: MessageId) -> Result<bool>;

    async fn fetch_conversation(&self, a: UserId, b: UserId) -> Result<Vec<Message>>;

    async fn list_unread_sender_ids(&self, receiver: UserId) -> Result<BTreeSet<UserId>>;
}

/// [`MessageStore`] backed by SQLite.
///
/// `rusqlite` is synchronous, so each call hops onto tokio's blocking pool
/// and serializes on the single connection.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Database>>,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Database::open_at(path).map(Self::new)
    }

    pub fn in_memory() -> Result<Self> {
        Database::open_in_memory().map(Self::new)
    }

    async fn with_db<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| StoreError::Poisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn save(&self, message: &Message) -> Result<()> {
        let message = message.clone();
        self.with_db(move |db| db.insert_message(&message)).await
    }

    async fn fetch_unread(&self, user: UserId) -> Result<Vec<Message>> {
        self.with_db(move |db| db.get_unread_messages(user)).await
    }

    async fn mark_read(&self, id: MessageId) -> Result<bool> {
        self.with_db(move |db| db.mark_message_read(id)).await
    }

    async fn fetch_conversation(&self, a: UserId, b: UserId) -> Result<Vec<Message>> {
        self.with_db(move |db| db.get_conversation(a, b)).await
    }

    async fn list_unread_sender_ids(&self, receiver: UserId) -> Result<BTreeSet<UserId>> {
        self.with_db(move |db| db.get_unread_sender_ids(receiver)).await
    }
}
