//! In-memory [`MessageStore`] with fault injection.
//!
//! Messages are kept in insertion order, so sorting by timestamp with a
//! stable sort gives the same tie-breaking as the SQLite store. Individual
//! operations can be switched into a failing mode to exercise the hub's
//! error paths.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use courier_shared::{Message, MessageId, UserId};

use crate::error::{Result, StoreError};
use crate::store::MessageStore;

/// Store operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Save,
    FetchUnread,
    MarkRead,
    FetchConversation,
    ListUnreadSenders,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

#[derive(Default)]
struct MemoryStoreInner {
    messages: Vec<Message>,
    failing: HashSet<StoreOp>,
    /// Every successful read transition, in order.
    read_marks: Vec<MessageId>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `op` fail (or succeed again) until told otherwise.
    pub fn set_failing(&self, op: StoreOp, failing: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            if failing {
                inner.failing.insert(op);
            } else {
                inner.failing.remove(&op);
            }
        }
    }

    /// Ids of messages whose read flag was flipped, in transition order.
    pub fn read_marks(&self) -> Vec<MessageId> {
        self.lock().map(|i| i.read_marks.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|i| i.messages.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryStoreInner>> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }

    fn checked(&self, op: StoreOp) -> Result<MutexGuard<'_, MemoryStoreInner>> {
        let inner = self.lock()?;
        if inner.failing.contains(&op) {
            return Err(StoreError::Unavailable(format!("{op:?} disabled")));
        }
        Ok(inner)
    }
}

fn oldest_first(mut messages: Vec<Message>) -> Vec<Message> {
    messages.sort_by_key(|m| m.timestamp);
    messages
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn save(&self, message: &Message) -> Result<()> {
        let mut inner = self.checked(StoreOp::Save)?;
        if inner.messages.iter().any(|m| m.id == message.id) {
            return Err(StoreError::Unavailable(format!(
                "duplicate message id {}",
                message.id
            )));
        }
        inner.messages.push(message.clone());
        Ok(())
    }

    async fn fetch_unread(&self, user: UserId) -> Result<Vec<Message>> {
        let inner = self.checked(StoreOp::FetchUnread)?;
        Ok(oldest_first(
            inner
                .messages
                .iter()
                .filter(|m| m.receiver_id == user && !m.read)
                .cloned()
                .collect(),
        ))
    }

    async fn mark_read(&self, id: MessageId) -> Result<bool> {
        let mut inner = self.checked(StoreOp::MarkRead)?;
        let message = inner
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(StoreError::NotFound)?;
        if message.read {
            return Ok(false);
        }
        message.read = true;
        inner.read_marks.push(id);
        Ok(true)
    }

    async fn fetch_conversation(&self, a: UserId, b: UserId) -> Result<Vec<Message>> {
        let inner = self.checked(StoreOp::FetchConversation)?;
        Ok(oldest_first(
            inner
                .messages
                .iter()
                .filter(|m| {
                    (m.sender_id == a && m.receiver_id == b)
                        || (m.sender_id == b && m.receiver_id == a)
                })
                .cloned()
                .collect(),
        ))
    }

    async fn list_unread_sender_ids(&self, receiver: UserId) -> Result<BTreeSet<UserId>> {
        let inner = self.checked(StoreOp::ListUnreadSenders)?;
        Ok(inner
            .messages
            .iter()
            .filter(|m| m.receiver_id == receiver && !m.read)
            .map(|m| m.sender_id)
            .collect())
    }
}
