//! Wire format for direct messages.
//!
//! Each WebSocket text frame carries exactly one JSON object with the fields
//! of [`Message`]. Clients only get to choose the recipient and the content:
//! `id`, `timestamp` and `read` are always assigned by the server, and on a
//! socket the sender is whoever owns the connection.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{MessageId, UserId};

/// A direct message between two users. Immutable once stamped, except for
/// the `read` flag which the store flips exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    /// Server ingestion time, Unix seconds.
    pub timestamp: i64,
    pub read: bool,
}

impl Message {
    /// Create a freshly stamped, unread message.
    pub fn new(sender_id: UserId, receiver_id: UserId, content: impl Into<String>) -> Self {
        Self::stamped_at(sender_id, receiver_id, content, unix_now())
    }

    pub fn stamped_at(
        sender_id: UserId,
        receiver_id: UserId,
        content: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            id: MessageId::new(),
            sender_id,
            receiver_id,
            content: content.into(),
            timestamp,
            read: false,
        }
    }

    /// Users that should see this message live: the receiver, then the
    /// sender for the echo. A note-to-self yields a single user.
    pub fn audience(&self) -> impl Iterator<Item = UserId> {
        let echo = (self.sender_id != self.receiver_id).then_some(self.sender_id);
        std::iter::once(self.receiver_id).chain(echo)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A message as written by a connected client.
///
/// Unknown fields (including any client-supplied `id`, `timestamp`, `read`
/// or `sender_id`) are accepted and dropped.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub receiver_id: UserId,
    pub content: String,
}

impl InboundMessage {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Bind the message to the connection's owner and assign server fields.
    pub fn stamp(self, sender_id: UserId) -> Message {
        Message::new(sender_id, self.receiver_id, self.content)
    }
}

/// Non-streaming send request submitted over HTTP.
#[derive(Debug, Clone, Deserialize)]
pub struct SendRequest {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
}

impl SendRequest {
    pub fn stamp(self) -> Message {
        Message::new(self.sender_id, self.receiver_id, self.content)
    }
}

/// Notice written back to a socket sender whose message could not be stored.
///
/// Nothing was delivered to anyone; the client should treat the send as
/// failed and may retry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendFailure {
    pub error: String,
    pub receiver_id: UserId,
    pub content: String,
}

impl SendFailure {
    pub fn for_message(message: &Message, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            receiver_id: message.receiver_id,
            content: message.content.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Current time in Unix seconds.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}
