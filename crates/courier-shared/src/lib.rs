//! Types shared by the Courier store and server: identifiers, the
//! [`Message`](protocol::Message) entity and the JSON frame format spoken on
//! the WebSocket.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use protocol::{unix_now, InboundMessage, Message, SendFailure, SendRequest};
pub use types::{MessageId, UserId};
