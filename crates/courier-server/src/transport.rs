//! Transport seam between a session and the wire.
//!
//! Sessions only ever see a [`FrameSink`] and a [`FrameStream`]. In
//! production both halves come from an axum WebSocket; tests plug in an
//! in-memory duplex instead.

use axum::extract::ws::{self, WebSocket};
use futures::{future, Sink, SinkExt, Stream, StreamExt};

use crate::error::TransportError;

/// A single transport frame, independent of the WebSocket library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Outbound half of a transport.
pub trait FrameSink: Sink<Frame, Error = TransportError> + Send + Unpin + 'static {}

impl<T> FrameSink for T where T: Sink<Frame, Error = TransportError> + Send + Unpin + 'static {}

/// Inbound half of a transport.
pub trait FrameStream: Stream<Item = Result<Frame, TransportError>> + Send + Unpin + 'static {}

impl<T> FrameStream for T where
    T: Stream<Item = Result<Frame, TransportError>> + Send + Unpin + 'static
{
}

impl From<ws::Message> for Frame {
    fn from(msg: ws::Message) -> Self {
        match msg {
            ws::Message::Text(text) => Frame::Text(text),
            ws::Message::Binary(data) => Frame::Binary(data),
            ws::Message::Ping(data) => Frame::Ping(data),
            ws::Message::Pong(data) => Frame::Pong(data),
            ws::Message::Close(_) => Frame::Close,
        }
    }
}

impl From<Frame> for ws::Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => ws::Message::Text(text),
            Frame::Binary(data) => ws::Message::Binary(data),
            Frame::Ping(data) => ws::Message::Ping(data),
            Frame::Pong(data) => ws::Message::Pong(data),
            Frame::Close => ws::Message::Close(None),
        }
    }
}

/// Split an upgraded WebSocket into the two halves a session runs on.
pub fn split_websocket(socket: WebSocket) -> (impl FrameSink, impl FrameStream) {
    let (sink, stream) = socket.split();
    let sink = sink.with(|frame: Frame| future::ready(Ok::<_, TransportError>(ws::Message::from(frame))));
    let stream = stream.map(|msg| msg.map(Frame::from).map_err(TransportError::from));
    (sink, stream)
}
