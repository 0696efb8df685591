//! Transport Adapter.
//!
//! Abstracts a WebSocket down to what the layers above need: connect, send a
//! text frame, receive the next event, close with a code/reason. The four
//! lifecycle events a browser `WebSocket` exposes (open/message/close/error)
//! show up here as the `Ok`/`Err` of [`Transport::connect`] (open/error) and
//! the variants of [`ConnectionEvent`] (message/close/error), collapsing
//! `tokio_tungstenite`'s `Message` enum down to the cases this protocol uses.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::error::TransportError;

/// One event read off an open connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A text frame arrived.
    Text(String),
    /// The peer closed the connection (or the transport detected an error
    /// that forces closure).
    Closed {
        /// Close code; 1006 ("abnormal closure") if none was supplied.
        code: u16,
        /// Close reason; empty if none was supplied.
        reason: String,
    },
}

/// A single open connection. Implementations need not be `Clone`; the layer
/// above owns exactly one at a time: a Request Handler instance is bound to
/// exactly one socket for its entire lifetime.
#[async_trait]
pub trait Connection: Send {
    /// Writes a text frame to the socket.
    async fn send_text(&mut self, frame: String) -> Result<(), TransportError>;

    /// Awaits the next event: a text frame, or closure (graceful or due to a
    /// transport-level error, which is folded into a synthetic close).
    async fn next_event(&mut self) -> ConnectionEvent;

    /// Closes the socket with the given code/reason. Best-effort: errors are
    /// swallowed, since by the time this is called the caller has already
    /// decided to tear down.
    async fn close(&mut self, code: u16, reason: String);
}

/// Connects to a remote endpoint, producing an open [`Connection`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a websocket connection to `url`.
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>, TransportError>;
}

/// The production [`Transport`], backed by `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteTransport;

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>, TransportError> {
        let (stream, _response) = tokio_tungstenite::connect_async(url).await?;
        Ok(Box::new(TungsteniteConnection { stream }))
    }
}

struct TungsteniteConnection {
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

#[async_trait]
impl Connection for TungsteniteConnection {
    async fn send_text(&mut self, frame: String) -> Result<(), TransportError> {
        self.stream.send(Message::Text(frame)).await?;
        Ok(())
    }

    async fn next_event(&mut self) -> ConnectionEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(t))) => return ConnectionEvent::Text(t),
                Some(Ok(Message::Close(frame))) => {
                    return close_event(frame);
                }
                // WS-level ping/pong/raw frames are handled transparently by
                // tungstenite; nothing for us to do at this layer.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Binary(b))) => {
                    tracing::warn!(bytes = b.len(), "dropping unexpected binary frame");
                    continue;
                }
                Some(Err(err)) => {
                    tracing::debug!(%err, "transport error, treating as closed");
                    return ConnectionEvent::Closed { code: 1006, reason: err.to_string() };
                }
                None => return ConnectionEvent::Closed { code: 1006, reason: String::new() },
            }
        }
    }

    async fn close(&mut self, code: u16, reason: String) {
        let frame = CloseFrame { code: CloseCode::from(code), reason: reason.into() };
        let _ = self.stream.send(Message::Close(Some(frame))).await;
    }
}

fn close_event(frame: Option<CloseFrame<'_>>) -> ConnectionEvent {
    match frame {
        Some(f) => ConnectionEvent::Closed { code: u16::from(f.code), reason: f.reason.into_owned() },
        None => ConnectionEvent::Closed { code: 1000, reason: String::new() },
    }
}
