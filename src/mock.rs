//! In-memory [`Transport`] test double.
//!
//! A queue the test script feeds and a queue the code under test drains,
//! instead of a real socket. The two queues are per-connection rather than
//! global, since each `connect()` call needs its own independent script (a
//! reconnect test dials more than once and each dial gets its own inbound
//! frames).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream::StreamExt;

use crate::error::TransportError;
use crate::transport::{Connection, ConnectionEvent, Transport};

/// Handle to a connection before (or after) it is dialed, used to script
/// what the mock server "sends" and to inspect what the client "sent".
#[derive(Clone)]
pub struct MockHandle {
    events: futures_channel::mpsc::UnboundedSender<ConnectionEvent>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl MockHandle {
    /// Queues a text frame as if the server had sent it.
    pub fn push_text(&self, text: impl Into<String>) {
        let _ = self.events.unbounded_send(ConnectionEvent::Text(text.into()));
    }
    /// Queues a close event as if the server had dropped the connection.
    pub fn push_close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.events.unbounded_send(ConnectionEvent::Closed { code, reason: reason.into() });
    }
    /// Every text frame the client has sent on this connection, oldest first.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

/// Scripted [`Transport`]: each `connect()` call either hands back the next
/// prepared connection in FIFO order, or fails with [`TransportError::Dial`]
/// if none is queued — a "you forgot to script this" failure mode.
type PreparedConnection = (futures_channel::mpsc::UnboundedReceiver<ConnectionEvent>, Arc<Mutex<Vec<String>>>);

#[derive(Clone, Default)]
pub struct MockTransport {
    pending: Arc<Mutex<VecDeque<PreparedConnection>>>,
    dialed: Arc<Mutex<Vec<String>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepares the connection the next `connect()` call will receive, and
    /// returns the handle the test uses to drive it. The handle's `sent()`
    /// reads from the same buffer the eventual `MockConnection` writes into.
    pub fn prepare_connection(&self) -> MockHandle {
        let (tx, rx) = futures_channel::mpsc::unbounded();
        let sent = Arc::new(Mutex::new(Vec::new()));
        self.pending.lock().unwrap().push_back((rx, sent.clone()));
        MockHandle { events: tx, sent }
    }

    /// Every URL passed to `connect()`, oldest first.
    pub fn dialed(&self) -> Vec<String> {
        self.dialed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>, TransportError> {
        self.dialed.lock().unwrap().push(url.to_string());
        let (events, sent) = self
            .pending
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| TransportError::Dial(format!("no connection scripted for {url}")))?;
        Ok(Box::new(MockConnection { events, sent }))
    }
}

struct MockConnection {
    events: futures_channel::mpsc::UnboundedReceiver<ConnectionEvent>,
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn send_text(&mut self, frame: String) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn next_event(&mut self) -> ConnectionEvent {
        match self.events.next().await {
            Some(event) => event,
            None => ConnectionEvent::Closed { code: 1006, reason: String::new() },
        }
    }

    async fn close(&mut self, _code: u16, _reason: String) {
        self.events.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_without_a_scripted_connection_fails() {
        let transport = MockTransport::new();
        let err = transport.connect("ws://example.test").await.unwrap_err();
        assert!(matches!(err, TransportError::Dial(_)));
    }

    #[tokio::test]
    async fn connect_hands_back_connections_in_fifo_order() {
        let transport = MockTransport::new();
        let first = transport.prepare_connection();
        let second = transport.prepare_connection();
        first.push_text("first");
        second.push_text("second");

        let mut a = transport.connect("ws://example.test/a").await.unwrap();
        let mut b = transport.connect("ws://example.test/b").await.unwrap();

        assert!(matches!(a.next_event().await, ConnectionEvent::Text(t) if t == "first"));
        assert!(matches!(b.next_event().await, ConnectionEvent::Text(t) if t == "second"));
        assert_eq!(transport.dialed(), vec!["ws://example.test/a", "ws://example.test/b"]);
    }

    #[tokio::test]
    async fn sent_frames_are_recorded_on_the_handle() {
        let transport = MockTransport::new();
        let handle = transport.prepare_connection();
        let mut conn = transport.connect("ws://example.test").await.unwrap();
        conn.send_text("hello".into()).await.unwrap();
        assert_eq!(handle.sent(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn closing_the_connection_ends_the_event_stream() {
        let transport = MockTransport::new();
        transport.prepare_connection();
        let mut conn = transport.connect("ws://example.test").await.unwrap();
        conn.close(1000, "done".into()).await;
        assert!(matches!(conn.next_event().await, ConnectionEvent::Closed { .. }));
    }
}
