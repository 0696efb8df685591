//! Request Handler.
//!
//! Multiplexes request/response RPCs and server-push subscriptions over one
//! socket. Bound to exactly one [`Connection`](crate::transport::Connection)
//! for its entire lifetime: if the socket closes, the handler is discarded
//! and all Tracked Requests under it are rejected; re-creation on reconnect
//! is the Robust Channel's job (see `robust_channel.rs`).
//!
//! Internally this runs as a single actor task owning the connection and
//! both lookup tables, communicating with the public handle only via
//! channels — one task is enough because nothing needs to survive the
//! socket's death.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_channel::{mpsc, oneshot};
use futures_util::StreamExt;
use serde_json::value::{to_raw_value, RawValue};

use crate::config::ChannelConfig;
use crate::error::RequestError;
use crate::transport::{Connection, ConnectionEvent};
use crate::wire::{Envelope, OutboundRequest, PONG_FRAME};

/// Callback installed via [`RequestHandler::register_server_callback`].
/// Invoked, deferred, with the raw (undecoded) payload of each matching push.
pub type ServerCallback = Arc<dyn Fn(Box<RawValue>) + Send + Sync>;

/// Callback installed via [`RequestHandler::set_closure_callback`]. Invoked
/// exactly once, when the socket closes, if this handler's close was
/// user-initiated (suppressing the reconnect path).
pub type ClosureCallback = Box<dyn FnOnce() + Send>;

/// The sweep period floor: `max(defaultTimeout/2, 5000)` ms.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(5_000);

struct TrackedRequest {
    sent_at: Instant,
    timeout: Duration,
    resolver: oneshot::Sender<Result<Envelope, RequestError>>,
}

enum Instruction {
    Send {
        unique_id: String,
        action: String,
        payload: Box<RawValue>,
        timeout: Duration,
        expected_response_id: Option<String>,
        respond: oneshot::Sender<Result<Envelope, RequestError>>,
    },
    RegisterListener {
        action: String,
        correlation_id: String,
        callback: ServerCallback,
    },
    RemoveListener {
        action: String,
        correlation_id: String,
    },
    SetClosureCallback(ClosureCallback),
    Close,
}

/// Public handle to a running Request Handler actor.
///
/// Cheaply `Clone`-able; all clones share the same underlying actor and
/// tables. Dropping every clone drops the instruction channel, which the
/// actor treats the same as any other shutdown.
#[derive(Clone)]
pub struct RequestHandler {
    instructions: mpsc::UnboundedSender<Instruction>,
    alive: Arc<AtomicBool>,
}

impl fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandler").field("alive", &self.is_alive()).finish_non_exhaustive()
    }
}

impl RequestHandler {
    /// Spawns a new handler bound to `connection`. `on_unexpected_close` is
    /// invoked once if the socket closes without
    /// [`set_closure_callback`](Self::set_closure_callback) having been used
    /// first — i.e. this is the Robust Channel's reconnect trigger.
    pub fn spawn(
        connection: Box<dyn Connection>,
        config: ChannelConfig,
        on_unexpected_close: impl FnOnce() + Send + 'static,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded();
        let alive = Arc::new(AtomicBool::new(true));
        let actor = Actor {
            connection,
            config,
            tracked: HashMap::new(),
            listeners: HashMap::new(),
            closure_callback: None,
            alive: alive.clone(),
        };
        tokio::spawn(actor.run(rx, on_unexpected_close));
        RequestHandler { instructions: tx, alive }
    }

    /// `true` while the backing actor task is still running.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Sends a request, returning the server's response envelope.
    ///
    /// `expected_response_correlation_id`, if given, is the key under which
    /// the Tracked Request is filed instead of `unique_id` — needed for the
    /// `getInitialTagState`/`initialTagState` asymmetry.
    pub async fn send_request(
        &self,
        unique_id: impl Into<String>,
        action: impl Into<String>,
        payload: impl serde::Serialize,
        timeout: Duration,
        expected_response_correlation_id: Option<String>,
    ) -> Result<Envelope, RequestError> {
        let payload = to_raw_value(&payload).map_err(|_| RequestError::InvalidArgument("payload"))?;
        let (respond, rx) = oneshot::channel();
        let instruction = Instruction::Send {
            unique_id: unique_id.into(),
            action: action.into(),
            payload,
            timeout,
            expected_response_id: expected_response_correlation_id,
            respond,
        };
        if self.instructions.unbounded_send(instruction).is_err() {
            return Err(RequestError::SocketClosed);
        }
        rx.await.unwrap_or(Err(RequestError::SocketClosed))
    }

    /// Installs a server listener under `(action, correlation_id)`.
    pub fn register_server_callback(
        &self,
        action: impl Into<String>,
        correlation_id: impl Into<String>,
        callback: ServerCallback,
    ) -> Result<(), RequestError> {
        let action = action.into();
        let correlation_id = correlation_id.into();
        if action.is_empty() {
            return Err(RequestError::InvalidArgument("action"));
        }
        if correlation_id.is_empty() {
            return Err(RequestError::InvalidArgument("correlationId"));
        }
        self.instructions
            .unbounded_send(Instruction::RegisterListener { action, correlation_id, callback })
            .map_err(|_| RequestError::SocketClosed)
    }

    /// Removes a previously-installed server listener.
    pub fn remove_server_callback(&self, action: impl Into<String>, correlation_id: impl Into<String>) {
        let _ = self.instructions.unbounded_send(Instruction::RemoveListener {
            action: action.into(),
            correlation_id: correlation_id.into(),
        });
    }

    /// Marks the next close as user-initiated: when the socket subsequently
    /// closes, `callback` fires instead of the reconnect path.
    pub fn set_closure_callback(&self, callback: ClosureCallback) {
        let _ = self.instructions.unbounded_send(Instruction::SetClosureCallback(callback));
    }

    /// Forces the socket closed. Pair with
    /// [`set_closure_callback`](Self::set_closure_callback), set first, so
    /// the caller is notified once teardown completes rather than racing the
    /// reconnect path.
    pub fn close_socket(&self) {
        let _ = self.instructions.unbounded_send(Instruction::Close);
    }
}

struct Actor {
    connection: Box<dyn Connection>,
    config: ChannelConfig,
    tracked: HashMap<String, TrackedRequest>,
    listeners: HashMap<(String, String), ServerCallback>,
    closure_callback: Option<ClosureCallback>,
    alive: Arc<AtomicBool>,
}

impl Actor {
    async fn run(mut self, mut instructions: mpsc::UnboundedReceiver<Instruction>, on_unexpected_close: impl FnOnce() + Send + 'static) {
        let sweep_interval = std::cmp::max(self.config.request_timeout / 2, MIN_SWEEP_INTERVAL);
        let mut sweep = tokio::time::interval(sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                instruction = instructions.next() => {
                    match instruction {
                        Some(Instruction::Close) => {
                            tracing::debug!("close requested, shutting down");
                            self.connection.close(1000, "closed".into()).await;
                            break;
                        }
                        Some(instruction) => self.handle_instruction(instruction).await,
                        None => {
                            tracing::debug!("all RequestHandler handles dropped, shutting down");
                            self.connection.close(1000, "handle dropped".into()).await;
                            break;
                        }
                    }
                }

                event = self.connection.next_event() => {
                    match event {
                        ConnectionEvent::Text(text) => self.handle_text(text).await,
                        ConnectionEvent::Closed { code, reason } => {
                            tracing::debug!(code, %reason, "connection closed");
                            break;
                        }
                    }
                }

                _ = sweep.tick() => self.sweep_timeouts(),
            }
        }

        self.alive.store(false, Ordering::Relaxed);
        self.reject_all(RequestError::SocketClosed);

        match self.closure_callback.take() {
            Some(cb) => cb(),
            None if self.config.reopen_broken_connection => on_unexpected_close(),
            None => {}
        }
    }

    async fn handle_instruction(&mut self, instruction: Instruction) {
        match instruction {
            Instruction::Send { unique_id, action, payload, timeout, expected_response_id, respond } => {
                let key = expected_response_id.unwrap_or_else(|| unique_id.clone());
                let frame = OutboundRequest { unique_id: &unique_id, action: &action, payload: &payload };
                let text = match frame.serialize() {
                    Ok(t) => t,
                    Err(err) => {
                        let _ = respond.send(Err(RequestError::InvalidArgument("payload")));
                        tracing::warn!(%err, "failed to serialize outbound request");
                        return;
                    }
                };
                if self.config.log_raw_messages {
                    tracing::trace!(frame = %text, "sending");
                }
                self.tracked.insert(
                    key,
                    TrackedRequest { sent_at: Instant::now(), timeout, resolver: respond },
                );
                if let Err(err) = self.connection.send_text(text).await {
                    tracing::warn!(%err, "failed to write request, rejecting in place");
                    // The next `next_event()` poll will observe the closed
                    // socket and run teardown, which rejects everything
                    // including this one; nothing further to do here.
                }
            }
            Instruction::RegisterListener { action, correlation_id, callback } => {
                self.listeners.insert((action, correlation_id), callback);
            }
            Instruction::RemoveListener { action, correlation_id } => {
                self.listeners.remove(&(action, correlation_id));
            }
            Instruction::SetClosureCallback(cb) => {
                self.closure_callback = Some(cb);
            }
            Instruction::Close => unreachable!("handled directly in run()"),
        }
    }

    async fn handle_text(&mut self, text: String) {
        if self.config.log_raw_messages {
            tracing::trace!(frame = %text, "received");
        }
        if text.is_empty() {
            // Liveness ping: reply, invoke nothing.
            if let Err(err) = self.connection.send_text(PONG_FRAME.to_string()).await {
                tracing::warn!(%err, "failed to reply to ping");
            }
            return;
        }

        let mut envelope: Envelope = match serde_json::from_str(&text) {
            Ok(e) => e,
            Err(err) => {
                tracing::warn!(%err, frame = %text, "dropping unparseable frame");
                return;
            }
        };

        let ok = envelope.is_ok();

        // Special-case rewrites, reproduced verbatim for wire
        // compatibility — do not generalize without server coordination.
        if envelope.unique_id == "getInitialTagState" {
            if !ok {
                envelope.unique_id = "initialTagState".to_string();
            } else {
                // Successful response arrives via a separate push; nothing
                // to route for this frame.
                return;
            }
        } else if envelope.action.as_deref() == Some("initialTagState") && ok {
            envelope.unique_id = "initialTagState".to_string();
            envelope.action = None;
        }

        if let Some(tracked) = self.tracked.remove(&envelope.unique_id) {
            let result = if ok { Ok(envelope) } else {
                let status = envelope.status.clone();
                Err(RequestError::Rejected(status))
            };
            defer(move || {
                let _ = tracked.resolver.send(result);
            });
            return;
        }

        if let Some(action) = envelope.action.clone() {
            let matches: Vec<ServerCallback> = self
                .listeners
                .iter()
                .filter(|(key, _)| key.0 == action)
                .map(|(_, cb)| cb.clone())
                .collect();
            if !matches.is_empty() {
                let payload = envelope.payload.clone();
                for cb in matches {
                    let payload = payload.clone();
                    defer(move || {
                        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(payload)));
                        if let Err(panic) = result {
                            tracing::error!(?panic, "server listener callback panicked");
                        }
                    });
                }
                return;
            }
        }

        tracing::debug!(uniqueId = %envelope.unique_id, action = ?envelope.action, "no handler for uniqueId/action");
    }

    fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .tracked
            .iter()
            .filter(|(_, req)| now.duration_since(req.sent_at) > req.timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(tracked) = self.tracked.remove(&id) {
                let _ = tracked.resolver.send(Err(RequestError::Timeout));
            }
        }
    }

    fn reject_all(&mut self, reason: RequestError) {
        for (_, tracked) in self.tracked.drain() {
            let _ = tracked.resolver.send(Err(reason.clone()));
        }
        self.listeners.clear();
    }
}

/// Runs `f` on a fresh task so a thrown or re-entrant user callback cannot
/// corrupt the routing loop it was invoked from.
fn defer(f: impl FnOnce() + Send + 'static) {
    tokio::spawn(async move { f() });
}
