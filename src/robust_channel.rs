//! Robust Channel.
//!
//! Adds connect/authenticate and automatic reconnection on top of a bare
//! [`RequestHandler`]: the same open-socket/hand-off-to-worker/reconnect-
//! on-death shape, collapsed here because the Request Handler this crate
//! hands off to does not survive the reconnect itself (see
//! `request_handler.rs`) — each reconnect attempt constructs a fresh one.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::clock::{schedule, Clock, TimerHandle};
use crate::config::ChannelConfig;
use crate::error::{ChannelError, ConnectError};
use crate::ids::generate_correlation_id;
use crate::request_handler::RequestHandler;
use crate::transport::Transport;
use crate::wire::Envelope;

/// Resolves the websocket URL to dial, given the pieces of context the
/// server-side address-assignment scheme needs. A trait rather than a
/// closure so implementations can hold
/// their own state (e.g. a cached DNS lookup or an HTTP client).
#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// Returns the `ws://`/`wss://` URL to connect to.
    async fn resolve(
        &self,
        http_domain: &str,
        account: &str,
        site: &str,
        jwt: &str,
    ) -> Result<String, ConnectError>;
}

/// The server's reply to a successful authentication handshake.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResult {
    #[serde(rename = "tokenIssued")]
    pub token_issued: i64,
    #[serde(rename = "tokenExpiration")]
    pub token_expiration: i64,
}

/// Hook invoked (deferred, off the reconnect path) after a connect or
/// reconnect succeeds.
pub type ConnectHook = Arc<dyn Fn(&AuthResult) + Send + Sync>;
/// Hook invoked after a reconnect-triggered re-authentication succeeds.
pub type ReconnectHook = Arc<dyn Fn(&AuthResult) + Send + Sync>;

struct State {
    handler: Option<RequestHandler>,
    jwt: Option<String>,
    last_auth: Option<AuthResult>,
    retry_interval: Duration,
    retry_timer: Option<TimerHandle>,
    closing: bool,
}

struct Inner {
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn AddressResolver>,
    clock: Arc<dyn Clock>,
    config: ChannelConfig,
    http_domain: String,
    account: String,
    site: String,
    // Vecs, not a single slot: both the Authenticated Channel (token refresh
    // rearming) and the Event Channel (subscription re-registration) need to
    // react independently to the same reconnect.
    on_connect: Mutex<Vec<ConnectHook>>,
    on_reconnect: Mutex<Vec<ReconnectHook>>,
    state: Mutex<State>,
}

/// A reconnecting, authenticated websocket channel.
///
/// Cheap to clone; every clone shares the same underlying connection state
/// through a cloneable front door onto actor-owned state.
#[derive(Clone)]
pub struct RobustChannel {
    inner: Arc<Inner>,
}

impl fmt::Debug for RobustChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RobustChannel").finish_non_exhaustive()
    }
}

impl RobustChannel {
    /// Builds a channel bound to one `(httpDomain, account, site)` triple.
    /// Dialing does not happen until [`connect`](Self::connect) is called.
    pub fn new(
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn AddressResolver>,
        clock: Arc<dyn Clock>,
        config: ChannelConfig,
        http_domain: impl Into<String>,
        account: impl Into<String>,
        site: impl Into<String>,
    ) -> Self {
        let retry_interval = config.retry_interval_min;
        RobustChannel {
            inner: Arc::new(Inner {
                transport,
                resolver,
                clock,
                config,
                http_domain: http_domain.into(),
                account: account.into(),
                site: site.into(),
                on_connect: Mutex::new(Vec::new()),
                on_reconnect: Mutex::new(Vec::new()),
                state: Mutex::new(State {
                    handler: None,
                    jwt: None,
                    last_auth: None,
                    retry_interval,
                    retry_timer: None,
                    closing: false,
                }),
            }),
        }
    }

    /// Adds a hook run after every successful `connect()` (not fired again
    /// on an automatic reconnect; see [`on_reconnect`](Self::on_reconnect)).
    /// Additive: each call adds an independent subscriber.
    pub async fn on_connect(&self, hook: ConnectHook) {
        self.inner.on_connect.lock().await.push(hook);
    }

    /// Adds a hook run after a reconnect-triggered re-authentication.
    /// Additive: each call adds an independent subscriber.
    pub async fn on_reconnect(&self, hook: ReconnectHook) {
        self.inner.on_reconnect.lock().await.push(hook);
    }

    /// `true` while a live, authenticated Request Handler is bound.
    pub async fn is_connected(&self) -> bool {
        matches!(&self.inner.state.lock().await.handler, Some(h) if h.is_alive())
    }

    /// Opens the socket, authenticates with `jwt`, and binds a fresh Request
    /// Handler. If already connected, returns the cached auth result without
    /// dialing again.
    pub async fn connect(&self, jwt: impl Into<String>) -> Result<AuthResult, ConnectError> {
        let jwt = jwt.into();
        {
            let mut state = self.inner.state.lock().await;
            if let Some(handler) = &state.handler {
                if handler.is_alive() {
                    if let Some(auth) = &state.last_auth {
                        return Ok(auth.clone());
                    }
                }
            }
            if let Some(timer) = state.retry_timer.take() {
                timer.cancel();
            }
            state.closing = false;
        }

        let auth = self.do_connect(&jwt).await?;

        {
            let mut state = self.inner.state.lock().await;
            state.retry_interval = self.inner.config.retry_interval_min;
        }

        for hook in self.inner.on_connect.lock().await.iter().cloned() {
            let auth = auth.clone();
            tokio::spawn(async move { hook(&auth) });
        }

        Ok(auth)
    }

    /// Performs the connect/authenticate protocol without touching the retry
    /// interval or firing `onConnect`; shared by [`connect`](Self::connect)
    /// and the reconnect loop.
    async fn do_connect(&self, jwt: &str) -> Result<AuthResult, ConnectError> {
        let url = self
            .inner
            .resolver
            .resolve(&self.inner.http_domain, &self.inner.account, &self.inner.site, jwt)
            .await?;
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConnectError::InvalidAddress(url));
        }

        let mut connection = self.inner.transport.connect(&url).await?;
        connection.send_text(jwt.to_string()).await?;

        let event = connection.next_event().await;
        let auth = match event {
            crate::transport::ConnectionEvent::Text(text) => {
                let envelope: Envelope = serde_json::from_str(&text).map_err(|_| ConnectError::InvalidToken)?;
                if envelope.unique_id != "authSuccess" || !envelope.is_ok() {
                    return Err(ConnectError::InvalidToken);
                }
                serde_json::from_str::<AuthResult>(envelope.payload.get())
                    .map_err(|_| ConnectError::InvalidToken)?
            }
            crate::transport::ConnectionEvent::Closed { .. } => return Err(ConnectError::InvalidToken),
        };

        let this = self.clone();
        let handler = RequestHandler::spawn(connection, self.inner.config.clone(), move || {
            let this = this.clone();
            tokio::spawn(async move { this.handle_unexpected_close().await });
        });

        {
            let mut state = self.inner.state.lock().await;
            state.handler = Some(handler);
            state.jwt = Some(jwt.to_string());
            state.last_auth = Some(auth.clone());
        }

        Ok(auth)
    }

    /// The Request Handler's unexpected-close trigger. A no-op if the
    /// channel is mid-`close()`.
    async fn handle_unexpected_close(&self) {
        {
            let state = self.inner.state.lock().await;
            if state.closing {
                return;
            }
        }
        tracing::info!("connection lost, scheduling reconnect");
        self.schedule_reconnect().await;
    }

    async fn schedule_reconnect(&self) {
        let (delay, clock) = {
            let mut state = self.inner.state.lock().await;
            state.handler = None;
            if let Some(timer) = state.retry_timer.take() {
                timer.cancel();
            }
            (state.retry_interval, self.inner.clock.clone())
        };

        let this = self.clone();
        let timer = schedule(&*clock, delay, async move { this.attempt_reconnect().await });

        self.inner.state.lock().await.retry_timer = Some(timer);
    }

    async fn attempt_reconnect(&self) {
        let jwt = {
            let state = self.inner.state.lock().await;
            if state.closing {
                return;
            }
            match &state.jwt {
                Some(jwt) => jwt.clone(),
                None => return,
            }
        };

        match self.do_connect(&jwt).await {
            Ok(auth) => {
                {
                    let mut state = self.inner.state.lock().await;
                    state.retry_interval = self.inner.config.retry_interval_min;
                    state.retry_timer = None;
                }
                tracing::info!("reconnected");
                for hook in self.inner.on_reconnect.lock().await.iter().cloned() {
                    let auth = auth.clone();
                    tokio::spawn(async move { hook(&auth) });
                }
            }
            Err(err) => {
                tracing::debug!(%err, "reconnect attempt failed, backing off");
                {
                    let mut state = self.inner.state.lock().await;
                    let next = state.retry_interval + self.inner.config.retry_interval_increase;
                    state.retry_interval = std::cmp::min(next, self.inner.config.retry_interval_max);
                }
                self.schedule_reconnect().await;
            }
        }
    }

    /// Closes the socket and suppresses any pending/future reconnect.
    ///
    /// Marks the handler's closure callback *before* tearing the socket down
    /// so that a close racing an in-flight reconnect trigger always wins.
    pub async fn close(&self) {
        let handler = {
            let mut state = self.inner.state.lock().await;
            state.closing = true;
            if let Some(timer) = state.retry_timer.take() {
                timer.cancel();
            }
            state.handler.take()
        };

        if let Some(handler) = handler {
            let (tx, rx) = tokio::sync::oneshot::channel();
            handler.set_closure_callback(Box::new(move || {
                let _ = tx.send(());
            }));
            handler.close_socket();
            let _ = rx.await;
        }
    }

    /// Sends a raw message under a freshly generated correlation id,
    /// delegating to the bound Request Handler. Fails if no socket is open.
    pub async fn send_message_raw(
        &self,
        action: impl Into<String>,
        payload: impl serde::Serialize,
    ) -> Result<Envelope, ChannelError> {
        let handler = {
            let state = self.inner.state.lock().await;
            state.handler.clone()
        };
        let handler = handler.ok_or(ChannelError::NotConnected)?;
        let unique_id = generate_correlation_id();
        handler
            .send_request(unique_id, action, payload, self.inner.config.request_timeout, None)
            .await
            .map_err(ChannelError::from)
    }

    /// The Request Handler currently bound, if any — used by higher layers
    /// (Event Channel) that need direct access to `send_request`/
    /// `register_server_callback` rather than going through
    /// [`send_message_raw`](Self::send_message_raw).
    pub async fn handler(&self) -> Option<RequestHandler> {
        self.inner.state.lock().await.handler.clone()
    }

    pub(crate) fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ImmediateClock;
    use crate::mock::{MockHandle, MockTransport};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn auth_result_deserializes_server_field_names() {
        let raw = r#"{"tokenIssued":1000,"tokenExpiration":2000}"#;
        let auth: AuthResult = serde_json::from_str(raw).unwrap();
        assert_eq!(auth.token_issued, 1000);
        assert_eq!(auth.token_expiration, 2000);
    }

    struct FixedResolver(String);

    #[async_trait]
    impl AddressResolver for FixedResolver {
        async fn resolve(&self, _http_domain: &str, _account: &str, _site: &str, _jwt: &str) -> Result<String, ConnectError> {
            Ok(self.0.clone())
        }
    }

    fn auth_success_frame(issued: i64, expiration: i64) -> String {
        format!(
            r#"{{"uniqueId":"authSuccess","action":null,"status":"ok","payload":{{"tokenIssued":{issued},"tokenExpiration":{expiration}}}}}"#
        )
    }

    async fn wait_for_sent(handle: &MockHandle, n: usize) {
        for _ in 0..500 {
            if handle.sent().len() >= n {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("timed out waiting for {n} sent frame(s), got {:?}", handle.sent());
    }

    #[tokio::test]
    async fn connect_authenticates_and_binds_a_handler() {
        let transport = Arc::new(MockTransport::new());
        let handle = transport.prepare_connection();
        let resolver = Arc::new(FixedResolver("ws://node".to_string()));
        let clock = Arc::new(ImmediateClock);
        let channel =
            RobustChannel::new(transport.clone(), resolver, clock, ChannelConfig::default(), "http://auth", "acct", "site1");

        let task = tokio::spawn({
            let channel = channel.clone();
            async move { channel.connect("jwt-1").await }
        });
        wait_for_sent(&handle, 1).await;
        assert_eq!(handle.sent(), vec!["jwt-1".to_string()]);
        handle.push_text(auth_success_frame(1000, 2000));

        let auth = task.await.unwrap().unwrap();
        assert_eq!(auth.token_issued, 1000);
        assert_eq!(auth.token_expiration, 2000);
        assert!(channel.is_connected().await);
        assert_eq!(transport.dialed(), vec!["ws://node".to_string()]);
    }

    #[tokio::test]
    async fn invalid_first_frame_rejects_as_invalid_token() {
        let transport = Arc::new(MockTransport::new());
        let handle = transport.prepare_connection();
        let resolver = Arc::new(FixedResolver("ws://node".to_string()));
        let clock = Arc::new(ImmediateClock);
        let channel =
            RobustChannel::new(transport.clone(), resolver, clock, ChannelConfig::default(), "http://auth", "acct", "site1");

        let task = tokio::spawn({
            let channel = channel.clone();
            async move { channel.connect("jwt-1").await }
        });
        wait_for_sent(&handle, 1).await;
        handle.push_text(r#"{"uniqueId":"somethingElse","action":null,"status":"ok","payload":{}}"#);

        assert!(matches!(task.await.unwrap().unwrap_err(), ConnectError::InvalidToken));
    }

    #[tokio::test]
    async fn reconnects_after_unexpected_close_reusing_the_original_jwt() {
        let transport = Arc::new(MockTransport::new());
        let first = transport.prepare_connection();
        let second = transport.prepare_connection();
        let resolver = Arc::new(FixedResolver("ws://node".to_string()));
        let clock = Arc::new(ImmediateClock);
        let mut config = ChannelConfig::default();
        config.retry_interval_min = Duration::from_millis(1);
        let channel = RobustChannel::new(transport.clone(), resolver, clock, config, "http://auth", "acct", "site1");

        let reconnected = Arc::new(AtomicBool::new(false));
        let flag = reconnected.clone();
        channel
            .on_reconnect(Arc::new(move |_auth: &AuthResult| {
                flag.store(true, Ordering::SeqCst);
            }))
            .await;

        let connect_task = tokio::spawn({
            let channel = channel.clone();
            async move { channel.connect("jwt-1").await }
        });
        wait_for_sent(&first, 1).await;
        first.push_text(auth_success_frame(1000, 2000));
        connect_task.await.unwrap().unwrap();

        first.push_close(1006, "lost");

        wait_for_sent(&second, 1).await;
        assert_eq!(second.sent(), vec!["jwt-1".to_string()]);
        second.push_text(auth_success_frame(1500, 2500));

        for _ in 0..500 {
            if reconnected.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(reconnected.load(Ordering::SeqCst));
        assert!(channel.is_connected().await);
    }

    #[tokio::test]
    async fn close_suppresses_reconnect() {
        let transport = Arc::new(MockTransport::new());
        let first = transport.prepare_connection();
        let resolver = Arc::new(FixedResolver("ws://node".to_string()));
        let clock = Arc::new(ImmediateClock);
        let channel =
            RobustChannel::new(transport.clone(), resolver, clock, ChannelConfig::default(), "http://auth", "acct", "site1");

        let connect_task = tokio::spawn({
            let channel = channel.clone();
            async move { channel.connect("jwt-1").await }
        });
        wait_for_sent(&first, 1).await;
        first.push_text(auth_success_frame(1000, 2000));
        connect_task.await.unwrap().unwrap();

        channel.close().await;

        assert!(!channel.is_connected().await);
        // No second connection was ever dialed: the retry timer was
        // cancelled before the socket was closed.
        assert_eq!(transport.dialed(), vec!["ws://node".to_string()]);
    }
}
