//! Authenticated Channel.
//!
//! Wraps a [`RobustChannel`] with proactive token refresh: whenever a
//! connect or reconnect hands back a fresh `tokenIssued`/`tokenExpiration`
//! pair, a timer is armed to send `refreshToken` before the old token
//! expires, using the [`schedule`]/[`Clock`] abstraction to isolate the
//! timer from a real clock.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use crate::clock::{schedule, Clock, TimerHandle};
use crate::config::ChannelConfig;
use crate::error::ConnectError;
use crate::robust_channel::{AuthResult, RobustChannel};

/// Supplies a fresh JWT on demand, e.g. by calling an auth server.
/// A trait rather than a closure so implementations can hold state (token
/// caches, HTTP clients, credentials).
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns a new JWT to authenticate with, routed to `auth_domain` when
    /// the caller supplied one (see spec.md §6's `(authDomain) -> jwt`
    /// external collaborator contract).
    async fn token(&self, auth_domain: Option<&str>) -> Result<String, ConnectError>;
}

struct State {
    refresh_timer: Option<TimerHandle>,
    /// Clock skew against the server, computed once at the initial connect
    /// and reused by every later refresh.
    clock_diff_millis: Option<i64>,
    /// Set once the reconnect hook is pushed onto the [`RobustChannel`], so a
    /// second `connect()` call (e.g. after a user-initiated `close()`) never
    /// registers a duplicate subscriber.
    reconnect_hook_installed: bool,
    /// The `authDomain` passed to the most recent `connect`/`connect_with_jwt`
    /// call, reused by every later refresh fetch.
    auth_domain: Option<String>,
}

struct Inner {
    channel: RobustChannel,
    tokens: Arc<dyn TokenProvider>,
    clock: Arc<dyn Clock>,
    config: ChannelConfig,
    state: Mutex<State>,
}

/// A [`RobustChannel`] that keeps its JWT fresh on its own.
///
/// Holds at most one refresh timer armed at a time: every (re)connect
/// cancels whatever timer was pending before arming a new one off the fresh
/// `tokenIssued`/`tokenExpiration` pair.
#[derive(Clone)]
pub struct AuthenticatedChannel {
    inner: Arc<Inner>,
}

impl fmt::Debug for AuthenticatedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticatedChannel").finish_non_exhaustive()
    }
}

impl AuthenticatedChannel {
    pub fn new(channel: RobustChannel, tokens: Arc<dyn TokenProvider>, clock: Arc<dyn Clock>, config: ChannelConfig) -> Self {
        AuthenticatedChannel {
            inner: Arc::new(Inner {
                channel,
                tokens,
                clock,
                config,
                state: Mutex::new(State {
                    refresh_timer: None,
                    clock_diff_millis: None,
                    reconnect_hook_installed: false,
                    auth_domain: None,
                }),
            }),
        }
    }

    /// Installed at most once per channel, not per call: `on_reconnect`
    /// is additive, so re-registering on every connect (e.g. after a
    /// `close()`/`connect()` cycle) would rearm the refresh timer twice per
    /// future reconnect.
    async fn ensure_reconnect_hook_installed(&self) {
        let already_installed = {
            let mut state = self.inner.state.lock().await;
            std::mem::replace(&mut state.reconnect_hook_installed, true)
        };
        if already_installed {
            return;
        }
        let hook_this = self.clone();
        self.inner
            .channel
            .on_reconnect(Arc::new(move |auth: &AuthResult| {
                let this = hook_this.clone();
                let auth = auth.clone();
                tokio::spawn(async move { this.arm_refresh(auth).await });
            }))
            .await;
    }

    /// Fetches a token from the [`TokenProvider`] (routed to `auth_domain`)
    /// and connects, arming proactive refresh. Mirrors spec.md §4.4's
    /// `connectPersistent(tokenGetter, authDomain?)`.
    pub async fn connect(&self, auth_domain: Option<&str>) -> Result<AuthResult, ConnectError> {
        self.ensure_reconnect_hook_installed().await;
        self.inner.state.lock().await.auth_domain = auth_domain.map(str::to_string);

        let jwt = self.inner.tokens.token(auth_domain).await?;
        let auth = self.inner.channel.connect(jwt).await?;
        if self.inner.config.automatic_token_renewal {
            self.arm_refresh(auth.clone()).await;
        }
        Ok(auth)
    }

    /// Connects with a caller-supplied raw JWT, still arming proactive
    /// refresh — spec.md §4.4's `connect(jwt) — delegates to Authenticated
    /// Channel`. There is no `authDomain` for this entry point (the caller
    /// already has a token), so any later refresh fetch routes to no
    /// particular domain.
    pub async fn connect_with_jwt(&self, jwt: impl Into<String>) -> Result<AuthResult, ConnectError> {
        self.ensure_reconnect_hook_installed().await;
        self.inner.state.lock().await.auth_domain = None;

        let auth = self.inner.channel.connect(jwt).await?;
        if self.inner.config.automatic_token_renewal {
            self.arm_refresh(auth.clone()).await;
        }
        Ok(auth)
    }

    /// Closes the underlying channel and cancels any pending refresh.
    pub async fn close(&self) {
        if let Some(timer) = self.inner.state.lock().await.refresh_timer.take() {
            timer.cancel();
        }
        self.inner.channel.close().await;
    }

    /// Direct access to the wrapped channel, for higher layers (Event
    /// Channel) that need `send_message_raw`/`handler`.
    pub fn channel(&self) -> &RobustChannel {
        &self.inner.channel
    }

    /// Computes and arms the next refresh timer: `refreshAt = issued +
    /// span/2` in server time, translated to local wall time via the
    /// clock-skew estimate, with two decreasingly conservative fallbacks if
    /// that point has already passed.
    async fn arm_refresh(&self, auth: AuthResult) {
        let mut state = self.inner.state.lock().await;
        if let Some(timer) = state.refresh_timer.take() {
            timer.cancel();
        }

        let now = self.inner.clock.now_millis();
        let issued_local = auth.token_issued.saturating_mul(1000);
        let clock_diff = *state.clock_diff_millis.get_or_insert(now - issued_local);

        let delay = compute_refresh_delay(now, &auth, clock_diff);

        tracing::debug!(delay_ms = delay.as_millis() as u64, "armed token refresh");
        let this = self.clone();
        let timer = schedule(&*self.inner.clock, delay, async move { this.refresh().await });
        state.refresh_timer = Some(timer);
    }

    /// Fires when the refresh timer elapses: fetches a new token and sends
    /// it over the *existing* connection as `refreshToken`, rather than
    /// re-running the full connect/authenticate handshake.
    async fn refresh(&self) {
        let auth_domain = self.inner.state.lock().await.auth_domain.clone();
        let jwt = match self.inner.tokens.token(auth_domain.as_deref()).await {
            Ok(jwt) => jwt,
            Err(err) => {
                tracing::warn!(%err, "token provider failed, retrying refresh");
                self.retry_refresh_after_failure().await;
                return;
            }
        };

        match self
            .inner
            .channel
            .send_message_raw("refreshToken", json!({ "token": jwt }))
            .await
        {
            Ok(envelope) if envelope.is_ok() => {
                match serde_json::from_str::<AuthResult>(envelope.payload.get()) {
                    Ok(auth) => {
                        tracing::debug!("token refreshed");
                        self.arm_refresh(auth).await;
                    }
                    Err(err) => {
                        tracing::warn!(%err, "refreshToken response was not a valid auth result");
                        self.retry_refresh_after_failure().await;
                    }
                }
            }
            Ok(envelope) => {
                tracing::warn!(status = %envelope.status, "refreshToken rejected, retrying");
                self.retry_refresh_after_failure().await;
            }
            Err(err) => {
                tracing::warn!(%err, "refreshToken request failed, retrying");
                self.retry_refresh_after_failure().await;
            }
        }
    }

    async fn retry_refresh_after_failure(&self) {
        let this = self.clone();
        let delay = self.inner.config.token_refresh_failure_retry_timeout;
        let timer = schedule(&*self.inner.clock, delay, async move { this.refresh().await });
        self.inner.state.lock().await.refresh_timer = Some(timer);
    }
}

/// `refreshAt = issued + span/2` in server time, translated to local wall
/// time via `clock_diff`, falling back to `expiration - 60s` and finally to
/// a 1s floor if those points have already passed. Split out of
/// [`AuthenticatedChannel::arm_refresh`] so the arithmetic itself (spec.md
/// §4.3, scenario S5) is unit-testable without a timer.
fn compute_refresh_delay(now: i64, auth: &AuthResult, clock_diff: i64) -> Duration {
    let span = auth.token_expiration - auth.token_issued;
    let refresh_at_server = auth.token_issued + span / 2;
    let mut refresh_at_local = refresh_at_server.saturating_mul(1000) + clock_diff;

    if refresh_at_local <= now {
        refresh_at_local = auth.token_expiration.saturating_mul(1000) + clock_diff - 60_000;
    }

    if refresh_at_local <= now {
        Duration::from_millis(1000)
    } else {
        Duration::from_millis((refresh_at_local - now) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ImmediateClock, TokioClock};
    use crate::config::ChannelConfig;
    use crate::error::ConnectError;
    use crate::mock::{MockHandle, MockTransport};
    use crate::robust_channel::{AddressResolver, RobustChannel};
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn tokio_clock_now_millis_is_positive() {
        assert!(TokioClock.now_millis() > 0);
    }

    #[test]
    fn s5_refresh_delay_fires_at_issued_plus_half_span() {
        // spec.md §8 scenario S5: issued=1000, expiration=2000, clockDiff=0
        // -> refresh fires at local time 1500*1000.
        let auth = AuthResult { token_issued: 1000, token_expiration: 2000 };
        let delay = compute_refresh_delay(0, &auth, 0);
        assert_eq!(delay, Duration::from_millis(1_500_000));
    }

    #[test]
    fn refresh_delay_accounts_for_clock_skew() {
        let auth = AuthResult { token_issued: 1000, token_expiration: 2000 };
        // A positive clockDiff shifts the local firing point later by the
        // same amount.
        let delay = compute_refresh_delay(0, &auth, 5_000);
        assert_eq!(delay, Duration::from_millis(1_505_000));
    }

    #[test]
    fn refresh_delay_falls_back_to_expiration_minus_sixty_seconds() {
        // issued=1000, expiration=5000: refreshAt (server) = 3000 -> local
        // 3_000_000ms, already in the past at now=3_500_000. Falls back to
        // expiration*1000 - 60_000 = 4_940_000, still in the future.
        let auth = AuthResult { token_issued: 1000, token_expiration: 5000 };
        let delay = compute_refresh_delay(3_500_000, &auth, 0);
        assert_eq!(delay, Duration::from_millis(1_440_000));
    }

    #[test]
    fn refresh_delay_floors_at_one_second_when_both_fallbacks_are_past() {
        let auth = AuthResult { token_issued: 1000, token_expiration: 1010 };
        let delay = compute_refresh_delay(10_000_000, &auth, 0);
        assert_eq!(delay, Duration::from_millis(1_000));
    }

    struct FixedResolver(String);

    #[async_trait]
    impl AddressResolver for FixedResolver {
        async fn resolve(&self, _http_domain: &str, _account: &str, _site: &str, _jwt: &str) -> Result<String, ConnectError> {
            Ok(self.0.clone())
        }
    }

    /// Hands back a fixed JWT, counting how many times it was called.
    struct CountingToken {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenProvider for CountingToken {
        async fn token(&self, _auth_domain: Option<&str>) -> Result<String, ConnectError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("jwt-refreshed".to_string())
        }
    }

    fn auth_success_frame(issued: i64, expiration: i64) -> String {
        response_frame("authSuccess", issued, expiration)
    }

    fn response_frame(unique_id: &str, issued: i64, expiration: i64) -> String {
        format!(
            r#"{{"uniqueId":"{unique_id}","action":null,"status":"ok","payload":{{"tokenIssued":{issued},"tokenExpiration":{expiration}}}}}"#
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

    fn build(transport: Arc<MockTransport>, tokens: Arc<dyn TokenProvider>) -> AuthenticatedChannel {
        let resolver = Arc::new(FixedResolver("ws://node".to_string()));
        let clock = Arc::new(ImmediateClock);
        let config = ChannelConfig::default();
        let robust = RobustChannel::new(transport, resolver, clock.clone(), config.clone(), "http://auth", "acct", "site1");
        AuthenticatedChannel::new(robust, tokens, clock, config)
    }

    #[tokio::test]
    async fn connect_with_jwt_still_arms_proactive_refresh() {
        // A raw-JWT connect must behave like connect()'s token-provider path
        // for refresh scheduling (maintainer review: EventChannel::connect
        // must not bypass AuthenticatedChannel).
        let transport = Arc::new(MockTransport::new());
        let handle = transport.prepare_connection();
        let tokens = Arc::new(CountingToken { calls: AtomicUsize::new(0) });
        let auth_channel = build(transport, tokens.clone());

        let connect_task = tokio::spawn({
            let auth_channel = auth_channel.clone();
            async move { auth_channel.connect_with_jwt("jwt-raw").await }
        });
        wait_for_sent(&handle, 1).await;
        assert_eq!(handle.sent(), vec!["jwt-raw".to_string()]);
        // Short-lived token: with ImmediateClock, the refresh timer fires
        // right away once armed.
        handle.push_text(auth_success_frame(1000, 1010));
        connect_task.await.unwrap().unwrap();

        // A refreshToken request must follow even though connect_with_jwt
        // never touched the TokenProvider to obtain the original JWT.
        wait_for_sent(&handle, 2).await;
        let sent = handle.sent();
        let refresh_request: Value = serde_json::from_str(&sent[1]).unwrap();
        assert_eq!(refresh_request["action"].as_str().unwrap(), "refreshToken");
        assert_eq!(tokens.calls.load(Ordering::SeqCst), 1);
    }

    fn refresh_request_id(handle: &MockHandle, index: usize) -> String {
        let sent = handle.sent();
        let request: Value = serde_json::from_str(&sent[index]).unwrap();
        assert_eq!(request["action"].as_str().unwrap(), "refreshToken");
        request["uniqueId"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn failed_refresh_retries_and_then_succeeds() {
        let transport = Arc::new(MockTransport::new());
        let handle = transport.prepare_connection();
        let tokens = Arc::new(CountingToken { calls: AtomicUsize::new(0) });
        let auth_channel = build(transport, tokens.clone());

        let connect_task = tokio::spawn({
            let auth_channel = auth_channel.clone();
            async move { auth_channel.connect(None).await }
        });
        wait_for_sent(&handle, 1).await;
        handle.push_text(auth_success_frame(1000, 1010));
        connect_task.await.unwrap().unwrap();

        wait_for_sent(&handle, 2).await;
        // Reject the first refresh attempt; the failure-retry path must
        // schedule exactly one more attempt.
        let first_id = refresh_request_id(&handle, 1);
        handle.push_text(format!(r#"{{"uniqueId":"{first_id}","action":null,"status":"rejected","payload":{{}}}}"#));

        wait_for_sent(&handle, 3).await;
        let second_id = refresh_request_id(&handle, 2);
        handle.push_text(response_frame(&second_id, 1500, 1510));

        // A third refresh attempt (the timer armed off the successful retry)
        // must follow, and only one — not two, which would indicate two
        // timers ended up armed simultaneously.
        wait_for_sent(&handle, 4).await;
        tokio::task::yield_now().await;
        assert_eq!(handle.sent().len(), 4, "exactly one refresh timer should be armed at a time");
        assert_eq!(tokens.calls.load(Ordering::SeqCst), 4);
    }
}
