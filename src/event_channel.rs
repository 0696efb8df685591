//! Event Channel: the public, typed surface.
//!
//! Tracks subscriptions, re-drives them after a reconnect, and applies the
//! per-event-type filter before a server push reaches the user's callback.
//! A cloneable handle in front of actor-owned state, generalized to own a
//! subscription table instead of a raw channel map: that table — not the
//! socket — is this crate's source of truth for what must be live.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::authenticated_channel::AuthenticatedChannel;
use crate::config::ChannelConfig;
use crate::error::{ChannelError, ConnectError, FilterError};
use crate::filters::{self, EventType, FilterStrategy, PayloadDecoder, Shape};
use crate::robust_channel::AuthResult;

/// Invoked with a filtered, decoded payload whenever a matching server push
/// (or, for one-shot event types, the initial fetch) survives filtering.
pub type EventCallback = Arc<dyn Fn(Value) + Send + Sync>;

struct SubscriptionDescriptor {
    event_type: EventType,
    filters: Value,
    callback: EventCallback,
    /// `(action, payload)` to send on `unregister`; `None` for one-shot
    /// event types, which have nothing to tear down server-side.
    unregister_template: Option<(&'static str, Value)>,
    failed_reregistrations: u32,
}

/// The public, typed entry point.
#[derive(Clone)]
pub struct EventChannel {
    inner: Arc<Inner>,
}

impl fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel").finish_non_exhaustive()
    }
}

struct Inner {
    auth: AuthenticatedChannel,
    config: ChannelConfig,
    decoder: Option<Arc<dyn PayloadDecoder>>,
    subscriptions: Mutex<HashMap<String, SubscriptionDescriptor>>,
}

impl EventChannel {
    /// Builds a channel around an already-constructed [`AuthenticatedChannel`].
    /// `decoder` is required only by event types using
    /// [`FilterStrategy::InitialState`] (tag/alert state); omit it if those
    /// are not used.
    pub fn new(auth: AuthenticatedChannel, config: ChannelConfig, decoder: Option<Arc<dyn PayloadDecoder>>) -> Self {
        let channel = EventChannel {
            inner: Arc::new(Inner { auth, config, decoder, subscriptions: Mutex::new(HashMap::new()) }),
        };

        let hook_target = channel.clone();
        let robust = channel.inner.auth.channel().clone();
        tokio::spawn(async move {
            robust
                .on_reconnect(Arc::new(move |_auth: &AuthResult| {
                    let target = hook_target.clone();
                    tokio::spawn(async move { target.reregister_events().await });
                }))
                .await;
        });

        channel
    }

    /// Connects with a raw JWT, delegating to the [`AuthenticatedChannel`]
    /// so proactive refresh is still armed even though no [`TokenProvider`]
    /// round trip was needed to obtain this JWT.
    pub async fn connect(&self, jwt: impl Into<String>) -> Result<AuthResult, ConnectError> {
        self.inner.auth.connect_with_jwt(jwt).await
    }

    /// Connects via a [`TokenProvider`], routed to `auth_domain` (spec.md
    /// §4.4's `connectPersistent(tokenGetter, authDomain?)`), and arms
    /// proactive refresh.
    pub async fn connect_persistent(&self, auth_domain: Option<&str>) -> Result<AuthResult, ConnectError> {
        self.inner.auth.connect(auth_domain).await
    }

    /// Clears the subscription table and closes the underlying channel.
    pub async fn close(&self) {
        self.inner.subscriptions.lock().await.clear();
        self.inner.auth.close().await;
    }

    /// Registers a subscription or runs a one-shot fetch for `event_type`,
    /// Returns the correlation id
    /// the subscription is stored under.
    pub async fn register(
        &self,
        event_type: EventType,
        filters: Value,
        callback: EventCallback,
        correlation_id: Option<String>,
    ) -> Result<String, ChannelError> {
        let handler = self.inner.auth.channel().handler().await.ok_or(ChannelError::NotConnected)?;
        if !handler.is_alive() {
            return Err(ChannelError::NotConnected);
        }

        filters::validate_filters(event_type, &filters)?;

        let correlation_id = correlation_id.unwrap_or_else(crate::ids::generate_correlation_id);
        let entry = filters::lookup(event_type);

        self.warn_if_duplicate(event_type, &filters, &correlation_id).await;

        let unregister_template = match entry.shape {
            Shape::Streaming { subscribe_action, unsubscribe_action, response_action } => {
                let strategy = entry.strategy;
                let cb = callback.clone();
                let filters_for_listener = filters.clone();
                let decoder = self.inner.decoder.clone();
                handler.register_server_callback(
                    response_action,
                    correlation_id.clone(),
                    Arc::new(move |raw_payload| {
                        deliver_filtered(&strategy, &filters_for_listener, raw_payload, decoder.as_deref(), &cb);
                    }),
                )?;

                let result = handler
                    .send_request(
                        correlation_id.clone(),
                        subscribe_action,
                        &filters,
                        self.inner.config.request_timeout,
                        None,
                    )
                    .await;
                match result {
                    Ok(envelope) if envelope.is_ok() => {}
                    Ok(envelope) => {
                        handler.remove_server_callback(response_action, correlation_id.clone());
                        return Err(ChannelError::Request(crate::error::RequestError::Rejected(envelope.status)));
                    }
                    Err(err) => {
                        handler.remove_server_callback(response_action, correlation_id.clone());
                        return Err(ChannelError::Request(err));
                    }
                }

                Some((unsubscribe_action, filters.clone()))
            }
            Shape::OneShot { fetch_action, fixed_unique_id, expected_response_correlation_id } => {
                let unique_id = fixed_unique_id.map(str::to_string).unwrap_or_else(|| correlation_id.clone());
                let envelope = handler
                    .send_request(
                        unique_id,
                        fetch_action,
                        &filters,
                        self.inner.config.request_timeout,
                        expected_response_correlation_id.map(str::to_string),
                    )
                    .await
                    .map_err(ChannelError::Request)?;
                if !envelope.is_ok() {
                    return Err(ChannelError::Request(crate::error::RequestError::Rejected(envelope.status)));
                }
                if let Some(value) = decode_one_shot(&entry.strategy, &filters, envelope.payload, self.inner.decoder.as_deref())? {
                    callback(value);
                }
                None
            }
        };

        self.inner.subscriptions.lock().await.insert(
            correlation_id.clone(),
            SubscriptionDescriptor { event_type, filters, callback, unregister_template, failed_reregistrations: 0 },
        );

        Ok(correlation_id)
    }

    async fn warn_if_duplicate(&self, event_type: EventType, filters: &Value, correlation_id: &str) {
        let subs = self.inner.subscriptions.lock().await;
        for (id, descriptor) in subs.iter() {
            if id != correlation_id && descriptor.event_type == event_type && &descriptor.filters == filters {
                tracing::warn!(
                    %id, new_id = %correlation_id, event_type = event_type.name(),
                    "duplicate subscription: server indexes by (event type, filter), unregistering one will remove both"
                );
            }
        }
    }

    /// Removes a subscription, sending its unregister request if the event
    /// type has one. Returns whether a descriptor existed.
    pub async fn unregister(&self, correlation_id: &str) -> Result<bool, ChannelError> {
        let descriptor = self.inner.subscriptions.lock().await.remove(correlation_id);
        let Some(descriptor) = descriptor else { return Ok(false) };

        if let Some((action, payload)) = descriptor.unregister_template {
            if let Some(handler) = self.inner.auth.channel().handler().await {
                let fresh_id = crate::ids::generate_correlation_id();
                let _ = handler
                    .send_request(fresh_id, action, payload, self.inner.config.request_timeout, None)
                    .await;
                let entry = filters::lookup(descriptor.event_type);
                if let Shape::Streaming { response_action, .. } = entry.shape {
                    handler.remove_server_callback(response_action, correlation_id.to_string());
                }
            }
        }

        Ok(true)
    }

    /// Installs a raw listener directly on the current Request Handler,
    /// bypassing the subscription table — not re-installed across
    /// reconnects.
    pub async fn register_to_server_message_raw(
        &self,
        action: impl Into<String>,
        correlation_id: impl Into<String>,
        callback: EventCallback,
    ) -> Result<(), ChannelError> {
        let handler = self.inner.auth.channel().handler().await.ok_or(ChannelError::NotConnected)?;
        handler
            .register_server_callback(
                action,
                correlation_id,
                Arc::new(move |raw| {
                    if let Ok(value) = serde_json::from_str(raw.get()) {
                        callback(value);
                    }
                }),
            )
            .map_err(ChannelError::Request)
    }

    /// Removes a listener installed via
    /// [`register_to_server_message_raw`](Self::register_to_server_message_raw).
    pub async fn unregister_server_message_raw(&self, action: impl Into<String>, correlation_id: impl Into<String>) {
        if let Some(handler) = self.inner.auth.channel().handler().await {
            handler.remove_server_callback(action, correlation_id);
        }
    }

    /// Reconnect hook: snapshots the
    /// current descriptors, clears the table, and re-registers each under
    /// its original correlation id, retrying failures up to
    /// `registrationAttemptsUntilIgnored` times before giving up.
    async fn reregister_events(&self) {
        let mut pending: VecDeque<(String, SubscriptionDescriptor)> =
            self.inner.subscriptions.lock().await.drain().collect();

        while let Some((correlation_id, descriptor)) = pending.pop_front() {
            let event_type = descriptor.event_type;
            let filters = descriptor.filters.clone();
            let callback = descriptor.callback.clone();
            let failed = descriptor.failed_reregistrations;

            match self.register(event_type, filters, callback, Some(correlation_id.clone())).await {
                Ok(_) => {
                    tracing::debug!(%correlation_id, "re-registered after reconnect");
                }
                Err(err) if failed + 1 < self.inner.config.registration_attempts_until_ignored => {
                    tracing::debug!(%correlation_id, %err, attempt = failed + 1, "re-registration failed, retrying");
                    let mut retry = descriptor;
                    retry.failed_reregistrations = failed + 1;
                    tokio::time::sleep(self.inner.config.wait_for_failed_re_registration).await;
                    pending.push_back((correlation_id, retry));
                }
                Err(err) => {
                    tracing::warn!(%correlation_id, %err, "giving up on re-registration after too many failures");
                }
            }
        }
    }

    /// `registerLocationUpdate(deviceIds, cb)` convenience wrapper.
    pub async fn register_location_update(&self, device_ids: Option<Vec<i64>>, callback: EventCallback) -> Result<String, ChannelError> {
        self.register(EventType::LocationUpdate, device_ids_filter(device_ids), callback, None).await
    }

    /// `registerTagDiffStream(deviceIds, cb)` convenience wrapper.
    pub async fn register_tag_diff_stream(&self, device_ids: Option<Vec<i64>>, callback: EventCallback) -> Result<String, ChannelError> {
        self.register(EventType::TagDiffStream, device_ids_filter(device_ids), callback, None).await
    }

    /// `registerAlertDiffStream(deviceIds, cb)` convenience wrapper.
    pub async fn register_alert_diff_stream(&self, device_ids: Option<Vec<i64>>, callback: EventCallback) -> Result<String, ChannelError> {
        self.register(EventType::AlertDiffStream, device_ids_filter(device_ids), callback, None).await
    }

    /// `registerP2PDistanceStream(deviceIds, cb)` convenience wrapper.
    pub async fn register_p2p_distance_stream(&self, device_ids: Option<Vec<i64>>, callback: EventCallback) -> Result<String, ChannelError> {
        self.register(EventType::P2pDistanceStream, device_ids_filter(device_ids), callback, None).await
    }

    /// `registerContactTracingStream(deviceIds, cb)` convenience wrapper.
    pub async fn register_contact_tracing_stream(&self, device_ids: Option<Vec<i64>>, callback: EventCallback) -> Result<String, ChannelError> {
        self.register(EventType::ContactTracingStream, device_ids_filter(device_ids), callback, None).await
    }

    /// `registerTwrStream(tagDeviceIds, beaconDeviceIds, cb)` convenience wrapper.
    pub async fn register_twr_stream(
        &self,
        tag_device_ids: Option<Vec<i64>>,
        beacon_device_ids: Option<Vec<i64>>,
        callback: EventCallback,
    ) -> Result<String, ChannelError> {
        let filters = serde_json::json!({
            "tagDeviceIds": tag_device_ids,
            "beaconDeviceIds": beacon_device_ids,
        });
        self.register(EventType::TwrStream, filters, callback, None).await
    }

    /// `getTagState(deviceIds)` one-shot initial-state fetch.
    pub async fn get_tag_state(&self, device_ids: Option<Vec<i64>>, callback: EventCallback) -> Result<String, ChannelError> {
        self.register(EventType::TagState, device_ids_filter(device_ids), callback, None).await
    }

    /// `getAlertState(deviceIds)` one-shot initial-state fetch.
    pub async fn get_alert_state(&self, device_ids: Option<Vec<i64>>, callback: EventCallback) -> Result<String, ChannelError> {
        self.register(EventType::AlertState, device_ids_filter(device_ids), callback, None).await
    }

    /// `getSite()` one-shot fetch.
    pub async fn get_site(&self, callback: EventCallback) -> Result<String, ChannelError> {
        self.register(EventType::Site, Value::Null, callback, None).await
    }

    /// `getContactTracingHistory(deviceIds)` one-shot fetch.
    pub async fn get_contact_tracing_history(&self, device_ids: Option<Vec<i64>>, callback: EventCallback) -> Result<String, ChannelError> {
        self.register(EventType::ContactTracingHistory, device_ids_filter(device_ids), callback, None).await
    }

    #[cfg(test)]
    async fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().await.len()
    }
}

fn device_ids_filter(device_ids: Option<Vec<i64>>) -> Value {
    serde_json::json!({ "deviceIds": device_ids })
}

fn deliver_filtered(
    strategy: &FilterStrategy,
    filters: &Value,
    raw_payload: Box<serde_json::value::RawValue>,
    decoder: Option<&dyn PayloadDecoder>,
    callback: &EventCallback,
) {
    let payload: Value = match serde_json::from_str(raw_payload.get()) {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!(%err, "dropping server push with unparseable payload");
            return;
        }
    };
    match filters::apply(strategy, filters, payload, decoder) {
        Ok(Some(value)) => callback(value),
        Ok(None) => {}
        Err(err) => tracing::warn!(%err, "filter rejected server push"),
    }
}

fn decode_one_shot(
    strategy: &FilterStrategy,
    filters: &Value,
    raw_payload: Box<serde_json::value::RawValue>,
    decoder: Option<&dyn PayloadDecoder>,
) -> Result<Option<Value>, FilterError> {
    let payload: Value = serde_json::from_str(raw_payload.get()).map_err(|err| FilterError::Decode(err.to_string()))?;
    filters::apply(strategy, filters, payload, decoder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authenticated_channel::TokenProvider;
    use crate::clock::ImmediateClock;
    use crate::error::ConnectError;
    use crate::mock::{MockHandle, MockTransport};
    use crate::robust_channel::AddressResolver;
    use async_trait::async_trait;

    #[test]
    fn device_ids_filter_builds_expected_shape() {
        let value = device_ids_filter(Some(vec![1, 2]));
        assert_eq!(value, serde_json::json!({ "deviceIds": [1, 2] }));
    }

    #[test]
    fn device_ids_filter_none_is_null_deviceids() {
        let value = device_ids_filter(None);
        assert_eq!(value, serde_json::json!({ "deviceIds": null }));
    }

    struct FixedResolver(String);

    #[async_trait]
    impl AddressResolver for FixedResolver {
        async fn resolve(&self, _http_domain: &str, _account: &str, _site: &str, _jwt: &str) -> Result<String, ConnectError> {
            Ok(self.0.clone())
        }
    }

    struct StaticToken;

    #[async_trait]
    impl TokenProvider for StaticToken {
        async fn token(&self, _auth_domain: Option<&str>) -> Result<String, ConnectError> {
            Ok("jwt-1".to_string())
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

    fn build_channel(transport: Arc<MockTransport>) -> EventChannel {
        let resolver = Arc::new(FixedResolver("ws://node".to_string()));
        let clock = Arc::new(ImmediateClock);
        let mut config = ChannelConfig::default();
        // These tests exercise subscription behavior, not token refresh;
        // with `ImmediateClock` an armed refresh timer fires right away and
        // would race the test's own requests for `sent()` slots.
        config.automatic_token_renewal = false;
        let robust = crate::robust_channel::RobustChannel::new(
            transport,
            resolver,
            clock.clone(),
            config.clone(),
            "http://auth",
            "acct",
            "site1",
        );
        let auth = crate::authenticated_channel::AuthenticatedChannel::new(robust, Arc::new(StaticToken), clock, config.clone());
        EventChannel::new(auth, config, None)
    }

    #[tokio::test]
    async fn register_subscribes_filters_and_delivers_exactly_once() {
        let transport = Arc::new(MockTransport::new());
        let handle = transport.prepare_connection();
        let channel = build_channel(transport.clone());

        let connect_task = tokio::spawn({
            let channel = channel.clone();
            async move { channel.connect("jwt-1").await }
        });
        wait_for_sent(&handle, 1).await;
        handle.push_text(auth_success_frame(1000, 2000));
        connect_task.await.unwrap().unwrap();

        let received = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = received.clone();
        let callback: EventCallback = Arc::new(move |v| sink.lock().unwrap().push(v));

        let reg_task = tokio::spawn({
            let channel = channel.clone();
            async move { channel.register_location_update(Some(vec![7, 8]), callback).await }
        });
        wait_for_sent(&handle, 2).await;
        let sent = handle.sent();
        let subscribe: Value = serde_json::from_str(&sent[1]).unwrap();
        assert_eq!(subscribe["action"].as_str().unwrap(), "registerTagLocation");
        let corr = subscribe["uniqueId"].as_str().unwrap().to_string();

        handle.push_text(format!(r#"{{"uniqueId":"{corr}","action":null,"status":"ok","payload":{{}}}}"#));
        let returned_corr = reg_task.await.unwrap().unwrap();
        assert_eq!(returned_corr, corr);

        handle.push_text(
            r#"{"uniqueId":"ignored","action":"locationUpdate","status":"ok","payload":{"5":{"x":1,"y":1},"7":{"x":2,"y":2}}}"#,
        );
        for _ in 0..500 {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }

        let delivered = received.lock().unwrap().clone();
        assert_eq!(delivered, vec![serde_json::json!({ "7": {"x": 2, "y": 2} })]);
    }

    #[tokio::test]
    async fn reconnect_reregisters_subscription_under_its_original_correlation_id() {
        let transport = Arc::new(MockTransport::new());
        let first = transport.prepare_connection();
        let second = transport.prepare_connection();
        let channel = build_channel(transport.clone());

        let connect_task = tokio::spawn({
            let channel = channel.clone();
            async move { channel.connect("jwt-1").await }
        });
        wait_for_sent(&first, 1).await;
        first.push_text(auth_success_frame(1000, 2000));
        connect_task.await.unwrap().unwrap();

        let callback: EventCallback = Arc::new(|_| {});
        let reg_task = tokio::spawn({
            let channel = channel.clone();
            let callback = callback.clone();
            async move { channel.register_tag_diff_stream(None, callback).await }
        });
        wait_for_sent(&first, 2).await;
        let sent = first.sent();
        let subscribe: Value = serde_json::from_str(&sent[1]).unwrap();
        let corr = subscribe["uniqueId"].as_str().unwrap().to_string();
        first.push_text(format!(r#"{{"uniqueId":"{corr}","action":null,"status":"ok","payload":{{}}}}"#));
        let corr = reg_task.await.unwrap().unwrap();

        first.push_close(1006, "lost");
        wait_for_sent(&second, 1).await;
        second.push_text(auth_success_frame(1500, 2500));

        wait_for_sent(&second, 2).await;
        let resent = second.sent();
        let resubscribe: Value = serde_json::from_str(&resent[1]).unwrap();
        assert_eq!(resubscribe["uniqueId"].as_str().unwrap(), corr);
        assert_eq!(resubscribe["action"].as_str().unwrap(), "registerTagDiffStream");

        second.push_text(format!(r#"{{"uniqueId":"{corr}","action":null,"status":"ok","payload":{{}}}}"#));
    }
}
