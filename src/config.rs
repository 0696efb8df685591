//! Channel configuration.

use std::time::Duration;

/// Every knob the core recognizes, collected into one struct so construction
/// sites read as a single named struct rather than a long
/// positional-argument list.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Whether an unexpected close schedules a reconnect attempt.
    pub reopen_broken_connection: bool,
    /// Initial reconnect backoff.
    pub retry_interval_min: Duration,
    /// Ceiling the backoff escalates toward.
    pub retry_interval_max: Duration,
    /// Amount added to the backoff after each failed attempt.
    pub retry_interval_increase: Duration,
    /// Default per-RPC timeout, used when a call site does not override it.
    pub request_timeout: Duration,
    /// Whether to schedule proactive token refresh after a successful auth.
    pub automatic_token_renewal: bool,
    /// Backoff before retrying a failed token refresh.
    pub token_refresh_failure_retry_timeout: Duration,
    /// Re-subscription attempts tolerated after a reconnect before a
    /// subscription is dropped and logged.
    pub registration_attempts_until_ignored: u32,
    /// Delay between re-registration passes for subscriptions that failed.
    pub wait_for_failed_re_registration: Duration,
    /// Debug toggle: log every raw inbound/outbound frame at `trace` level.
    pub log_raw_messages: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            reopen_broken_connection: true,
            retry_interval_min: Duration::from_millis(1_000),
            retry_interval_max: Duration::from_millis(30_000),
            retry_interval_increase: Duration::from_millis(2_000),
            request_timeout: Duration::from_millis(10_000),
            automatic_token_renewal: true,
            token_refresh_failure_retry_timeout: Duration::from_millis(10_000),
            registration_attempts_until_ignored: 5,
            wait_for_failed_re_registration: Duration::from_millis(2_000),
            log_raw_messages: false,
        }
    }
}
