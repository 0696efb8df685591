//! Clock & Scheduler abstraction.
//!
//! Everything above this module treats "now" and "set a timer" through this
//! trait so that reconnection backoff, the timeout sweep, and token-refresh
//! scheduling can be driven deterministically in tests, rather than calling
//! `tokio::time::sleep`/`SystemTime::now` directly at each call site.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Abstracts wall-clock time and delayed execution.
///
/// A production binary uses [`TokioClock`]; tests can supply a fake that
/// fires timers immediately or on command.
pub trait Clock: Send + Sync + 'static {
    /// Milliseconds since the Unix epoch; converted from the
    /// seconds-since-epoch timestamps the server reports for
    /// `tokenIssued`/`tokenExpiration`.
    fn now_millis(&self) -> i64;

    /// Sleeps for `duration`, returning a future that resolves once elapsed.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// The default [`Clock`] backed by `tokio::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as i64
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// A handle to a scheduled, cancellable timer.
///
/// Dropping the handle without calling [`TimerHandle::cancel`] leaves the
/// timer armed; callers that need "scheduling a new timer cancels the
/// previous one" must explicitly cancel the old handle before installing a
/// new one.
pub struct TimerHandle {
    abort: tokio::task::AbortHandle,
}

impl TimerHandle {
    /// Cancels the timer. If it already fired, this is a no-op.
    pub fn cancel(self) {
        self.abort.abort();
    }
}

/// Spawns `fut` to run after `delay`, using `clock` to sleep.
///
/// Returns a [`TimerHandle`] that cancels the whole task (sleep + callback)
/// if dropped via [`TimerHandle::cancel`].
pub fn schedule<C, F>(clock: &C, delay: Duration, fut: F) -> TimerHandle
where
    C: Clock + ?Sized,
    F: Future<Output = ()> + Send + 'static,
{
    let sleep = clock.sleep(delay);
    let task = tokio::spawn(async move {
        sleep.await;
        fut.await;
    });
    TimerHandle { abort: task.abort_handle() }
}

/// A [`Clock`] whose `sleep` resolves immediately, so reconnect backoff and
/// refresh scheduling in tests do not actually wait out the configured
/// delays. `now_millis` still reports real wall-clock time.
#[cfg(test)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ImmediateClock;

#[cfg(test)]
impl Clock for ImmediateClock {
    fn now_millis(&self) -> i64 {
        TokioClock.now_millis()
    }

    fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}
