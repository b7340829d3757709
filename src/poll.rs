//! Bounded polling for eventually-consistent backend state.
//!
//! Callers issue the action that triggers a transition first, then hand a
//! state accessor to [`PollingWaiter::wait`]. The waiter samples the
//! accessor until the desired state is observed, the optional abort state
//! is observed, or the deadline passes. It sleeps between samples but never
//! past the deadline, and gives up on a hung sample one interval after it.

use crate::error::{Error, Result};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Sampling interval used unless a call site overrides it.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(3456);

/// One "wait for X" call site: what to watch, for which value, how long.
#[derive(Debug, Clone)]
pub struct PollingWaiter<S> {
    what: String,
    desired: S,
    abort_on: Option<S>,
    timeout: Duration,
    interval: Duration,
}

impl<S> PollingWaiter<S>
where
    S: PartialEq + Display,
{
    /// Wait for `what` to reach `desired` within `timeout`.
    pub fn new(what: impl Into<String>, desired: S, timeout: Duration) -> Self {
        Self {
            what: what.into(),
            desired,
            abort_on: None,
            timeout,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Fail immediately when `state` is observed.
    pub fn abort_on(mut self, state: S) -> Self {
        self.abort_on = Some(state);
        self
    }

    /// Override the sampling interval.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Call `sample` until the desired state, the abort state, or the
    /// deadline. Errors from `sample` end the wait immediately.
    ///
    /// # Errors
    ///
    /// [`Error::WaitAborted`] when the abort state is seen,
    /// [`Error::Timeout`] with the last observed state when the deadline
    /// passes, or whatever `sample` returned.
    pub async fn wait<F, Fut>(&self, mut sample: F) -> Result<S>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<S>>,
    {
        let started = Instant::now();
        let deadline = started + self.timeout;
        // A hung sample may overrun the deadline by at most one interval.
        let hard_stop = deadline + self.interval;
        let mut last: Option<String> = None;

        loop {
            let current = match tokio::time::timeout_at(hard_stop, sample()).await {
                Ok(sample) => sample?,
                Err(_) => {
                    let last = last.unwrap_or_else(|| "unknown".to_string());
                    tracing::warn!(what = %self.what, desired = %self.desired, last = %last, "state query did not return");
                    return Err(self.timed_out(last));
                }
            };

            if current == self.desired {
                tracing::debug!(
                    what = %self.what,
                    state = %current,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "reached desired state"
                );
                return Ok(current);
            }

            if self.abort_on.as_ref() == Some(&current) {
                tracing::warn!(what = %self.what, state = %current, desired = %self.desired, "abort state observed");
                return Err(Error::WaitAborted {
                    what: self.what.clone(),
                    desired: self.desired.to_string(),
                    state: current.to_string(),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    what = %self.what,
                    desired = %self.desired,
                    last = %current,
                    timeout_secs = self.timeout.as_secs(),
                    "timed out waiting for state"
                );
                return Err(self.timed_out(current.to_string()));
            }

            tracing::trace!(what = %self.what, state = %current, desired = %self.desired, "waiting again");
            last = Some(current.to_string());
            tokio::time::sleep(self.interval.min(deadline - now)).await;
        }
    }

    fn timed_out(&self, last: String) -> Error {
        Error::Timeout {
            what: self.what.clone(),
            desired: self.desired.to_string(),
            last,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::CanonicalState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn scripted(
        states: Vec<CanonicalState>,
    ) -> impl FnMut() -> std::future::Ready<Result<CanonicalState>> {
        let mut states = states.into_iter();
        let mut last = CanonicalState::Unrecognized;
        move || {
            if let Some(next) = states.next() {
                last = next;
            }
            std::future::ready(Ok(last))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaches_desired_state_after_two_polls() {
        let waiter = PollingWaiter::new("vmA", CanonicalState::Active, Duration::from_millis(5000))
            .interval(Duration::from_millis(2000));
        let started = Instant::now();

        let state = waiter
            .wait(scripted(vec![
                CanonicalState::Build,
                CanonicalState::Build,
                CanonicalState::Active,
            ]))
            .await
            .unwrap();

        assert_eq!(state, CanonicalState::Active);
        assert_eq!(started.elapsed(), Duration::from_millis(4000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_at_deadline() {
        let timeout = Duration::from_millis(5000);
        let interval = Duration::from_millis(2000);
        let waiter = PollingWaiter::new("vmA", CanonicalState::Active, timeout).interval(interval);
        let started = Instant::now();

        let err = waiter
            .wait(scripted(vec![CanonicalState::Build]))
            .await
            .unwrap_err();

        // Samples at 0, 2, 4 and a final one clipped to the deadline.
        assert_eq!(started.elapsed(), timeout);
        match err {
            Error::Timeout { last, desired, .. } => {
                assert_eq!(last, "BUILD");
                assert_eq!(desired, "ACTIVE");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_state_returns_before_deadline() {
        let waiter = PollingWaiter::new("vmA", CanonicalState::Active, Duration::from_secs(360))
            .abort_on(CanonicalState::Error);
        let started = Instant::now();

        let err = waiter
            .wait(scripted(vec![CanonicalState::Error]))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::WaitAborted { .. }));
        assert!(started.elapsed() < Duration::from_secs(360));
        assert!(!err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_error_ends_wait() {
        let calls = Arc::new(AtomicUsize::new(0));
        let waiter = PollingWaiter::new("vmA", CanonicalState::Paused, Duration::from_secs(60));

        let counter = calls.clone();
        let err = waiter
            .wait(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Err::<CanonicalState, _>(Error::backend(
                    "openstack",
                    "nova list failed",
                )))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Backend { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_state_query_is_bounded() {
        let timeout = Duration::from_secs(10);
        let interval = Duration::from_secs(3);
        let waiter = PollingWaiter::new("vmA", CanonicalState::Active, timeout).interval(interval);
        let started = Instant::now();

        let mut samples = 0;
        let err = waiter
            .wait(|| {
                samples += 1;
                let first = samples == 1;
                async move {
                    if first {
                        Ok(CanonicalState::Build)
                    } else {
                        std::future::pending::<Result<CanonicalState>>().await
                    }
                }
            })
            .await
            .unwrap_err();

        assert_eq!(started.elapsed(), timeout + interval);
        match err {
            Error::Timeout { last, .. } => assert_eq!(last, "BUILD"),
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
