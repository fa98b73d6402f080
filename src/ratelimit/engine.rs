//! Core admission engine.
//!
//! The engine turns a policy, the counter store and the current instant into
//! verdicts. It keeps no per-caller state: every call derives its bucket keys
//! from the clock and asks the store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use super::caller::CallerId;
use super::policy::{Policy, WindowLimit};
use super::verdict::{QuotaUsage, UsageSnapshot, Verdict, WindowUsage};
use super::window::Window;
use crate::clock::{Clock, SystemClock};
use crate::store::{CounterKey, CounterStore, Reservation, StoreError};

/// Errors produced while rendering or committing an admission decision.
///
/// Callers must treat every variant as "not admitted".
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// A counter could not be read during `check` or `info`.
    #[error("failed to read {window} counter: {source}")]
    Read {
        window: Window,
        #[source]
        source: StoreError,
    },

    /// An increment failed during `commit`. Increments listed in `applied`
    /// already happened and are not rolled back.
    #[error("failed to increment {window} counter (already applied: {applied:?}): {source}")]
    Commit {
        window: Window,
        applied: Vec<Window>,
        #[source]
        source: StoreError,
    },

    /// A conditional increment failed during `admit`. Reservations taken
    /// earlier in the same call have been released.
    #[error("failed to reserve {window} counter: {source}")]
    Reserve {
        window: Window,
        #[source]
        source: StoreError,
    },
}

impl AdmissionError {
    /// The store failure underneath this error.
    pub fn store_error(&self) -> &StoreError {
        match self {
            AdmissionError::Read { source, .. }
            | AdmissionError::Commit { source, .. }
            | AdmissionError::Reserve { source, .. } => source,
        }
    }
}

/// Multi-window admission control over a shared counter store.
///
/// This struct is thread-safe and can be shared across multiple tasks.
#[derive(Debug)]
pub struct AdmissionEngine {
    store: Arc<dyn CounterStore>,
    policy: Policy,
    clock: Arc<dyn Clock>,
    store_timeout: Option<Duration>,
}

impl AdmissionEngine {
    /// Create an engine reading the system clock, with unbounded store calls.
    pub fn new(store: Arc<dyn CounterStore>, policy: Policy) -> Self {
        Self {
            store,
            policy,
            clock: Arc::new(SystemClock),
            store_timeout: None,
        }
    }

    /// Use `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bound every store round-trip by `timeout`.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = Some(timeout);
        self
    }

    /// The policy this engine enforces.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// The counter store behind this engine.
    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    /// Check that the counter store answers within the store timeout.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.bounded(self.store.ping()).await
    }

    /// Decide whether `caller` may proceed. Never mutates any counter.
    ///
    /// The monthly quota is evaluated first, then `minute`, `hour` and `day`;
    /// the first exhausted one produces a deny verdict bound to it.
    pub async fn check(&self, caller: &CallerId) -> Result<Verdict, AdmissionError> {
        let now = self.clock.now();
        let quota_limit = self.policy.monthly_quota;

        let quota_used = self
            .bounded(self.store.read_monthly_quota(caller, now))
            .await
            .map_err(|source| AdmissionError::Read {
                window: Window::Monthly,
                source,
            })?;

        trace!(caller = %caller, quota_used = quota_used, "Checking admission");

        if quota_used >= quota_limit {
            warn!(
                caller = %caller,
                quota_used = quota_used,
                quota_limit = quota_limit,
                "Monthly quota exceeded"
            );
            return Ok(self.deny(Window::Monthly, 0, now, quota_used));
        }

        let mut minute_count = 0;
        for WindowLimit { window, limit } in self.policy.windows() {
            let current = self
                .bounded(self.store.read_bucket(caller, window, now))
                .await
                .map_err(|source| AdmissionError::Read { window, source })?;

            if current >= limit {
                let verdict = self.deny(window, limit, now, quota_used);
                warn!(
                    caller = %caller,
                    window = %window,
                    current = current,
                    limit = limit,
                    reset_time = %verdict.reset_at,
                    "Rate limit exceeded"
                );
                return Ok(verdict);
            }

            if window == Window::Minute {
                minute_count = current;
            }
        }

        let limit = self.policy.requests_per_minute;
        let remaining = if self.policy.exact_remaining {
            limit.saturating_sub(minute_count + 1)
        } else {
            limit
        };

        Ok(Verdict {
            allowed: true,
            limit,
            remaining,
            reset_at: Window::Minute.reset_at(now),
            window: Window::Minute,
            quota_used,
            quota_limit,
        })
    }

    /// Count one admitted request against the quota and every window.
    ///
    /// Call only after the gated operation succeeded. The four increments
    /// are independent; the first failure stops the sequence and is reported
    /// together with the windows that were already incremented.
    pub async fn commit(&self, caller: &CallerId) -> Result<(), AdmissionError> {
        let now = self.clock.now();
        let mut applied = Vec::with_capacity(4);

        for window in std::iter::once(Window::Monthly).chain(Window::ROLLING) {
            let outcome = match window {
                Window::Monthly => {
                    self.bounded(self.store.increment_monthly_quota(caller, now))
                        .await
                }
                rolling => {
                    self.bounded(self.store.increment_bucket(caller, rolling, now))
                        .await
                }
            };

            match outcome {
                Ok(current) => {
                    debug!(
                        caller = %caller,
                        window = %window,
                        current = current,
                        limit = self.policy.limit(window),
                        "Counter incremented"
                    );
                    applied.push(window);
                }
                Err(source) => {
                    error!(
                        caller = %caller,
                        window = %window,
                        applied = ?applied,
                        error = %source,
                        "Partial commit, counters under-count this request"
                    );
                    return Err(AdmissionError::Commit {
                        window,
                        applied,
                        source,
                    });
                }
            }
        }

        Ok(())
    }

    /// Report the caller's usage of the quota and every window.
    /// Never mutates and never denies.
    pub async fn info(&self, caller: &CallerId) -> Result<UsageSnapshot, AdmissionError> {
        let now = self.clock.now();

        let used = self
            .bounded(self.store.read_monthly_quota(caller, now))
            .await
            .map_err(|source| AdmissionError::Read {
                window: Window::Monthly,
                source,
            })?;

        let reads = self.policy.windows().map(|WindowLimit { window, limit }| async move {
            let current = self
                .bounded(self.store.read_bucket(caller, window, now))
                .await
                .map_err(|source| AdmissionError::Read { window, source })?;

            Ok::<_, AdmissionError>(WindowUsage {
                window,
                current,
                limit,
                remaining: limit.saturating_sub(current),
                reset_at: window.reset_at(now),
            })
        });
        let windows = try_join_all(reads).await?;

        let limit = self.policy.monthly_quota;
        Ok(UsageSnapshot {
            quota: QuotaUsage {
                used,
                limit,
                remaining: limit.saturating_sub(used),
                reset_at: Window::Monthly.reset_at(now),
            },
            windows,
        })
    }

    /// Decide and count in one step.
    ///
    /// Each counter is conditionally incremented in priority order, so no
    /// limit is ever overshot by concurrent callers. When a window refuses,
    /// the reservations already taken by this call are released before the
    /// deny verdict is returned. On allow, `quota_used` includes this request
    /// and `remaining` is exact.
    pub async fn admit(&self, caller: &CallerId) -> Result<Verdict, AdmissionError> {
        let now = self.clock.now();
        let quota_limit = self.policy.monthly_quota;

        let quota_key = CounterKey::for_window(caller, Window::Monthly, now);
        let reservation = match self
            .bounded(self.store.increment_within(
                &quota_key,
                quota_limit,
                Window::Monthly.expiry(now),
            ))
            .await
        {
            Ok(reservation) => reservation,
            Err(source) => {
                if matches!(source, StoreError::Timeout(_)) {
                    self.release_all(std::slice::from_ref(&quota_key)).await;
                }
                return Err(AdmissionError::Reserve {
                    window: Window::Monthly,
                    source,
                });
            }
        };

        let quota_used = match reservation {
            Reservation::Granted(used) => used,
            Reservation::Refused(used) => {
                warn!(
                    caller = %caller,
                    quota_used = used,
                    quota_limit = quota_limit,
                    "Monthly quota exceeded"
                );
                return Ok(self.deny(Window::Monthly, 0, now, used));
            }
        };

        let mut reserved = vec![quota_key];
        let mut minute_count = 0;

        for WindowLimit { window, limit } in self.policy.windows() {
            let key = CounterKey::for_window(caller, window, now);
            let reservation = match self
                .bounded(self.store.increment_within(&key, limit, window.expiry(now)))
                .await
            {
                Ok(reservation) => reservation,
                Err(source) => {
                    // A timed-out increment may still land in the store.
                    if matches!(source, StoreError::Timeout(_)) {
                        reserved.push(key);
                    }
                    self.release_all(&reserved).await;
                    return Err(AdmissionError::Reserve { window, source });
                }
            };

            match reservation {
                Reservation::Granted(count) => {
                    if window == Window::Minute {
                        minute_count = count;
                    }
                    reserved.push(key);
                }
                Reservation::Refused(current) => {
                    self.release_all(&reserved).await;
                    let verdict = self.deny(window, limit, now, quota_used.saturating_sub(1));
                    warn!(
                        caller = %caller,
                        window = %window,
                        current = current,
                        limit = limit,
                        reset_time = %verdict.reset_at,
                        "Rate limit exceeded"
                    );
                    return Ok(verdict);
                }
            }
        }

        let limit = self.policy.requests_per_minute;
        debug!(caller = %caller, quota_used = quota_used, minute = minute_count, "Request admitted");

        Ok(Verdict {
            allowed: true,
            limit,
            remaining: limit.saturating_sub(minute_count),
            reset_at: Window::Minute.reset_at(now),
            window: Window::Minute,
            quota_used,
            quota_limit,
        })
    }

    fn deny(&self, window: Window, limit: u64, now: DateTime<Utc>, quota_used: u64) -> Verdict {
        Verdict {
            allowed: false,
            limit,
            remaining: 0,
            reset_at: window.reset_at(now),
            window,
            quota_used,
            quota_limit: self.policy.monthly_quota,
        }
    }

    async fn release_all(&self, keys: &[CounterKey]) {
        for key in keys {
            if let Err(e) = self.bounded(self.store.release(key)).await {
                warn!(
                    key = %key,
                    error = %e,
                    "Failed to release reservation, counter over-counts until its bucket expires"
                );
            }
        }
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match self.store_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| StoreError::Timeout(limit))?,
            None => call.await,
        }
    }
}
