//! Counter store capability and backends.
//!
//! The store owns every durable counter. It offers atomic
//! increment-with-expiry and point-in-time reads; the admission engine builds
//! all of its decisions on top of those two primitives and keeps no state of
//! its own.

mod memory;
mod redis;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

use crate::clock::Clock;
use crate::config::{StoreBackend, StoreConfig};
use crate::ratelimit::{CallerId, Window};

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Errors surfaced by a counter store.
///
/// None of these may be read as "zero" or "unlimited" by callers.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached (connection, I/O, timeout).
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    /// A stored value is not an integer.
    #[error("malformed counter value at {key}: {value:?}")]
    Corrupt { key: String, value: String },
    /// The store did not answer within the configured bound.
    #[error("counter store did not answer within {0:?}")]
    Timeout(Duration),
    /// Any other backend failure.
    #[error("counter store error: {0}")]
    Backend(String),
}

/// The two persisted key families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyFamily {
    /// Per-window admission counters: `rate:<caller>:<bucket>`
    Rate,
    /// Monthly quota counters: `quota:<caller>:<YYYY-MM>`
    Quota,
}

impl KeyFamily {
    fn prefix(&self) -> &'static str {
        match self {
            KeyFamily::Rate => "rate",
            KeyFamily::Quota => "quota",
        }
    }
}

/// Key identifying one counter: a caller's count within one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// Which key family the counter belongs to.
    pub family: KeyFamily,
    /// The raw caller identity.
    pub caller: String,
    /// The bucket label (see [`Window::bucket_label`]).
    pub bucket: String,
}

impl CounterKey {
    /// Create a counter key.
    pub fn new(family: KeyFamily, caller: &str, bucket: &str) -> Self {
        Self {
            family,
            caller: caller.to_string(),
            bucket: bucket.to_string(),
        }
    }

    /// Key of the counter for the bucket of `window` that `now` falls into.
    pub fn for_window(caller: &CallerId, window: Window, now: DateTime<Utc>) -> Self {
        let family = match window {
            Window::Monthly => KeyFamily::Quota,
            _ => KeyFamily::Rate,
        };
        Self::new(family, caller.as_str(), &window.bucket_label(now))
    }

    /// Render as the backend key string.
    /// Format: "rate:{caller}:{bucket}" or "quota:{caller}:{year}-{month}"
    pub fn to_storage_key(&self) -> String {
        format!("{}:{}:{}", self.family.prefix(), self.caller, self.bucket)
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_storage_key())
    }
}

/// When a counter should disappear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// A fixed lifetime measured from the increment.
    After(Duration),
    /// An absolute instant.
    At(DateTime<Utc>),
}

/// Outcome of a conditional increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// The counter was below the limit and now holds this value.
    Granted(u64),
    /// The counter was already at (or above) the limit; nothing changed.
    Refused(u64),
}

/// A durable, atomic, auto-expiring counter store shared by every engine
/// instance.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add one to `key`, creating it at zero if absent, and
    /// (re-)attach `expiry`. Returns the post-increment value.
    async fn increment(&self, key: &CounterKey, expiry: Expiry) -> Result<u64, StoreError>;

    /// Current value of `key`, or 0 if it does not exist. Never touches expiry.
    async fn read(&self, key: &CounterKey) -> Result<u64, StoreError>;

    /// Atomically add one to `key` only if its current value is below
    /// `limit`.
    async fn increment_within(
        &self,
        key: &CounterKey,
        limit: u64,
        expiry: Expiry,
    ) -> Result<Reservation, StoreError>;

    /// Take back one unit granted by [`increment_within`](Self::increment_within).
    ///
    /// Never drops below zero and never creates a key.
    async fn release(&self, key: &CounterKey) -> Result<(), StoreError>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Short name of the backend, for logs and health output.
    fn backend_name(&self) -> &'static str;

    /// Increment the caller's counter for the current bucket of a rolling
    /// window.
    async fn increment_bucket(
        &self,
        caller: &CallerId,
        window: Window,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let key = CounterKey::for_window(caller, window, now);
        self.increment(&key, window.expiry(now)).await
    }

    /// Read the caller's counter for the current bucket of a rolling window.
    async fn read_bucket(
        &self,
        caller: &CallerId,
        window: Window,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let key = CounterKey::for_window(caller, window, now);
        self.read(&key).await
    }

    /// Increment the caller's quota for the calendar month of `now`. The
    /// counter expires exactly when that month rolls over.
    async fn increment_monthly_quota(
        &self,
        caller: &CallerId,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.increment_bucket(caller, Window::Monthly, now).await
    }

    /// Quota used by the caller in the calendar month of `now`.
    async fn read_monthly_quota(
        &self,
        caller: &CallerId,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.read_bucket(caller, Window::Monthly, now).await
    }
}

impl fmt::Debug for dyn CounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CounterStore({})", self.backend_name())
    }
}

/// Build the configured counter store backend.
pub async fn connect(
    config: &StoreConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn CounterStore>, StoreError> {
    match config.backend {
        StoreBackend::Memory => {
            info!(
                sweep_interval_secs = config.sweep_interval_secs,
                "Using in-process counter store; limits are enforced per process"
            );
            let store = Arc::new(MemoryStore::new(clock));
            store.spawn_sweeper(Duration::from_secs(config.sweep_interval_secs));
            Ok(store)
        }
        StoreBackend::Redis => {
            let store = RedisStore::connect(&config.redis_url).await?;
            Ok(Arc::new(store))
        }
    }
}
