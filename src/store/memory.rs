//! In-process counter store.
//!
//! Counters live in a sharded map; each key is updated under its shard lock,
//! so increments for one key are atomic across tasks. Limits are only
//! enforced per process with this backend.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, trace};

use super::{CounterKey, CounterStore, Expiry, Reservation, StoreError};
use crate::clock::Clock;

#[derive(Debug, Clone, Copy)]
struct Slot {
    value: u64,
    expires_at: DateTime<Utc>,
}

impl Slot {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    fn extend(&mut self, now: DateTime<Utc>, expiry: Expiry) {
        let candidate = deadline(now, expiry);
        if candidate > self.expires_at {
            self.expires_at = candidate;
        }
    }
}

fn deadline(now: DateTime<Utc>, expiry: Expiry) -> DateTime<Utc> {
    match expiry {
        Expiry::At(instant) => instant,
        Expiry::After(ttl) => match Duration::from_std(ttl) {
            Ok(ttl) => now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            Err(_) => DateTime::<Utc>::MAX_UTC,
        },
    }
}

/// A counter store held in process memory.
#[derive(Debug)]
pub struct MemoryStore {
    counters: DashMap<CounterKey, Slot>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store that evaluates expiry against `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            clock,
        }
    }

    /// Drop every counter whose expiry has passed. Returns how many were
    /// removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.counters.len();
        self.counters.retain(|_, slot| slot.is_live(now));
        let removed = before.saturating_sub(self.counters.len());
        if removed > 0 {
            debug!(removed = removed, "Purged expired counters");
        }
        removed
    }

    /// Number of stored counters, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether the store holds no counters at all.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Run [`purge_expired`](Self::purge_expired) every `interval` until the
    /// returned task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.purge_expired();
            }
        })
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &CounterKey, expiry: Expiry) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let mut slot = self.counters.entry(key.clone()).or_insert(Slot {
            value: 0,
            expires_at: now,
        });

        if !slot.is_live(now) {
            slot.value = 0;
            slot.expires_at = now;
        }
        slot.value += 1;
        slot.extend(now, expiry);

        trace!(key = %key, value = slot.value, "Incremented counter");
        Ok(slot.value)
    }

    async fn read(&self, key: &CounterKey) -> Result<u64, StoreError> {
        let now = self.clock.now();
        Ok(self
            .counters
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.value)
            .unwrap_or(0))
    }

    async fn increment_within(
        &self,
        key: &CounterKey,
        limit: u64,
        expiry: Expiry,
    ) -> Result<Reservation, StoreError> {
        let now = self.clock.now();
        let mut slot = self.counters.entry(key.clone()).or_insert(Slot {
            value: 0,
            expires_at: now,
        });

        if !slot.is_live(now) {
            slot.value = 0;
            slot.expires_at = now;
        }
        if slot.value >= limit {
            return Ok(Reservation::Refused(slot.value));
        }
        slot.value += 1;
        slot.extend(now, expiry);
        Ok(Reservation::Granted(slot.value))
    }

    async fn release(&self, key: &CounterKey) -> Result<(), StoreError> {
        let now = self.clock.now();
        if let Some(mut slot) = self.counters.get_mut(key) {
            if slot.is_live(now) {
                slot.value = slot.value.saturating_sub(1);
            }
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::{CallerId, Window};
    use crate::store::KeyFamily;
    use chrono::TimeZone;
    use futures::future::join_all;
    use std::time::Duration as StdDuration;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn store_at(instant: DateTime<Utc>) -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::new(instant));
        let store = MemoryStore::new(clock.clone());
        (clock, store)
    }

    fn key(bucket: &str) -> CounterKey {
        CounterKey::new(KeyFamily::Rate, "k1", bucket)
    }

    #[tokio::test]
    async fn test_read_missing_counter_is_zero() {
        let (_clock, store) = store_at(start());
        assert_eq!(store.read(&key("never")).await.unwrap(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_increment_is_monotonic() {
        let (_clock, store) = store_at(start());
        let expiry = Expiry::After(StdDuration::from_secs(60));

        let mut last = 0;
        for _ in 0..10 {
            let value = store.increment(&key("b"), expiry).await.unwrap();
            assert!(value > last);
            last = value;
        }
        assert_eq!(store.read(&key("b")).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_counter_expires_after_ttl() {
        let (clock, store) = store_at(start());
        let expiry = Expiry::After(StdDuration::from_secs(60));

        store.increment(&key("b"), expiry).await.unwrap();
        clock.advance(Duration::seconds(59));
        assert_eq!(store.read(&key("b")).await.unwrap(), 1);

        clock.advance(Duration::seconds(1));
        assert_eq!(store.read(&key("b")).await.unwrap(), 0);

        // An increment after expiry starts over from zero.
        assert_eq!(store.increment(&key("b"), expiry).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expiry_is_never_shortened() {
        let (clock, store) = store_at(start());
        let at = start() + Duration::days(1);

        store.increment(&key("b"), Expiry::At(at)).await.unwrap();
        store
            .increment(&key("b"), Expiry::After(StdDuration::from_secs(1)))
            .await
            .unwrap();

        clock.advance(Duration::hours(1));
        assert_eq!(store.read(&key("b")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_read_does_not_extend_expiry() {
        let (clock, store) = store_at(start());
        store
            .increment(&key("b"), Expiry::After(StdDuration::from_secs(10)))
            .await
            .unwrap();

        for _ in 0..5 {
            clock.advance(Duration::seconds(3));
            store.read(&key("b")).await.unwrap();
        }
        assert_eq!(store.read(&key("b")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_monthly_quota_dies_at_month_boundary() {
        let late_january = Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 0).unwrap();
        let (clock, store) = store_at(late_january);
        let caller = CallerId::new("k1").unwrap();

        store.increment_monthly_quota(&caller, late_january).await.unwrap();
        assert_eq!(store.read_monthly_quota(&caller, late_january).await.unwrap(), 1);

        // The January key itself is gone right at the boundary.
        let january_key = CounterKey::for_window(&caller, Window::Monthly, late_january);
        clock.set(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        assert_eq!(store.read(&january_key).await.unwrap(), 0);
        assert_eq!(store.purge_expired(), 1);
    }

    #[tokio::test]
    async fn test_day_bucket_rolls_over_at_midnight() {
        let before_midnight = Utc.with_ymd_and_hms(2024, 5, 10, 23, 59, 59).unwrap()
            + Duration::milliseconds(900);
        let after_midnight = Utc.with_ymd_and_hms(2024, 5, 11, 0, 0, 0).unwrap()
            + Duration::milliseconds(100);
        let (clock, store) = store_at(before_midnight);
        let caller = CallerId::new("k1").unwrap();

        store
            .increment_bucket(&caller, Window::Day, before_midnight)
            .await
            .unwrap();
        clock.set(after_midnight);

        assert_eq!(
            store.read_bucket(&caller, Window::Day, after_midnight).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_increment_within_refuses_at_limit() {
        let (_clock, store) = store_at(start());
        let expiry = Expiry::After(StdDuration::from_secs(60));

        assert_eq!(
            store.increment_within(&key("b"), 2, expiry).await.unwrap(),
            Reservation::Granted(1)
        );
        assert_eq!(
            store.increment_within(&key("b"), 2, expiry).await.unwrap(),
            Reservation::Granted(2)
        );
        assert_eq!(
            store.increment_within(&key("b"), 2, expiry).await.unwrap(),
            Reservation::Refused(2)
        );
        assert_eq!(store.read(&key("b")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_release_never_goes_negative_or_creates() {
        let (_clock, store) = store_at(start());
        store.release(&key("absent")).await.unwrap();
        assert!(store.is_empty());

        store
            .increment(&key("b"), Expiry::After(StdDuration::from_secs(60)))
            .await
            .unwrap();
        store.release(&key("b")).await.unwrap();
        store.release(&key("b")).await.unwrap();
        assert_eq!(store.read(&key("b")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_purge_keeps_live_counters() {
        let (clock, store) = store_at(start());
        store
            .increment(&key("short"), Expiry::After(StdDuration::from_secs(60)))
            .await
            .unwrap();
        store
            .increment(&key("long"), Expiry::After(StdDuration::from_secs(3600)))
            .await
            .unwrap();

        clock.advance(Duration::minutes(5));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.read(&key("long")).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_lose_nothing() {
        let (_clock, store) = store_at(start());
        let store = Arc::new(store);
        let expiry = Expiry::After(StdDuration::from_secs(60));

        let tasks = (0..64).map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.increment(&key("hot"), expiry).await.unwrap() })
        });
        let mut values: Vec<u64> = join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        values.sort_unstable();

        assert_eq!(values, (1..=64).collect::<Vec<u64>>());
        assert_eq!(store.read(&key("hot")).await.unwrap(), 64);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_respect_limit() {
        let (_clock, store) = store_at(start());
        let store = Arc::new(store);
        let expiry = Expiry::After(StdDuration::from_secs(60));

        let tasks = (0..50).map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.increment_within(&key("hot"), 10, expiry).await.unwrap() })
        });
        let granted = join_all(tasks)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(Reservation::Granted(_))))
            .count();

        assert_eq!(granted, 10);
        assert_eq!(store.read(&key("hot")).await.unwrap(), 10);
    }
}
