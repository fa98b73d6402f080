//! Redis-backed counter store.
//!
//! This is the cluster-wide backend: every gateway instance points at the
//! same Redis, so limits hold across horizontally scaled processes.
//! Increments run as `MULTI INCR / PEXPIRE|EXPIREAT EXEC`; the conditional increment
//! and its release are Lua scripts so that compare and write happen in one
//! server-side step.

use async_trait::async_trait;
use ::redis::aio::ConnectionManager;
use ::redis::{Client, ErrorKind, RedisError, Script};
use tracing::{debug, info, trace};

use super::{CounterKey, CounterStore, Expiry, Reservation, StoreError};

/// Returns `{granted, value}`: `{0, current}` when the counter is already at
/// the limit, `{1, new value}` otherwise.
/// ARGV: limit, expiry mode ("px" | "at"), expiry value.
/// Returns `{granted, value}`: `{0, current}` when the counter is already at
/// the limit, `{1, new value}` otherwise. A stored value that is not a
/// non-negative integer is an error, never coerced.
/// ARGV: limit, expiry mode ("px" | "at"), expiry value.
const INCREMENT_WITHIN: &str = r#"
local raw = redis.call('GET', KEYS[1])
local current = 0
if raw then
  if not string.match(raw, '^%d+$') then
    return redis.error_reply('ERR value is not an integer or out of range')
  end
  current = tonumber(raw)
end
if current >= tonumber(ARGV[1]) then
  return {0, current}
end
local value = redis.call('INCR', KEYS[1])
if ARGV[2] == 'at' then
  redis.call('EXPIREAT', KEYS[1], ARGV[3])
else
  redis.call('PEXPIRE', KEYS[1], ARGV[3])
end
return {1, value}
"#;

/// Decrements a counter, never below zero and never creating it.
const RELEASE: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then
  return 0
end
if not string.match(raw, '^%d+$') then
  return redis.error_reply('ERR value is not an integer or out of range')
end
if tonumber(raw) > 0 then
  return redis.call('DECR', KEYS[1])
end
return 0
"#;

/// Counter store on a shared Redis server.
pub struct RedisStore {
    conn: ConnectionManager,
    increment_within: Script,
    release: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to `url` and verify the server answers.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        info!(url = %redact_url(url), "Connecting to Redis counter store");

        let client = Client::open(url).map_err(map_redis_error)?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(map_redis_error)?;

        let store = Self {
            conn,
            increment_within: Script::new(INCREMENT_WITHIN),
            release: Script::new(RELEASE),
        };
        store.ping().await?;

        info!("Redis counter store connected");
        Ok(store)
    }

    async fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = ::redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(raw)
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &CounterKey, expiry: Expiry) -> Result<u64, StoreError> {
        let storage_key = key.to_storage_key();
        let mut conn = self.conn.clone();

        let mut pipe = ::redis::pipe();
        pipe.atomic().cmd("INCR").arg(&storage_key);
        match expiry {
            Expiry::After(ttl) => {
                pipe.cmd("PEXPIRE")
                    .arg(&storage_key)
                    .arg(ttl.as_millis() as u64)
                    .ignore();
            }
            Expiry::At(instant) => {
                pipe.cmd("EXPIREAT")
                    .arg(&storage_key)
                    .arg(instant.timestamp())
                    .ignore();
            }
        }

        let (value,): (i64,) = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| map_counter_error(e, &storage_key))?;

        // INCR happily steps a negative value; a sound counter is at least 1 here.
        if value < 1 {
            return Err(StoreError::Corrupt {
                key: storage_key,
                value: (value - 1).to_string(),
            });
        }

        trace!(key = %storage_key, value = value, "Incremented counter");
        Ok(value as u64)
    }

    async fn read(&self, key: &CounterKey) -> Result<u64, StoreError> {
        let storage_key = key.to_storage_key();
        match self.get_raw(&storage_key).await? {
            None => Ok(0),
            Some(raw) => parse_count(&storage_key, &raw),
        }
    }

    async fn increment_within(
        &self,
        key: &CounterKey,
        limit: u64,
        expiry: Expiry,
    ) -> Result<Reservation, StoreError> {
        let storage_key = key.to_storage_key();
        let mut conn = self.conn.clone();

        let (mode, amount) = expiry_args(expiry);
        let (granted, value): (i64, i64) = self
            .increment_within
            .key(&storage_key)
            .arg(limit)
            .arg(mode)
            .arg(amount)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_counter_error(e, &storage_key))?;

        let value = value.max(0) as u64;
        Ok(if granted == 1 {
            Reservation::Granted(value)
        } else {
            Reservation::Refused(value)
        })
    }

    async fn release(&self, key: &CounterKey) -> Result<(), StoreError> {
        let storage_key = key.to_storage_key();
        let mut conn = self.conn.clone();

        let value: i64 = self
            .release
            .key(&storage_key)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_counter_error(e, &storage_key))?;

        debug!(key = %storage_key, value = value, "Released reservation");
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = ::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

fn expiry_args(expiry: Expiry) -> (&'static str, i64) {
    match expiry {
        Expiry::After(ttl) => ("px", ttl.as_millis() as i64),
        Expiry::At(instant) => ("at", instant.timestamp()),
    }
}

fn parse_count(key: &str, raw: &str) -> Result<u64, StoreError> {
    let corrupt = || StoreError::Corrupt {
        key: key.to_string(),
        value: raw.to_string(),
    };
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(corrupt());
    }
    raw.parse::<u64>().map_err(|_| corrupt())
}

fn map_counter_error(err: RedisError, key: &str) -> StoreError {
    let message = err.to_string();
    if err.kind() == ErrorKind::TypeError || message.contains("not an integer") {
        return StoreError::Corrupt {
            key: key.to_string(),
            value: message,
        };
    }
    map_redis_error(err)
}

fn map_redis_error(err: RedisError) -> StoreError {
    if err.is_io_error() || err.is_timeout() || err.is_connection_dropped() || err.is_connection_refusal() {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Backend(err.to_string())
    }
}

/// Strip credentials from a connection URL before logging it.
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
