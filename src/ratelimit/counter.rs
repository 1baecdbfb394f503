use std::time::Duration;

use async_trait::async_trait;
use redis::{
    AsyncCommands,
    Script,
    aio::ConnectionManager,
};
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::error::StoreError;

/// Bumps the window hash and returns `{count, pttl, window}` in one round trip.
/// The first hit names the window and anchors its expiry; later hits keep both.
const INCREMENT_LUA: &str = r#"
local count = redis.call('HINCRBY', KEYS[1], 'count', 1)
if count == 1 then
  redis.call('HSET', KEYS[1], 'window', ARGV[2])
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl, redis.call('HGET', KEYS[1], 'window')}
"#;

/// Takes back one hit only from the window that charged it. Never creates the key.
const REFUND_LUA: &str = r#"
if redis.call('HGET', KEYS[1], 'window') ~= ARGV[1] then
  return 0
end
if tonumber(redis.call('HGET', KEYS[1], 'count')) > 0 then
  redis.call('HINCRBY', KEYS[1], 'count', -1)
  return 1
end
return 0
"#;

/// Result of one atomic increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterHit {
    pub count: u64,
    /// Milliseconds until the window closes; non-positive when the store lost the expiry.
    pub ttl_ms: i64,
    /// Identifies the window this hit landed in.
    pub window_id: String,
}

/// Shared atomic counter with per-key expiry.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increments `key`, creating it with a `window` expiry when absent.
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterHit, StoreError>;

    /// Seconds until `key` expires; negative when the key or its expiry is missing.
    async fn ttl_seconds(&self, key: &str) -> Result<i64, StoreError>;

    /// Takes back one hit if `key` still holds the window named `window_id`.
    async fn decrement(&self, key: &str, window_id: &str) -> Result<bool, StoreError>;
}

pub struct RedisCounterStore {
    client: redis::Client,
    manager: OnceCell<ConnectionManager>,
    key_prefix: String,
}

impl RedisCounterStore {
    /// Parses the URL only; the connection is opened on first use.
    pub fn new(url: &str, key_prefix: impl Into<String>) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            manager: OnceCell::new(),
            key_prefix: key_prefix.into(),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                let manager = self.client.get_connection_manager().await?;
                tracing::info!(prefix = %self.key_prefix, "connected to counter store");
                Ok::<_, StoreError>(manager)
            })
            .await?;
        Ok(manager.clone())
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterHit, StoreError> {
        let mut conn = self.connection().await?;
        let window_ms = (window.as_millis() as u64).max(1);
        let candidate = Uuid::new_v4().simple().to_string();
        let script = Script::new(INCREMENT_LUA);
        let (count, ttl_ms, window_id): (i64, i64, String) = script
            .key(self.key(key))
            .arg(window_ms)
            .arg(candidate)
            .invoke_async(&mut conn)
            .await?;
        Ok(CounterHit {
            count: count.max(0) as u64,
            ttl_ms,
            window_id,
        })
    }

    async fn ttl_seconds(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.connection().await?;
        let ttl: i64 = conn.ttl(self.key(key)).await?;
        Ok(ttl)
    }

    async fn decrement(&self, key: &str, window_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let script = Script::new(REFUND_LUA);
        let refunded: i64 = script
            .key(self.key(key))
            .arg(window_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(refunded == 1)
    }
}
