//! Shared (remote) cache tier.
//!
//! The remote tier is optional: the tiered cache treats every failure here as
//! a miss. `RedisStore` is the production implementation; tests substitute
//! their own `RemoteStore`.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use thiserror::Error;

/// Errors from the remote tier. All of them are transient from the cache's view.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("Redis pool creation failed: {0}")]
    CreatePool(#[from] deadpool_redis::CreatePoolError),

    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote store unavailable: {0}")]
    Unavailable(String),
}

/// Network key/value store backing the shared cache tier.
///
/// Tag indexes are kept as sets (`add_to_set` / `members`) whose expiry only
/// ever grows, so a set outlives every member written under it.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError>;

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration)
    -> Result<(), RemoteError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, RemoteError>;

    async fn add_to_set(&self, set_key: &str, member: &str) -> Result<(), RemoteError>;

    async fn members(&self, set_key: &str) -> Result<Vec<String>, RemoteError>;

    /// Make `key` live for at least `ttl` from now. Never shortens an existing expiry.
    async fn extend_expiry(&self, key: &str, ttl: Duration) -> Result<(), RemoteError>;

    /// Cheap liveness check for health reporting.
    async fn ping(&self) -> Result<(), RemoteError>;
}

/// Millisecond TTL for Redis, `None` when the entry would already be gone.
pub(crate) fn ttl_millis(ttl: Duration) -> Option<u64> {
    match u64::try_from(ttl.as_millis()) {
        Ok(0) => None,
        Ok(ms) => Some(ms),
        Err(_) => Some(u64::MAX),
    }
}

/// `PEXPIRE` only when the current deadline is sooner (or absent).
const EXTEND_EXPIRY_SCRIPT: &str = r"
local current = redis.call('PTTL', KEYS[1])
if current == -2 then return 0 end
if current == -1 or current < tonumber(ARGV[1]) then
  return redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return 0
";

/// Redis-backed remote tier using a deadpool connection pool.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a pool for `url` and verify that a connection can be obtained.
    pub async fn connect(
        url: &str,
        pool_size: usize,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let mut redis_config = deadpool_redis::Config::from_url(url);
        let pool_config = redis_config
            .pool
            .get_or_insert_with(deadpool_redis::PoolConfig::default);
        pool_config.max_size = pool_size;
        pool_config.timeouts.wait = Some(timeout);
        pool_config.timeouts.create = Some(timeout);
        pool_config.timeouts.recycle = Some(timeout);

        let pool = redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1))?;
        let store = Self::new(pool);
        store.ping().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        let mut conn = self.pool.get().await?;
        Ok(conn.get::<_, Option<Vec<u8>>>(key).await?)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), RemoteError> {
        let Some(ms) = ttl_millis(ttl) else {
            return Ok(());
        };
        let mut conn = self.pool.get().await?;
        conn.pset_ex::<_, _, ()>(key, value, ms).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, RemoteError> {
        let mut conn = self.pool.get().await?;
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn add_to_set(&self, set_key: &str, member: &str) -> Result<(), RemoteError> {
        let mut conn = self.pool.get().await?;
        conn.sadd::<_, _, ()>(set_key, member).await?;
        Ok(())
    }

    async fn members(&self, set_key: &str) -> Result<Vec<String>, RemoteError> {
        let mut conn = self.pool.get().await?;
        Ok(conn.smembers::<_, Vec<String>>(set_key).await?)
    }

    async fn extend_expiry(&self, key: &str, ttl: Duration) -> Result<(), RemoteError> {
        let Some(ms) = ttl_millis(ttl) else {
            return Ok(());
        };
        let mut conn = self.pool.get().await?;
        let _: i64 = redis::Script::new(EXTEND_EXPIRY_SCRIPT)
            .key(key)
            .arg(ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        let mut conn = self.pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
