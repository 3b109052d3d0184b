use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};

use super::{KvStore, StoreError, StoreResult, WindowCount};

/// INCR, set the window expiry on the first hit, report the remaining TTL.
/// A counter that somehow lost its expiry gets one again instead of living
/// forever.
const INCR_WINDOW_LUA: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

/// The Redis-backed store.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    timeout: Duration,
    incr_window: Script,
}

impl RedisStore {
    /// Connects to `url` and bounds every command by `timeout`.
    pub async fn connect(url: &str, timeout: Duration) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(map_redis_error)?;
        let conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout)?
            .map_err(map_redis_error)?;

        tracing::info!("✅ Redis Connection Manager initialized (pooled)");

        Ok(Self {
            conn,
            timeout,
            incr_window: Script::new(INCR_WINDOW_LUA),
        })
    }

    async fn bounded<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = Result<T, RedisError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(map_redis_error),
            Err(_) => {
                tracing::warn!("⏱️ Redis command exceeded {:?}", self.timeout);
                Err(StoreError::Timeout)
            }
        }
    }
}

fn map_redis_error(e: RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
    {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Backend(e.to_string())
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.get::<_, Option<String>>(key).await })
            .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        self.bounded(async move {
            match ttl {
                Some(ttl) => {
                    redis::cmd("SET")
                        .arg(key)
                        .arg(value)
                        .arg("PX")
                        .arg(millis(ttl))
                        .query_async::<()>(&mut conn)
                        .await
                }
                None => conn.set::<_, _, ()>(key, value).await,
            }
        })
        .await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        self.bounded(async move {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value).arg("NX");
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(millis(ttl));
            }
            let written: Option<String> = cmd.query_async(&mut conn).await?;
            Ok(written.is_some())
        })
        .await
    }

    async fn set_xx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        self.bounded(async move {
            let written: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(millis(ttl))
                .arg("XX")
                .query_async(&mut conn)
                .await?;
            Ok(written.is_some())
        })
        .await
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .bounded(async move { conn.del(key).await })
            .await?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let applied: i64 = self
            .bounded(async move {
                redis::cmd("PEXPIRE")
                    .arg(key)
                    .arg(millis(ttl))
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(applied == 1)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> StoreResult<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: i64 = self
            .bounded(async move { conn.sadd(key, members.to_vec()).await })
            .await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .bounded(async move { conn.srem(key, member).await })
            .await?;
        Ok(removed == 1)
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.smembers::<_, Vec<String>>(key).await })
            .await
    }

    async fn incr_window(&self, key: &str, window: Duration) -> StoreResult<WindowCount> {
        let mut conn = self.conn.clone();
        let script = &self.incr_window;
        let reply: Vec<i64> = self
            .bounded(async move {
                script
                    .key(key)
                    .arg(millis(window))
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        match reply.as_slice() {
            [count, ttl] => Ok(WindowCount {
                count: u64::try_from(*count).unwrap_or(0),
                resets_in: Duration::from_millis(u64::try_from(*ttl).unwrap_or(0)),
            }),
            _ => Err(StoreError::Corrupt(key.to_string())),
        }
    }
}
