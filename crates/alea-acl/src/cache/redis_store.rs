//! Redis cache backend, shared by all server instances
//!
//! Every command is bounded by the configured timeout. A slow or unreachable
//! Redis surfaces as [`CacheError`], which the engine turns into a deny.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, RedisResult, Script};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{CacheError, CacheStore};

/// Delete the lock only if the caller's token still holds it
const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Cache backed by Redis through an auto-reconnecting connection manager
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    prefix: String,
    timeout: Duration,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("prefix", &self.prefix)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RedisCache {
    /// Connect to `url`, failing if Redis does not answer within `timeout`
    #[instrument(skip(url))]
    pub async fn connect(url: &str, prefix: &str, timeout: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(map_redis_error)?;

        let conn = match tokio::time::timeout(timeout, ConnectionManager::new(client)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(map_redis_error(e)),
            Err(_) => {
                return Err(CacheError::Timeout {
                    op: "connect",
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        };

        debug!("Connected to Redis");
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            timeout,
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T, CacheError>
    where
        F: Future<Output = RedisResult<T>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(op, error = %e, "Redis command failed");
                Err(map_redis_error(e))
            }
            Err(_) => {
                warn!(op, "Redis command timed out");
                Err(CacheError::Timeout {
                    op,
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }
}

fn map_redis_error(err: RedisError) -> CacheError {
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
    {
        CacheError::Unavailable(err.to_string())
    } else if err.to_string().contains("WRONGTYPE") {
        CacheError::WrongType(err.to_string())
    } else {
        CacheError::Backend(err.to_string())
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn set_entry(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let key = self.key(key);
        self.bounded("set", async move { conn.set::<_, _, ()>(key, value).await })
            .await
    }

    async fn get_entry(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let key = self.key(key);
        self.bounded("get", async move { conn.get::<_, Option<String>>(key).await })
            .await
    }

    async fn add_to_set(&self, key: &str, members: &[String]) -> Result<(), CacheError> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let key = self.key(key);
        self.bounded("sadd", async move { conn.sadd::<_, _, ()>(key, members).await })
            .await
    }

    async fn get_from_set(&self, key: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        let key = self.key(key);
        self.bounded("smembers", async move { conn.smembers::<_, Vec<String>>(key).await })
            .await
    }

    async fn is_member_of_set(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let key = self.key(key);
        self.bounded("sismember", async move {
            conn.sismember::<_, _, bool>(key, member).await
        })
        .await
    }

    async fn replace_set(&self, key: &str, members: &[String]) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let key = self.key(key);

        if members.is_empty() {
            return self
                .bounded("del", async move { conn.del::<_, ()>(key).await })
                .await;
        }

        // Build the next set under a private key, then RENAME it over the
        // live key inside MULTI/EXEC
        let staging = format!("{}:staging:{}", key, Uuid::new_v4());
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(&staging)
            .ignore()
            .sadd(&staging, members)
            .ignore()
            .rename(&staging, &key)
            .ignore();

        self.bounded("replace_set", async move {
            let _: () = pipe.query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let keys: Vec<String> = keys.iter().map(|k| self.key(k)).collect();
        self.bounded("del", async move { conn.del::<_, ()>(keys).await })
            .await
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let key = self.key(key);
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let acquired: Option<String> = self
            .bounded("set_nx", async move {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(token)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(acquired.is_some())
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let key = self.key(key);
        self.bounded("unlock", async move {
            let _: i64 = Script::new(UNLOCK_SCRIPT)
                .key(key)
                .arg(token)
                .invoke_async(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        self.bounded("ping", async move {
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
