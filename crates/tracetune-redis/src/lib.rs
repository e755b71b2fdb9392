//! Redis backends for TraceTune's lock service and identity caches.
//!
//! The key-value store holds only locks and short-TTL caches; it is
//! never a source of truth. Locks are fenced: every acquire writes a
//! random token and release deletes the key only when the token still
//! matches, so a holder that outlived its safety TTL cannot release a
//! successor's lock.
//!
//! # Example
//!
//! ```rust,ignore
//! use tracetune::locks::{with_lock, LockService};
//! use tracetune_redis::RedisLockService;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let locks = RedisLockService::connect("redis://localhost:6379").await?;
//!     let outcome = with_lock(&locks, "agent_discovery", || async {
//!         // tick body
//!         Ok(())
//!     })
//!     .await?;
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};
use tracing::{debug, warn};
use uuid::Uuid;

use tracetune::locks::{LockService, LOCK_PREFIX};

/// Errors from the redis backends.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RedisBackendError {
    #[error("redis connection error: {0}")]
    ConnectionError(String),

    #[error("redis command error: {0}")]
    CommandError(String),
}

impl From<RedisError> for RedisBackendError {
    fn from(err: RedisError) -> Self {
        RedisBackendError::CommandError(err.to_string())
    }
}

impl From<RedisBackendError> for tracetune::Error {
    fn from(err: RedisBackendError) -> Self {
        tracetune::Error::Lock(err.to_string())
    }
}

/// Compare-and-delete: only the holder that wrote the token may delete.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Redis-backed [`LockService`].
pub struct RedisLockService {
    conn: ConnectionManager,
    /// Fence token per held lock name, local to this process.
    tokens: DashMap<String, String>,
    release: Script,
}

impl RedisLockService {
    /// Connect to redis.
    pub async fn connect(url: &str) -> Result<Self, RedisBackendError> {
        let client = redis::Client::open(url)
            .map_err(|e| RedisBackendError::ConnectionError(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| RedisBackendError::ConnectionError(e.to_string()))?;
        Ok(Self::with_connection(conn))
    }

    /// Build from an existing connection manager.
    #[must_use]
    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            tokens: DashMap::new(),
            release: Script::new(RELEASE_SCRIPT),
        }
    }

    fn key(name: &str) -> String {
        format!("{LOCK_PREFIX}{name}")
    }
}

#[async_trait]
impl LockService for RedisLockService {
    async fn acquire(&self, name: &str, ttl: Duration) -> tracetune::Result<bool> {
        let key = Self::key(name);
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();

        let acquired: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(RedisBackendError::from)?;

        if acquired.is_some() {
            self.tokens.insert(name.to_string(), token);
            debug!(lock = %name, "acquired task lock");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn release(&self, name: &str) -> tracetune::Result<()> {
        // Releasing a lock we never acquired (or already released) is a
        // no-op; TTL expiry racing the holder must not error.
        let Some((_, token)) = self.tokens.remove(name) else {
            return Ok(());
        };

        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release
            .key(Self::key(name))
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(RedisBackendError::from)?;

        if deleted == 0 {
            warn!(lock = %name, "lock already expired or taken over at release");
        }
        Ok(())
    }
}

/// Short-TTL cache for identity lookups (`User`/`Token`).
pub struct KvCache {
    conn: ConnectionManager,
    prefix: String,
}

impl KvCache {
    /// Connect to redis with a key prefix.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, RedisBackendError> {
        let client = redis::Client::open(url)
            .map_err(|e| RedisBackendError::ConnectionError(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| RedisBackendError::ConnectionError(e.to_string()))?;
        Ok(Self {
            conn,
            prefix: prefix.into(),
        })
    }

    /// Build from an existing connection manager.
    #[must_use]
    pub fn with_connection(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, RedisBackendError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(self.key(key)).await?)
    }

    pub async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), RedisBackendError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(self.key(key), value, ttl.as_secs())
            .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), RedisBackendError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.key(key)).await?;
        Ok(())
    }

    /// Delete every key matching `pattern` (appended to the prefix),
    /// scanning in batches so large keyspaces don't block the server.
    pub async fn delete_pattern(&self, pattern: &str) -> Result<u64, RedisBackendError> {
        let mut conn = self.conn.clone();
        let full_pattern = self.key(pattern);
        let mut cursor: u64 = 0;
        let mut deleted: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&full_pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                let removed: u64 = conn.del(keys).await?;
                deleted += removed;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(deleted)
    }
}
