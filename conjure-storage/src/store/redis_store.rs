//! Redis backend.
//!
//! Regular commands share one auto-reconnecting [`ConnectionManager`].
//! Blocking waits on a dogpile signal open their own connection so a
//! parked waiter never stalls the multiplexed pipe other tasks are using.
//! Those connections are capped by a semaphore and bounded by a connect
//! timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conjure_core::{
    ensure_colocated, ConfigError, ConjureConfig, ConjureError, ConjureResult, StoreError,
};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ErrorKind, RedisError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::scripts::{
    DELETE_UNION_SCRIPT, PRUNE_SET_SCRIPT, REGISTER_CONJUNCTION_SCRIPT, RELEASE_LOCK_SCRIPT,
    TRY_LOCK_SCRIPT,
};
use super::{check_union_keys, ttl_secs, ConjunctionWrite, KeyTtl, PruneOutcome, ScanPage, Store};

/// Dedicated signal-wait connections open at once, per store. Waiters
/// beyond the cap queue for a slot within their own timeout.
pub const DEFAULT_MAX_SIGNAL_WAITERS: usize = 64;

/// Limit on establishing a signal-wait connection.
pub const SIGNAL_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Redis-backed [`Store`].
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    manager: ConnectionManager,
    waiters: Arc<Semaphore>,
}

impl RedisStore {
    /// Connect to the store at `url`.
    pub async fn connect(url: &str) -> ConjureResult<Self> {
        let client = redis::Client::open(url).map_err(|e| ConfigError::InvalidValue {
            field: "redis_url".to_string(),
            value: url.to_string(),
            reason: e.to_string(),
        })?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| redis_error("CONNECT", e))?;

        tracing::info!("Cache store connected");
        Ok(Self {
            client,
            manager,
            waiters: Arc::new(Semaphore::new(DEFAULT_MAX_SIGNAL_WAITERS)),
        })
    }

    pub async fn from_config(config: &ConjureConfig) -> ConjureResult<Self> {
        config.validate()?;
        Self::connect(&config.redis_url).await
    }

    pub async fn ping(&self) -> ConjureResult<()> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("PING", e))?;
        Ok(())
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

/// Wait up to `timeout` for a signal-wait slot.
async fn acquire_waiter(
    waiters: &Arc<Semaphore>,
    timeout: Duration,
) -> Option<OwnedSemaphorePermit> {
    match tokio::time::timeout(timeout, Arc::clone(waiters).acquire_owned()).await {
        Ok(Ok(permit)) => Some(permit),
        Ok(Err(_)) | Err(_) => None,
    }
}

/// Classify a client error. Only transport failures become
/// [`StoreError::Connection`] or [`StoreError::Timeout`].
fn redis_error(command: &str, e: RedisError) -> ConjureError {
    let reason = e.to_string();
    let err = if e.is_timeout() {
        StoreError::Timeout {
            operation: command.to_string(),
            reason,
        }
    } else if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() {
        StoreError::Connection {
            reason: format!("{}: {}", command, reason),
        }
    } else if e.kind() == ErrorKind::TypeError {
        StoreError::UnexpectedReply {
            command: command.to_string(),
            reason,
        }
    } else {
        StoreError::Command {
            command: command.to_string(),
            reason,
        }
    };
    err.into()
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> ConjureResult<Option<Vec<u8>>> {
        let mut conn = self.conn();
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(|e| redis_error("GET", e))?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> ConjureResult<()> {
        let secs = ttl_secs("set_ex", ttl)?;
        let mut conn = self.conn();
        let _: () = conn
            .set_ex(key, value, secs)
            .await
            .map_err(|e| redis_error("SETEX", e))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> ConjureResult<bool> {
        let mut conn = self.conn();
        let exists: bool = conn
            .exists(key)
            .await
            .map_err(|e| redis_error("EXISTS", e))?;
        Ok(exists)
    }

    async fn ttl(&self, key: &str) -> ConjureResult<KeyTtl> {
        let mut conn = self.conn();
        let secs: i64 = conn.ttl(key).await.map_err(|e| redis_error("TTL", e))?;
        Ok(KeyTtl::from_reply(secs))
    }

    async fn delete(&self, keys: &[String]) -> ConjureResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        ensure_colocated("delete", keys.iter().map(String::as_str))?;
        let mut conn = self.conn();
        let deleted: u64 = conn.del(keys).await.map_err(|e| redis_error("DEL", e))?;
        Ok(deleted)
    }

    async fn set_members(&self, key: &str) -> ConjureResult<Vec<String>> {
        let mut conn = self.conn();
        let members: Vec<String> = conn
            .smembers(key)
            .await
            .map_err(|e| redis_error("SMEMBERS", e))?;
        Ok(members)
    }

    async fn set_len(&self, key: &str) -> ConjureResult<u64> {
        let mut conn = self.conn();
        let len: u64 = conn.scard(key).await.map_err(|e| redis_error("SCARD", e))?;
        Ok(len)
    }

    async fn value_len(&self, key: &str) -> ConjureResult<u64> {
        let mut conn = self.conn();
        let len: u64 = conn
            .strlen(key)
            .await
            .map_err(|e| redis_error("STRLEN", e))?;
        Ok(len)
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> ConjureResult<ScanPage> {
        let mut conn = self.conn();
        let (cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("SCAN", e))?;
        Ok(ScanPage { cursor, keys })
    }

    async fn scan_set(&self, key: &str, cursor: u64, count: usize) -> ConjureResult<ScanPage> {
        let mut conn = self.conn();
        let (cursor, keys): (u64, Vec<String>) = redis::cmd("SSCAN")
            .arg(key)
            .arg(cursor)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("SSCAN", e))?;
        Ok(ScanPage { cursor, keys })
    }

    async fn flush(&self) -> ConjureResult<()> {
        let mut conn = self.conn();
        let _: () = redis::cmd("FLUSHDB")
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("FLUSHDB", e))?;
        Ok(())
    }

    async fn register_conjunction(&self, write: &ConjunctionWrite) -> ConjureResult<()> {
        ensure_colocated("register_conjunction", write.keys())?;
        let (timeout, extend_to) = match write.ttl {
            Some(ext) => (
                ttl_secs("register_conjunction", ext.entry_timeout)?,
                ttl_secs("register_conjunction", ext.extend_to)?,
            ),
            None => (0, 0),
        };

        let mut invocation = REGISTER_CONJUNCTION_SCRIPT.prepare_invoke();
        invocation
            .key(&write.schemes_key)
            .key(&write.conj_key)
            .arg(&write.scheme)
            .arg(&write.cache_key)
            .arg(timeout)
            .arg(extend_to);

        let mut conn = self.conn();
        let _: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_error("EVALSHA register_conjunction", e))?;
        Ok(())
    }

    async fn delete_union(
        &self,
        index_keys: &[String],
        extra_keys: &[String],
    ) -> ConjureResult<u64> {
        check_union_keys(index_keys, extra_keys)?;

        let mut invocation = DELETE_UNION_SCRIPT.prepare_invoke();
        for key in index_keys.iter().chain(extra_keys) {
            invocation.key(key);
        }
        invocation.arg(index_keys.len());

        let mut conn = self.conn();
        let removed: u64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_error("EVALSHA delete_union", e))?;
        Ok(removed)
    }

    async fn try_lock(
        &self,
        key: &str,
        signal_key: &str,
        sentinel: &[u8],
        ttl: Duration,
    ) -> ConjureResult<bool> {
        ensure_colocated("try_lock", [key, signal_key])?;
        let secs = ttl_secs("try_lock", ttl)?;

        let mut invocation = TRY_LOCK_SCRIPT.prepare_invoke();
        invocation.key(key).key(signal_key).arg(sentinel).arg(secs);

        let mut conn = self.conn();
        let locked: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_error("EVALSHA try_lock", e))?;
        Ok(locked == 1)
    }

    async fn wait_signal(&self, signal_key: &str, timeout: Duration) -> ConjureResult<bool> {
        let started = tokio::time::Instant::now();
        let Some(_permit) = acquire_waiter(&self.waiters, timeout).await else {
            tracing::debug!(signal_key, "No signal-wait slot before timeout");
            return Ok(false);
        };
        let timeout = timeout.saturating_sub(started.elapsed());

        let mut conn = tokio::time::timeout(
            SIGNAL_CONNECT_TIMEOUT,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| StoreError::Timeout {
            operation: "BRPOPLPUSH".to_string(),
            reason: format!("connect exceeded {:?}", SIGNAL_CONNECT_TIMEOUT),
        })?
        .map_err(|e| redis_error("BRPOPLPUSH", e))?;

        // Popping and pushing back to the same list leaves the token in
        // place, so every waiter parked on this signal wakes up.
        let reply: Result<Option<Vec<u8>>, RedisError> = redis::cmd("BRPOPLPUSH")
            .arg(signal_key)
            .arg(signal_key)
            .arg(timeout.as_secs().max(1))
            .query_async(&mut conn)
            .await;

        match reply {
            Ok(token) => Ok(token.is_some()),
            Err(e) if e.is_timeout() => Ok(false),
            Err(e) => Err(redis_error("BRPOPLPUSH", e)),
        }
    }

    async fn release_lock(
        &self,
        key: &str,
        signal_key: &str,
        sentinel: &[u8],
        signal_ttl: Duration,
    ) -> ConjureResult<()> {
        ensure_colocated("release_lock", [key, signal_key])?;
        let secs = ttl_secs("release_lock", signal_ttl)?;

        let mut invocation = RELEASE_LOCK_SCRIPT.prepare_invoke();
        invocation.key(key).key(signal_key).arg(sentinel).arg(secs);

        let mut conn = self.conn();
        let _: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_error("EVALSHA release_lock", e))?;
        Ok(())
    }

    async fn prune_set(&self, set_key: &str, members: &[String]) -> ConjureResult<PruneOutcome> {
        if members.is_empty() {
            return Ok(PruneOutcome::default());
        }
        ensure_colocated(
            "prune_set",
            std::iter::once(set_key).chain(members.iter().map(String::as_str)),
        )?;

        let mut invocation = PRUNE_SET_SCRIPT.prepare_invoke();
        invocation.key(set_key);
        for member in members {
            invocation.key(member);
        }

        let mut conn = self.conn();
        let (processed, removed, deleted, bytes_freed): (u64, u64, u64, u64) = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_error("EVALSHA prune_set", e))?;

        Ok(PruneOutcome {
            processed,
            removed,
            set_deleted: deleted == 1,
            bytes_freed,
        })
    }
}

// =============================================================================
// TESTS (require a running store)
// =============================================================================
