//! Store abstraction for the invalidation index.
//!
//! The engine never issues raw commands. It talks to a [`Store`], which
//! exposes the handful of primitive reads it needs plus the multi-key units
//! that must execute atomically on the store side (registration, union
//! delete, lock acquire/release, set pruning).
//!
//! Two backends exist:
//!
//! - [`RedisStore`]: the production backend; atomic units are Lua scripts.
//! - [`MemoryStore`]: an in-process backend with the same observable
//!   semantics, used by tests and local tooling.
//!
//! # Colocation
//!
//! Every multi-key unit checks that all keys it touches share one routing
//! tag before doing anything. A mismatch is a [`ProtocolError::CrossSlot`]
//! and nothing is written.
//!
//! [`ProtocolError::CrossSlot`]: conjure_core::ProtocolError::CrossSlot

pub mod memory;
pub mod redis_store;
mod scripts;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use std::time::Duration;

use async_trait::async_trait;
use conjure_core::{ensure_colocated, ConjureResult, ProtocolError};

// ============================================================================
// VALUE TYPES
// ============================================================================

/// Remaining lifetime of a key, as reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist.
    Missing,
    /// The key exists and never expires.
    Persistent,
    /// The key expires after this long.
    Expires(Duration),
}

impl KeyTtl {
    /// Interpret a `TTL` reply (`-2` missing, `-1` persistent).
    pub fn from_reply(seconds: i64) -> Self {
        match seconds {
            -2 => KeyTtl::Missing,
            s if s < 0 => KeyTtl::Persistent,
            s => KeyTtl::Expires(Duration::from_secs(s as u64)),
        }
    }
}

/// One page of a cursor scan. A returned cursor of `0` means the scan is
/// complete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub cursor: u64,
    pub keys: Vec<String>,
}

impl ScanPage {
    pub fn is_last(&self) -> bool {
        self.cursor == 0
    }
}

/// TTL extension applied to a conjunction set on registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlExtension {
    /// Timeout of the entry being registered.
    pub entry_timeout: Duration,
    /// TTL the set receives when its remaining TTL is below `entry_timeout`.
    pub extend_to: Duration,
}

/// Registration of one cache key under one conjunction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConjunctionWrite {
    pub schemes_key: String,
    pub scheme: String,
    pub conj_key: String,
    pub cache_key: String,
    /// `None` in LRU mode: the set is left without a TTL.
    pub ttl: Option<TtlExtension>,
}

impl ConjunctionWrite {
    pub fn keys(&self) -> [&str; 3] {
        [&self.schemes_key, &self.conj_key, &self.cache_key]
    }
}

/// Result of pruning one batch of conjunction-set members.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneOutcome {
    /// Members examined.
    pub processed: u64,
    /// Members removed because their entry no longer exists.
    pub removed: u64,
    /// Whether the set became empty and was deleted.
    pub set_deleted: bool,
    /// Bytes of member names reclaimed.
    pub bytes_freed: u64,
}

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Backend operations the engine relies on.
///
/// Implementations must be safe to share across tasks. The atomic units
/// (`register_conjunction`, `delete_union`, `try_lock`, `release_lock`,
/// `prune_set`) must appear indivisible to every other client of the store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Get a string value.
    async fn get(&self, key: &str) -> ConjureResult<Option<Vec<u8>>>;

    /// Set a string value with a TTL.
    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> ConjureResult<()>;

    async fn exists(&self, key: &str) -> ConjureResult<bool>;

    async fn ttl(&self, key: &str) -> ConjureResult<KeyTtl>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> ConjureResult<u64>;

    /// All members of a set. Missing sets are empty.
    async fn set_members(&self, key: &str) -> ConjureResult<Vec<String>>;

    /// Cardinality of a set.
    async fn set_len(&self, key: &str) -> ConjureResult<u64>;

    /// Byte length of a string value, `0` when missing.
    async fn value_len(&self, key: &str) -> ConjureResult<u64>;

    /// One page of a keyspace scan over keys matching a glob `pattern`.
    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> ConjureResult<ScanPage>;

    /// One page of a scan over the members of a set.
    async fn scan_set(&self, key: &str, cursor: u64, count: usize) -> ConjureResult<ScanPage>;

    /// Drop every key in the database.
    async fn flush(&self) -> ConjureResult<()>;

    /// Atomically add the scheme to the table's scheme set, add the cache key
    /// to the conjunction set, and apply the TTL extension.
    async fn register_conjunction(&self, write: &ConjunctionWrite) -> ConjureResult<()>;

    /// Atomically delete every key that is a member of any `index_keys` set,
    /// then the index sets themselves and `extra_keys`.
    ///
    /// Returns the number of member keys that existed and were deleted.
    async fn delete_union(&self, index_keys: &[String], extra_keys: &[String])
        -> ConjureResult<u64>;

    /// Set `key` to `sentinel` if absent, clearing `signal_key` on success.
    async fn try_lock(
        &self,
        key: &str,
        signal_key: &str,
        sentinel: &[u8],
        ttl: Duration,
    ) -> ConjureResult<bool>;

    /// Block until `signal_key` receives a wakeup or `timeout` passes.
    /// Returns whether a wakeup was observed.
    async fn wait_signal(&self, signal_key: &str, timeout: Duration) -> ConjureResult<bool>;

    /// Delete `key` if it still holds `sentinel`, then push a wakeup onto
    /// `signal_key` that expires after `signal_ttl`.
    async fn release_lock(
        &self,
        key: &str,
        signal_key: &str,
        sentinel: &[u8],
        signal_ttl: Duration,
    ) -> ConjureResult<()>;

    /// Remove `members` of `set_key` whose keys no longer exist, deleting
    /// the set when it becomes empty.
    async fn prune_set(&self, set_key: &str, members: &[String]) -> ConjureResult<PruneOutcome>;
}

// ============================================================================
// SHARED CHECKS
// ============================================================================

/// Validate the key arguments of a union delete.
pub(crate) fn check_union_keys(index_keys: &[String], extra_keys: &[String]) -> ConjureResult<()> {
    if index_keys.is_empty() {
        return Err(ProtocolError::EmptyKeys {
            operation: "delete_union".to_string(),
        }
        .into());
    }
    ensure_colocated(
        "delete_union",
        index_keys.iter().chain(extra_keys).map(String::as_str),
    )?;
    Ok(())
}

/// Whole seconds for a TTL argument, rejecting sub-second values the store
/// would treat as "expire now".
pub(crate) fn ttl_secs(operation: &str, ttl: Duration) -> ConjureResult<u64> {
    let secs = ttl.as_secs();
    if secs == 0 {
        return Err(ProtocolError::InvalidArgument {
            operation: operation.to_string(),
            reason: format!("ttl must be at least one second, got {:?}", ttl),
        }
        .into());
    }
    Ok(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conjure_core::ConjureError;

    #[test]
    fn test_key_ttl_from_reply() {
        assert_eq!(KeyTtl::from_reply(-2), KeyTtl::Missing);
        assert_eq!(KeyTtl::from_reply(-1), KeyTtl::Persistent);
        assert_eq!(
            KeyTtl::from_reply(30),
            KeyTtl::Expires(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_union_keys_require_index() {
        let err = check_union_keys(&[], &["schemes:t".to_string()]).unwrap_err();
        assert!(matches!(
            err,
            ConjureError::Protocol(ProtocolError::EmptyKeys { .. })
        ));
    }

    #[test]
    fn test_union_keys_reject_mixed_tags() {
        let err = check_union_keys(
            &["{a}conj:t:x=1".to_string()],
            &["{b}schemes:t".to_string()],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConjureError::Protocol(ProtocolError::CrossSlot { .. })
        ));
    }

    #[test]
    fn test_ttl_secs_rejects_subsecond() {
        assert!(ttl_secs("set_ex", Duration::from_millis(200)).is_err());
        assert_eq!(ttl_secs("set_ex", Duration::from_secs(5)).unwrap(), 5);
    }
}
