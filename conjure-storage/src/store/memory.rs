//! In-process store.
//!
//! Mirrors the observable behavior of the Redis backend closely enough for
//! the engine's tests: lazy TTL expiry on the tokio clock, stable scan
//! cursors under concurrent deletion, glob `MATCH` patterns and blocking
//! signal waits. Every atomic unit runs under one mutex.
//!
//! Glob patterns are translated to anchored regexes. `*`, `?` and backslash
//! escapes are supported, which is all the engine's patterns use.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use conjure_core::{ensure_colocated, ConjureResult, StoreError};
use regex::Regex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{check_union_keys, ttl_secs, ConjunctionWrite, KeyTtl, PruneOutcome, ScanPage, Store};

// ============================================================================
// VALUES
// ============================================================================

/// A set whose members keep their insertion sequence, so a scan cursor
/// stays valid while members are removed.
#[derive(Debug, Default)]
struct OrderedSet {
    index: HashMap<String, u64>,
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl OrderedSet {
    fn insert(&mut self, member: &str) -> bool {
        if self.index.contains_key(member) {
            return false;
        }
        self.next_seq += 1;
        self.index.insert(member.to_string(), self.next_seq);
        self.order.insert(self.next_seq, member.to_string());
        true
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.index.remove(member) {
            Some(seq) => {
                self.order.remove(&seq);
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn members(&self) -> Vec<String> {
        self.order.values().cloned().collect()
    }
}

#[derive(Debug)]
enum Value {
    Bytes(Vec<u8>),
    Set(OrderedSet),
    List(VecDeque<Vec<u8>>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Bytes(_) => "string",
            Value::Set(_) => "set",
            Value::List(_) => "list",
        }
    }
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn wrong_type(command: &str, key: &str, value: &Value) -> StoreError {
    StoreError::Command {
        command: command.to_string(),
        reason: format!(
            "WRONGTYPE {} holds a {}, not the expected kind",
            key,
            value.type_name()
        ),
    }
}

/// Walk `order` from `cursor`, examining at most `count` entries.
fn scan_order(
    order: &BTreeMap<u64, String>,
    cursor: u64,
    count: usize,
    mut keep: impl FnMut(&str) -> bool,
) -> ScanPage {
    let limit = count.max(1);
    let mut keys = Vec::new();
    let mut last = None;

    for (seq, key) in order.range(cursor..).take(limit) {
        last = Some(*seq);
        if keep(key) {
            keys.push(key.clone());
        }
    }

    let cursor = match last {
        Some(seq) if order.range(seq + 1..).next().is_some() => seq + 1,
        _ => 0,
    };
    ScanPage { cursor, keys }
}

/// Translate a glob pattern (`*`, `?` and `\x` escapes) into an anchored
/// regex.
pub(crate) fn glob_regex(pattern: &str) -> Result<Regex, StoreError> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push_str("(?s)^");
    let literal = |c: char| regex::escape(c.encode_utf8(&mut [0; 4]));
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            // A trailing backslash matches itself.
            '\\' => source.push_str(&literal(chars.next().unwrap_or('\\'))),
            c => source.push_str(&literal(c)),
        }
    }
    source.push('$');

    Regex::new(&source).map_err(|e| StoreError::Command {
        command: "SCAN".to_string(),
        reason: format!("invalid MATCH pattern {:?}: {}", pattern, e),
    })
}

// ============================================================================
// KEYSPACE
// ============================================================================

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl Keyspace {
    /// Drop `key` if its TTL has passed.
    fn purge(&mut self, key: &str, now: Instant) {
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.remove(key);
        }
    }

    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        self.purge(key, now);
        self.entries.get_mut(key)
    }

    fn is_live(&self, key: &str, now: Instant) -> bool {
        self.entries.get(key).is_some_and(|e| !e.is_expired(now))
    }

    fn insert(&mut self, key: &str, value: Value, expires_at: Option<Instant>) {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.value = value;
                entry.expires_at = expires_at;
            }
            None => {
                self.next_seq += 1;
                self.order.insert(self.next_seq, key.to_string());
                self.entries.insert(
                    key.to_string(),
                    Entry {
                        seq: self.next_seq,
                        value,
                        expires_at,
                    },
                );
            }
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.order.remove(&entry.seq);
                true
            }
            None => false,
        }
    }

    /// Remove a key only if it is still live.
    fn remove_live(&mut self, key: &str, now: Instant) -> bool {
        self.purge(key, now);
        self.remove(key)
    }

    fn set(
        &mut self,
        command: &str,
        key: &str,
        now: Instant,
    ) -> Result<Option<&mut OrderedSet>, StoreError> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(Some(set)),
            Some(entry) => Err(wrong_type(command, key, &entry.value)),
        }
    }

    fn set_or_create(
        &mut self,
        command: &str,
        key: &str,
        now: Instant,
    ) -> Result<&mut OrderedSet, StoreError> {
        if self.set(command, key, now)?.is_none() {
            self.insert(key, Value::Set(OrderedSet::default()), None);
        }
        match self.entries.get_mut(key) {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set),
            _ => Err(StoreError::UnexpectedReply {
                command: command.to_string(),
                reason: format!("set {} vanished during write", key),
            }),
        }
    }
}

// ============================================================================
// MEMORY STORE
// ============================================================================

/// In-process [`Store`].
#[derive(Debug)]
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
    signals: Notify,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            signals: Notify::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store going away (`false`) or coming back (`true`).
    /// While unavailable every operation fails with a connection error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Drop a key as if the store had expired or evicted it.
    pub fn evict(&self, key: &str) -> bool {
        self.keyspace().remove(key)
    }

    /// Live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let keyspace = self.keyspace();
        let mut keys: Vec<String> = keyspace
            .entries
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    fn keyspace(&self) -> MutexGuard<'_, Keyspace> {
        self.keyspace.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connect(&self) -> Result<MutexGuard<'_, Keyspace>, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Connection {
                reason: "memory store marked unavailable".to_string(),
            });
        }
        Ok(self.keyspace())
    }

    /// Consume a wakeup token without removing it, like a same-list
    /// `BRPOPLPUSH`.
    fn signal_ready(&self, signal_key: &str) -> ConjureResult<bool> {
        let now = Instant::now();
        let mut keyspace = self.connect()?;
        match keyspace.live(signal_key, now) {
            None => Ok(false),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => match list.pop_back() {
                Some(token) => {
                    list.push_front(token);
                    Ok(true)
                }
                None => Ok(false),
            },
            Some(entry) => Err(wrong_type("BRPOPLPUSH", signal_key, &entry.value).into()),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> ConjureResult<Option<Vec<u8>>> {
        let now = Instant::now();
        let mut keyspace = self.connect()?;
        match keyspace.live(key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::Bytes(bytes),
                ..
            }) => Ok(Some(bytes.clone())),
            Some(entry) => Err(wrong_type("GET", key, &entry.value).into()),
        }
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> ConjureResult<()> {
        let secs = ttl_secs("set_ex", ttl)?;
        let now = Instant::now();
        let mut keyspace = self.connect()?;
        keyspace.insert(
            key,
            Value::Bytes(value.to_vec()),
            Some(now + Duration::from_secs(secs)),
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> ConjureResult<bool> {
        let now = Instant::now();
        let mut keyspace = self.connect()?;
        Ok(keyspace.live(key, now).is_some())
    }

    async fn ttl(&self, key: &str) -> ConjureResult<KeyTtl> {
        let now = Instant::now();
        let mut keyspace = self.connect()?;
        Ok(match keyspace.live(key, now) {
            None => KeyTtl::Missing,
            Some(Entry {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => KeyTtl::Expires(at.saturating_duration_since(now)),
        })
    }

    async fn delete(&self, keys: &[String]) -> ConjureResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        ensure_colocated("delete", keys.iter().map(String::as_str))?;
        let now = Instant::now();
        let mut keyspace = self.connect()?;
        Ok(keys
            .iter()
            .filter(|key| keyspace.remove_live(key, now))
            .count() as u64)
    }

    async fn set_members(&self, key: &str) -> ConjureResult<Vec<String>> {
        let now = Instant::now();
        let mut keyspace = self.connect()?;
        Ok(keyspace
            .set("SMEMBERS", key, now)?
            .map(|set| set.members())
            .unwrap_or_default())
    }

    async fn set_len(&self, key: &str) -> ConjureResult<u64> {
        let now = Instant::now();
        let mut keyspace = self.connect()?;
        Ok(keyspace
            .set("SCARD", key, now)?
            .map(|set| set.len() as u64)
            .unwrap_or(0))
    }

    async fn value_len(&self, key: &str) -> ConjureResult<u64> {
        let now = Instant::now();
        let mut keyspace = self.connect()?;
        match keyspace.live(key, now) {
            None => Ok(0),
            Some(Entry {
                value: Value::Bytes(bytes),
                ..
            }) => Ok(bytes.len() as u64),
            Some(entry) => Err(wrong_type("STRLEN", key, &entry.value).into()),
        }
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> ConjureResult<ScanPage> {
        let matcher = glob_regex(pattern)?;
        let now = Instant::now();
        let keyspace = self.connect()?;
        let entries = &keyspace.entries;
        Ok(scan_order(&keyspace.order, cursor, count, |key| {
            entries.get(key).is_some_and(|e| !e.is_expired(now)) && matcher.is_match(key)
        }))
    }

    async fn scan_set(&self, key: &str, cursor: u64, count: usize) -> ConjureResult<ScanPage> {
        let now = Instant::now();
        let mut keyspace = self.connect()?;
        Ok(match keyspace.set("SSCAN", key, now)? {
            Some(set) => scan_order(&set.order, cursor, count, |_| true),
            None => ScanPage::default(),
        })
    }

    async fn flush(&self) -> ConjureResult<()> {
        let mut keyspace = self.connect()?;
        *keyspace = Keyspace::default();
        Ok(())
    }

    async fn register_conjunction(&self, write: &ConjunctionWrite) -> ConjureResult<()> {
        ensure_colocated("register_conjunction", write.keys())?;
        let extension = match write.ttl {
            Some(ext) => Some((
                Duration::from_secs(ttl_secs("register_conjunction", ext.entry_timeout)?),
                Duration::from_secs(ttl_secs("register_conjunction", ext.extend_to)?),
            )),
            None => None,
        };

        let now = Instant::now();
        let mut keyspace = self.connect()?;
        keyspace
            .set_or_create("SADD", &write.schemes_key, now)?
            .insert(&write.scheme);
        keyspace
            .set_or_create("SADD", &write.conj_key, now)?
            .insert(&write.cache_key);

        if let (Some((timeout, extend_to)), Some(entry)) =
            (extension, keyspace.entries.get_mut(&write.conj_key))
        {
            let below = match entry.expires_at {
                None => true,
                Some(at) => at.saturating_duration_since(now) < timeout,
            };
            if below {
                entry.expires_at = Some(now + extend_to);
            }
        }
        Ok(())
    }

    async fn delete_union(
        &self,
        index_keys: &[String],
        extra_keys: &[String],
    ) -> ConjureResult<u64> {
        check_union_keys(index_keys, extra_keys)?;
        let now = Instant::now();
        let mut keyspace = self.connect()?;

        let mut members = BTreeSet::new();
        for key in index_keys {
            if let Some(set) = keyspace.set("SUNION", key, now)? {
                members.extend(set.members());
            }
        }

        let removed = members
            .iter()
            .filter(|member| keyspace.remove_live(member, now))
            .count() as u64;

        for key in index_keys.iter().chain(extra_keys) {
            keyspace.remove(key);
        }
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
        let now = Instant::now();
        let mut keyspace = self.connect()?;

        if keyspace.live(key, now).is_some() {
            return Ok(false);
        }
        keyspace.insert(
            key,
            Value::Bytes(sentinel.to_vec()),
            Some(now + Duration::from_secs(secs)),
        );
        keyspace.remove(signal_key);
        Ok(true)
    }

    async fn wait_signal(&self, signal_key: &str, timeout: Duration) -> ConjureResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.signals.notified();
            tokio::pin!(notified);
            // Register before checking so a release between the check and
            // the await is not missed.
            notified.as_mut().enable();

            if self.signal_ready(signal_key)? {
                return Ok(true);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(false);
            }
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
        let now = Instant::now();
        {
            let mut keyspace = self.connect()?;
            let holds_sentinel = matches!(
                keyspace.live(key, now),
                Some(Entry { value: Value::Bytes(bytes), .. }) if bytes.as_slice() == sentinel
            );
            if holds_sentinel {
                keyspace.remove(key);
            }

            let expires_at = Some(now + Duration::from_secs(secs));
            match keyspace.live(signal_key, now) {
                Some(Entry {
                    value: Value::List(list),
                    expires_at: expiry,
                    ..
                }) => {
                    list.push_front(b"1".to_vec());
                    *expiry = expires_at;
                }
                Some(entry) => {
                    return Err(wrong_type("LPUSH", signal_key, &entry.value).into());
                }
                None => {
                    keyspace.insert(
                        signal_key,
                        Value::List(VecDeque::from([b"1".to_vec()])),
                        expires_at,
                    );
                }
            }
        }
        self.signals.notify_waiters();
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

        let now = Instant::now();
        let mut keyspace = self.connect()?;
        let mut outcome = PruneOutcome {
            processed: members.len() as u64,
            ..PruneOutcome::default()
        };

        for member in members {
            if keyspace.is_live(member, now) {
                continue;
            }
            if let Some(set) = keyspace.set("SREM", set_key, now)? {
                if set.remove(member) {
                    outcome.removed += 1;
                    outcome.bytes_freed += member.len() as u64;
                }
            }
        }

        let emptied = keyspace
            .set("SCARD", set_key, now)?
            .is_some_and(|set| set.is_empty());
        if emptied {
            keyspace.remove(set_key);
            outcome.set_deleted = outcome.removed > 0;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TtlExtension;
    use conjure_core::{ConjureError, ProtocolError};

    fn write(conj_key: &str, cache_key: &str, ttl: Option<TtlExtension>) -> ConjunctionWrite {
        ConjunctionWrite {
            schemes_key: "schemes:post".to_string(),
            scheme: "category_id".to_string(),
            conj_key: conj_key.to_string(),
            cache_key: cache_key.to_string(),
            ttl,
        }
    }

    #[test]
    fn test_glob_match() {
        let matches = |pattern: &str, key: &str| glob_regex(pattern).unwrap().is_match(key);
        assert!(matches("conj:*", "conj:post:x=1"));
        assert!(matches("*conj:*", "{acme}conj:post:"));
        assert!(!matches("conj:*", "q:abc"));
        assert!(!matches("conj:*", "{acme}conj:post:"));
        assert!(matches("q:???", "q:abc"));
        assert!(!matches("q:???", "q:abcd"));
        assert!(matches("conj:we\\*ird:*", "conj:we*ird:x=1"));
        assert!(!matches("conj:we\\*ird:*", "conj:weXird:x=1"));
        assert!(matches("conj:post:a=1&b=(x)+", "conj:post:a=1&b=(x)+"));
        assert!(matches("*", ""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_ex_expires() {
        let store = MemoryStore::new();
        store
            .set_ex("q:a", b"v", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.get("q:a").await.unwrap(), Some(b"v".to_vec()));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get("q:a").await.unwrap(), None);
        assert_eq!(store.ttl("q:a").await.unwrap(), KeyTtl::Missing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_extends_short_ttl_only() {
        let store = MemoryStore::new();
        let ext = TtlExtension {
            entry_timeout: Duration::from_secs(60),
            extend_to: Duration::from_secs(130),
        };
        store
            .register_conjunction(&write("conj:post:category_id=1", "q:a", Some(ext)))
            .await
            .unwrap();
        assert_eq!(
            store.ttl("conj:post:category_id=1").await.unwrap(),
            KeyTtl::Expires(Duration::from_secs(130))
        );

        // Still above the entry timeout: left alone.
        tokio::time::advance(Duration::from_secs(20)).await;
        store
            .register_conjunction(&write("conj:post:category_id=1", "q:b", Some(ext)))
            .await
            .unwrap();
        assert_eq!(
            store.ttl("conj:post:category_id=1").await.unwrap(),
            KeyTtl::Expires(Duration::from_secs(110))
        );

        // Below the entry timeout: raised again.
        tokio::time::advance(Duration::from_secs(60)).await;
        store
            .register_conjunction(&write("conj:post:category_id=1", "q:c", Some(ext)))
            .await
            .unwrap();
        assert_eq!(
            store.ttl("conj:post:category_id=1").await.unwrap(),
            KeyTtl::Expires(Duration::from_secs(130))
        );
    }

    #[tokio::test]
    async fn test_register_without_extension_is_persistent() {
        let store = MemoryStore::new();
        store
            .register_conjunction(&write("conj:post:category_id=1", "q:a", None))
            .await
            .unwrap();
        assert_eq!(
            store.ttl("conj:post:category_id=1").await.unwrap(),
            KeyTtl::Persistent
        );
        assert_eq!(
            store.set_members("schemes:post").await.unwrap(),
            vec!["category_id".to_string()]
        );
    }

    #[tokio::test]
    async fn test_register_rejects_cross_slot() {
        let store = MemoryStore::new();
        let mut bad = write("{a}conj:post:category_id=1", "{a}q:x", None);
        bad.schemes_key = "{b}schemes:post".to_string();
        let err = store.register_conjunction(&bad).await.unwrap_err();
        assert!(matches!(
            err,
            ConjureError::Protocol(ProtocolError::CrossSlot { .. })
        ));
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_delete_union_counts_only_existing() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        store.set_ex("q:a", b"1", ttl).await.unwrap();
        store.set_ex("q:b", b"2", ttl).await.unwrap();
        store
            .register_conjunction(&write("conj:post:x=1", "q:a", None))
            .await
            .unwrap();
        store
            .register_conjunction(&write("conj:post:x=2", "q:b", None))
            .await
            .unwrap();
        store
            .register_conjunction(&write("conj:post:x=2", "q:gone", None))
            .await
            .unwrap();

        let removed = store
            .delete_union(
                &["conj:post:x=1".to_string(), "conj:post:x=2".to_string()],
                &[],
            )
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.keys(), vec!["schemes:post".to_string()]);
    }

    #[tokio::test]
    async fn test_scan_cursor_survives_deletes() {
        let store = MemoryStore::new();
        for i in 0..10 {
            store
                .set_ex(&format!("q:{}", i), b"v", Duration::from_secs(60))
                .await
                .unwrap();
        }

        let first = store.scan(0, "q:*", 4).await.unwrap();
        assert_eq!(first.keys.len(), 4);
        assert!(!first.is_last());

        store.delete(&first.keys).await.unwrap();

        let mut seen = first.keys.clone();
        let mut cursor = first.cursor;
        while cursor != 0 {
            let page = store.scan(cursor, "q:*", 4).await.unwrap();
            seen.extend(page.keys);
            cursor = page.cursor;
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 10);
    }

    #[tokio::test]
    async fn test_lock_cycle_and_signal() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(5);
        assert!(store.try_lock("q:l", "q:l:signal", b"LOCK", ttl).await.unwrap());
        assert!(!store.try_lock("q:l", "q:l:signal", b"LOCK", ttl).await.unwrap());
        assert!(!store
            .wait_signal("q:l:signal", Duration::ZERO)
            .await
            .unwrap());

        store
            .release_lock("q:l", "q:l:signal", b"LOCK", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!store.exists("q:l").await.unwrap());
        // The token stays in place for every waiter.
        assert!(store.wait_signal("q:l:signal", ttl).await.unwrap());
        assert!(store.wait_signal("q:l:signal", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_keeps_real_value() {
        let store = MemoryStore::new();
        store
            .set_ex("q:l", b"rows", Duration::from_secs(60))
            .await
            .unwrap();
        store
            .release_lock("q:l", "q:l:signal", b"LOCK", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(store.get("q:l").await.unwrap(), Some(b"rows".to_vec()));
    }

    #[tokio::test]
    async fn test_prune_set_removes_dangling_members() {
        let store = MemoryStore::new();
        store
            .set_ex("q:live", b"v", Duration::from_secs(60))
            .await
            .unwrap();
        store
            .register_conjunction(&write("conj:post:x=1", "q:live", None))
            .await
            .unwrap();
        store
            .register_conjunction(&write("conj:post:x=1", "q:dead", None))
            .await
            .unwrap();

        let members = store.set_members("conj:post:x=1").await.unwrap();
        let outcome = store.prune_set("conj:post:x=1", &members).await.unwrap();
        assert_eq!(outcome.processed, 2);
        assert_eq!(outcome.removed, 1);
        assert_eq!(outcome.bytes_freed, "q:dead".len() as u64);
        assert!(!outcome.set_deleted);

        store.evict("q:live");
        let outcome = store
            .prune_set("conj:post:x=1", &["q:live".to_string()])
            .await
            .unwrap();
        assert!(outcome.set_deleted);
        assert!(!store.exists("conj:post:x=1").await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_with_connection_error() {
        let store = MemoryStore::new();
        store.set_available(false);
        let err = store.get("q:a").await.unwrap_err();
        assert!(err.is_connection_failure());

        store.set_available(true);
        assert_eq!(store.get("q:a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_wrong_type_is_command_error() {
        let store = MemoryStore::new();
        store
            .register_conjunction(&write("conj:post:x=1", "q:a", None))
            .await
            .unwrap();
        let err = store.get("conj:post:x=1").await.unwrap_err();
        assert!(!err.is_connection_failure());
    }
}
