//! Dogpile prevention.
//!
//! When several callers miss on the same cache key at once, only one of them
//! should compute the value. The first caller to miss stores a lock sentinel
//! under the key itself; the others park on the key's signal list until the
//! holder releases, then re-read.
//!
//! The wait is bounded by the lock timeout. A holder that dies without
//! releasing only delays waiters until the sentinel expires.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use conjure_core::keys::signal_key;
use conjure_core::{ConjureConfig, ConjureError, ConjureResult, FailurePolicy};

use crate::degrade::degrade;
use crate::store::Store;

/// Value stored under a cache key while its result is being computed.
pub const LOCK_SENTINEL: &[u8] = b"LOCK";

/// Outcome of a locked lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// The key holds a computed value.
    Hit(Vec<u8>),
    /// The caller holds the lock and must compute, store and release.
    Acquired,
    /// The store is unreachable and the failure policy degrades: compute
    /// without caching.
    Unavailable,
}

/// Single-flight lock over cache keys.
pub struct DogpileLock<S: Store> {
    store: Arc<S>,
    lock_timeout: Duration,
    signal_ttl: Duration,
    policy: FailurePolicy,
}

impl<S: Store> DogpileLock<S> {
    pub fn new(store: Arc<S>, config: &ConjureConfig) -> Self {
        Self {
            store,
            lock_timeout: config.lock_timeout,
            signal_ttl: config.signal_ttl,
            policy: config.failure_policy,
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Return the cached value, or take the lock.
    ///
    /// `None` means the caller now holds the lock (or the store is down
    /// under a degrading policy) and must compute the value itself.
    pub async fn get_or_lock(&self, key: &str) -> ConjureResult<Option<Vec<u8>>> {
        Ok(match self.lookup(key).await? {
            Lookup::Hit(data) => Some(data),
            Lookup::Acquired | Lookup::Unavailable => None,
        })
    }

    /// Like [`get_or_lock`](Self::get_or_lock), distinguishing a held lock
    /// from a degraded store.
    #[tracing::instrument(skip(self))]
    pub async fn lookup(&self, key: &str) -> ConjureResult<Lookup> {
        let result = self.lookup_inner(key).await;
        degrade(self.policy, "get_or_lock", result, || Lookup::Unavailable)
    }

    async fn lookup_inner(&self, key: &str) -> ConjureResult<Lookup> {
        let signal = signal_key(key);
        loop {
            match self.store.get(key).await? {
                Some(data) if data != LOCK_SENTINEL => return Ok(Lookup::Hit(data)),
                Some(_) => {}
                None => {
                    if self
                        .store
                        .try_lock(key, &signal, LOCK_SENTINEL, self.lock_timeout)
                        .await?
                    {
                        tracing::trace!(key, "Acquired dogpile lock");
                        return Ok(Lookup::Acquired);
                    }
                }
            }

            let woke = self.store.wait_signal(&signal, self.lock_timeout).await?;
            tracing::trace!(key, woke, "Dogpile wait finished");
        }
    }

    /// Plain read that treats a lock sentinel as a miss.
    pub async fn get(&self, key: &str) -> ConjureResult<Option<Vec<u8>>> {
        let result = self
            .store
            .get(key)
            .await
            .map(|value| value.filter(|data| data != LOCK_SENTINEL));
        degrade(self.policy, "get", result, || None)
    }

    /// Drop the sentinel if it is still in place and wake every waiter.
    ///
    /// A value written under the key in the meantime is left alone.
    #[tracing::instrument(skip(self))]
    pub async fn release(&self, key: &str) -> ConjureResult<()> {
        let result = self
            .store
            .release_lock(key, &signal_key(key), LOCK_SENTINEL, self.signal_ttl)
            .await;
        degrade(self.policy, "release", result, || ())
    }

    /// Return the cached value or compute it under the lock.
    ///
    /// `store` receives the computed value and is expected to write it under
    /// `key`. The lock is released on every path, including compute and store
    /// failures.
    pub async fn get_or_compute<T, E, C, CFut, W, WFut>(
        &self,
        key: &str,
        compute: C,
        store: W,
    ) -> Result<Computed<T>, E>
    where
        T: From<Vec<u8>>,
        E: From<ConjureError>,
        C: FnOnce() -> CFut,
        CFut: Future<Output = Result<T, E>>,
        W: FnOnce(&T) -> WFut,
        WFut: Future<Output = Result<(), E>>,
    {
        let holds_lock = match self.lookup(key).await? {
            Lookup::Hit(data) => return Ok(Computed::Cached(T::from(data))),
            Lookup::Acquired => true,
            Lookup::Unavailable => false,
        };

        let outcome = match compute().await {
            Ok(value) => store(&value).await.map(|()| value),
            Err(e) => Err(e),
        };

        // An unreleased sentinel still expires after the lock timeout, so a
        // failed release does not hide the computed value.
        if holds_lock {
            if let Err(e) = self.release(key).await {
                tracing::warn!(key, error = %e, "Failed to release dogpile lock");
            }
        }
        outcome.map(Computed::Fresh)
    }
}

/// Where a value returned by [`DogpileLock::get_or_compute`] came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Computed<T> {
    Cached(T),
    Fresh(T),
}

impl<T> Computed<T> {
    pub fn into_inner(self) -> T {
        match self {
            Computed::Cached(v) | Computed::Fresh(v) => v,
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, Computed::Cached(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn lock(config: ConjureConfig) -> (Arc<MemoryStore>, DogpileLock<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Arc::clone(&store), DogpileLock::new(store, &config))
    }

    #[tokio::test]
    async fn test_first_caller_acquires() {
        let (store, lock) = lock(ConjureConfig::default());
        assert_eq!(lock.lookup("q:a").await.unwrap(), Lookup::Acquired);
        assert_eq!(store.get("q:a").await.unwrap(), Some(LOCK_SENTINEL.to_vec()));
        assert_eq!(lock.get("q:a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_hit_returns_value() {
        let (store, lock) = lock(ConjureConfig::default());
        store
            .set_ex("q:a", b"rows", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            lock.get_or_lock("q:a").await.unwrap(),
            Some(b"rows".to_vec())
        );
    }

    #[tokio::test]
    async fn test_waiter_sees_value_after_release() {
        let (store, lock) = lock(ConjureConfig::default());
        let lock = Arc::new(lock);
        assert_eq!(lock.get_or_lock("q:a").await.unwrap(), None);

        let waiter = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move { lock.get_or_lock("q:a").await })
        };
        tokio::task::yield_now().await;

        store
            .set_ex("q:a", b"rows", Duration::from_secs(60))
            .await
            .unwrap();
        lock.release("q:a").await.unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), Some(b"rows".to_vec()));
    }

    #[tokio::test]
    async fn test_waiter_takes_over_after_failed_compute() {
        let (_store, lock) = lock(ConjureConfig::default());
        let lock = Arc::new(lock);
        assert_eq!(lock.get_or_lock("q:a").await.unwrap(), None);

        let waiter = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move { lock.lookup("q:a").await })
        };
        tokio::task::yield_now().await;

        // Holder gives up without writing a value.
        lock.release("q:a").await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), Lookup::Acquired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_lock_expires() {
        let config = ConjureConfig::default().with_lock_timeout(Duration::from_secs(2));
        let (_store, lock) = lock(config);
        assert_eq!(lock.lookup("q:a").await.unwrap(), Lookup::Acquired);

        // Nobody releases; the second caller gets the lock once the
        // sentinel expires.
        assert_eq!(lock.lookup("q:a").await.unwrap(), Lookup::Acquired);
    }

    #[tokio::test]
    async fn test_get_or_compute_single_flight() {
        let (store, lock) = lock(ConjureConfig::default());
        let lock = Arc::new(lock);
        let computes = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            let store = Arc::clone(&store);
            let computes = Arc::clone(&computes);
            handles.push(tokio::spawn(async move {
                lock.get_or_compute::<Vec<u8>, ConjureError, _, _, _, _>(
                    "q:a",
                    || async move {
                        computes.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        Ok(b"rows".to_vec())
                    },
                    |value| {
                        let value = value.clone();
                        async move { store.set_ex("q:a", &value, Duration::from_secs(60)).await }
                    },
                )
                .await
                .map(Computed::into_inner)
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), b"rows".to_vec());
        }
        assert_eq!(computes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_compute_releases_on_error() {
        let (store, lock) = lock(ConjureConfig::default());
        let result = lock
            .get_or_compute::<Vec<u8>, ConjureError, _, _, _, _>(
                "q:a",
                || async {
                    Err(ConjureError::from(conjure_core::StoreError::Command {
                        command: "SELECT".to_string(),
                        reason: "db down".to_string(),
                    }))
                },
                |_| async { Ok(()) },
            )
            .await;

        assert!(result.is_err());
        assert!(!store.exists("q:a").await.unwrap());
    }

    #[tokio::test]
    async fn test_degraded_lookup_when_store_down() {
        let config = ConjureConfig::default().with_failure_policy(FailurePolicy::Degrade);
        let (store, lock) = lock(config);
        store.set_available(false);
        assert_eq!(lock.lookup("q:a").await.unwrap(), Lookup::Unavailable);
        lock.release("q:a").await.unwrap();
    }
}
