//! Read-through query cache.
//!
//! [`QueryCache`] ties the pieces together for the read path: it derives the
//! cache key of a query, serves hits, and on a miss computes the result under
//! the dogpile lock, stores it and indexes it under the query's
//! dependencies.

use std::future::Future;
use std::sync::Arc;

use conjure_core::{
    CacheableQuery, CodecError, ConjureConfig, ConjureError, ConjureResult, HashTagRouter,
    KeySpace,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::dogpile::{DogpileLock, Lookup};
use crate::events::{CacheEvent, CacheObserver, TracingObserver};
use crate::indexer::{ConjunctionIndexer, IndexReport};
use crate::store::Store;

/// A query result and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub data: Vec<u8>,
    pub from_cache: bool,
}

/// Read-through cache for query results.
///
/// # Example
///
/// ```ignore
/// let cache = QueryCache::new(store, HashTagRouter::disabled(), ConjureConfig::from_env());
/// let query = CacheableQuery::new("SELECT * FROM post WHERE category_id = 1", ttl)
///     .depends_on(Disjunction::new("post", vec![Conjunction::new().with("category_id", 1)]));
///
/// let rows = cache.fetch(&query, || run_query()).await?;
/// ```
pub struct QueryCache<S: Store> {
    router: HashTagRouter,
    indexer: ConjunctionIndexer<S>,
    dogpile: DogpileLock<S>,
    observer: Arc<dyn CacheObserver>,
}

impl<S: Store> QueryCache<S> {
    pub fn new(store: Arc<S>, router: HashTagRouter, config: ConjureConfig) -> Self {
        Self {
            router,
            dogpile: DogpileLock::new(Arc::clone(&store), &config),
            indexer: ConjunctionIndexer::new(store, config),
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn CacheObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Key space of the shard a query routes to.
    pub fn key_space(&self, query: &CacheableQuery) -> KeySpace {
        KeySpace::new(self.router.tag_for(query.routing.as_deref()))
    }

    pub fn cache_key(&self, query: &CacheableQuery) -> String {
        self.key_space(query).cache_key(&query.identity)
    }

    /// Look a query up without computing it. A key being computed by another
    /// caller reads as a miss.
    pub async fn get(&self, query: &CacheableQuery) -> ConjureResult<Option<Vec<u8>>> {
        let cache_key = self.cache_key(query);
        let data = self.dogpile.get(&cache_key).await?;
        self.observer.on_event(&match data {
            Some(_) => CacheEvent::Hit { cache_key },
            None => CacheEvent::Miss { cache_key },
        });
        Ok(data)
    }

    /// Store a result that was computed elsewhere.
    pub async fn cache_thing(
        &self,
        query: &CacheableQuery,
        data: &[u8],
    ) -> ConjureResult<IndexReport> {
        let cache_key = self.cache_key(query);
        self.store_result(&cache_key, query, data).await
    }

    /// Serve `query` from the cache, computing and caching it on a miss.
    ///
    /// Concurrent misses on the same query run `compute` once; the other
    /// callers wait for its result. The lock is released whether `compute`
    /// succeeds or not.
    #[tracing::instrument(skip(self, query, compute), fields(identity = %query.identity))]
    pub async fn fetch<E, F, Fut>(&self, query: &CacheableQuery, compute: F) -> Result<Fetched, E>
    where
        E: From<ConjureError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, E>>,
    {
        let cache_key = self.cache_key(query);

        let holds_lock = match self.dogpile.lookup(&cache_key).await? {
            Lookup::Hit(data) => {
                self.observer.on_event(&CacheEvent::Hit { cache_key });
                return Ok(Fetched {
                    data,
                    from_cache: true,
                });
            }
            Lookup::Acquired => true,
            Lookup::Unavailable => false,
        };
        self.observer.on_event(&CacheEvent::Miss {
            cache_key: cache_key.clone(),
        });

        let outcome = match compute().await {
            Ok(data) => match self.store_result(&cache_key, query, &data).await {
                Ok(_) => Ok(data),
                Err(e) => Err(E::from(e)),
            },
            Err(e) => Err(e),
        };

        if holds_lock {
            if let Err(e) = self.dogpile.release(&cache_key).await {
                tracing::warn!(cache_key = %cache_key, error = %e, "Failed to release dogpile lock");
            }
        }

        outcome.map(|data| Fetched {
            data,
            from_cache: false,
        })
    }

    /// [`fetch`](Self::fetch) for results stored as JSON.
    pub async fn fetch_json<T, E, F, Fut>(&self, query: &CacheableQuery, compute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<ConjureError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let fetched = self
            .fetch(query, || async move {
                match compute().await {
                    Ok(value) => encode(&value).map_err(E::from),
                    Err(e) => Err(e),
                }
            })
            .await?;
        decode(&fetched.data).map_err(E::from)
    }

    async fn store_result(
        &self,
        cache_key: &str,
        query: &CacheableQuery,
        data: &[u8],
    ) -> ConjureResult<IndexReport> {
        let report = self
            .indexer
            .index(cache_key, data, query.timeout, &query.dependencies)
            .await?;
        if !report.degraded {
            self.observer.on_event(&CacheEvent::Created {
                cache_key: cache_key.to_string(),
                tables: query.tables().map(str::to_string).collect(),
            });
        }
        Ok(report)
    }
}

fn encode<T: Serialize>(value: &T) -> ConjureResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| {
        CodecError::Encode {
            what: "query result".to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> ConjureResult<T> {
    Ok(serde_json::from_slice(data)?)
}
