//! Writing cache entries and registering them in the invalidation index.

use std::sync::Arc;
use std::time::Duration;

use conjure_core::keys::{self, conj_key, schemes_key};
use conjure_core::{ConjureConfig, ConjureResult, Disjunction, HashTag, ProtocolError};

use crate::degrade::degrade;
use crate::store::{ConjunctionWrite, Store, TtlExtension};

/// What an indexing call wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexReport {
    /// Conjunction sets the entry was registered in.
    pub conjunctions: usize,
    /// Whether the call degraded to a no-op.
    pub degraded: bool,
}

/// Stores query results and records which conjunctions they depend on.
pub struct ConjunctionIndexer<S: Store> {
    store: Arc<S>,
    config: ConjureConfig,
}

impl<S: Store> ConjunctionIndexer<S> {
    pub fn new(store: Arc<S>, config: ConjureConfig) -> Self {
        Self { store, config }
    }

    /// Build the registrations for `cache_key`.
    ///
    /// Index keys inherit the hash tag of `cache_key`, so every write of one
    /// registration lands on the same shard.
    pub fn plan(
        &self,
        cache_key: &str,
        timeout: Duration,
        dependencies: &[Disjunction],
    ) -> Vec<ConjunctionWrite> {
        let tag = HashTag::extract(cache_key)
            .map(HashTag::new)
            .unwrap_or_default();
        let ttl = self.config.extends_conj_ttl().then(|| TtlExtension {
            entry_timeout: timeout,
            extend_to: self.config.conj_ttl_for(timeout),
        });

        dependencies
            .iter()
            .flat_map(|disjunction| {
                let schemes = tag.apply(&schemes_key(&disjunction.table));
                let tag = &tag;
                disjunction.conjunctions.iter().map(move |conjunction| {
                    ConjunctionWrite {
                        schemes_key: schemes.clone(),
                        scheme: conjunction.scheme().encode(),
                        conj_key: tag.apply(&conj_key(&disjunction.table, conjunction)),
                        cache_key: cache_key.to_string(),
                        ttl,
                    }
                })
            })
            .collect()
    }

    /// Write `data` under `cache_key` for `timeout` and register it under
    /// every conjunction of `dependencies`.
    ///
    /// The entry is written first. If a registration fails afterwards, the
    /// entry is indexed under only some of its conjunctions and is still
    /// bounded by its own timeout.
    #[tracing::instrument(skip(self, data, dependencies), fields(conjunctions))]
    pub async fn index(
        &self,
        cache_key: &str,
        data: &[u8],
        timeout: Duration,
        dependencies: &[Disjunction],
    ) -> ConjureResult<IndexReport> {
        if timeout.as_secs() == 0 {
            return Err(ProtocolError::InvalidArgument {
                operation: "index".to_string(),
                reason: format!("timeout must be at least one second, got {:?}", timeout),
            }
            .into());
        }
        if !cache_key.contains(keys::CACHE_KEY_PREFIX) {
            return Err(ProtocolError::InvalidKey {
                key: cache_key.to_string(),
                reason: format!("cache keys carry the {} prefix", keys::CACHE_KEY_PREFIX),
            }
            .into());
        }

        let writes = self.plan(cache_key, timeout, dependencies);
        tracing::Span::current().record("conjunctions", writes.len());

        let result = self.write(cache_key, data, timeout, &writes).await;
        degrade(self.config.failure_policy, "index", result, || IndexReport {
            conjunctions: 0,
            degraded: true,
        })
    }

    async fn write(
        &self,
        cache_key: &str,
        data: &[u8],
        timeout: Duration,
        writes: &[ConjunctionWrite],
    ) -> ConjureResult<IndexReport> {
        self.store.set_ex(cache_key, data, timeout).await?;
        for write in writes {
            self.store.register_conjunction(write).await?;
        }
        Ok(IndexReport {
            conjunctions: writes.len(),
            degraded: false,
        })
    }
}
