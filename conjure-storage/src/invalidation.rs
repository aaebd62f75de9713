//! Invalidation of cache entries on record changes.
//!
//! When a record of `table` changes, every cached query that depends on a
//! conjunction the record satisfies must go. The engine reads the schemes
//! recorded for the table, projects the record onto each scheme to get the
//! conjunction sets it falls into, and deletes the union of their members
//! together with the sets themselves in one atomic store call.
//!
//! Invalidation is skipped while the caller is inside a suppression scope
//! (see [`conjure_core::suppress`]). The checked entry points consult the
//! scope; the `*_now` variants used by deferred commits do not.

use std::sync::Arc;
use std::time::Instant;

use conjure_core::{
    is_suppressed, ConjureConfig, ConjureResult, HashTagRouter, KeySpace, RecordValues, Scheme,
};

use crate::degrade::degrade;
use crate::events::{CacheEvent, CacheObserver, TracingObserver};
use crate::store::Store;

/// Keys requested per page when scanning a table's conjunction sets.
pub const TABLE_SCAN_COUNT: usize = 1000;

/// Conjunction sets deleted per atomic call during table invalidation.
pub const TABLE_DELETE_CHUNK: usize = 500;

/// Conjunction set keys a record with `values` belongs to.
///
/// Schemes naming a field absent from `values` are skipped. The empty
/// scheme always contributes the table's whole-table set.
pub fn conj_keys_for(
    keys: &KeySpace,
    table: &str,
    schemes: &[Scheme],
    values: &RecordValues,
) -> Vec<String> {
    let mut conj_keys: Vec<String> = schemes
        .iter()
        .filter_map(|scheme| scheme.project(values))
        .map(|conjunction| keys.conj_key(table, &conjunction))
        .collect();
    conj_keys.sort();
    conj_keys.dedup();
    conj_keys
}

/// Removes cache entries affected by record changes.
pub struct Invalidator<S: Store> {
    store: Arc<S>,
    router: HashTagRouter,
    config: ConjureConfig,
    observer: Arc<dyn CacheObserver>,
}

impl<S: Store> Invalidator<S> {
    pub fn new(store: Arc<S>, router: HashTagRouter, config: ConjureConfig) -> Self {
        Self {
            store,
            router,
            config,
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn CacheObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn router(&self) -> &HashTagRouter {
        &self.router
    }

    /// Invalidate every entry depending on a conjunction satisfied by a
    /// record of `table` with `values`.
    ///
    /// `routing` selects the shard in a clustered deployment. Returns the
    /// number of cache entries removed.
    pub async fn invalidate(
        &self,
        table: &str,
        values: &RecordValues,
        routing: Option<&str>,
    ) -> ConjureResult<u64> {
        if is_suppressed() {
            tracing::trace!(table, "Invalidation suppressed");
            return Ok(0);
        }
        self.invalidate_now(table, values, routing).await
    }

    /// [`Invalidator::invalidate`] without the suppression check.
    #[tracing::instrument(skip(self, values), fields(removed))]
    pub(crate) async fn invalidate_now(
        &self,
        table: &str,
        values: &RecordValues,
        routing: Option<&str>,
    ) -> ConjureResult<u64> {
        let started = Instant::now();
        let keys = KeySpace::new(self.router.tag_for(routing));
        let result = self.invalidate_record(&keys, table, values).await;
        let removed = degrade(self.config.failure_policy, "invalidate", result, || 0)?;

        tracing::Span::current().record("removed", removed);
        self.observer.on_event(&CacheEvent::Invalidated {
            table: table.to_string(),
            values: values.clone(),
            removed,
            duration: started.elapsed(),
        });
        Ok(removed)
    }

    async fn invalidate_record(
        &self,
        keys: &KeySpace,
        table: &str,
        values: &RecordValues,
    ) -> ConjureResult<u64> {
        let schemes: Vec<Scheme> = self
            .store
            .set_members(&keys.schemes_key(table))
            .await?
            .iter()
            .map(|raw| Scheme::parse(raw))
            .collect();

        let conj_keys = conj_keys_for(keys, table, &schemes, values);
        if conj_keys.is_empty() {
            return Ok(0);
        }
        self.store.delete_union(&conj_keys, &[]).await
    }

    /// Invalidate every entry depending on any conjunction of `table`.
    ///
    /// The table's scheme set is kept: an entry indexed while the scan runs
    /// may land in a set the scan already passed, and record invalidation
    /// can only reach it through its scheme.
    ///
    /// In a clustered deployment only the shard selected by `routing` is
    /// touched.
    pub async fn invalidate_table(&self, table: &str, routing: Option<&str>) -> ConjureResult<u64> {
        if is_suppressed() {
            tracing::trace!(table, "Table invalidation suppressed");
            return Ok(0);
        }
        self.invalidate_table_now(table, routing).await
    }

    #[tracing::instrument(skip(self))]
    pub(crate) async fn invalidate_table_now(
        &self,
        table: &str,
        routing: Option<&str>,
    ) -> ConjureResult<u64> {
        let keys = KeySpace::new(self.router.tag_for(routing));
        let result = self.invalidate_whole_table(&keys, table).await;
        let removed = degrade(
            self.config.failure_policy,
            "invalidate_table",
            result,
            || 0,
        )?;

        self.observer.on_event(&CacheEvent::TableInvalidated {
            table: table.to_string(),
            removed,
        });
        Ok(removed)
    }

    async fn invalidate_whole_table(&self, keys: &KeySpace, table: &str) -> ConjureResult<u64> {
        let pattern = keys.conj_pattern(table);
        let mut removed = 0;
        let mut pending: Vec<String> = Vec::new();
        let mut cursor = 0;

        loop {
            let page = self.store.scan(cursor, &pattern, TABLE_SCAN_COUNT).await?;
            pending.extend(page.keys);

            while pending.len() >= TABLE_DELETE_CHUNK {
                let chunk: Vec<String> = pending.drain(..TABLE_DELETE_CHUNK).collect();
                removed += self.store.delete_union(&chunk, &[]).await?;
            }

            cursor = page.cursor;
            if cursor == 0 {
                break;
            }
        }

        if !pending.is_empty() {
            removed += self.store.delete_union(&pending, &[]).await?;
        }
        Ok(removed)
    }

    /// Drop everything in the store.
    pub async fn invalidate_all(&self) -> ConjureResult<()> {
        if is_suppressed() {
            tracing::trace!("Flush suppressed");
            return Ok(());
        }
        self.invalidate_all_now().await
    }

    #[tracing::instrument(skip(self))]
    pub(crate) async fn invalidate_all_now(&self) -> ConjureResult<()> {
        let result = self.store.flush().await;
        degrade(self.config.failure_policy, "invalidate_all", result, || ())?;
        self.observer.on_event(&CacheEvent::Flushed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::ConjunctionIndexer;
    use crate::store::MemoryStore;
    use conjure_core::{
        without_invalidation, Conjunction, Disjunction, FailurePolicy, FieldValue, HashTag,
    };
    use std::time::Duration;

    fn values(pairs: &[(&str, FieldValue)]) -> RecordValues {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        indexer: ConjunctionIndexer<MemoryStore>,
        invalidator: Invalidator<MemoryStore>,
    }

    fn fixture(config: ConjureConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        Fixture {
            indexer: ConjunctionIndexer::new(Arc::clone(&store), config.clone()),
            invalidator: Invalidator::new(Arc::clone(&store), HashTagRouter::disabled(), config),
            store,
        }
    }

    async fn cache(f: &Fixture, key: &str, deps: Vec<Disjunction>) {
        f.indexer
            .index(key, b"rows", Duration::from_secs(60), &deps)
            .await
            .unwrap();
    }

    #[test]
    fn test_conj_keys_skip_schemes_with_absent_fields() {
        let schemes = vec![
            Scheme::parse(""),
            Scheme::parse("category_id"),
            Scheme::parse("category_id,visible"),
        ];
        let record = values(&[("category_id", FieldValue::Int(1))]);
        let keys = conj_keys_for(&KeySpace::untagged(), "post", &schemes, &record);
        assert_eq!(keys, vec!["conj:post:", "conj:post:category_id=1"]);
    }

    #[test]
    fn test_conj_keys_with_tag() {
        let schemes = vec![Scheme::parse("id")];
        let record = values(&[("id", FieldValue::Int(7))]);
        let keys = conj_keys_for(
            &KeySpace::new(HashTag::new("t1")),
            "post",
            &schemes,
            &record,
        );
        assert_eq!(keys, vec!["{t1}conj:post:id=7"]);
    }

    #[tokio::test]
    async fn test_invalidate_removes_matching_entries_only() {
        let f = fixture(ConjureConfig::default());
        cache(
            &f,
            "q:one",
            vec![Disjunction::new(
                "post",
                vec![Conjunction::new().with("category_id", 1)],
            )],
        )
        .await;
        cache(
            &f,
            "q:two",
            vec![Disjunction::new(
                "post",
                vec![Conjunction::new().with("category_id", 2)],
            )],
        )
        .await;

        let removed = f
            .invalidator
            .invalidate(
                "post",
                &values(&[("id", 5.into()), ("category_id", 1.into())]),
                None,
            )
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert!(!f.store.exists("q:one").await.unwrap());
        assert!(f.store.exists("q:two").await.unwrap());
        assert!(!f.store.exists("conj:post:category_id=1").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalidate_unknown_table_is_noop() {
        let f = fixture(ConjureConfig::default());
        let removed = f
            .invalidator
            .invalidate("ghost", &values(&[("id", 1.into())]), None)
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn test_invalidate_is_idempotent() {
        let f = fixture(ConjureConfig::default());
        cache(&f, "q:one", vec![Disjunction::whole_table("post")]).await;
        let record = values(&[("id", 1.into())]);

        assert_eq!(f.invalidator.invalidate("post", &record, None).await.unwrap(), 1);
        let before = f.store.keys();
        assert_eq!(f.invalidator.invalidate("post", &record, None).await.unwrap(), 0);
        assert_eq!(f.store.keys(), before);
    }

    #[tokio::test]
    async fn test_invalidate_suppressed_for_record() {
        let f = fixture(ConjureConfig::default());
        cache(&f, "q:one", vec![Disjunction::whole_table("post")]).await;

        let removed = without_invalidation(f.invalidator.invalidate(
            "post",
            &values(&[("id", 1.into())]),
            None,
        ))
        .await
        .unwrap();
        assert_eq!(removed, 0);
        assert!(f.store.exists("q:one").await.unwrap());
    }

    #[tokio::test]
    async fn test_suppression_does_not_reach_other_tasks() {
        let f = Arc::new(fixture(ConjureConfig::default()));
        cache(&f, "q:one", vec![Disjunction::whole_table("post")]).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let holder = tokio::spawn(without_invalidation(async move {
            let _ = release_rx.await;
        }));
        tokio::task::yield_now().await;

        let other = Arc::clone(&f);
        let removed = tokio::spawn(async move {
            other
                .invalidator
                .invalidate("post", &values(&[("id", 1.into())]), None)
                .await
                .unwrap()
        })
        .await
        .unwrap();
        assert_eq!(removed, 1);
        assert!(!f.store.exists("q:one").await.unwrap());

        release_tx.send(()).unwrap();
        holder.await.unwrap();
    }

    #[tokio::test]
    async fn test_unchecked_variants_ignore_suppression() {
        let f = fixture(ConjureConfig::default());
        cache(&f, "q:one", vec![Disjunction::whole_table("post")]).await;

        let removed = without_invalidation(f.invalidator.invalidate_now(
            "post",
            &values(&[("id", 1.into())]),
            None,
        ))
        .await
        .unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn test_invalidate_suppressed_in_task_scope() {
        let f = fixture(ConjureConfig::default());
        cache(&f, "q:one", vec![Disjunction::whole_table("post")]).await;

        let removed = without_invalidation(f.invalidator.invalidate_table("post", None))
            .await
            .unwrap();
        assert_eq!(removed, 0);
        assert!(f.store.exists("q:one").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalidate_table_drops_sets_and_keeps_schemes() {
        let f = fixture(ConjureConfig::default());
        for i in 0..3 {
            cache(
                &f,
                &format!("q:{}", i),
                vec![Disjunction::new(
                    "post",
                    vec![Conjunction::new().with("id", i)],
                )],
            )
            .await;
        }
        cache(&f, "q:other", vec![Disjunction::whole_table("comment")]).await;

        let removed = f.invalidator.invalidate_table("post", None).await.unwrap();
        assert_eq!(removed, 3);
        assert_eq!(
            f.store.keys(),
            vec!["conj:comment:", "q:other", "schemes:comment", "schemes:post"]
        );
    }

    #[tokio::test]
    async fn test_invalidate_all_flushes() {
        let f = fixture(ConjureConfig::default());
        cache(&f, "q:one", vec![Disjunction::whole_table("post")]).await;
        f.invalidator.invalidate_all().await.unwrap();
        assert!(f.store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_degrades_to_zero() {
        let f = fixture(ConjureConfig::default().with_failure_policy(FailurePolicy::Degrade));
        f.store.set_available(false);
        let removed = f
            .invalidator
            .invalidate("post", &values(&[("id", 1.into())]), None)
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }
}
