//! Conjure Test Utilities
//!
//! Shared test infrastructure for the conjure workspace:
//! - Proptest generators for the conjunction model
//! - Fixtures wiring the engine over an in-memory store
//! - Assertions for index invariants

pub use conjure_core::{
    CacheableQuery, Conjunction, ConjureConfig, ConjureError, ConjureResult, Disjunction,
    FailurePolicy, FieldValue, HashTag, HashTagRouter, KeySpace, RecordValues, Scheme,
};
pub use conjure_storage::{
    ConjunctionIndexer, Invalidator, KeyTtl, MemoryStore, QueryCache, Store,
};

use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for conjunction model types.

    use super::*;
    use proptest::collection::{btree_map, vec};
    use proptest::prelude::*;

    /// Table names: short lowercase identifiers.
    pub fn arb_table() -> impl Strategy<Value = String> {
        "[a-z][a-z_]{0,9}"
    }

    /// Field names drawn from a small pool so conjunctions overlap.
    pub fn arb_field() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("id".to_string()),
            Just("category_id".to_string()),
            Just("author_id".to_string()),
            Just("visible".to_string()),
            Just("status".to_string()),
        ]
    }

    /// Scalar values without `&` or `=`, which would be ambiguous inside a
    /// conjunction key. Strings never spell another variant's canonical form.
    pub fn arb_field_value() -> impl Strategy<Value = FieldValue> {
        prop_oneof![
            Just(FieldValue::Null),
            any::<bool>().prop_map(FieldValue::Bool),
            (0i64..20).prop_map(FieldValue::Int),
            "s[a-z]{0,5}".prop_map(FieldValue::Str),
        ]
    }

    pub fn arb_conjunction() -> impl Strategy<Value = Conjunction> {
        btree_map(arb_field(), arb_field_value(), 0..3)
            .prop_map(|pairs| pairs.into_iter().collect::<Conjunction>())
    }

    /// A record reporting every field in the pool.
    pub fn arb_record_values() -> impl Strategy<Value = RecordValues> {
        (
            arb_field_value(),
            arb_field_value(),
            arb_field_value(),
            arb_field_value(),
            arb_field_value(),
        )
            .prop_map(|(id, category_id, author_id, visible, status)| {
                [
                    ("id", id),
                    ("category_id", category_id),
                    ("author_id", author_id),
                    ("visible", visible),
                    ("status", status),
                ]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect::<RecordValues>()
            })
    }

    pub fn arb_disjunction(table: String) -> impl Strategy<Value = Disjunction> {
        vec(arb_conjunction(), 1..4).prop_map(move |conjunctions| {
            Disjunction::new(table.clone(), conjunctions)
        })
    }

    /// Stored scheme strings, occasionally with stray separators.
    pub fn arb_scheme_raw() -> impl Strategy<Value = String> {
        vec(prop_oneof![arb_field(), Just(String::new())], 0..4).prop_map(|f| f.join(","))
    }

    /// Tag values as a routing function might produce them.
    pub fn arb_tag_value() -> impl Strategy<Value = String> {
        "[a-z0-9]{1,8}"
    }

    /// Query identities.
    pub fn arb_identity() -> impl Strategy<Value = String> {
        "select \\* from [a-z]{1,8} where [a-z_]{1,8} = [0-9]{1,4}"
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-wired engine pieces over a [`MemoryStore`].

    use super::*;

    /// Default entry timeout for fixtures.
    pub const ENTRY_TIMEOUT: Duration = Duration::from_secs(60);

    /// The indexer and invalidator sharing one in-memory store.
    pub struct MemoryEngine {
        pub store: Arc<MemoryStore>,
        pub config: ConjureConfig,
        pub indexer: ConjunctionIndexer<MemoryStore>,
        pub invalidator: Invalidator<MemoryStore>,
    }

    impl MemoryEngine {
        pub fn new(config: ConjureConfig) -> Self {
            Self::with_router(config, HashTagRouter::disabled())
        }

        pub fn with_router(config: ConjureConfig, router: HashTagRouter) -> Self {
            let store = Arc::new(MemoryStore::new());
            Self {
                indexer: ConjunctionIndexer::new(Arc::clone(&store), config.clone()),
                invalidator: Invalidator::new(Arc::clone(&store), router, config.clone()),
                store,
                config,
            }
        }

        /// Cache `data` under `cache_key` with [`ENTRY_TIMEOUT`].
        pub async fn cache(
            &self,
            cache_key: &str,
            data: &[u8],
            dependencies: &[Disjunction],
        ) -> ConjureResult<()> {
            self.indexer
                .index(cache_key, data, ENTRY_TIMEOUT, dependencies)
                .await
                .map(|_| ())
        }

        pub fn query_cache(&self, router: HashTagRouter) -> QueryCache<MemoryStore> {
            QueryCache::new(Arc::clone(&self.store), router, self.config.clone())
        }
    }

    /// Engine with TTL-managed conjunction sets.
    pub fn memory_engine() -> MemoryEngine {
        MemoryEngine::new(ConjureConfig::default())
    }

    /// Engine for a store that evicts on its own.
    pub fn lru_engine() -> MemoryEngine {
        MemoryEngine::new(ConjureConfig::default().with_lru(true))
    }

    /// Router tagging keys with the routing value, or `shared` without one.
    pub fn tenant_router() -> HashTagRouter {
        HashTagRouter::clustered(Arc::new(|routing: Option<&str>| {
            routing.unwrap_or("shared").to_string()
        }))
    }

    /// One conjunction over `pairs` on `table`.
    pub fn dependency(table: &str, pairs: &[(&str, FieldValue)]) -> Disjunction {
        Disjunction::new(
            table,
            vec![pairs.iter().map(|(k, v)| (*k, v.clone())).collect()],
        )
    }

    pub fn record(pairs: &[(&str, FieldValue)]) -> RecordValues {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Checks for index invariants.

    use super::*;

    /// A conjunction set must outlive every entry registered in it.
    pub async fn assert_set_outlives_entry<S: Store>(store: &S, conj_key: &str, cache_key: &str) {
        let set = store.ttl(conj_key).await.expect("read set ttl");
        let entry = store.ttl(cache_key).await.expect("read entry ttl");
        match (set, entry) {
            (KeyTtl::Persistent, _) | (_, KeyTtl::Missing) => {}
            (KeyTtl::Expires(set), KeyTtl::Expires(entry)) => assert!(
                set >= entry,
                "{} expires in {:?}, before {} ({:?})",
                conj_key,
                set,
                cache_key,
                entry
            ),
            (set, entry) => panic!(
                "{} has ttl {:?} while {} has {:?}",
                conj_key, set, cache_key, entry
            ),
        }
    }

    /// The members of `conj_key` are exactly `expected`, in any order.
    pub async fn assert_members<S: Store>(store: &S, conj_key: &str, expected: &[&str]) {
        let mut members = store.set_members(conj_key).await.expect("read members");
        members.sort();
        let mut expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
        expected.sort();
        assert_eq!(members, expected, "members of {}", conj_key);
    }
}
