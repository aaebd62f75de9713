//! Property-based tests for the invalidation index.
//!
//! **Exact invalidation:** for any set of cached entries and any changed
//! record, invalidation removes every entry indexed under a conjunction the
//! record satisfies and nothing else.
//!
//! **Colocation:** every key generated for one routing value carries the
//! same tag.

use std::collections::BTreeSet;
use std::time::Duration;

use conjure_core::keys::signal_key;
use conjure_storage::{GarbageCollector, GcConfig, Store};
use conjure_test_utils::fixtures::{lru_engine, memory_engine};
use conjure_test_utils::generators::{
    arb_conjunction, arb_disjunction, arb_identity, arb_record_values, arb_tag_value,
};
use conjure_test_utils::{Conjunction, HashTag, HashTagRouter, KeySpace, RecordValues};
use proptest::collection::vec;
use proptest::prelude::*;
use std::sync::Arc;
use tokio::runtime::Runtime;

// ============================================================================
// TEST CONFIGURATION
// ============================================================================

fn test_runtime() -> Result<Runtime, TestCaseError> {
    Runtime::new().map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

/// Whether a record reporting `values` satisfies `conjunction`.
fn satisfies(conjunction: &Conjunction, values: &RecordValues) -> bool {
    conjunction
        .iter()
        .all(|(field, value)| values.get(field) == Some(value))
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_invalidate_removes_exactly_matching_entries(
        deps in vec(arb_disjunction("post".to_string()), 1..8),
        changed in arb_record_values(),
    ) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let engine = memory_engine();
            let mut expected_gone = BTreeSet::new();
            for (i, dep) in deps.iter().enumerate() {
                let key = format!("q:{}", i);
                engine.cache(&key, b"rows", std::slice::from_ref(dep)).await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                if dep.conjunctions.iter().any(|c| satisfies(c, &changed)) {
                    expected_gone.insert(key);
                }
            }

            let removed = engine.invalidator.invalidate("post", &changed, None).await
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            prop_assert_eq!(removed as usize, expected_gone.len());

            for i in 0..deps.len() {
                let key = format!("q:{}", i);
                let exists = engine.store.exists(&key).await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                prop_assert_eq!(exists, !expected_gone.contains(&key), "entry {}", key);
            }

            let again = engine.invalidator.invalidate("post", &changed, None).await
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            prop_assert_eq!(again, 0);
            Ok::<(), TestCaseError>(())
        })?;
    }

    #[test]
    fn prop_gc_converges_in_one_sweep(
        conjunctions in vec(arb_conjunction(), 1..6),
        evicted in vec(any::<bool>(), 6),
    ) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let engine = lru_engine();
            for (i, conjunction) in conjunctions.iter().enumerate() {
                let dep = conjure_test_utils::Disjunction::new("post", vec![conjunction.clone()]);
                let key = format!("q:{}", i);
                engine.cache(&key, b"rows", &[dep]).await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                if evicted[i] {
                    engine.store.evict(&key);
                }
            }

            let gc = GarbageCollector::new(Arc::clone(&engine.store), GcConfig::development(), false);
            let first = gc.sweep().await;
            prop_assert_eq!(first.errors, 0);

            let after_first = engine.store.keys();
            let second = gc.sweep().await;
            prop_assert_eq!(second.deleted_items, 0);
            prop_assert_eq!(second.deleted_sets, 0);
            prop_assert_eq!(engine.store.keys(), after_first);
            Ok::<(), TestCaseError>(())
        })?;
    }

    #[test]
    fn prop_keys_for_one_routing_value_share_tag(
        tenant in arb_tag_value(),
        identity in arb_identity(),
        conjunction in arb_conjunction(),
    ) {
        let router = HashTagRouter::clustered(Arc::new(|routing: Option<&str>| {
            routing.unwrap_or_default().to_string()
        }));
        let keys = KeySpace::new(router.tag_for(Some(&tenant)));
        let cache_key = keys.cache_key(&identity);

        let generated = [
            cache_key.clone(),
            keys.conj_key("post", &conjunction),
            keys.schemes_key("post"),
            signal_key(&cache_key),
        ];
        for key in &generated {
            prop_assert_eq!(HashTag::extract(key), Some(tenant.as_str()));
            prop_assert!(key.starts_with(HashTag::new(&tenant).as_str()));
        }
    }
}
