//! Conjure Storage - Invalidation Index Engine
//!
//! The store-facing half of conjure: the [`Store`] abstraction with its
//! Redis and in-memory backends, and the engine built on it.
//!
//! - [`ConjunctionIndexer`] writes a cached result and registers it under
//!   every conjunction it depends on.
//! - [`Invalidator`] removes the entries a changed record could affect.
//! - [`DogpileLock`] makes recomputation on a miss single-flight.
//! - [`GarbageCollector`] prunes stale members when the store evicts on its
//!   own.
//! - [`QueryCache`] wires the read path together.

mod degrade;

pub mod deferred;
pub mod diagnostics;
pub mod dogpile;
pub mod events;
pub mod gc;
pub mod indexer;
pub mod invalidation;
pub mod read_through;
pub mod store;

pub use deferred::{PendingInvalidation, TransactionQueue};
pub use diagnostics::{Diagnostics, KeyKind, SizedKey, TableStats, TagCount, TopReport};
pub use dogpile::{Computed, DogpileLock, Lookup, LOCK_SENTINEL};
pub use events::{BatchingObserver, CacheEvent, CacheObserver, NoopObserver, TracingObserver};
pub use gc::{gc_task, GarbageCollector, GcConfig, GcMetrics, GcSnapshot, GcStats};
pub use indexer::{ConjunctionIndexer, IndexReport};
pub use invalidation::{conj_keys_for, Invalidator};
pub use read_through::{Fetched, QueryCache};
pub use store::{
    ConjunctionWrite, KeyTtl, MemoryStore, PruneOutcome, RedisStore, ScanPage, Store,
    TtlExtension,
};
