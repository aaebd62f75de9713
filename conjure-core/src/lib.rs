//! Conjure Core - Key Model and Contracts
//!
//! Pure building blocks of the invalidation index: the conjunction model,
//! key fingerprinting, hash-tag routing, configuration, invalidation
//! suppression scopes and the error taxonomy. Nothing in this crate talks to
//! a store; `conjure-storage` builds the engine on top of it.

pub mod config;
pub mod conjunction;
pub mod error;
pub mod keys;
pub mod query;
pub mod suppress;
pub mod tag;

pub use config::{ConjureConfig, FailurePolicy};
pub use conjunction::{Conjunction, Disjunction, FieldValue, RecordValues, Scheme};
pub use error::{
    CodecError, ConfigError, ConjureError, ConjureResult, ProtocolError, StoreError,
};
pub use keys::KeySpace;
pub use query::CacheableQuery;
pub use suppress::{
    is_suppressed, suppress_invalidation, suppression_depth, without_invalidation,
    SuppressionGuard,
};
pub use tag::{ensure_colocated, HashTag, HashTagRouter, TagFn};
