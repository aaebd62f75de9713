//! Cacheable query descriptor handed over by the query-normalization layer.

use std::time::Duration;

use crate::conjunction::Disjunction;

/// A query that has been judged cacheable, with its dependencies already
/// normalized into per-table disjunctions.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheableQuery {
    /// Stable identity of the query (normalized SQL, a serialized plan...).
    pub identity: String,
    /// Shard-routing value, when the deployment is clustered.
    pub routing: Option<String>,
    /// Lifetime of the cached result.
    pub timeout: Duration,
    /// Conjunctions whose matching records the result depends on.
    pub dependencies: Vec<Disjunction>,
}

impl CacheableQuery {
    pub fn new(identity: impl Into<String>, timeout: Duration) -> Self {
        Self {
            identity: identity.into(),
            routing: None,
            timeout,
            dependencies: Vec::new(),
        }
    }

    pub fn with_routing(mut self, routing: impl Into<String>) -> Self {
        self.routing = Some(routing.into());
        self
    }

    pub fn depends_on(mut self, disjunction: Disjunction) -> Self {
        self.dependencies.push(disjunction);
        self
    }

    /// Tables this query reads from.
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().map(|d| d.table.as_str())
    }
}
