//! Hash-tag routing for clustered stores.
//!
//! A sharded store hashes only the `{...}` part of a key when one is present.
//! Every key touching one logical shard (cache entries, conjunction sets,
//! scheme sets, lock signals) gets the same `{tag}` prefix so multi-key
//! scripts can run on a single node. Without clustering the tag is empty and
//! keys are written exactly as the plain key scheme describes.

use std::fmt;
use std::sync::Arc;

use crate::error::{ConfigError, ProtocolError};

/// Derives the routing tag value from an optional shard-routing value
/// (typically a tenant identifier).
pub type TagFn = Arc<dyn Fn(Option<&str>) -> String + Send + Sync>;

// ============================================================================
// HASH TAG
// ============================================================================

/// A `{tag}` key prefix, or the empty prefix when routing is off.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct HashTag(String);

impl HashTag {
    /// The empty tag.
    pub fn none() -> Self {
        Self(String::new())
    }

    /// Wrap a tag value in braces. An empty value yields the empty tag.
    pub fn new(value: &str) -> Self {
        if value.is_empty() {
            Self::none()
        } else {
            Self(format!("{{{}}}", value))
        }
    }

    /// The full prefix, including braces.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Prefix a plain key with this tag.
    pub fn apply(&self, key: &str) -> String {
        format!("{}{}", self.0, key)
    }

    /// Extract the hashed section of a key, following the store's rule: the
    /// text between the first `{` and the first `}` after it, if non-empty.
    pub fn extract(key: &str) -> Option<&str> {
        let open = key.find('{')?;
        let rest = &key[open + 1..];
        let close = rest.find('}')?;
        if close == 0 {
            None
        } else {
            Some(&rest[..close])
        }
    }
}

impl fmt::Display for HashTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fail fast when keys handed to one atomic operation would route to
/// different shards.
pub fn ensure_colocated<'a, I>(operation: &str, keys: I) -> Result<(), ProtocolError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut keys = keys.into_iter();
    let first = keys.next().ok_or_else(|| ProtocolError::EmptyKeys {
        operation: operation.to_string(),
    })?;
    let expected = HashTag::extract(first);

    for key in keys {
        let found = HashTag::extract(key);
        if found != expected {
            return Err(ProtocolError::CrossSlot {
                operation: operation.to_string(),
                expected: expected.unwrap_or_default().to_string(),
                found: found.unwrap_or_default().to_string(),
                key: key.to_string(),
            });
        }
    }
    Ok(())
}

// ============================================================================
// ROUTER
// ============================================================================

/// Maps shard-routing values to hash tags.
#[derive(Clone)]
pub struct HashTagRouter {
    tag_fn: Option<TagFn>,
}

impl HashTagRouter {
    /// Router for a non-clustered store: every tag is empty.
    pub fn disabled() -> Self {
        Self { tag_fn: None }
    }

    /// Router for a clustered store.
    pub fn clustered(tag_fn: TagFn) -> Self {
        Self {
            tag_fn: Some(tag_fn),
        }
    }

    /// Build a router from configuration.
    ///
    /// # Errors
    ///
    /// Clustering without a tag function is a configuration error: keys of
    /// one invalidation would scatter across shards.
    pub fn from_config(clustered: bool, tag_fn: Option<TagFn>) -> Result<Self, ConfigError> {
        match (clustered, tag_fn) {
            (false, _) => Ok(Self::disabled()),
            (true, Some(f)) => Ok(Self::clustered(f)),
            (true, None) => Err(ConfigError::MissingRequired {
                field: "tag_fn (required when clustered routing is enabled)".to_string(),
            }),
        }
    }

    pub fn is_clustered(&self) -> bool {
        self.tag_fn.is_some()
    }

    /// Tag for a shard-routing value.
    pub fn tag_for(&self, routing: Option<&str>) -> HashTag {
        match &self.tag_fn {
            Some(f) => HashTag::new(&f(routing)),
            None => HashTag::none(),
        }
    }
}

impl Default for HashTagRouter {
    fn default() -> Self {
        Self::disabled()
    }
}

impl fmt::Debug for HashTagRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashTagRouter")
            .field("clustered", &self.is_clustered())
            .finish()
    }
}
