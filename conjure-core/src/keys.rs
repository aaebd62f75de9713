//! Key fingerprinting and naming.
//!
//! Key layout (each optionally prefixed with a `{tag}`):
//!
//! ```text
//! q:<fingerprint>                       cached query result
//! conj:<table>:<f1>=<v1>&<f2>=<v2>      set of cache keys depending on a conjunction
//! schemes:<table>                       set of conjunction schemes seen for a table
//! <key>:signal                          dogpile wakeup list for <key>
//! ```

use sha2::{Digest, Sha256};

use crate::conjunction::Conjunction;
use crate::tag::HashTag;

pub const CACHE_KEY_PREFIX: &str = "q:";
pub const CONJ_KEY_PREFIX: &str = "conj:";
pub const SCHEMES_KEY_PREFIX: &str = "schemes:";
pub const SIGNAL_SUFFIX: &str = ":signal";

/// Hex length of a query fingerprint (128 bits).
pub const FINGERPRINT_LEN: usize = 32;

/// Stable fingerprint of a query identity.
pub fn fingerprint(identity: &str) -> String {
    let digest = Sha256::digest(identity.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(FINGERPRINT_LEN);
    hex
}

/// `q:<fingerprint>` for a query identity.
pub fn cache_key(identity: &str) -> String {
    format!("{}{}", CACHE_KEY_PREFIX, fingerprint(identity))
}

/// `conj:<table>:<encoded conjunction>`.
pub fn conj_key(table: &str, conjunction: &Conjunction) -> String {
    format!("{}{}:{}", CONJ_KEY_PREFIX, table, conjunction.encode())
}

/// `schemes:<table>`.
pub fn schemes_key(table: &str) -> String {
    format!("{}{}", SCHEMES_KEY_PREFIX, table)
}

/// `<key>:signal`. The signal inherits whatever tag `key` carries.
pub fn signal_key(key: &str) -> String {
    format!("{}{}", key, SIGNAL_SUFFIX)
}

// ============================================================================
// KEY SPACE
// ============================================================================

/// Key builder bound to one routing tag.
///
/// All keys produced by one `KeySpace` share the same hash tag, so they can
/// be combined in a single atomic script on a clustered store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySpace {
    tag: HashTag,
}

impl KeySpace {
    pub fn new(tag: HashTag) -> Self {
        Self { tag }
    }

    /// Key space for a non-clustered store.
    pub fn untagged() -> Self {
        Self::default()
    }

    pub fn tag(&self) -> &HashTag {
        &self.tag
    }

    pub fn cache_key(&self, identity: &str) -> String {
        self.tag.apply(&cache_key(identity))
    }

    pub fn conj_key(&self, table: &str, conjunction: &Conjunction) -> String {
        self.tag.apply(&conj_key(table, conjunction))
    }

    pub fn schemes_key(&self, table: &str) -> String {
        self.tag.apply(&schemes_key(table))
    }

    /// Scan pattern matching every conjunction set of `table` in this space.
    pub fn conj_pattern(&self, table: &str) -> String {
        format!(
            "{}{}{}:*",
            glob_escape(self.tag.as_str()),
            CONJ_KEY_PREFIX,
            glob_escape(table)
        )
    }
}

/// Scan pattern matching every conjunction set, tagged or not.
pub fn all_conj_pattern(clustered: bool) -> String {
    if clustered {
        format!("*{}*", CONJ_KEY_PREFIX)
    } else {
        format!("{}*", CONJ_KEY_PREFIX)
    }
}

/// Scan pattern matching every cached query result, tagged or not.
pub fn all_cache_pattern(clustered: bool) -> String {
    if clustered {
        format!("*{}*", CACHE_KEY_PREFIX)
    } else {
        format!("{}*", CACHE_KEY_PREFIX)
    }
}

/// Escape glob metacharacters so a table name matches literally.
fn glob_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
