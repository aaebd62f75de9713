//! Configuration for the invalidation index engine.
//!
//! Configuration is loaded from environment variables with defaults suited
//! to a single local store. The routing-tag function is not representable in
//! the environment and is handed to [`crate::HashTagRouter`] directly.

use std::time::Duration;

use crate::error::ConfigError;

// ============================================================================
// DEFAULTS
// ============================================================================

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/";
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_SIGNAL_TTL_SECS: u64 = 1;
pub const DEFAULT_CONJ_TTL_MARGIN_SECS: u64 = 10;

// ============================================================================
// FAILURE POLICY
// ============================================================================

/// How store connection failures surface to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Return the error.
    #[default]
    Propagate,
    /// Log a warning and behave as a cache miss / no-op.
    Degrade,
}

impl FailurePolicy {
    pub fn from_flag(degrade: bool) -> Self {
        if degrade {
            FailurePolicy::Degrade
        } else {
            FailurePolicy::Propagate
        }
    }

    pub fn degrades(&self) -> bool {
        matches!(self, FailurePolicy::Degrade)
    }
}

// ============================================================================
// ENGINE CONFIGURATION
// ============================================================================

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConjureConfig {
    /// Store connection URL.
    pub redis_url: String,

    /// What to do when the store is unreachable.
    pub failure_policy: FailurePolicy,

    /// The store evicts keys on its own (LRU). Conjunction sets then get no
    /// TTL and the garbage collector reclaims stale members instead.
    pub lru: bool,

    /// Keys are routed through hash tags.
    pub clustered: bool,

    /// TTL of the dogpile lock sentinel, and the longest a waiter blocks
    /// before re-checking.
    pub lock_timeout: Duration,

    /// TTL of the dogpile wakeup list after a release.
    pub signal_ttl: Duration,

    /// Constant added on top of twice the entry timeout when extending a
    /// conjunction set's TTL.
    pub conj_ttl_margin: Duration,
}

impl Default for ConjureConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            failure_policy: FailurePolicy::Propagate,
            lru: false,
            clustered: false,
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
            signal_ttl: Duration::from_secs(DEFAULT_SIGNAL_TTL_SECS),
            conj_ttl_margin: Duration::from_secs(DEFAULT_CONJ_TTL_MARGIN_SECS),
        }
    }
}

impl ConjureConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create ConjureConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `CONJURE_REDIS_URL`: Store URL (default: redis://127.0.0.1:6379/)
    /// - `CONJURE_DEGRADE_ON_FAILURE`: "true" to degrade on connection failure (default: false)
    /// - `CONJURE_LRU`: "true" when the store evicts keys itself (default: false)
    /// - `CONJURE_CLUSTERED`: "true" to route keys through hash tags (default: false)
    /// - `CONJURE_LOCK_TIMEOUT_SECS`: Dogpile lock TTL (default: 60)
    /// - `CONJURE_SIGNAL_TTL_SECS`: Dogpile signal TTL (default: 1)
    /// - `CONJURE_CONJ_TTL_MARGIN_SECS`: Conjunction TTL margin (default: 10)
    pub fn from_env() -> Self {
        let redis_url =
            std::env::var("CONJURE_REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string());

        let failure_policy = FailurePolicy::from_flag(env_flag("CONJURE_DEGRADE_ON_FAILURE"));
        let lru = env_flag("CONJURE_LRU");
        let clustered = env_flag("CONJURE_CLUSTERED");

        let lock_timeout = Duration::from_secs(env_parse(
            "CONJURE_LOCK_TIMEOUT_SECS",
            DEFAULT_LOCK_TIMEOUT_SECS,
        ));
        let signal_ttl = Duration::from_secs(env_parse(
            "CONJURE_SIGNAL_TTL_SECS",
            DEFAULT_SIGNAL_TTL_SECS,
        ));
        let conj_ttl_margin = Duration::from_secs(env_parse(
            "CONJURE_CONJ_TTL_MARGIN_SECS",
            DEFAULT_CONJ_TTL_MARGIN_SECS,
        ));

        Self {
            redis_url,
            failure_policy,
            lru,
            clustered,
            lock_timeout,
            signal_ttl,
            conj_ttl_margin,
        }
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_lru(mut self, lru: bool) -> Self {
        self.lru = lru;
        self
    }

    pub fn with_clustered(mut self, clustered: bool) -> Self {
        self.clustered = clustered;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_conj_ttl_margin(mut self, margin: Duration) -> Self {
        self.conj_ttl_margin = margin;
        self
    }

    /// Whether conjunction sets get their TTL raised on insert.
    pub fn extends_conj_ttl(&self) -> bool {
        !self.lru
    }

    /// TTL a conjunction set needs to outlive an entry of `timeout`.
    pub fn conj_ttl_for(&self, timeout: Duration) -> Duration {
        timeout * 2 + self.conj_ttl_margin
    }

    /// Check the configuration for values the store would reject.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "redis_url".to_string(),
            });
        }
        if self.lock_timeout.as_secs() == 0 {
            return Err(ConfigError::InvalidValue {
                field: "lock_timeout".to_string(),
                value: format!("{:?}", self.lock_timeout),
                reason: "must be at least one second".to_string(),
            });
        }
        if self.signal_ttl.as_secs() == 0 {
            return Err(ConfigError::InvalidValue {
                field: "signal_ttl".to_string(),
                value: format!("{:?}", self.signal_ttl),
                reason: "must be at least one second".to_string(),
            });
        }
        Ok(())
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|s| matches!(s.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
