//! LRU garbage collector for conjunction sets.
//!
//! When the store evicts cache entries on its own (LRU mode), conjunction
//! sets carry no TTL and keep pointing at entries that no longer exist. The
//! collector walks every conjunction set page by page, removes members whose
//! entry is gone and deletes sets that end up empty. Each page is pruned in
//! one atomic store call, so a concurrent registration is never lost.
//!
//! # Configuration
//!
//! ```rust
//! use conjure_storage::gc::GcConfig;
//! use std::time::Duration;
//!
//! let config = GcConfig {
//!     page_size: 1000,                           // SCAN / SSCAN count hint
//!     interval: Duration::from_millis(100),      // Pause between bursts
//!     wait_pages: 100,                           // Pages per burst
//!     max_pages: None,                           // No limit
//!     check_interval: Duration::from_secs(300),  // Background sweep period
//! };
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conjure_core::keys::all_conj_pattern;
use conjure_core::{ConfigError, ConjureConfig, ConjureResult};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::store::Store;

// ============================================================================
// DEFAULTS
// ============================================================================

pub const DEFAULT_GC_PAGE_SIZE: usize = 1000;
pub const DEFAULT_GC_INTERVAL_MS: u64 = 100;
pub const DEFAULT_GC_WAIT_PAGES: u64 = 100;
pub const DEFAULT_GC_CHECK_INTERVAL_SECS: u64 = 300;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the garbage collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcConfig {
    /// Count hint for each keyspace and set scan (default: 1000)
    pub page_size: usize,

    /// Pause after every `wait_pages` pages (default: 100ms)
    pub interval: Duration,

    /// Pages processed between pauses; `0` never pauses (default: 100)
    pub wait_pages: u64,

    /// Stop a sweep after this many pages (default: unlimited)
    pub max_pages: Option<u64>,

    /// Period of the background task (default: 5 minutes)
    pub check_interval: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_GC_PAGE_SIZE,
            interval: Duration::from_millis(DEFAULT_GC_INTERVAL_MS),
            wait_pages: DEFAULT_GC_WAIT_PAGES,
            max_pages: None,
            check_interval: Duration::from_secs(DEFAULT_GC_CHECK_INTERVAL_SECS),
        }
    }
}

impl GcConfig {
    /// Create GcConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `CONJURE_GC_PAGE_SIZE`: Scan count hint (default: 1000)
    /// - `CONJURE_GC_INTERVAL_MS`: Pause between bursts (default: 100)
    /// - `CONJURE_GC_WAIT_PAGES`: Pages per burst (default: 100)
    /// - `CONJURE_GC_MAX_PAGES`: Page limit per sweep (default: unlimited)
    /// - `CONJURE_GC_CHECK_INTERVAL_SECS`: Background sweep period (default: 300)
    pub fn from_env() -> Self {
        let page_size = std::env::var("CONJURE_GC_PAGE_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_GC_PAGE_SIZE);

        let interval = Duration::from_millis(
            std::env::var("CONJURE_GC_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_GC_INTERVAL_MS),
        );

        let wait_pages = std::env::var("CONJURE_GC_WAIT_PAGES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_GC_WAIT_PAGES);

        let max_pages = std::env::var("CONJURE_GC_MAX_PAGES")
            .ok()
            .and_then(|s| s.parse().ok());

        let check_interval = Duration::from_secs(
            std::env::var("CONJURE_GC_CHECK_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_GC_CHECK_INTERVAL_SECS),
        );

        Self {
            page_size,
            interval,
            wait_pages,
            max_pages,
            check_interval,
        }
    }

    /// Small pages and no pauses, for tests and local stores.
    pub fn development() -> Self {
        Self {
            page_size: 100,
            interval: Duration::ZERO,
            wait_pages: 0,
            max_pages: None,
            check_interval: Duration::from_secs(10),
        }
    }

    /// Gentler pacing for a store that also serves traffic.
    pub fn production() -> Self {
        Self {
            page_size: DEFAULT_GC_PAGE_SIZE,
            interval: Duration::from_millis(250),
            wait_pages: 50,
            max_pages: None,
            check_interval: Duration::from_secs(900),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_wait_pages(mut self, wait_pages: u64) -> Self {
        self.wait_pages = wait_pages;
        self
    }

    pub fn with_max_pages(mut self, max_pages: Option<u64>) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }
}

// ============================================================================
// STATS
// ============================================================================

/// Counters for one sweep. They are observability data: a page that fails
/// halfway may be counted again on the next sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
    /// Set members examined
    pub processed: u64,
    /// Members removed because their entry was gone
    pub deleted_items: u64,
    /// Sets deleted because they became empty
    pub deleted_sets: u64,
    /// Failed scans and prunes
    pub errors: u64,
    /// Bytes of member names reclaimed
    pub bytes: u64,
    /// Set pages pruned
    pub pages: u64,
    /// Conjunction sets visited
    pub keys: u64,
    #[serde(rename = "runtime_ms", serialize_with = "as_millis")]
    pub runtime: Duration,
}

fn as_millis<S: serde::Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(duration.as_millis() as u64)
}

impl GcStats {
    /// Fold another sweep's counters into these. Runtime is left alone.
    pub fn merge(&mut self, other: &GcStats) {
        self.processed += other.processed;
        self.deleted_items += other.deleted_items;
        self.deleted_sets += other.deleted_sets;
        self.errors += other.errors;
        self.bytes += other.bytes;
        self.pages += other.pages;
        self.keys += other.keys;
    }

    /// Share of processed members and sets that were deleted.
    pub fn deleted_percent(&self) -> f64 {
        if self.processed == 0 {
            return 0.0;
        }
        (self.deleted_items + self.deleted_sets) as f64 / self.processed as f64 * 100.0
    }

    pub fn bytes_per_sec(&self) -> f64 {
        per_sec(self.bytes, self.runtime)
    }

    pub fn items_per_sec(&self) -> f64 {
        per_sec(self.processed, self.runtime)
    }
}

fn per_sec(count: u64, runtime: Duration) -> f64 {
    let secs = runtime.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Totals across the sweeps of a background task.
#[derive(Debug, Default)]
pub struct GcMetrics {
    pub sweeps: AtomicU64,
    pub processed: AtomicU64,
    pub deleted_items: AtomicU64,
    pub deleted_sets: AtomicU64,
    pub bytes: AtomicU64,
    pub errors: AtomicU64,
}

impl GcMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, stats: &GcStats) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(stats.processed, Ordering::Relaxed);
        self.deleted_items
            .fetch_add(stats.deleted_items, Ordering::Relaxed);
        self.deleted_sets.fetch_add(stats.deleted_sets, Ordering::Relaxed);
        self.bytes.fetch_add(stats.bytes, Ordering::Relaxed);
        self.errors.fetch_add(stats.errors, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GcSnapshot {
        GcSnapshot {
            sweeps: self.sweeps.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            deleted_items: self.deleted_items.load(Ordering::Relaxed),
            deleted_sets: self.deleted_sets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`GcMetrics`] at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GcSnapshot {
    pub sweeps: u64,
    pub processed: u64,
    pub deleted_items: u64,
    pub deleted_sets: u64,
    pub bytes: u64,
    pub errors: u64,
}

// ============================================================================
// COLLECTOR
// ============================================================================

/// Sweeps stale members out of conjunction sets.
pub struct GarbageCollector<S: Store> {
    store: Arc<S>,
    config: GcConfig,
    clustered: bool,
}

/// Page budget and pacing shared by every scan of one sweep.
struct Pacer<'a> {
    config: &'a GcConfig,
    pages: u64,
}

impl<'a> Pacer<'a> {
    fn new(config: &'a GcConfig) -> Self {
        Self { config, pages: 0 }
    }

    fn exhausted(&self) -> bool {
        self.config.max_pages.is_some_and(|max| self.pages >= max)
    }

    /// Count a page and pause when a burst is complete.
    async fn page_done(&mut self) {
        self.pages += 1;
        let wait = self.config.wait_pages;
        if wait > 0 && self.pages % wait == 0 && !self.config.interval.is_zero() {
            tokio::time::sleep(self.config.interval).await;
        }
    }
}

impl<S: Store> GarbageCollector<S> {
    pub fn new(store: Arc<S>, config: GcConfig, clustered: bool) -> Self {
        Self {
            store,
            config,
            clustered,
        }
    }

    /// Build a collector for a deployment, refusing when the store does not
    /// evict on its own. Outside LRU mode conjunction sets expire by TTL and
    /// there is nothing to collect.
    pub fn for_deployment(
        store: Arc<S>,
        config: GcConfig,
        deployment: &ConjureConfig,
    ) -> Result<Self, ConfigError> {
        if !deployment.lru {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "gc".to_string(),
                option_b: "lru=false".to_string(),
            });
        }
        Ok(Self::new(store, config, deployment.clustered))
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Sweep a single conjunction set, honoring the page limit.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_key(&self, conj_key: &str) -> GcStats {
        let started = Instant::now();
        let mut pacer = Pacer::new(&self.config);
        let mut stats = self.sweep_members(conj_key, &mut pacer).await;
        stats.runtime = started.elapsed();
        stats
    }

    async fn sweep_members(&self, conj_key: &str, pacer: &mut Pacer<'_>) -> GcStats {
        let mut stats = GcStats {
            keys: 1,
            ..GcStats::default()
        };
        let mut cursor = 0;

        loop {
            let page = match self
                .store
                .scan_set(conj_key, cursor, self.config.page_size)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(conj_key, error = %e, "Failed to scan conjunction set");
                    stats.errors += 1;
                    break;
                }
            };

            match self.store.prune_set(conj_key, &page.keys).await {
                Ok(outcome) => {
                    stats.processed += outcome.processed;
                    stats.deleted_items += outcome.removed;
                    stats.deleted_sets += u64::from(outcome.set_deleted);
                    stats.bytes += outcome.bytes_freed;
                }
                Err(e) => {
                    tracing::warn!(conj_key, error = %e, "Failed to prune conjunction set page");
                    stats.errors += 1;
                }
            }
            stats.pages += 1;
            pacer.page_done().await;

            cursor = page.cursor;
            if page.is_last() || pacer.exhausted() {
                break;
            }
        }
        stats
    }

    /// Sweep every set listed on one keyspace scan page.
    ///
    /// Returns the next keyspace cursor (`0` when the scan is complete)
    /// together with the page's counters. Sets are swept to the end; the
    /// page limit is not applied here.
    pub async fn sweep_page(&self, cursor: u64) -> ConjureResult<(u64, GcStats)> {
        let started = Instant::now();
        let unlimited = GcConfig {
            max_pages: None,
            ..self.config.clone()
        };
        let mut pacer = Pacer::new(&unlimited);
        let (next, mut stats) = self.sweep_scan_page(cursor, &mut pacer).await?;
        stats.runtime = started.elapsed();
        Ok((next, stats))
    }

    async fn sweep_scan_page(
        &self,
        cursor: u64,
        pacer: &mut Pacer<'_>,
    ) -> ConjureResult<(u64, GcStats)> {
        let page = self
            .store
            .scan(cursor, &all_conj_pattern(self.clustered), self.config.page_size)
            .await?;

        let mut stats = GcStats::default();
        for conj_key in &page.keys {
            stats.merge(&self.sweep_members(conj_key, pacer).await);
            if pacer.exhausted() {
                break;
            }
        }
        Ok((page.cursor, stats))
    }

    /// Sweep every conjunction set in the store.
    ///
    /// Stops early once `max_pages` set pages have been pruned. A failed
    /// keyspace scan ends the sweep with the error counted; failed prunes are
    /// counted and skipped.
    #[tracing::instrument(skip(self), fields(processed, deleted_items, errors))]
    pub async fn sweep(&self) -> GcStats {
        let started = Instant::now();
        let mut pacer = Pacer::new(&self.config);
        let mut stats = GcStats::default();
        let mut cursor = 0;

        loop {
            match self.sweep_scan_page(cursor, &mut pacer).await {
                Ok((next, page_stats)) => {
                    stats.merge(&page_stats);
                    cursor = next;
                }
                Err(e) => {
                    tracing::warn!(cursor, error = %e, "Keyspace scan failed, ending sweep");
                    stats.errors += 1;
                    break;
                }
            }
            if cursor == 0 || pacer.exhausted() {
                break;
            }
        }

        stats.runtime = started.elapsed();
        let span = tracing::Span::current();
        span.record("processed", stats.processed);
        span.record("deleted_items", stats.deleted_items);
        span.record("errors", stats.errors);
        stats
    }
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Run [`GarbageCollector::sweep`] every `check_interval` until shutdown.
///
/// A sweep in progress finishes before the shutdown is observed.
///
/// # Example
///
/// ```ignore
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// let gc = Arc::new(GarbageCollector::for_deployment(store, GcConfig::from_env(), &config)?);
///
/// let handle = tokio::spawn(gc_task(gc, shutdown_rx));
///
/// // Later, trigger shutdown
/// let _ = shutdown_tx.send(true);
/// let metrics = handle.await?;
/// ```
pub async fn gc_task<S: Store + 'static>(
    gc: Arc<GarbageCollector<S>>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<GcMetrics> {
    let metrics = Arc::new(GcMetrics::new());

    let mut sweep_interval = interval(gc.config.check_interval);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        check_interval_secs = gc.config.check_interval.as_secs(),
        page_size = gc.config.page_size,
        "Conjunction GC task started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Conjunction GC task shutting down");
                    break;
                }
            }

            _ = sweep_interval.tick() => {
                let stats = gc.sweep().await;
                metrics.record(&stats);
                if stats.deleted_items > 0 || stats.errors > 0 {
                    tracing::info!(
                        processed = stats.processed,
                        deleted_items = stats.deleted_items,
                        deleted_sets = stats.deleted_sets,
                        errors = stats.errors,
                        "Conjunction GC sweep completed"
                    );
                } else {
                    tracing::trace!(processed = stats.processed, "Conjunction GC sweep found nothing stale");
                }
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        sweeps = snapshot.sweeps,
        processed = snapshot.processed,
        deleted_items = snapshot.deleted_items,
        deleted_sets = snapshot.deleted_sets,
        errors = snapshot.errors,
        "Conjunction GC task completed"
    );

    metrics
}
