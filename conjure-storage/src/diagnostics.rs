//! Capacity diagnostics.
//!
//! Read-only reports over the keyspace: which conjunction sets and cached
//! payloads are largest, how a table's index is shaped, and how keys spread
//! across routing tags. Every report walks the keyspace with cursor scans,
//! so it can run against a live store; `max_pages` bounds the walk and turns
//! a report into a sample.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;
use std::time::Duration;

use conjure_core::keys::{
    all_cache_pattern, all_conj_pattern, CACHE_KEY_PREFIX, CONJ_KEY_PREFIX, SCHEMES_KEY_PREFIX,
    SIGNAL_SUFFIX,
};
use conjure_core::{ConjureResult, HashTag, KeySpace};
use serde::Serialize;
use tokio::time::Instant;

use crate::gc::DEFAULT_GC_PAGE_SIZE;
use crate::store::Store;

/// What a key holds, judged from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    Cache,
    Conjunction,
    Schemes,
    Signal,
    Other,
}

impl KeyKind {
    pub fn of(key: &str) -> Self {
        let plain = strip_tag(key);
        if plain.ends_with(SIGNAL_SUFFIX) {
            KeyKind::Signal
        } else if plain.starts_with(CACHE_KEY_PREFIX) {
            KeyKind::Cache
        } else if plain.starts_with(CONJ_KEY_PREFIX) {
            KeyKind::Conjunction
        } else if plain.starts_with(SCHEMES_KEY_PREFIX) {
            KeyKind::Schemes
        } else {
            KeyKind::Other
        }
    }
}

/// A key without its leading `{tag}` prefix.
fn strip_tag(key: &str) -> &str {
    if key.starts_with('{') {
        if let Some(close) = key.find('}') {
            return &key[close + 1..];
        }
    }
    key
}

/// A key and its size (members for sets, bytes for payloads).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SizedKey {
    pub key: String,
    pub size: u64,
}

/// Largest items seen during a scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopReport {
    /// Largest first.
    pub top: Vec<SizedKey>,
    /// Keys examined.
    pub sampled: u64,
    /// Sum of the sizes of every examined key.
    pub total: u64,
    /// Keyspace pages scanned.
    pub pages: u64,
    #[serde(rename = "runtime_ms", serialize_with = "as_millis")]
    pub runtime: Duration,
}

impl TopReport {
    pub fn average(&self) -> f64 {
        if self.sampled == 0 {
            0.0
        } else {
            self.total as f64 / self.sampled as f64
        }
    }
}

/// Shape of one table's conjunction sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableStats {
    pub table: String,
    pub sets: u64,
    pub members: u64,
    /// Sets found without members. Deleted sets read as empty too, so a
    /// non-zero count on a busy store is expected.
    pub empty: u64,
    pub pages: u64,
}

/// Keys counted under one routing tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TagCount {
    pub cache: u64,
    pub conjunction: u64,
    pub schemes: u64,
    pub signal: u64,
    pub other: u64,
}

impl TagCount {
    fn add(&mut self, kind: KeyKind) {
        match kind {
            KeyKind::Cache => self.cache += 1,
            KeyKind::Conjunction => self.conjunction += 1,
            KeyKind::Schemes => self.schemes += 1,
            KeyKind::Signal => self.signal += 1,
            KeyKind::Other => self.other += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.cache + self.conjunction + self.schemes + self.signal + self.other
    }
}

fn as_millis<S: serde::Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(duration.as_millis() as u64)
}

/// Keeps the `limit` largest keys seen.
struct TopN {
    limit: usize,
    heap: BinaryHeap<Reverse<(u64, String)>>,
}

impl TopN {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            heap: BinaryHeap::with_capacity(limit + 1),
        }
    }

    fn offer(&mut self, size: u64, key: &str) {
        if self.limit == 0 {
            return;
        }
        if self.heap.len() < self.limit {
            self.heap.push(Reverse((size, key.to_string())));
        } else if self.heap.peek().is_some_and(|Reverse((min, _))| size > *min) {
            self.heap.pop();
            self.heap.push(Reverse((size, key.to_string())));
        }
    }

    fn into_sorted(self) -> Vec<SizedKey> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse((size, key))| SizedKey { key, size })
            .collect()
    }
}

/// Read-only keyspace reports.
pub struct Diagnostics<S: Store> {
    store: Arc<S>,
    clustered: bool,
    page_size: usize,
    max_pages: Option<u64>,
}

impl<S: Store> Diagnostics<S> {
    pub fn new(store: Arc<S>, clustered: bool) -> Self {
        Self {
            store,
            clustered,
            page_size: DEFAULT_GC_PAGE_SIZE,
            max_pages: None,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_max_pages(mut self, max_pages: Option<u64>) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// Conjunction sets with the most members.
    #[tracing::instrument(skip(self))]
    pub async fn largest_sets(&self, limit: usize) -> ConjureResult<TopReport> {
        let started = Instant::now();
        let pattern = all_conj_pattern(self.clustered);
        let mut top = TopN::new(limit);
        let mut sampled = 0;
        let mut total = 0;
        let mut pages = 0;
        let mut cursor = 0;

        loop {
            let page = self.store.scan(cursor, &pattern, self.page_size).await?;
            pages += 1;
            for key in page.keys.iter().filter(|k| KeyKind::of(k) == KeyKind::Conjunction) {
                let card = self.store.set_len(key).await?;
                sampled += 1;
                total += card;
                top.offer(card, key);
            }
            cursor = page.cursor;
            if self.done(cursor, pages) {
                break;
            }
        }

        Ok(TopReport {
            top: top.into_sorted(),
            sampled,
            total,
            pages,
            runtime: started.elapsed(),
        })
    }

    /// Cached payloads with the most bytes. Keys that vanish between the
    /// scan and the read are skipped.
    #[tracing::instrument(skip(self))]
    pub async fn largest_keys(&self, limit: usize) -> ConjureResult<TopReport> {
        let started = Instant::now();
        let pattern = all_cache_pattern(self.clustered);
        let mut top = TopN::new(limit);
        let mut sampled = 0;
        let mut total = 0;
        let mut pages = 0;
        let mut cursor = 0;

        loop {
            let page = self.store.scan(cursor, &pattern, self.page_size).await?;
            pages += 1;
            for key in page.keys.iter().filter(|k| KeyKind::of(k) == KeyKind::Cache) {
                let len = self.store.value_len(key).await?;
                if len == 0 {
                    continue;
                }
                sampled += 1;
                total += len;
                top.offer(len, key);
            }
            cursor = page.cursor;
            if self.done(cursor, pages) {
                break;
            }
        }

        Ok(TopReport {
            top: top.into_sorted(),
            sampled,
            total,
            pages,
            runtime: started.elapsed(),
        })
    }

    /// Count the conjunction sets of `table` and their members, across every
    /// routing tag.
    #[tracing::instrument(skip(self))]
    pub async fn table_stats(&self, table: &str) -> ConjureResult<TableStats> {
        let plain = KeySpace::untagged().conj_pattern(table);
        let pattern = if self.clustered {
            format!("*{}", plain)
        } else {
            plain
        };

        let mut stats = TableStats {
            table: table.to_string(),
            ..TableStats::default()
        };
        let mut cursor = 0;
        loop {
            let page = self.store.scan(cursor, &pattern, self.page_size).await?;
            stats.pages += 1;
            for key in &page.keys {
                let card = self.store.set_len(key).await?;
                stats.sets += 1;
                stats.members += card;
                if card == 0 {
                    stats.empty += 1;
                }
            }
            cursor = page.cursor;
            if self.done(cursor, stats.pages) {
                break;
            }
        }
        Ok(stats)
    }

    /// Key counts per routing tag. Untagged keys are listed under `""`.
    #[tracing::instrument(skip(self))]
    pub async fn tag_distribution(&self) -> ConjureResult<BTreeMap<String, TagCount>> {
        let mut counts: BTreeMap<String, TagCount> = BTreeMap::new();
        let mut cursor = 0;
        let mut pages = 0;
        loop {
            let page = self.store.scan(cursor, "*", self.page_size).await?;
            pages += 1;
            for key in &page.keys {
                let tag = if key.starts_with('{') {
                    HashTag::extract(key).unwrap_or_default()
                } else {
                    ""
                };
                counts.entry(tag.to_string()).or_default().add(KeyKind::of(key));
            }
            cursor = page.cursor;
            if self.done(cursor, pages) {
                break;
            }
        }
        Ok(counts)
    }

    fn done(&self, cursor: u64, pages: u64) -> bool {
        cursor == 0 || self.max_pages.is_some_and(|max| pages >= max)
    }
}
