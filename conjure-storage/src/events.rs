//! Cache events and observers.
//!
//! The engine reports hits, misses, new entries and invalidations to a
//! [`CacheObserver`]. The default [`TracingObserver`] emits them as
//! structured log events; [`BatchingObserver`] groups them for a sink such
//! as an analytics pipeline.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use conjure_core::RecordValues;
use serde::Serialize;

/// Something the cache engine did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CacheEvent {
    Hit {
        cache_key: String,
    },
    Miss {
        cache_key: String,
    },
    Created {
        cache_key: String,
        tables: Vec<String>,
    },
    Invalidated {
        table: String,
        values: RecordValues,
        removed: u64,
        #[serde(rename = "duration_ms", serialize_with = "as_millis")]
        duration: Duration,
    },
    TableInvalidated {
        table: String,
        removed: u64,
    },
    Flushed,
}

fn as_millis<S: serde::Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(duration.as_millis() as u64)
}

impl CacheEvent {
    /// Table the event concerns, if any.
    pub fn table(&self) -> Option<&str> {
        match self {
            CacheEvent::Invalidated { table, .. } | CacheEvent::TableInvalidated { table, .. } => {
                Some(table)
            }
            _ => None,
        }
    }
}

/// Receives engine events. Implementations must not block.
pub trait CacheObserver: Send + Sync {
    fn on_event(&self, event: &CacheEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl CacheObserver for NoopObserver {
    fn on_event(&self, _event: &CacheEvent) {}
}

/// Emits events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl CacheObserver for TracingObserver {
    fn on_event(&self, event: &CacheEvent) {
        match event {
            CacheEvent::Hit { cache_key } => tracing::trace!(cache_key = %cache_key, "Cache hit"),
            CacheEvent::Miss { cache_key } => tracing::trace!(cache_key = %cache_key, "Cache miss"),
            CacheEvent::Created { cache_key, tables } => {
                tracing::debug!(cache_key = %cache_key, tables = ?tables, "Cache entry created")
            }
            CacheEvent::Invalidated {
                table,
                values,
                removed,
                duration,
            } => tracing::debug!(
                table = %table,
                values = ?values,
                removed,
                duration_ms = duration.as_millis() as u64,
                "Invalidated entries for record"
            ),
            CacheEvent::TableInvalidated { table, removed } => {
                tracing::info!(table = %table, removed, "Invalidated entries for table")
            }
            CacheEvent::Flushed => tracing::info!("Flushed cache store"),
        }
    }
}

type BatchSink = Box<dyn Fn(Vec<CacheEvent>) + Send + Sync>;

/// Buffers events and hands them to a sink in batches.
///
/// Invalidation events can be limited to a set of tables; events that carry
/// no table always pass.
pub struct BatchingObserver {
    batch_size: usize,
    tables: Option<HashSet<String>>,
    buffer: Mutex<Vec<CacheEvent>>,
    sink: BatchSink,
}

impl BatchingObserver {
    pub fn new(batch_size: usize, sink: impl Fn(Vec<CacheEvent>) + Send + Sync + 'static) -> Self {
        Self {
            batch_size: batch_size.max(1),
            tables: None,
            buffer: Mutex::new(Vec::new()),
            sink: Box::new(sink),
        }
    }

    /// Only forward table events for these tables.
    pub fn with_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables = Some(tables.into_iter().map(Into::into).collect());
        self
    }

    fn accepts(&self, event: &CacheEvent) -> bool {
        match (&self.tables, event.table()) {
            (Some(tables), Some(table)) => tables.contains(table),
            _ => true,
        }
    }

    /// Hand any buffered events to the sink.
    pub fn flush(&self) {
        let batch = {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *buffer)
        };
        if !batch.is_empty() {
            (self.sink)(batch);
        }
    }

    pub fn pending(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl CacheObserver for BatchingObserver {
    fn on_event(&self, event: &CacheEvent) {
        if !self.accepts(event) {
            return;
        }
        let full = {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            buffer.push(event.clone());
            if buffer.len() >= self.batch_size {
                Some(std::mem::take(&mut *buffer))
            } else {
                None
            }
        };
        if let Some(batch) = full {
            (self.sink)(batch);
        }
    }
}

impl Drop for BatchingObserver {
    fn drop(&mut self) {
        self.flush();
    }
}

impl fmt::Debug for BatchingObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchingObserver")
            .field("batch_size", &self.batch_size)
            .field("tables", &self.tables)
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conjure_core::FieldValue;
    use std::sync::Arc;

    fn collector() -> (Arc<Mutex<Vec<Vec<CacheEvent>>>>, impl Fn(Vec<CacheEvent>) + Send + Sync) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink_batches = Arc::clone(&batches);
        let sink = move |batch: Vec<CacheEvent>| sink_batches.lock().unwrap().push(batch);
        (batches, sink)
    }

    fn invalidated(table: &str) -> CacheEvent {
        let mut values = RecordValues::new();
        values.insert("id".to_string(), FieldValue::Int(1));
        CacheEvent::Invalidated {
            table: table.to_string(),
            values,
            removed: 2,
            duration: Duration::from_millis(3),
        }
    }

    #[test]
    fn test_batching_flushes_at_batch_size() {
        let (batches, sink) = collector();
        let observer = BatchingObserver::new(2, sink);

        observer.on_event(&invalidated("post"));
        assert_eq!(observer.pending(), 1);
        observer.on_event(&invalidated("post"));
        assert_eq!(observer.pending(), 0);
        assert_eq!(batches.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_batching_filters_tables() {
        let (batches, sink) = collector();
        let observer = BatchingObserver::new(10, sink).with_tables(["post"]);

        observer.on_event(&invalidated("post"));
        observer.on_event(&invalidated("comment"));
        observer.on_event(&CacheEvent::Hit {
            cache_key: "q:a".to_string(),
        });
        observer.flush();

        let batches = batches.lock().unwrap();
        assert_eq!(batches[0].len(), 2);
    }

    #[test]
    fn test_drop_flushes_remaining() {
        let (batches, sink) = collector();
        {
            let observer = BatchingObserver::new(10, sink);
            observer.on_event(&invalidated("post"));
        }
        assert_eq!(batches.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(invalidated("post")).unwrap();
        assert_eq!(json["action"], "invalidated");
        assert_eq!(json["table"], "post");
        assert_eq!(json["duration_ms"], 3);
        assert_eq!(json["values"]["id"], 1);
    }
}
