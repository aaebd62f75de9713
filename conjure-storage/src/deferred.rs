//! Invalidation deferred to the end of a unit of work.
//!
//! Inside a database transaction, other readers still see the old rows until
//! commit, so invalidating immediately would let them re-cache stale data.
//! A [`TransactionQueue`] records invalidations issued while a transaction
//! is open and runs them on commit. A rollback discards them. Nested
//! transactions commit into their parent; only the outermost commit reaches
//! the store.
//!
//! Suppression is checked when an invalidation is issued. A queued
//! invalidation runs at commit even if the commit itself happens inside a
//! suppression scope.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use conjure_core::{is_suppressed, ConjureError, ConjureResult, ProtocolError, RecordValues};

use crate::invalidation::Invalidator;
use crate::store::Store;

/// An invalidation waiting for its transaction to commit.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingInvalidation {
    Record {
        table: String,
        values: RecordValues,
        routing: Option<String>,
    },
    Table {
        table: String,
        routing: Option<String>,
    },
    All,
}

/// Per-unit-of-work queue of invalidations.
pub struct TransactionQueue<S: Store> {
    invalidator: Arc<Invalidator<S>>,
    frames: Mutex<Vec<Vec<PendingInvalidation>>>,
}

impl<S: Store> TransactionQueue<S> {
    pub fn new(invalidator: Arc<Invalidator<S>>) -> Self {
        Self {
            invalidator,
            frames: Mutex::new(Vec::new()),
        }
    }

    fn frames(&self) -> MutexGuard<'_, Vec<Vec<PendingInvalidation>>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a (possibly nested) transaction. Returns the new depth.
    pub fn begin(&self) -> usize {
        let mut frames = self.frames();
        frames.push(Vec::new());
        frames.len()
    }

    pub fn depth(&self) -> usize {
        self.frames().len()
    }

    pub fn in_transaction(&self) -> bool {
        self.depth() > 0
    }

    /// Invalidations queued across all open transactions.
    pub fn pending(&self) -> usize {
        self.frames().iter().map(Vec::len).sum()
    }

    /// Queue `pending` in the innermost transaction, or hand it back when no
    /// transaction is open.
    fn enqueue(&self, pending: PendingInvalidation) -> Option<PendingInvalidation> {
        match self.frames().last_mut() {
            Some(frame) => {
                frame.push(pending);
                None
            }
            None => Some(pending),
        }
    }

    /// Invalidate a record now, or at commit when a transaction is open.
    ///
    /// Returns the number of entries removed, or `None` when queued.
    pub async fn invalidate(
        &self,
        table: &str,
        values: &RecordValues,
        routing: Option<&str>,
    ) -> ConjureResult<Option<u64>> {
        if is_suppressed() {
            return Ok(Some(0));
        }
        let pending = PendingInvalidation::Record {
            table: table.to_string(),
            values: values.clone(),
            routing: routing.map(str::to_string),
        };
        match self.enqueue(pending) {
            None => Ok(None),
            Some(pending) => self.run(&pending).await.map(Some),
        }
    }

    /// Invalidate a whole table now, or at commit.
    pub async fn invalidate_table(
        &self,
        table: &str,
        routing: Option<&str>,
    ) -> ConjureResult<Option<u64>> {
        if is_suppressed() {
            return Ok(Some(0));
        }
        let pending = PendingInvalidation::Table {
            table: table.to_string(),
            routing: routing.map(str::to_string),
        };
        match self.enqueue(pending) {
            None => Ok(None),
            Some(pending) => self.run(&pending).await.map(Some),
        }
    }

    /// Flush the store now, or at commit.
    pub async fn invalidate_all(&self) -> ConjureResult<Option<u64>> {
        if is_suppressed() {
            return Ok(Some(0));
        }
        match self.enqueue(PendingInvalidation::All) {
            None => Ok(None),
            Some(pending) => self.run(&pending).await.map(Some),
        }
    }

    /// Close the innermost transaction successfully.
    ///
    /// A nested commit moves its queue into the parent and returns `0`. The
    /// outermost commit runs every queued invalidation in order and returns
    /// the total removed. Every invalidation is attempted; the first error is
    /// returned after the rest have run.
    #[tracing::instrument(skip(self))]
    pub async fn commit(&self) -> ConjureResult<u64> {
        let queued = {
            let mut frames = self.frames();
            let frame = frames.pop().ok_or_else(|| no_transaction("commit"))?;
            match frames.last_mut() {
                Some(parent) => {
                    parent.extend(frame);
                    return Ok(0);
                }
                None => frame,
            }
        };

        let mut removed = 0;
        let mut first_error = None;
        for pending in &queued {
            match self.run(pending).await {
                Ok(n) => removed += n,
                Err(e) => {
                    tracing::error!(error = %e, pending = ?pending, "Deferred invalidation failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        tracing::debug!(queued = queued.len(), removed, "Committed deferred invalidations");

        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    /// Close the innermost transaction, discarding its queue. Returns how
    /// many invalidations were dropped.
    pub fn rollback(&self) -> ConjureResult<usize> {
        let frame = self
            .frames()
            .pop()
            .ok_or_else(|| no_transaction("rollback"))?;
        Ok(frame.len())
    }

    async fn run(&self, pending: &PendingInvalidation) -> ConjureResult<u64> {
        match pending {
            PendingInvalidation::Record {
                table,
                values,
                routing,
            } => {
                self.invalidator
                    .invalidate_now(table, values, routing.as_deref())
                    .await
            }
            PendingInvalidation::Table { table, routing } => {
                self.invalidator
                    .invalidate_table_now(table, routing.as_deref())
                    .await
            }
            PendingInvalidation::All => self.invalidator.invalidate_all_now().await.map(|()| 0),
        }
    }
}

fn no_transaction(operation: &str) -> ConjureError {
    ProtocolError::InvalidArgument {
        operation: operation.to_string(),
        reason: "no transaction is open".to_string(),
    }
    .into()
}
