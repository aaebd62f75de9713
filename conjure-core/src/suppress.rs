//! Scoped suppression of invalidation.
//!
//! Batch jobs that mutate many records can disable per-mutation invalidation
//! and invalidate once at the end. Suppression is a depth counter so scopes
//! nest: leaving an inner scope does not re-enable invalidation while an
//! outer scope is still open.
//!
//! Two scopes exist:
//!
//! - [`without_invalidation`] runs a future with suppression scoped to that
//!   task. This is the only scope async code sees.
//! - [`suppress_invalidation`] returns a guard bound to the current thread,
//!   for synchronous code running outside any async runtime. Inside a
//!   runtime it is refused, and thread depth is ignored, because tasks
//!   sharing a worker thread would otherwise observe each other's scopes.
//!   Synchronous code that drives a runtime with `block_on` should wrap the
//!   future in [`without_invalidation`] instead.
//!
//! Both release on every exit path, including early returns and panics.

use std::cell::Cell;
use std::future::Future;
use std::marker::PhantomData;

use tokio::runtime::Handle;

use crate::error::{ConjureResult, ProtocolError};

thread_local! {
    static THREAD_DEPTH: Cell<usize> = const { Cell::new(0) };
}

tokio::task_local! {
    static TASK_DEPTH: usize;
}

fn in_runtime() -> bool {
    Handle::try_current().is_ok()
}

/// Keeps invalidation suppressed on this thread until dropped.
#[derive(Debug)]
#[must_use = "suppression ends when the guard is dropped"]
pub struct SuppressionGuard {
    _not_send: PhantomData<*const ()>,
}

impl Drop for SuppressionGuard {
    fn drop(&mut self) {
        THREAD_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Enter a thread-scoped suppression block.
///
/// Fails with [`ProtocolError::InvalidArgument`] when called from inside an
/// async runtime; use [`without_invalidation`] there.
pub fn suppress_invalidation() -> ConjureResult<SuppressionGuard> {
    if in_runtime() {
        return Err(ProtocolError::InvalidArgument {
            operation: "suppress_invalidation".to_string(),
            reason: "thread-scoped suppression inside an async runtime, use without_invalidation"
                .to_string(),
        }
        .into());
    }
    THREAD_DEPTH.with(|depth| depth.set(depth.get() + 1));
    Ok(SuppressionGuard {
        _not_send: PhantomData,
    })
}

/// Run `fut` with invalidation suppressed for the current task.
pub async fn without_invalidation<F: Future>(fut: F) -> F::Output {
    let depth = TASK_DEPTH.try_with(|d| *d).unwrap_or(0);
    TASK_DEPTH.scope(depth + 1, fut).await
}

/// Nesting depth visible to the caller. Inside a runtime only the task
/// scope counts.
pub fn suppression_depth() -> usize {
    let task = TASK_DEPTH.try_with(|d| *d).unwrap_or(0);
    if in_runtime() {
        return task;
    }
    task + THREAD_DEPTH.with(|depth| depth.get())
}

/// Whether invalidation is currently suppressed for the caller.
pub fn is_suppressed() -> bool {
    suppression_depth() > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConjureError;

    #[test]
    fn test_guard_enables_and_releases() {
        assert!(!is_suppressed());
        {
            let _guard = suppress_invalidation().unwrap();
            assert!(is_suppressed());
        }
        assert!(!is_suppressed());
    }

    #[test]
    fn test_nested_guards() {
        let outer = suppress_invalidation().unwrap();
        {
            let _inner = suppress_invalidation().unwrap();
            assert_eq!(suppression_depth(), 2);
        }
        assert!(is_suppressed());
        drop(outer);
        assert!(!is_suppressed());
    }

    #[test]
    fn test_released_on_early_error() {
        fn batch() -> Result<(), &'static str> {
            let _guard = suppress_invalidation().map_err(|_| "refused")?;
            let step: Result<(), &'static str> = Err("boom");
            step?;
            Ok(())
        }
        assert_eq!(batch(), Err("boom"));
        assert!(!is_suppressed());
    }

    #[test]
    fn test_released_on_panic() {
        let result = std::panic::catch_unwind(|| {
            let _guard = suppress_invalidation().unwrap();
            panic!("mid-batch");
        });
        assert!(result.is_err());
        assert!(!is_suppressed());
    }

    #[test]
    fn test_thread_scope_is_not_shared() {
        let _guard = suppress_invalidation().unwrap();
        let other = std::thread::spawn(is_suppressed).join().unwrap();
        assert!(!other);
    }

    #[test]
    fn test_thread_scope_ignored_inside_runtime() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let _guard = suppress_invalidation().unwrap();
        assert!(is_suppressed());
        assert!(!rt.block_on(async { is_suppressed() }));
        assert!(rt.block_on(without_invalidation(async { is_suppressed() })));
    }

    #[tokio::test]
    async fn test_guard_refused_inside_runtime() {
        assert!(matches!(
            suppress_invalidation(),
            Err(ConjureError::Protocol(ProtocolError::InvalidArgument { .. }))
        ));
        assert!(!is_suppressed());
    }

    #[tokio::test]
    async fn test_task_scope_nests() {
        assert!(!is_suppressed());
        let depth = without_invalidation(async {
            without_invalidation(async { suppression_depth() }).await
        })
        .await;
        assert_eq!(depth, 2);
        assert!(!is_suppressed());
    }

    #[tokio::test]
    async fn test_task_scope_does_not_leak_into_spawned_tasks() {
        let inside = without_invalidation(async {
            tokio::spawn(async { is_suppressed() }).await.unwrap()
        })
        .await;
        assert!(!inside);
    }

    #[tokio::test]
    async fn test_task_scope_held_across_await_is_private() {
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let holder = tokio::spawn(without_invalidation(async move {
            let _ = entered_tx.send(());
            let _ = release_rx.await;
            is_suppressed()
        }));

        entered_rx.await.unwrap();
        let neighbour = tokio::spawn(async { is_suppressed() }).await.unwrap();
        assert!(!neighbour);
        assert!(!is_suppressed());

        release_tx.send(()).unwrap();
        assert!(holder.await.unwrap());
    }
}
