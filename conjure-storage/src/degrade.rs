//! Connection-failure degradation.

use conjure_core::{ConjureResult, FailurePolicy};

/// Apply the failure policy to a store result.
///
/// Under [`FailurePolicy::Degrade`] a connection failure is logged and
/// replaced by `fallback()`. Every other error, including protocol errors,
/// is returned unchanged.
pub(crate) fn degrade<T>(
    policy: FailurePolicy,
    operation: &str,
    result: ConjureResult<T>,
    fallback: impl FnOnce() -> T,
) -> ConjureResult<T> {
    match result {
        Err(e) if policy.degrades() && e.is_connection_failure() => {
            tracing::warn!(operation, error = %e, "Cache store unavailable, degrading");
            Ok(fallback())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conjure_core::{ConjureError, ProtocolError, StoreError};

    fn connection_error() -> ConjureError {
        StoreError::Connection {
            reason: "refused".to_string(),
        }
        .into()
    }

    #[test]
    fn test_degrade_swallows_connection_failure() {
        let result = degrade(
            FailurePolicy::Degrade,
            "get",
            Err::<Option<u8>, _>(connection_error()),
            || None,
        );
        assert_eq!(result.unwrap(), None);
    }

    #[test]
    fn test_propagate_keeps_connection_failure() {
        let result = degrade(
            FailurePolicy::Propagate,
            "get",
            Err::<Option<u8>, _>(connection_error()),
            || None,
        );
        assert!(result.unwrap_err().is_connection_failure());
    }

    #[test]
    fn test_degrade_never_hides_protocol_errors() {
        let err: ConjureError = ProtocolError::EmptyKeys {
            operation: "delete_union".to_string(),
        }
        .into();
        let result = degrade(FailurePolicy::Degrade, "invalidate", Err::<u64, _>(err), || 0);
        assert!(matches!(result, Err(ConjureError::Protocol(_))));
    }
}
