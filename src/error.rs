//! Error types for the autorestart controller
//!
//! Errors carry enough context (identity, offending dependents, operation)
//! for an operator to act on them. [`Error::is_retryable`] is the single
//! place that decides whether the engine backs off and tries again or gives
//! up on the current notification.

use thiserror::Error;

use crate::model::{ConfigIdentity, RestartMethod};

/// Main error type for autorestart operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error that was not mapped to a more specific variant
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A read or write against the cluster could not complete
    #[error("store unavailable during {operation}: {message}")]
    StoreUnavailable {
        /// Operation that failed (e.g. "list pods")
        operation: String,
        /// Underlying cause
        message: String,
    },

    /// A dependent binds to the ConfigMap in a contradictory way
    #[error("ambiguous binding for {identity}: {}", .dependents.join(", "))]
    AmbiguousBinding {
        /// ConfigMap being reconciled
        identity: ConfigIdentity,
        /// Pods whose binding could not be interpreted
        dependents: Vec<String>,
    },

    /// The ledger entry moved under us
    #[error("ledger conflict for {identity}: revision already advanced elsewhere")]
    LedgerConflict {
        /// ConfigMap whose entry changed
        identity: ConfigIdentity,
    },

    /// A restart action exhausted its retries
    #[error("restart ({method}) of {dependent} failed: {message}")]
    ActionFailed {
        /// Pod the action targeted (`namespace/name`)
        dependent: String,
        /// Delete or annotate
        method: RestartMethod,
        /// Last underlying error
        message: String,
    },

    /// A persisted ledger entry could not be decoded
    #[error("ledger entry {object} is corrupt: {message}")]
    LedgerCorrupt {
        /// Name of the backing object
        object: String,
        /// What was wrong with it
        message: String,
    },

    /// Invalid controller configuration
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The attempt was cancelled before it could commit
    #[error("reconcile cancelled")]
    Cancelled,
}

impl Error {
    /// Create a store-unavailable error for the given operation
    pub fn store_unavailable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a corrupt-ledger error for the named backing object
    pub fn ledger_corrupt(object: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LedgerCorrupt {
            object: object.into(),
            message: message.into(),
        }
    }

    /// Whether backing off and retrying the same step can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StoreUnavailable { .. } => true,
            Self::Kube(e) => kube_error_is_transient(e),
            Self::AmbiguousBinding { .. }
            | Self::LedgerConflict { .. }
            | Self::ActionFailed { .. }
            | Self::LedgerCorrupt { .. }
            | Self::Validation(_)
            | Self::Serialization(_)
            | Self::Cancelled => false,
        }
    }

    /// Whether the identity should be reconciled again without waiting for
    /// a new notification
    ///
    /// An action that exhausted its retries is redelivered: the ledger was
    /// not advanced, so the next attempt re-executes every action.
    pub fn should_redeliver(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable { .. } | Self::Kube(_) | Self::ActionFailed { .. }
        )
    }

    /// Metric label: `transient` or `permanent`
    pub fn error_type(&self) -> &'static str {
        if self.is_retryable() {
            "transient"
        } else {
            "permanent"
        }
    }
}

/// Classify a kube error: server-side 5xx, throttling and transport
/// failures are transient, other API responses are not.
pub(crate) fn kube_error_is_transient(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(resp) => resp.code >= 500 || resp.code == 429,
        _ => true,
    }
}

/// True for a 404 API response
pub(crate) fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// True for a 409 API response
pub(crate) fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: "Test".to_string(),
            code,
        })
    }

    /// Story: a flaky API server never turns into a permanent failure
    #[test]
    fn story_transient_store_errors_are_retried() {
        let err = Error::store_unavailable("list pods", "connection reset");
        assert!(err.is_retryable());
        assert_eq!(err.error_type(), "transient");
        assert!(err.to_string().contains("list pods"));

        assert!(Error::Kube(api_error(503)).is_retryable());
        assert!(Error::Kube(api_error(429)).is_retryable());
        assert!(!Error::Kube(api_error(403)).is_retryable());
    }

    /// Story: contradictory bindings are surfaced with the offending Pods
    #[test]
    fn story_ambiguous_binding_names_the_offenders() {
        let err = Error::AmbiguousBinding {
            identity: ConfigIdentity::new("fedx-1000", "db-config"),
            dependents: vec!["api-0".to_string(), "api-1".to_string()],
        };
        assert!(!err.is_retryable());
        assert_eq!(err.error_type(), "permanent");
        let msg = err.to_string();
        assert!(msg.contains("fedx-1000/db-config"));
        assert!(msg.contains("api-0, api-1"));
    }

    #[test]
    fn status_code_helpers() {
        assert!(is_not_found(&api_error(404)));
        assert!(!is_not_found(&api_error(409)));
        assert!(is_conflict(&api_error(409)));
    }

    #[test]
    fn action_failure_reports_method() {
        let err = Error::ActionFailed {
            dependent: "ns/worker-0".to_string(),
            method: RestartMethod::Delete,
            message: "timeout".to_string(),
        };
        assert!(err.to_string().contains("restart (delete) of ns/worker-0"));
        assert!(!err.is_retryable());
        assert!(err.should_redeliver());
    }

    #[test]
    fn ambiguity_waits_for_a_new_notification() {
        let err = Error::AmbiguousBinding {
            identity: ConfigIdentity::new("ns", "cfg"),
            dependents: vec!["a".to_string()],
        };
        assert!(!err.should_redeliver());
        assert!(!Error::Cancelled.should_redeliver());
    }
}
