//! Error taxonomy for reconciliation
//!
//! Two layers: `ProviderError` classifies failures coming back from the
//! cloud API (retry and recovery decisions are made on these), while
//! `ReconcileError` covers failures of the reconciliation pass itself.

use thiserror::Error;

/// Classified cloud provider error
///
/// Every provider call reports one of these categories so the materializer
/// and teardown controller can decide between retry, recover, and fail.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Resource already exists (creation race - re-probe and treat as success)
    #[error("resource already exists")]
    AlreadyExists,

    /// Resource was not found (safe to skip in teardown)
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Network error or throttling (retryable with backoff)
    #[error("transient API error ({}): {message}", .code.as_deref().unwrap_or("unknown"))]
    Transient {
        code: Option<String>,
        message: String,
    },

    /// Resource has dependent objects still attached (e.g. a target group
    /// with a live listener)
    #[error("resource has dependent objects: {0}")]
    DependencyViolation(String),

    /// Any other API error with code and message
    #[error("API error ({}): {message}", .code.as_deref().unwrap_or("none"))]
    Api {
        code: Option<String>,
        message: String,
    },
}

impl ProviderError {
    /// Errors worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ProviderError::AlreadyExists)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }

    pub fn is_dependency_violation(&self) -> bool {
        matches!(self, ProviderError::DependencyViolation(_))
    }
}

/// Failures of a reconciliation pass
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Malformed topology or spec (always aborts, regardless of mode)
    #[error("invalid topology: {0}")]
    Config(String),

    /// Probe found more than one candidate for a name filter
    #[error("ambiguous match for {kind} '{name}': {} candidates", .candidates.len())]
    AmbiguousMatch {
        kind: &'static str,
        name: String,
        candidates: Vec<String>,
    },

    /// A spec's dependency never reached a usable terminal state
    #[error("dependency '{dependency}' of '{spec}' did not resolve")]
    DependencyUnresolved { spec: String, dependency: String },

    /// The run was cancelled externally
    #[error("reconciliation cancelled")]
    Cancelled,

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_retryable() {
        let err = ProviderError::Transient {
            code: Some("Throttling".into()),
            message: "rate exceeded".into(),
        };
        assert!(err.is_transient());
        assert!(!err.is_already_exists());
    }

    #[test]
    fn already_exists_is_not_transient() {
        assert!(ProviderError::AlreadyExists.is_already_exists());
        assert!(!ProviderError::AlreadyExists.is_transient());
    }

    #[test]
    fn ambiguous_match_display() {
        let err = ReconcileError::AmbiguousMatch {
            kind: "vpc",
            name: "app-vpc".into(),
            candidates: vec!["vpc-1".into(), "vpc-2".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("app-vpc"));
        assert!(msg.contains("2 candidates"));
    }
}
