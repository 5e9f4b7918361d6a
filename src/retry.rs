//! Shared retry policy for transient provider errors.
//!
//! The scripts this replaces repeated the same fixed-interval retry loop
//! around every API call; here a single helper wraps any provider operation
//! with bounded exponential backoff, retrying only the transient class.

use crate::error::ProviderError;
use backon::{ExponentialBuilder, Retryable};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Default backoff for transient API errors (throttling, network).
pub fn transient_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(500))
        .with_max_delay(Duration::from_secs(15))
        .with_max_times(6)
}

/// Run `op`, retrying on [`ProviderError::Transient`] with exponential
/// backoff. Non-transient errors are returned on the first occurrence.
pub async fn with_retry<T, F, Fut>(op: F, what: &str) -> Result<T, ProviderError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    op.retry(transient_backoff())
        .when(|e: &ProviderError| e.is_transient())
        .notify(|e, dur| {
            warn!(what = %what, delay = ?dur, error = %e, "Transient API error, retrying");
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn throttled() -> ProviderError {
        ProviderError::Transient {
            code: Some("Throttling".into()),
            message: "rate exceeded".into(),
        }
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();

        let result = with_retry(
            || {
                let a = a.clone();
                async move {
                    if a.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(throttled())
                    } else {
                        Ok(42)
                    }
                }
            },
            "flaky-call",
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_fails_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();

        let result: Result<(), _> = with_retry(
            || {
                let a = a.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(ProviderError::AlreadyExists)
                }
            },
            "duplicate-create",
        )
        .await;

        assert!(result.unwrap_err().is_already_exists());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
