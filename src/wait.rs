//! Poll-until-condition with exponential backoff and cancellation.
//!
//! Replaces fixed-duration sleeps when waiting on cloud resources to reach
//! a state: the condition is checked on an exponential schedule with jitter
//! until it holds, the timeout elapses, or the run is cancelled.

use anyhow::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Polling schedule for [`wait_until`].
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Delay before the second check (first check is immediate)
    pub initial_delay: Duration,
    /// Cap for the exponentially growing delay
    pub max_delay: Duration,
    /// Total time budget before giving up
    pub timeout: Duration,
    /// Jitter factor (0.0 - 1.0) applied to each delay
    pub jitter: f64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(15),
            timeout: Duration::from_secs(120),
            jitter: 0.25,
        }
    }
}

impl PollConfig {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }
}

/// Poll `condition` until it reports `Ok(true)`.
///
/// Returns an error on timeout, cancellation, or if the condition itself
/// fails. `what` names the awaited condition for logs and error messages.
pub async fn wait_until<F, Fut>(
    config: PollConfig,
    cancel: Option<&CancellationToken>,
    condition: F,
    what: &str,
) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = std::time::Instant::now();
    let mut delay = config.initial_delay;
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        if let Some(token) = cancel {
            if token.is_cancelled() {
                anyhow::bail!("wait for {what} cancelled");
            }
        }

        if start.elapsed() >= config.timeout {
            anyhow::bail!(
                "timeout waiting for {what} after {:?} ({attempts} attempts)",
                config.timeout
            );
        }

        match condition().await {
            Ok(true) => {
                debug!(what = %what, attempts, "Condition satisfied");
                return Ok(());
            }
            Ok(false) => {
                let jittered = jittered(delay, config.jitter);
                debug!(
                    what = %what,
                    attempt = attempts,
                    delay_ms = jittered.as_millis(),
                    "Not ready, polling again"
                );

                tokio::select! {
                    _ = tokio::time::sleep(jittered) => {}
                    _ = async {
                        match cancel {
                            Some(token) => token.cancelled().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        anyhow::bail!("wait for {what} cancelled");
                    }
                }

                delay = (delay * 2).min(config.max_delay);
            }
            Err(e) => {
                warn!(what = %what, error = ?e, "Condition check failed");
                return Err(e);
            }
        }
    }
}

/// Spread delays out to avoid synchronized polling.
fn jittered(base: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return base;
    }
    let jitter = rand::thread_rng().gen_range(0.0..factor);
    Duration::from_secs_f64(base.as_secs_f64() * (1.0 + jitter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(timeout_ms: u64) -> PollConfig {
        PollConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            timeout: Duration::from_millis(timeout_ms),
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn immediate_success() {
        let result = wait_until(PollConfig::default(), None, || async { Ok(true) }, "ready").await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn retries_until_condition_holds() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = wait_until(
            fast_config(5_000),
            None,
            || {
                let c = c.clone();
                async move { Ok(c.fetch_add(1, Ordering::SeqCst) >= 2) }
            },
            "third-time",
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn times_out() {
        let result = wait_until(fast_config(50), None, || async { Ok(false) }, "never").await;
        let err = result.unwrap_err().to_string();
        assert!(err.contains("timeout"));
    }

    #[tokio::test]
    async fn cancellation_interrupts_wait() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = wait_until(
            fast_config(10_000),
            Some(&cancel),
            || async { Ok(false) },
            "never",
        )
        .await;

        let err = result.unwrap_err().to_string();
        assert!(err.contains("cancelled"));
    }

    #[tokio::test]
    async fn condition_error_propagates() {
        let result = wait_until(
            PollConfig::default(),
            None,
            || async { anyhow::bail!("probe exploded") },
            "broken",
        )
        .await;
        assert!(result.unwrap_err().to_string().contains("probe exploded"));
    }
}
