//! Bounded exponential backoff for transport calls.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::config::RetryConfig;
use crate::domain::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().into()
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based): base, 2×base, 4×base, …
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Run `f` until it succeeds, attempts run out, or `cancel` fires.
    ///
    /// `f` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(
        &self,
        op: &'static str,
        cancel: &CancellationToken,
        mut f: F,
    ) -> Result<T, SyncError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::Cancelled { op }),
                outcome = f(attempt) => outcome,
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(op, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    warn!(op, attempt, max = self.max_attempts, "Attempt failed: {e:#}");
                    last_error = Some(e);
                }
            }

            if attempt < self.max_attempts {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(SyncError::Cancelled { op }),
                    _ = tokio::time::sleep(self.delay_for(attempt)) => {}
                }
            }
        }

        Err(SyncError::RetriesExhausted {
            op,
            attempts: self.max_attempts,
            message: last_error
                .map(|e| format!("{e:#}"))
                .unwrap_or_else(|| "no attempts made".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
        }
    }

    #[test]
    fn delays_double_and_cap() {
        let p = policy();
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(250));
        assert_eq!(p.delay_for(40), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let value = policy()
            .run("track", &CancellationToken::new(), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        anyhow::bail!("flaky")
                    }
                    Ok(n)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_last_error() {
        let err = policy()
            .run("subscribe", &CancellationToken::new(), |attempt| async move {
                Err::<(), _>(anyhow::anyhow!("down on attempt {attempt}"))
            })
            .await
            .unwrap_err();

        assert_eq!(
            err,
            SyncError::RetriesExhausted {
                op: "subscribe",
                attempts: 3,
                message: "down on attempt 3".into(),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_loop() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = policy()
            .run("track", &cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(anyhow::anyhow!("nope")) }
            })
            .await
            .unwrap_err();

        assert_eq!(err, SyncError::Cancelled { op: "track" });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
