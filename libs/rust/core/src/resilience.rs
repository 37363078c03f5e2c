//! Retry with exponential backoff for store writes made by round workflows.

use std::time::Duration;
use rand::{thread_rng, Rng};
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64, // 0.0 - 1.0
}
impl Default for RetryConfig { fn default() -> Self { Self { max_retries: 3, base_delay_ms: 25, max_delay_ms: 500, jitter: 0.25 } } }

impl RetryConfig {
    pub fn none() -> Self { Self { max_retries: 0, ..Self::default() } }

    fn delay_for(&self, attempt: usize) -> Duration {
        let exp_ms = self.base_delay_ms.saturating_mul(1u64 << attempt.min(63));
        let mut delay_ms = exp_ms.min(self.max_delay_ms);
        if self.jitter > 0.0 {
            let jitter_ms = (delay_ms as f64 * self.jitter) as u64;
            delay_ms = thread_rng().gen_range(delay_ms.saturating_sub(jitter_ms)..=delay_ms.saturating_add(jitter_ms));
        }
        Duration::from_millis(delay_ms)
    }
}

/// Runs `op` until it succeeds, `retryable` rejects the error, or retries run out.
pub async fn retry_async<F, Fut, T, E, P>(cfg: &RetryConfig, retryable: P, mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= cfg.max_retries || !retryable(&e) => return Err(e),
            Err(e) => {
                let delay = cfg.delay_for(attempt);
                warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "retrying_store_write");
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> RetryConfig { RetryConfig { max_retries: 3, base_delay_ms: 1, max_delay_ms: 5, jitter: 0.0 } }

    #[tokio::test]
    async fn eventual_success() {
        let mut attempts = 0;
        let res: Result<usize, &str> = retry_async(&fast(), |_| true, |_i| {
            attempts += 1;
            let n = attempts;
            async move { if n < 3 { Err("fail") } else { Ok(42) } }
        }).await;
        assert_eq!(res.unwrap(), 42);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let mut attempts = 0;
        let res: Result<(), &str> = retry_async(&fast(), |e: &&str| *e == "transient", |_| { attempts += 1; async { Err("fatal") } }).await;
        assert_eq!(res.unwrap_err(), "fatal");
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let mut attempts = 0;
        let res: Result<(), &str> = retry_async(&fast(), |_| true, |_| { attempts += 1; async { Err("transient") } }).await;
        assert!(res.is_err());
        assert_eq!(attempts, 4);
    }

    #[test]
    fn delay_is_capped() {
        let cfg = RetryConfig { max_retries: 10, base_delay_ms: 10, max_delay_ms: 40, jitter: 0.0 };
        assert_eq!(cfg.delay_for(0), Duration::from_millis(10));
        assert_eq!(cfg.delay_for(5), Duration::from_millis(40));
    }

    #[test]
    fn huge_attempt_counts_saturate_at_max_delay() {
        let cfg = RetryConfig { max_retries: usize::MAX, base_delay_ms: 25, max_delay_ms: 500, jitter: 0.0 };
        assert_eq!(cfg.delay_for(64), Duration::from_millis(500));
        assert_eq!(cfg.delay_for(10_000), Duration::from_millis(500));
        let jittery = RetryConfig { jitter: 1.0, max_delay_ms: u64::MAX, ..cfg };
        let _ = jittery.delay_for(10_000);
    }
}
