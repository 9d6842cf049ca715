//! Reconnect policy with exponential backoff and jitter

use nvc_core::{NvcError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(with = "nvc_core::duration_ms")]
    pub initial_delay: Duration,
    /// Upper bound for the un-jittered delay
    #[serde(with = "nvc_core::duration_ms")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Relative jitter applied to each delay, `0.2` meaning ±20 %
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Fast policy for tests and local servers
    pub fn quick() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            jitter: 0.2,
        }
    }

    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Un-jittered delay before retry number `retry` (1-based)
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(63) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Jittered delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry).as_millis() as f64;
        let spread = self.jitter.clamp(0.0, 1.0);
        let factor = 1.0 + spread * (rand::random::<f64>() * 2.0 - 1.0);
        Duration::from_millis((base * factor).round().max(0.0) as u64)
    }

    /// Whether another attempt may follow `attempts` failed ones
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Run `operation`, retrying recoverable failures according to `policy`
///
/// `on_retry` is told the retry number and the delay before each retry.
/// Exhausting the attempts yields [`NvcError::MaxRetriesExceeded`];
/// non-recoverable errors are returned as they are.
pub async fn retry_with_backoff<T, F, Fut, R>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
    mut on_retry: R,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    R: FnMut(u32, Duration),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        debug!(
            operation = operation_name,
            attempt = attempt,
            max_attempts = max_attempts,
            "Attempting operation"
        );

        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt,
                        "Operation succeeded after retries"
                    );
                }
                return Ok(result);
            }
            Err(e) if e.is_recoverable() && attempt < max_attempts => {
                let delay = e.retry_in().unwrap_or_else(|| policy.delay_for(attempt));
                warn!(
                    operation = operation_name,
                    attempt = attempt,
                    error = %e,
                    next_delay_ms = delay.as_millis() as u64,
                    "Recoverable error, will retry"
                );
                on_retry(attempt, delay);
                sleep(delay).await;
            }
            Err(e) if e.is_recoverable() => {
                error!(
                    operation = operation_name,
                    attempts = attempt,
                    error = %e,
                    "Operation failed after all retry attempts"
                );
                return Err(NvcError::MaxRetriesExceeded {
                    operation: operation_name.to_string(),
                    attempts: attempt,
                    last_error: e.to_string(),
                });
            }
            Err(e) => {
                error!(
                    operation = operation_name,
                    error = %e,
                    code = %e.error_code(),
                    "Non-recoverable error, not retrying"
                );
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn refused() -> NvcError {
        NvcError::Connection {
            url: "ws://127.0.0.1:1".to_string(),
            reason: "connection refused".to_string(),
            retry_in: None,
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay(1), Duration::from_secs(1));
        assert_eq!(policy.base_delay(2), Duration::from_secs(2));
        assert_eq!(policy.base_delay(5), Duration::from_secs(16));
        assert_eq!(policy.base_delay(6), Duration::from_secs(30));
        assert_eq!(policy.base_delay(40), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::default();
        for retry in 1..=8 {
            let base = policy.base_delay(retry).as_millis() as f64;
            for _ in 0..200 {
                let delay = policy.delay_for(retry).as_millis() as f64;
                assert!(delay >= (base * 0.8).floor(), "{} below bound for {}", delay, base);
                assert!(delay <= (base * 1.2).ceil(), "{} above bound for {}", delay, base);
            }
        }
    }

    #[test]
    fn test_policy_serde() {
        let json = serde_json::to_value(RetryPolicy::default()).unwrap();
        assert_eq!(json["initial_delay"], 1000);
        assert_eq!(json["max_delay"], 30000);

        let parsed: RetryPolicy = serde_json::from_str(r#"{"max_attempts":2}"#).unwrap();
        assert_eq!(parsed.max_attempts, 2);
        assert_eq!(parsed.initial_delay, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_attempts_never_exceed_max() {
        let calls = AtomicU32::new(0);
        let mut retries = Vec::new();
        let policy = RetryPolicy::quick();

        let result: Result<()> = retry_with_backoff(
            "connect",
            &policy,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(refused()) }
            },
            |retry, delay| retries.push((retry, delay)),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), policy.max_attempts);
        assert_eq!(retries.len() as u32, policy.max_attempts - 1);
        match result {
            Err(NvcError::MaxRetriesExceeded { attempts, .. }) => {
                assert_eq!(attempts, policy.max_attempts)
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_retries() {
        let result = retry_with_backoff(
            "connect",
            &RetryPolicy::quick(),
            |attempt| async move {
                if attempt < 3 {
                    Err(refused())
                } else {
                    Ok(attempt)
                }
            },
            |_, _| {},
        )
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(
            "connect",
            &RetryPolicy::quick(),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(NvcError::ProtocolError {
                        message: "unexpected answer".to_string(),
                    })
                }
            },
            |_, _| {},
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(NvcError::ProtocolError { .. })));
    }
}
