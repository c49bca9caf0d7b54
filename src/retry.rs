//! Retry with exponential backoff and jitter.
//!
//! Retryability is decided by [`OrchestratorError::is_retryable`] — a typed
//! classification, not a keyword-sniffed string match — so a
//! call site never has to guess whether a provider's error message happens
//! to contain the string "503".

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{OrchestratorError, Result};

/// Retry strategy configuration. Delay formula:
/// `delay = min(max_delay, base_delay * multiplier^(attempt-1)) * uniform[1-jitter, 1+jitter]`
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try.
    pub max_retries: u32,

    pub base_delay_ms: u64,

    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff (typically 2.0).
    pub multiplier: f64,

    /// Fractional jitter applied symmetrically around the computed delay,
    /// e.g. 0.25 means the delay is scaled by a factor drawn uniformly from
    /// `[0.75, 1.25]`.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_base_delay(mut self, ms: u64) -> Self {
        self.base_delay_ms = ms;
        self
    }

    pub fn with_max_delay(mut self, ms: u64) -> Self {
        self.max_delay_ms = ms;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Backoff delay for the given 1-indexed attempt number, per the
    /// formula above.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);

        let scaled = if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
            capped * factor
        } else {
            capped
        };

        Duration::from_millis(scaled.max(0.0) as u64)
    }
}

/// Execute `f` with retry, honoring [`OrchestratorError::is_retryable`].
/// Non-retryable errors return immediately. When all attempts are
/// exhausted, wraps the last error in [`OrchestratorError::RetryExhausted`].
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with_backoff_notify(config, operation_name, f, |_, _, _| {}).await
}

/// Like [`retry_with_backoff`], but invokes `on_retry(attempt, &err, delay)`
/// immediately before each backoff sleep — the core consults this to feed
/// `MetricsCollector::record_retry` and similar observers without baking
/// that dependency into the retry policy itself.
pub async fn retry_with_backoff_notify<F, Fut, T, N>(
    config: &RetryConfig,
    operation_name: &str,
    mut f: F,
    mut on_retry: N,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    N: FnMut(u32, &OrchestratorError, Duration),
{
    let mut last_error: Option<OrchestratorError> = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            info!(operation = operation_name, attempt, max_retries = config.max_retries, "retrying operation");
        }

        match f().await {
            Ok(result) => {
                if attempt > 0 {
                    info!(operation = operation_name, attempt, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) => {
                debug!(
                    operation = operation_name,
                    attempt,
                    error = %e,
                    retryable = e.is_retryable(),
                    "operation failed"
                );

                if !e.is_retryable() {
                    error!(operation = operation_name, error = %e, "non-retryable error, aborting");
                    return Err(e);
                }

                if attempt < config.max_retries {
                    let delay = config.backoff_delay(attempt + 1);
                    warn!(
                        operation = operation_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient error, retrying after delay"
                    );
                    on_retry(attempt + 1, &e, delay);
                    tokio::time::sleep(delay).await;
                }

                last_error = Some(e);
            }
        }
    }

    let source = last_error.unwrap_or_else(|| {
        OrchestratorError::General(format!(
            "operation '{operation_name}' failed with no recorded error"
        ))
    });

    error!(operation = operation_name, max_retries = config.max_retries, error = %source, "all retry attempts exhausted");

    Err(OrchestratorError::RetryExhausted {
        attempts: config.max_retries + 1,
        source: Box::new(source),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay_ms, 1000);
        assert_eq!(config.max_delay_ms, 60_000);
        assert_eq!(config.multiplier, 2.0);
    }

    #[test]
    fn backoff_delay_grows_exponentially_without_jitter() {
        let config = RetryConfig::new(5).with_jitter(0.0);
        assert_eq!(config.backoff_delay(1).as_millis(), 1000);
        assert_eq!(config.backoff_delay(2).as_millis(), 2000);
        assert_eq!(config.backoff_delay(3).as_millis(), 4000);
    }

    #[test]
    fn backoff_delay_is_capped_at_max() {
        let config = RetryConfig::new(10).with_max_delay(5000).with_jitter(0.0);
        assert_eq!(config.backoff_delay(6).as_millis(), 5000);
    }

    #[test]
    fn backoff_delay_jitter_stays_within_bounds() {
        let config = RetryConfig::new(3).with_base_delay(1000).with_jitter(0.25);
        for attempt in 1..=3 {
            let delay = config.backoff_delay(attempt).as_millis() as f64;
            let base = 1000.0 * 2f64.powi(attempt as i32 - 1);
            assert!(delay >= base * 0.75 - 1.0);
            assert!(delay <= base * 1.25 + 1.0);
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt_without_sleeping() {
        let config = RetryConfig::new(3);
        let calls = Arc::new(Mutex::new(0));
        let calls2 = Arc::clone(&calls);

        let result = retry_with_backoff(&config, "op", move || {
            let calls = Arc::clone(&calls2);
            async move {
                *calls.lock().unwrap() += 1;
                Ok::<i32, OrchestratorError>(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_errors() {
        let config = RetryConfig::new(3).with_base_delay(1).with_jitter(0.0);
        let calls = Arc::new(Mutex::new(0));
        let calls2 = Arc::clone(&calls);

        let result = retry_with_backoff(&config, "op", move || {
            let calls = Arc::clone(&calls2);
            async move {
                let mut c = calls.lock().unwrap();
                *c += 1;
                if *c < 3 {
                    Err(OrchestratorError::Timeout("slow".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn aborts_immediately_on_non_retryable_error() {
        let config = RetryConfig::new(3).with_base_delay(1);
        let calls = Arc::new(Mutex::new(0));
        let calls2 = Arc::clone(&calls);

        let result: Result<()> = retry_with_backoff(&config, "op", move || {
            let calls = Arc::clone(&calls2);
            async move {
                *calls.lock().unwrap() += 1;
                Err(OrchestratorError::Validation("bad input".into()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn notify_callback_fires_once_per_retry_with_attempt_and_delay() {
        let config = RetryConfig::new(3).with_base_delay(1).with_jitter(0.0);
        let calls = Arc::new(Mutex::new(0));
        let calls2 = Arc::clone(&calls);
        let notified: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let notified2 = Arc::clone(&notified);

        let result = retry_with_backoff_notify(
            &config,
            "op",
            move || {
                let calls = Arc::clone(&calls2);
                async move {
                    let mut c = calls.lock().unwrap();
                    *c += 1;
                    if *c < 3 {
                        Err(OrchestratorError::Timeout("slow".into()))
                    } else {
                        Ok(42)
                    }
                }
            },
            move |attempt, err, _delay| {
                assert!(err.is_retryable());
                notified2.lock().unwrap().push(attempt);
            },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(*notified.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn exhausts_all_attempts_and_wraps_source() {
        let config = RetryConfig::new(2).with_base_delay(1).with_jitter(0.0);
        let calls = Arc::new(Mutex::new(0));
        let calls2 = Arc::clone(&calls);

        let result: Result<()> = retry_with_backoff(&config, "op", move || {
            let calls = Arc::clone(&calls2);
            async move {
                *calls.lock().unwrap() += 1;
                Err(OrchestratorError::Network("down".into()))
            }
        })
        .await;

        assert_eq!(*calls.lock().unwrap(), 3); // initial + 2 retries
        match result.unwrap_err() {
            OrchestratorError::RetryExhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }
}
