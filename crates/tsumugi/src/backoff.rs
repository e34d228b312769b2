use std::{future::Future, time::Duration};

use rand::Rng;

use crate::{error::ErrorKind, TsumugiError, TsumugiResult};

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffOptions {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Retries allowed for transient network failures.
    pub max_retry: u32,
    /// Retries allowed while the network is unreachable, counted separately.
    pub max_retry_offline: u32,
    pub jitter: bool,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(3),
            max_retry: 4,
            max_retry_offline: 7,
            jitter: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    Abort,
}

/// Retry bookkeeping of one logical request.
#[derive(Debug, Clone)]
pub struct BackoffState {
    options: BackoffOptions,
    attempt: u32,
    online_failures: u32,
    offline_failures: u32,
}

impl BackoffState {
    pub fn new(options: BackoffOptions) -> Self {
        Self {
            options,
            attempt: 0,
            online_failures: 0,
            offline_failures: 0,
        }
    }

    /// Number of retries scheduled so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn online_failures(&self) -> u32 {
        self.online_failures
    }

    pub fn offline_failures(&self) -> u32 {
        self.offline_failures
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let delay = self
            .options
            .base_delay
            .saturating_mul(factor)
            .min(self.options.max_delay);
        if self.options.jitter {
            let factor = rand::thread_rng().gen_range(0.7..1.3);
            delay.mul_f64(factor).min(self.options.max_delay)
        } else {
            delay
        }
    }

    pub fn on_failure(&mut self, error: &TsumugiError) -> RetryDecision {
        let (failures, budget) = match error.kind() {
            ErrorKind::NetworkTransient => (&mut self.online_failures, self.options.max_retry),
            ErrorKind::NetworkOffline => {
                (&mut self.offline_failures, self.options.max_retry_offline)
            }
            _ => return RetryDecision::Abort,
        };
        if *failures >= budget {
            return RetryDecision::Abort;
        }
        *failures += 1;

        let delay = self.delay_for_attempt(self.attempt);
        self.attempt += 1;
        RetryDecision::Retry(delay)
    }
}

/// Run `operation` until it succeeds, retrying network failures with exponential backoff.
///
/// `on_retry` is called with the failure before each wait. Parse and fatal errors are
/// returned as-is; an exhausted retry budget becomes [`TsumugiError::RetryExhausted`].
pub async fn try_with_backoff<T, Op, Fut, R>(
    mut operation: Op,
    options: &BackoffOptions,
    mut on_retry: R,
) -> TsumugiResult<T>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = TsumugiResult<T>>,
    R: FnMut(&TsumugiError),
{
    let mut state = BackoffState::new(options.clone());
    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        match state.on_failure(&error) {
            RetryDecision::Retry(delay) => {
                tracing::warn!(
                    attempt = state.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "Request failed, retry later. {error}"
                );
                on_retry(&error);
                tokio::time::sleep(delay).await;
            }
            RetryDecision::Abort if error.is_retryable() => {
                tracing::error!(
                    attempts = state.attempt() + 1,
                    "Request failed, max retries exceed. {error}"
                );
                return Err(TsumugiError::RetryExhausted {
                    attempts: state.attempt() + 1,
                    source: Box::new(error),
                });
            }
            RetryDecision::Abort => return Err(error),
        }
    }
}
