//! Optional retrying around the transport.
//!
//! The client wires this in when `default_retries > 0`. With `default_retries = 0` requests are
//! attempted exactly once.
use std::time::Duration;

use async_trait::async_trait;
use rand::{thread_rng, Rng};
use serde_json::Value;
use url::Url;

use crate::{Error, Result, Settings, Transport, TransportResponse};

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Backoff before the first retry. Doubles on every further retry.
    pub retry_interval: Duration,
    /// Upper bound for a single backoff.
    pub max_retry_delay: Duration,
}

impl RetryPolicy {
    /// Policy described by `settings`, or `None` when retrying is disabled.
    pub fn from_settings(settings: &Settings) -> Option<RetryPolicy> {
        (settings.default_retries > 0).then(|| RetryPolicy {
            max_retries: settings.default_retries,
            retry_interval: settings.retry_interval,
            max_retry_delay: settings.max_retry_delay,
        })
    }

    /// Backoff before retry number `attempt` (zero-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.retry_interval
            .saturating_mul(factor)
            .min(self.max_retry_delay)
    }

    /// Backoff with up to half of it randomly subtracted, so clients that failed together do not
    /// retry together.
    pub fn delay(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        jitter(backoff, backoff / 2)
    }
}

/// Whether a response status is worth retrying.
fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// [`Transport`] decorator that retries transport errors and 429/5xx responses.
pub struct RetryingTransport<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T: Transport> RetryingTransport<T> {
    /// Wrap `inner` with `policy`.
    pub fn new(inner: T, policy: RetryPolicy) -> RetryingTransport<T> {
        RetryingTransport { inner, policy }
    }
}

#[async_trait]
impl<T: Transport> Transport for RetryingTransport<T> {
    async fn post(&self, url: &Url, body: &Value) -> Result<TransportResponse> {
        let mut attempt = 0;
        loop {
            let result = self.inner.post(url, body).await;
            let retryable = match &result {
                Ok(response) => is_retryable_status(response.status),
                Err(Error::Network(_)) => true,
                Err(_) => false,
            };
            if !retryable || attempt >= self.policy.max_retries {
                return result;
            }

            let delay = self.policy.delay(attempt);
            attempt += 1;
            log::debug!(target: "posthog", attempt, url:% = url; "retrying request in {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

/// Apply randomized subtractive `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}
