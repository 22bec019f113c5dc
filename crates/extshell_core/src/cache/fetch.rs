//! Asset fetch capability, per-request options and the retry driver.

use crate::cache::entry::AssetHandle;
use crate::cache::error::{AssetFetchError, AssetResult};
use crate::config::AssetCacheConfig;
use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Failure reported by an `AssetFetcher` for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    /// Transport-level problem; the attempt may be retried.
    Transient(String),
    /// The resource is genuinely unavailable; never retried.
    Terminal(String),
}

/// Raw resource backend.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    /// Fetches `path`. Implementations should stop early once `cancel` fires.
    async fn fetch_asset(
        &self,
        path: &str,
        cancel: CancellationToken,
    ) -> Result<Bytes, FetchFailure>;

    /// Releases backend resources tied to a handle leaving the cache.
    fn release(&self, _handle: &AssetHandle) {}
}

/// Per-request fetch behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    /// Extra attempts after the first transient failure.
    pub retry: u32,
    /// Per-attempt timeout; expiry counts as a transient failure.
    pub timeout: Duration,
    /// Entry lifetime; `None` keeps the entry until invalidated or evicted.
    pub ttl: Option<Duration>,
}

impl FetchOptions {
    pub fn from_config(config: &AssetCacheConfig) -> Self {
        Self {
            retry: config.retry,
            timeout: Duration::from_millis(config.timeout_ms),
            ttl: config.ttl_ms.map(Duration::from_millis),
        }
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self::from_config(&AssetCacheConfig::default())
    }
}

/// Exponential backoff bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    /// Delay after the failed attempt number `attempt` (zero based):
    /// `base * 2^attempt`, capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max)
    }
}

/// Runs one logical fetch: attempts, timeouts, backoff and cancellation.
pub(crate) async fn fetch_with_retry(
    fetcher: &dyn AssetFetcher,
    key: &str,
    options: &FetchOptions,
    backoff: Backoff,
    cancel: &CancellationToken,
) -> AssetResult<Bytes> {
    let mut attempt: u32 = 0;
    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(AssetFetchError::Cancelled { key: key.to_string() });
            }
            outcome = tokio::time::timeout(options.timeout, fetcher.fetch_asset(key, cancel.clone())) => outcome,
        };

        let failure = match outcome {
            Ok(Ok(bytes)) => return Ok(bytes),
            Ok(Err(FetchFailure::Terminal(reason))) => {
                return Err(AssetFetchError::Terminal {
                    key: key.to_string(),
                    reason,
                });
            }
            Ok(Err(FetchFailure::Transient(reason))) => AssetFetchError::Retryable {
                key: key.to_string(),
                reason,
                attempts: attempt + 1,
            },
            Err(_) => AssetFetchError::TimedOut {
                key: key.to_string(),
                timeout_ms: options.timeout.as_millis() as u64,
                attempts: attempt + 1,
            },
        };

        if attempt >= options.retry {
            return Err(failure);
        }
        let delay = backoff.delay(attempt);
        debug!(
            "event=asset_fetch module=cache status=retry key={key} attempt={} delay_ms={} error={failure}",
            attempt + 1,
            delay.as_millis()
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(AssetFetchError::Cancelled { key: key.to_string() });
            }
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
