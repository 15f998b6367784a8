//! Paginated fetcher: retry, backoff and pacing around single-page requests.
//!
//! Pages of one job are fetched strictly one after another. HTTP 429 waits
//! `max(Retry-After, rate_limit_delay * attempt)` and retries the same page; other
//! transient failures back off exponentially with jitter. Auth failures and malformed
//! bodies are returned immediately.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use rand::{Rng, thread_rng};
use tracing::{debug, instrument, warn};

use super::SyncError;
use crate::config::FetchPolicyConfig;
use crate::marketplace::{MarketplaceClient, MarketplacePage};
use crate::telemetry::{METRIC_PAGE_FETCH_SECONDS, METRIC_RATE_LIMIT_RETRIES};

pub struct PaginatedFetcher {
    client: Arc<MarketplaceClient>,
    policy: FetchPolicyConfig,
}

impl PaginatedFetcher {
    pub fn new(client: Arc<MarketplaceClient>, policy: FetchPolicyConfig) -> Self {
        Self { client, policy }
    }

    /// Minimal request used by job initialization to read pagination metadata.
    pub async fn probe(&self) -> Result<MarketplacePage, SyncError> {
        self.fetch_page(1, 1).await
    }

    /// Fetch one page, retrying 429s and transient failures within the policy budget.
    #[instrument(skip(self), fields(endpoint = %self.client.endpoint()))]
    pub async fn fetch_page(
        &self,
        page_number: u32,
        page_size: u32,
    ) -> Result<MarketplacePage, SyncError> {
        let mut attempt: u32 = 0;

        loop {
            let started = Instant::now();
            let result = self.client.fetch_page(page_number, page_size).await;
            histogram!(METRIC_PAGE_FETCH_SECONDS).record(started.elapsed().as_secs_f64());

            let error = match result {
                Ok(page) => {
                    if attempt > 0 {
                        debug!(page_number, attempt, "page fetched after retries");
                    }
                    return Ok(page);
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                return Err(error);
            }

            attempt += 1;
            if attempt > self.policy.max_retries {
                warn!(page_number, attempts = attempt, "retry budget exhausted: {}", error);
                return Err(match error {
                    SyncError::RateLimited {
                        retry_after_secs, ..
                    } => SyncError::RateLimited {
                        retry_after_secs,
                        attempts: attempt,
                    },
                    other => other,
                });
            }

            let delay = match &error {
                SyncError::RateLimited {
                    retry_after_secs, ..
                } => {
                    counter!(METRIC_RATE_LIMIT_RETRIES).increment(1);
                    self.rate_limit_delay(attempt, *retry_after_secs)
                }
                _ => self.backoff_delay(attempt),
            };

            warn!(
                page_number,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying page: {}",
                error
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Fixed pause between successful page fetches.
    pub async fn pause_between_pages(&self) {
        if self.policy.page_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.policy.page_delay_ms)).await;
        }
    }

    /// Increasing delay for 429s; a longer `Retry-After` wins.
    fn rate_limit_delay(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        let scheduled = self.policy.rate_limit_delay_ms.saturating_mul(attempt as u64);
        let requested = retry_after_secs.unwrap_or(0).saturating_mul(1000);
        Duration::from_millis(scheduled.max(requested))
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let backoff = self
            .policy
            .backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.policy.backoff_max_ms) as f64;

        let jitter_span = self.policy.jitter_factor * backoff;
        let jitter = if jitter_span > 0.0 {
            thread_rng().gen_range(0.0..jitter_span)
        } else {
            0.0
        };

        Duration::from_millis((backoff + jitter) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MarketplaceConfig;

    fn fetcher(policy: FetchPolicyConfig) -> PaginatedFetcher {
        let client = MarketplaceClient::new(&MarketplaceConfig::default()).unwrap();
        PaginatedFetcher::new(Arc::new(client), policy)
    }

    #[test]
    fn rate_limit_delay_grows_and_honors_retry_after() {
        let fetcher = fetcher(FetchPolicyConfig {
            rate_limit_delay_ms: 2000,
            ..FetchPolicyConfig::default()
        });

        assert_eq!(fetcher.rate_limit_delay(1, None), Duration::from_millis(2000));
        assert_eq!(fetcher.rate_limit_delay(2, None), Duration::from_millis(4000));
        assert_eq!(fetcher.rate_limit_delay(1, Some(10)), Duration::from_secs(10));
        assert_eq!(fetcher.rate_limit_delay(3, Some(1)), Duration::from_millis(6000));
    }

    #[test]
    fn backoff_is_capped_and_jittered_upward() {
        let fetcher = fetcher(FetchPolicyConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 1000,
            jitter_factor: 0.1,
            ..FetchPolicyConfig::default()
        });

        let first = fetcher.backoff_delay(1);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(111));

        let third = fetcher.backoff_delay(3);
        assert!(third >= Duration::from_millis(400) && third < Duration::from_millis(441));

        let capped = fetcher.backoff_delay(30);
        assert!(capped >= Duration::from_millis(1000) && capped < Duration::from_millis(1101));
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let fetcher = fetcher(FetchPolicyConfig {
            backoff_base_ms: 50,
            backoff_max_ms: 50,
            jitter_factor: 0.0,
            ..FetchPolicyConfig::default()
        });
        assert_eq!(fetcher.backoff_delay(4), Duration::from_millis(50));
    }
}
