pub mod coingecko;
pub mod delta;
pub mod sentiment;
pub mod types;

pub use coingecko::CoinGeckoClient;
pub use delta::DeltaOptionsClient;
pub use sentiment::SentimentClient;
pub use types::*;

use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

/// Source of daily historical price series, keyed by asset id (e.g. "bitcoin").
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HistoricalDataSource: Send + Sync {
    async fn historical_prices(&self, asset: &str, days: u32) -> Result<Vec<types::PricePoint>>;
}

/// Source of aggregate market sentiment. The analysis itself happens upstream.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SentimentSource: Send + Sync {
    async fn market_sentiment(&self) -> Result<types::SentimentResult>;
}

/// Source of options chains, keyed by underlying symbol (e.g. "BTCUSD").
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OptionsSource: Send + Sync {
    async fn options_chain(&self, underlying: &str) -> Result<Vec<types::OptionContract>>;
}

/// Retry an operation with exponential backoff. Used by REST clients for
/// transient upstream hiccups; sustained failure is the circuit breaker's job.
pub(crate) async fn retry_with_backoff<T, F, Fut>(
    label: &str,
    max_retries: u32,
    base_delay: Duration,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt > max_retries {
                    return Err(err);
                }
                let delay = base_delay * 2u32.pow(attempt - 1);
                warn!(
                    target = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after backoff"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::assert_ok;

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let result = retry_with_backoff("test", 3, Duration::from_millis(10), || async move {
            if calls_ref.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(anyhow!("transient"))
            } else {
                Ok(7u32)
            }
        })
        .await;
        assert_eq!(assert_ok!(result), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let result: Result<u32> =
            retry_with_backoff("test", 2, Duration::from_millis(10), || async move {
                calls_ref.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("permanent"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
