use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use super::types::PricePoint;
use super::{retry_with_backoff, HistoricalDataSource};

const MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
struct MarketChartResponse {
    prices: Vec<(i64, f64)>,
}

pub struct CoinGeckoClient {
    client: Client,
    base_url: String,
}

impl CoinGeckoClient {
    pub fn new(client: Client, base_url: String) -> Self {
        Self { client, base_url }
    }

    pub async fn historical_prices(&self, asset: &str, days: u32) -> Result<Vec<PricePoint>> {
        let url = format!("{}/coins/{}/market_chart", self.base_url, asset);
        let days_param = days.to_string();
        let client = &self.client;
        let url_ref = url.as_str();
        let days_ref = days_param.as_str();

        let chart: MarketChartResponse =
            retry_with_backoff("coingecko", MAX_RETRIES, RETRY_BASE_DELAY, || async move {
                let response = client
                    .get(url_ref)
                    .query(&[
                        ("vs_currency", "usd"),
                        ("days", days_ref),
                        ("interval", "daily"),
                    ])
                    .send()
                    .await?
                    .error_for_status()?;
                Ok(response.json::<MarketChartResponse>().await?)
            })
            .await
            .with_context(|| format!("coingecko market chart for {asset}"))?;

        Ok(chart
            .prices
            .into_iter()
            .map(|(timestamp, price)| PricePoint { timestamp, price })
            .collect())
    }
}

#[async_trait]
impl HistoricalDataSource for CoinGeckoClient {
    async fn historical_prices(&self, asset: &str, days: u32) -> Result<Vec<PricePoint>> {
        CoinGeckoClient::historical_prices(self, asset, days).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_chart_prices_deserialize_from_pairs() {
        let raw = r#"{"prices":[[1700000000000,37250.12],[1700086400000,37500.5]]}"#;
        let chart: MarketChartResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(chart.prices.len(), 2);
        assert_eq!(chart.prices[0].0, 1_700_000_000_000);
        assert!((chart.prices[1].1 - 37500.5).abs() < f64::EPSILON);
    }
}
