use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;

use super::types::SentimentResult;
use super::SentimentSource;

/// Thin client for the sentiment provider service. The provider aggregates
/// news scoring upstream; this end only consumes its summary.
pub struct SentimentClient {
    client: Client,
    endpoint: String,
}

impl SentimentClient {
    pub fn new(client: Client, endpoint: String) -> Self {
        Self { client, endpoint }
    }

    pub async fn market_sentiment(&self) -> Result<SentimentResult> {
        let sentiment = self
            .client
            .get(&self.endpoint)
            .send()
            .await?
            .error_for_status()?
            .json::<SentimentResult>()
            .await
            .context("failed to parse sentiment response")?;
        Ok(sentiment)
    }
}

#[async_trait]
impl SentimentSource for SentimentClient {
    async fn market_sentiment(&self) -> Result<SentimentResult> {
        SentimentClient::market_sentiment(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentiment_result_deserializes_without_error_field() {
        let raw = r#"{
            "overall": {"positive": 0.5, "negative": 0.2, "neutral": 0.3, "compound": 0.3},
            "articleCount": 20,
            "timestamp": 1700000000000
        }"#;
        let sentiment: SentimentResult = serde_json::from_str(raw).unwrap();
        assert_eq!(sentiment.article_count, 20);
        assert!(sentiment.error.is_none());
        assert!((sentiment.overall.compound - 0.3).abs() < f64::EPSILON);
    }
}
