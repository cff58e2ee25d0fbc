use chrono::Utc;
use serde::{Deserialize, Serialize};

/// One point of a historical price series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: i64,
    pub price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    Call,
    Put,
}

/// One entry of an options chain, normalized for the implied-volatility solve.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionContract {
    pub symbol: String,
    pub strike: f64,
    #[serde(rename = "type")]
    pub option_type: OptionType,
    pub price: f64,
    pub expiration_days: f64,
    pub volume: u64,
    pub open_interest: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SentimentScores {
    pub positive: f64,
    pub negative: f64,
    pub neutral: f64,
    pub compound: f64,
}

/// Aggregate market sentiment produced by the sentiment provider. Consumed
/// here as-is; an `error` marker means the value is a degraded substitute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentimentResult {
    pub overall: SentimentScores,
    pub article_count: u32,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SentimentResult {
    /// Neutral stand-in served when the provider is unreachable.
    pub fn neutral_fallback() -> Self {
        Self {
            overall: SentimentScores {
                positive: 0.33,
                negative: 0.33,
                neutral: 0.34,
                compound: 0.0,
            },
            article_count: 0,
            timestamp: Utc::now().timestamp_millis(),
            error: Some("using fallback sentiment data".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountBalance {
    pub total: f64,
    pub available: f64,
    pub in_orders: f64,
    pub timestamp: i64,
}
