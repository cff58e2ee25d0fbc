pub mod context;

pub use context::{ConnectionId, MarketContext};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::alerts::Alert;
use crate::api::types::{AccountBalance, SentimentResult};
use crate::feeds::{BookLevel, NormalizedTrade};
use crate::pipeline::VolatilityResult;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeQuote {
    pub price: f64,
    pub volume: f64,
}

/// Ticker fused across exchanges: one exchange's snapshot promoted to
/// primary, with per-exchange quotes kept as context. `degraded` is set when
/// the first-configured exchange had no fresh ticker to promote.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FusedTicker {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub price_change: f64,
    pub price_change_percent: f64,
    pub high: f64,
    pub low: f64,
    pub exchanges: HashMap<String, ExchangeQuote>,
    pub timestamp: i64,
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FusedOrderBook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub timestamp: i64,
}

/// The single merged market snapshot for one symbol, recomputed lazily at
/// broadcast time from the latest per-source slots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FusedView {
    pub symbol: String,
    pub ticker: Option<FusedTicker>,
    pub order_book: Option<FusedOrderBook>,
    pub recent_trades: Vec<NormalizedTrade>,
    pub sentiment: Option<SentimentResult>,
    pub volatility: Option<VolatilityResult>,
    pub account_balance: Option<AccountBalance>,
    pub last_update: i64,
}

impl FusedView {
    pub(crate) fn empty(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            ticker: None,
            order_book: None,
            recent_trades: Vec::new(),
            sentiment: None,
            volatility: None,
            account_balance: None,
            last_update: 0,
        }
    }
}

/// Periodic bundle pushed by the acquisition pipeline into a symbol's slot.
#[derive(Debug, Clone)]
pub struct PipelineUpdate {
    pub sentiment: SentimentResult,
    pub volatility: Option<VolatilityResult>,
    pub account_balance: AccountBalance,
}

/// Frames delivered to subscriber connections.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum OutboundMessage {
    MarketUpdate { symbol: String, data: FusedView },
    Alert { alert: Alert },
    AlertHistory { alerts: Vec<Alert> },
    #[serde(rename = "alert-thresholds-updated")]
    ThresholdsUpdated { success: bool },
}
