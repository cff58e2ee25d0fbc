pub mod binance;
pub mod connection;
pub mod delta;

pub use binance::BinanceProtocol;
pub use connection::{ExchangeProtocol, FeedClient};
pub use delta::DeltaProtocol;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub type BinanceFeedClient = FeedClient<BinanceProtocol>;
pub type DeltaFeedClient = FeedClient<DeltaProtocol>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeId {
    Binance,
    Delta,
}

impl ExchangeId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeId::Binance => "binance",
            ExchangeId::Delta => "delta",
        }
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Ticker,
    Depth,
    Trade,
}

pub const DEFAULT_STREAM_KINDS: [StreamKind; 3] =
    [StreamKind::Ticker, StreamKind::Depth, StreamKind::Trade];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Reconnecting,
    Closed,
}

/// Exchange-agnostic ticker snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedTick {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub price_change: f64,
    pub price_change_percent: f64,
    pub high: f64,
    pub low: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub quantity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedOrderBook {
    pub symbol: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedTrade {
    pub symbol: String,
    pub price: f64,
    pub quantity: f64,
    pub timestamp: i64,
    pub is_buyer_maker: bool,
    pub trade_id: i64,
    pub exchange: ExchangeId,
}

/// One frame's worth of market data, tagged by stream kind at the parse
/// boundary.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    Ticker(NormalizedTick),
    OrderBook(NormalizedOrderBook),
    Trade(NormalizedTrade),
}

/// Unit of delivery from a feed client to the aggregator.
#[derive(Debug, Clone)]
pub struct FeedUpdate {
    pub exchange: ExchangeId,
    pub symbol: String,
    pub event: MarketEvent,
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub ws_url: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub connect_timeout_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ws_url: String::new(),
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 1000,
            connect_timeout_secs: 10,
        }
    }
}

/// The aggregator's view of a feed client: per-symbol subscription lifecycle.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    fn exchange(&self) -> ExchangeId;
    async fn subscribe(&self, symbol: &str, kinds: &[StreamKind]);
    async fn unsubscribe(&self, symbol: &str);
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Numeric field that exchanges serialize either as a JSON number or a string.
pub(crate) fn value_f64(value: &Value) -> Result<f64> {
    match value {
        Value::String(raw) => raw
            .parse::<f64>()
            .map_err(|_| anyhow!("'{raw}' is not numeric")),
        Value::Number(number) => number
            .as_f64()
            .ok_or_else(|| anyhow!("number not representable as f64")),
        other => Err(anyhow!("unexpected value type: {other}")),
    }
}

pub(crate) fn field_f64(data: &Value, key: &str) -> Result<f64> {
    let field = data
        .get(key)
        .ok_or_else(|| anyhow!("missing field '{key}'"))?;
    value_f64(field).map_err(|err| anyhow!("field '{key}': {err}"))
}

/// Price levels serialized as `[[price, quantity], ...]` pairs.
pub(crate) fn parse_levels(value: Option<&Value>) -> Result<Vec<BookLevel>> {
    let rows = value
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("missing book levels"))?;

    rows.iter()
        .map(|row| {
            let pair = row
                .as_array()
                .filter(|pair| pair.len() >= 2)
                .ok_or_else(|| anyhow!("book level is not a [price, quantity] pair"))?;
            Ok(BookLevel {
                price: value_f64(&pair[0])?,
                quantity: value_f64(&pair[1])?,
            })
        })
        .collect()
}
