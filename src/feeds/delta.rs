use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::connection::{ExchangeProtocol, FeedClient};
use super::{
    field_f64, now_ms, parse_levels, ExchangeId, FeedConfig, FeedUpdate, MarketEvent,
    NormalizedOrderBook, NormalizedTick, NormalizedTrade, StreamKind,
};

/// Delta channel protocol: one bare socket per symbol with an explicit
/// subscribe payload, frames tagged `type: "data"` per channel.
pub struct DeltaProtocol;

impl FeedClient<DeltaProtocol> {
    pub fn delta(config: FeedConfig, updates: mpsc::Sender<FeedUpdate>) -> Self {
        FeedClient::new(DeltaProtocol, config, updates)
    }
}

fn channel_name(kind: StreamKind) -> &'static str {
    match kind {
        StreamKind::Ticker => "ticker",
        StreamKind::Depth => "l2_orderbook",
        StreamKind::Trade => "trades",
    }
}

impl ExchangeProtocol for DeltaProtocol {
    fn exchange(&self) -> ExchangeId {
        ExchangeId::Delta
    }

    fn connect_url(&self, ws_url: &str, _symbol: &str, _kinds: &[StreamKind]) -> String {
        ws_url.to_string()
    }

    fn subscribe_frame(&self, symbol: &str, kinds: &[StreamKind]) -> Option<String> {
        let channels: Vec<Value> = kinds
            .iter()
            .map(|kind| json!({"name": channel_name(*kind), "symbol": symbol}))
            .collect();
        Some(
            json!({
                "type": "subscribe",
                "payload": {"channels": channels}
            })
            .to_string(),
        )
    }

    fn parse_frame(&self, symbol: &str, raw: &str) -> Result<Option<MarketEvent>> {
        let value: Value = serde_json::from_str(raw).context("invalid json frame")?;

        if value.get("type").and_then(Value::as_str) != Some("data") {
            return Ok(None);
        }
        let data = value
            .get("data")
            .ok_or_else(|| anyhow!("data frame without payload"))?;

        match value.get("channel").and_then(Value::as_str) {
            Some("ticker") => Ok(Some(MarketEvent::Ticker(NormalizedTick {
                symbol: data
                    .get("symbol")
                    .and_then(Value::as_str)
                    .unwrap_or(symbol)
                    .to_string(),
                price: field_f64(data, "close")?,
                volume: field_f64(data, "volume")?,
                price_change: field_f64(data, "change_24h")?,
                price_change_percent: field_f64(data, "change_percentage_24h")?,
                high: field_f64(data, "high_24h")?,
                low: field_f64(data, "low_24h")?,
                timestamp: data
                    .get("timestamp")
                    .and_then(Value::as_i64)
                    .unwrap_or_else(now_ms),
            }))),
            Some("l2_orderbook") => Ok(Some(MarketEvent::OrderBook(NormalizedOrderBook {
                symbol: data
                    .get("symbol")
                    .and_then(Value::as_str)
                    .unwrap_or(symbol)
                    .to_string(),
                bids: parse_levels(data.get("bids"))?,
                asks: parse_levels(data.get("asks"))?,
                timestamp: data
                    .get("timestamp")
                    .and_then(Value::as_i64)
                    .unwrap_or_else(now_ms),
            }))),
            Some("trades") => Ok(Some(MarketEvent::Trade(NormalizedTrade {
                symbol: data
                    .get("symbol")
                    .and_then(Value::as_str)
                    .unwrap_or(symbol)
                    .to_string(),
                price: field_f64(data, "price")?,
                quantity: field_f64(data, "size")?,
                timestamp: data
                    .get("timestamp")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| anyhow!("trade frame missing timestamp"))?,
                // Delta tags the aggressor side; a sell aggressor means the
                // buyer was the resting maker.
                is_buyer_maker: data.get("side").and_then(Value::as_str) == Some("sell"),
                trade_id: data.get("trade_id").and_then(Value::as_i64).unwrap_or(0),
                exchange: ExchangeId::Delta,
            }))),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol() -> DeltaProtocol {
        DeltaProtocol
    }

    #[test]
    fn subscribe_frame_lists_requested_channels() {
        let frame = protocol()
            .subscribe_frame("BTCUSDT", &[StreamKind::Ticker, StreamKind::Depth])
            .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "subscribe");
        let channels = value["payload"]["channels"].as_array().unwrap();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0]["name"], "ticker");
        assert_eq!(channels[1]["name"], "l2_orderbook");
        assert_eq!(channels[1]["symbol"], "BTCUSDT");
    }

    #[test]
    fn parses_ticker_frames() {
        let raw = r#"{
            "type": "data", "channel": "ticker",
            "data": {"symbol": "BTCUSDT", "close": "50100", "volume": "9876",
                     "change_24h": "150", "change_percentage_24h": "0.3",
                     "high_24h": "50500", "low_24h": "49500", "timestamp": 1700000001000}
        }"#;
        let event = protocol().parse_frame("BTCUSDT", raw).unwrap().unwrap();
        match event {
            MarketEvent::Ticker(tick) => {
                assert!((tick.price - 50_100.0).abs() < f64::EPSILON);
                assert_eq!(tick.timestamp, 1_700_000_001_000);
            }
            other => panic!("expected ticker, got {other:?}"),
        }
    }

    #[test]
    fn parses_trades_with_aggressor_side() {
        let raw = r#"{
            "type": "data", "channel": "trades",
            "data": {"symbol": "BTCUSDT", "price": "50050", "size": "0.5",
                     "timestamp": 1700000002000, "side": "sell", "trade_id": 42}
        }"#;
        let event = protocol().parse_frame("BTCUSDT", raw).unwrap().unwrap();
        match event {
            MarketEvent::Trade(trade) => {
                assert!(trade.is_buyer_maker);
                assert_eq!(trade.exchange, ExchangeId::Delta);
            }
            other => panic!("expected trade, got {other:?}"),
        }
    }

    #[test]
    fn subscription_acks_are_ignored() {
        let raw = r#"{"type": "subscriptions", "channels": [{"name": "ticker"}]}"#;
        assert!(protocol().parse_frame("BTCUSDT", raw).unwrap().is_none());
    }

    #[test]
    fn malformed_book_frame_is_an_error() {
        let raw = r#"{"type": "data", "channel": "l2_orderbook", "data": {"symbol": "BTCUSDT"}}"#;
        assert!(protocol().parse_frame("BTCUSDT", raw).is_err());
    }
}
