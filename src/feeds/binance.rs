use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use tokio::sync::mpsc;

use super::connection::{ExchangeProtocol, FeedClient};
use super::{
    field_f64, now_ms, parse_levels, ExchangeId, FeedConfig, FeedUpdate, MarketEvent,
    NormalizedOrderBook, NormalizedTick, NormalizedTrade, StreamKind,
};

/// Binance combined-stream protocol: streams are encoded in the connect URL
/// and every frame arrives wrapped in a `{stream, data}` envelope.
pub struct BinanceProtocol;

impl FeedClient<BinanceProtocol> {
    pub fn binance(config: FeedConfig, updates: mpsc::Sender<FeedUpdate>) -> Self {
        FeedClient::new(BinanceProtocol, config, updates)
    }
}

impl ExchangeProtocol for BinanceProtocol {
    fn exchange(&self) -> ExchangeId {
        ExchangeId::Binance
    }

    fn connect_url(&self, ws_url: &str, symbol: &str, kinds: &[StreamKind]) -> String {
        let lower = symbol.to_lowercase();
        let streams = kinds
            .iter()
            .map(|kind| match kind {
                StreamKind::Ticker => format!("{lower}@ticker"),
                StreamKind::Depth => format!("{lower}@depth20@100ms"),
                StreamKind::Trade => format!("{lower}@trade"),
            })
            .collect::<Vec<_>>()
            .join("/");
        format!("{ws_url}/stream?streams={streams}")
    }

    fn subscribe_frame(&self, _symbol: &str, _kinds: &[StreamKind]) -> Option<String> {
        None
    }

    fn parse_frame(&self, symbol: &str, raw: &str) -> Result<Option<MarketEvent>> {
        let value: Value = serde_json::from_str(raw).context("invalid json frame")?;

        // Subscription acks and other non-stream envelopes carry no data.
        let stream = match value.get("stream").and_then(Value::as_str) {
            Some(stream) => stream,
            None => return Ok(None),
        };
        let data = value
            .get("data")
            .ok_or_else(|| anyhow!("combined frame without data"))?;

        if stream.contains("@ticker") {
            Ok(Some(MarketEvent::Ticker(NormalizedTick {
                symbol: data
                    .get("s")
                    .and_then(Value::as_str)
                    .unwrap_or(symbol)
                    .to_string(),
                price: field_f64(data, "c")?,
                volume: field_f64(data, "v")?,
                price_change: field_f64(data, "p")?,
                price_change_percent: field_f64(data, "P")?,
                high: field_f64(data, "h")?,
                low: field_f64(data, "l")?,
                timestamp: data.get("E").and_then(Value::as_i64).unwrap_or_else(now_ms),
            })))
        } else if stream.contains("@depth") {
            Ok(Some(MarketEvent::OrderBook(NormalizedOrderBook {
                symbol: symbol.to_string(),
                bids: parse_levels(data.get("bids"))?,
                asks: parse_levels(data.get("asks"))?,
                timestamp: data.get("E").and_then(Value::as_i64).unwrap_or_else(now_ms),
            })))
        } else if stream.contains("@trade") {
            Ok(Some(MarketEvent::Trade(NormalizedTrade {
                symbol: data
                    .get("s")
                    .and_then(Value::as_str)
                    .unwrap_or(symbol)
                    .to_string(),
                price: field_f64(data, "p")?,
                quantity: field_f64(data, "q")?,
                timestamp: data
                    .get("T")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| anyhow!("trade frame missing timestamp"))?,
                is_buyer_maker: data.get("m").and_then(Value::as_bool).unwrap_or(false),
                trade_id: data.get("t").and_then(Value::as_i64).unwrap_or(0),
                exchange: ExchangeId::Binance,
            })))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol() -> BinanceProtocol {
        BinanceProtocol
    }

    #[test]
    fn connect_url_encodes_requested_streams() {
        let url = protocol().connect_url(
            "wss://stream.binance.com:9443",
            "BTCUSDT",
            &[StreamKind::Ticker, StreamKind::Trade],
        );
        assert_eq!(
            url,
            "wss://stream.binance.com:9443/stream?streams=btcusdt@ticker/btcusdt@trade"
        );
    }

    #[test]
    fn parses_ticker_frames() {
        let raw = r#"{
            "stream": "btcusdt@ticker",
            "data": {"s": "BTCUSDT", "c": "50000.5", "v": "1234.5", "p": "-120.5",
                     "P": "-0.24", "h": "51000", "l": "49000", "E": 1700000000123}
        }"#;
        let event = protocol().parse_frame("BTCUSDT", raw).unwrap().unwrap();
        match event {
            MarketEvent::Ticker(tick) => {
                assert_eq!(tick.symbol, "BTCUSDT");
                assert!((tick.price - 50000.5).abs() < f64::EPSILON);
                assert!((tick.price_change_percent + 0.24).abs() < f64::EPSILON);
                assert_eq!(tick.timestamp, 1_700_000_000_123);
            }
            other => panic!("expected ticker, got {other:?}"),
        }
    }

    #[test]
    fn parses_depth_frames() {
        let raw = r#"{
            "stream": "btcusdt@depth20@100ms",
            "data": {"lastUpdateId": 1, "bids": [["50000", "1.5"], ["49999", "2"]],
                     "asks": [["50001", "0.7"]]}
        }"#;
        let event = protocol().parse_frame("BTCUSDT", raw).unwrap().unwrap();
        match event {
            MarketEvent::OrderBook(book) => {
                assert_eq!(book.bids.len(), 2);
                assert_eq!(book.asks.len(), 1);
                assert!((book.bids[0].price - 50_000.0).abs() < f64::EPSILON);
            }
            other => panic!("expected order book, got {other:?}"),
        }
    }

    #[test]
    fn parses_trade_frames() {
        let raw = r#"{
            "stream": "btcusdt@trade",
            "data": {"s": "BTCUSDT", "p": "50000.1", "q": "0.25",
                     "T": 1700000000456, "m": true, "t": 987654}
        }"#;
        let event = protocol().parse_frame("BTCUSDT", raw).unwrap().unwrap();
        match event {
            MarketEvent::Trade(trade) => {
                assert!(trade.is_buyer_maker);
                assert_eq!(trade.trade_id, 987_654);
                assert_eq!(trade.exchange, ExchangeId::Binance);
            }
            other => panic!("expected trade, got {other:?}"),
        }
    }

    #[test]
    fn acks_map_to_no_event() {
        let raw = r#"{"result": null, "id": 1}"#;
        assert!(protocol().parse_frame("BTCUSDT", raw).unwrap().is_none());
    }

    #[test]
    fn malformed_frames_error_without_panicking() {
        assert!(protocol().parse_frame("BTCUSDT", "not json").is_err());

        let missing_fields = r#"{"stream": "btcusdt@ticker", "data": {"s": "BTCUSDT"}}"#;
        assert!(protocol().parse_frame("BTCUSDT", missing_fields).is_err());
    }
}
