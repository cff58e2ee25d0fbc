use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::alerts::AlertDetector;
use crate::feeds::{
    ExchangeId, FeedUpdate, MarketEvent, NormalizedOrderBook, NormalizedTick, NormalizedTrade,
    MarketFeed, DEFAULT_STREAM_KINDS,
};

use super::{
    ExchangeQuote, FusedOrderBook, FusedTicker, FusedView, OutboundMessage, PipelineUpdate,
};

pub type ConnectionId = Uuid;

const MAX_BOOK_LEVELS: usize = 20;
const MAX_RECENT_TRADES: usize = 50;
const TRADES_KEPT_PER_EXCHANGE: usize = 50;

#[derive(Debug, Default)]
struct ExchangeSlot {
    ticker: Option<NormalizedTick>,
    order_book: Option<NormalizedOrderBook>,
    trades: VecDeque<NormalizedTrade>,
    last_update: i64,
}

#[derive(Debug, Default)]
struct PipelineSlot {
    sentiment: Option<crate::api::types::SentimentResult>,
    volatility: Option<crate::pipeline::VolatilityResult>,
    account_balance: Option<crate::api::types::AccountBalance>,
    last_update: i64,
}

#[derive(Debug, Default)]
struct SymbolState {
    exchanges: HashMap<ExchangeId, ExchangeSlot>,
    pipeline: PipelineSlot,
}

/// Per-symbol aggregation point. Holds the latest per-exchange and pipeline
/// snapshots, fuses them on demand, and fans the fused view out to the
/// symbol's subscriber set. Feed subscriptions start lazily with the first
/// subscriber and are torn down eagerly with the last.
pub struct MarketContext {
    feeds: Vec<Arc<dyn MarketFeed>>,
    exchange_priority: Vec<ExchangeId>,
    alert_detector: Arc<AlertDetector>,
    primary_staleness_ms: i64,
    state: RwLock<HashMap<String, SymbolState>>,
    subscribers: RwLock<HashMap<String, HashSet<ConnectionId>>>,
    connections: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<OutboundMessage>>>,
}

impl MarketContext {
    pub fn new(
        feeds: Vec<Arc<dyn MarketFeed>>,
        alert_detector: Arc<AlertDetector>,
        primary_staleness_ms: i64,
    ) -> Self {
        let exchange_priority: Vec<ExchangeId> = if feeds.is_empty() {
            vec![ExchangeId::Binance, ExchangeId::Delta]
        } else {
            feeds.iter().map(|feed| feed.exchange()).collect()
        };

        Self {
            feeds,
            exchange_priority,
            alert_detector,
            primary_staleness_ms,
            state: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Drain the feed-update channel into per-symbol state. Runs for the
    /// lifetime of the process.
    pub async fn run(self: Arc<Self>, mut updates: mpsc::Receiver<FeedUpdate>) {
        while let Some(update) = updates.recv().await {
            self.apply_feed_update(update).await;
        }
        debug!("feed update channel closed, aggregator loop ending");
    }

    pub async fn apply_feed_update(&self, update: FeedUpdate) {
        let FeedUpdate {
            exchange,
            symbol,
            event,
        } = update;

        {
            let mut state = self.state.write().await;
            let slot = state
                .entry(symbol.clone())
                .or_default()
                .exchanges
                .entry(exchange)
                .or_default();

            match event {
                MarketEvent::Ticker(tick) => slot.ticker = Some(tick),
                MarketEvent::OrderBook(book) => slot.order_book = Some(book),
                MarketEvent::Trade(trade) => {
                    slot.trades.push_front(trade);
                    slot.trades.truncate(TRADES_KEPT_PER_EXCHANGE);
                }
            }
            slot.last_update = Utc::now().timestamp_millis();
        }

        self.broadcast(&symbol).await;
    }

    /// Merge one pipeline bundle into a symbol's slot, overwriting fields and
    /// stamping the slot's update time.
    pub async fn update_pipeline(&self, symbol: &str, update: PipelineUpdate) {
        {
            let mut state = self.state.write().await;
            let slot = &mut state.entry(symbol.to_string()).or_default().pipeline;
            slot.sentiment = Some(update.sentiment);
            slot.volatility = update.volatility;
            slot.account_balance = Some(update.account_balance);
            slot.last_update = Utc::now().timestamp_millis();
        }

        self.broadcast(symbol).await;
    }

    pub async fn register_connection(
        &self,
        connection: ConnectionId,
        sender: mpsc::UnboundedSender<OutboundMessage>,
    ) {
        self.connections.write().await.insert(connection, sender);
    }

    pub async fn subscribe(&self, connection: ConnectionId, symbol: &str) {
        let first_subscriber = {
            let mut subscribers = self.subscribers.write().await;
            let set = subscribers.entry(symbol.to_string()).or_default();
            let was_empty = set.is_empty();
            set.insert(connection);
            was_empty
        };

        if first_subscriber {
            info!(symbol, "first subscriber, starting exchange feeds");
            for feed in &self.feeds {
                feed.subscribe(symbol, &DEFAULT_STREAM_KINDS).await;
            }
        }

        // New subscribers get the current view immediately.
        let view = self.fused_view(symbol).await;
        let sender = self.connections.read().await.get(&connection).cloned();
        if let Some(sender) = sender {
            let _ = sender.send(OutboundMessage::MarketUpdate {
                symbol: symbol.to_string(),
                data: view,
            });
        }
    }

    pub async fn unsubscribe(&self, connection: ConnectionId, symbol: &str) {
        let now_empty = {
            let mut subscribers = self.subscribers.write().await;
            let Some(set) = subscribers.get_mut(symbol) else {
                return;
            };
            set.remove(&connection);
            if set.is_empty() {
                subscribers.remove(symbol);
                true
            } else {
                false
            }
        };

        if now_empty {
            info!(symbol, "last subscriber left, tearing down feeds");
            for feed in &self.feeds {
                feed.unsubscribe(symbol).await;
            }
            self.state.write().await.remove(symbol);
            self.alert_detector.clear_symbol(symbol).await;
        }
    }

    /// Remove a connection entirely, unsubscribing it from every symbol.
    pub async fn drop_connection(&self, connection: ConnectionId) {
        self.connections.write().await.remove(&connection);

        let symbols: Vec<String> = {
            self.subscribers
                .read()
                .await
                .iter()
                .filter(|(_, set)| set.contains(&connection))
                .map(|(symbol, _)| symbol.clone())
                .collect()
        };
        for symbol in symbols {
            self.unsubscribe(connection, &symbol).await;
        }
    }

    pub async fn subscriber_count(&self, symbol: &str) -> usize {
        self.subscribers
            .read()
            .await
            .get(symbol)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    pub async fn tracked_symbols(&self) -> Vec<String> {
        self.state.read().await.keys().cloned().collect()
    }

    /// Recompute the fused view for a symbol from the latest slots.
    pub async fn fused_view(&self, symbol: &str) -> FusedView {
        let state = self.state.read().await;
        let Some(symbol_state) = state.get(symbol) else {
            return FusedView::empty(symbol);
        };

        let now = Utc::now().timestamp_millis();
        let pipeline = &symbol_state.pipeline;
        let last_update = symbol_state
            .exchanges
            .values()
            .map(|slot| slot.last_update)
            .chain(std::iter::once(pipeline.last_update))
            .max()
            .unwrap_or(0);

        FusedView {
            symbol: symbol.to_string(),
            ticker: self.fuse_ticker(symbol_state, now),
            order_book: fuse_order_book(symbol_state),
            recent_trades: fuse_trades(symbol_state),
            sentiment: pipeline.sentiment.clone(),
            volatility: pipeline.volatility.clone(),
            account_balance: pipeline.account_balance,
            last_update,
        }
    }

    /// Promote the first-priority exchange with a fresh ticker. Falling back
    /// to a lower-priority or stale ticker marks the result degraded so
    /// consumers can tell a silently dying primary from live data.
    fn fuse_ticker(&self, symbol_state: &SymbolState, now: i64) -> Option<FusedTicker> {
        let mut chosen: Option<(&NormalizedTick, bool)> = None;
        for (index, exchange) in self.exchange_priority.iter().enumerate() {
            let Some(slot) = symbol_state.exchanges.get(exchange) else {
                continue;
            };
            let Some(tick) = slot.ticker.as_ref() else {
                continue;
            };
            if now - slot.last_update <= self.primary_staleness_ms {
                chosen = Some((tick, index == 0));
                break;
            }
        }

        let (primary, fresh_primary) = match chosen {
            Some(found) => found,
            None => {
                // Everything is stale; serve the best stale ticker, flagged.
                let stale = self
                    .exchange_priority
                    .iter()
                    .filter_map(|exchange| symbol_state.exchanges.get(exchange))
                    .filter_map(|slot| slot.ticker.as_ref())
                    .next()?;
                (stale, false)
            }
        };

        let exchanges = symbol_state
            .exchanges
            .iter()
            .filter_map(|(exchange, slot)| {
                slot.ticker.as_ref().map(|tick| {
                    (
                        exchange.as_str().to_string(),
                        ExchangeQuote {
                            price: tick.price,
                            volume: tick.volume,
                        },
                    )
                })
            })
            .collect();

        Some(FusedTicker {
            symbol: primary.symbol.clone(),
            price: primary.price,
            volume: primary.volume,
            price_change: primary.price_change,
            price_change_percent: primary.price_change_percent,
            high: primary.high,
            low: primary.low,
            exchanges,
            timestamp: primary.timestamp,
            degraded: !fresh_primary,
        })
    }

    async fn broadcast(&self, symbol: &str) {
        let targets: Vec<mpsc::UnboundedSender<OutboundMessage>> = {
            let subscribers = self.subscribers.read().await;
            let Some(set) = subscribers.get(symbol) else {
                return;
            };
            let connections = self.connections.read().await;
            set.iter()
                .filter_map(|connection| connections.get(connection).cloned())
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        let view = self.fused_view(symbol).await;
        for sender in targets {
            let _ = sender.send(OutboundMessage::MarketUpdate {
                symbol: symbol.to_string(),
                data: view.clone(),
            });
        }
    }
}

/// Books concatenated across exchanges, re-sorted, truncated to the top
/// levels per side.
fn fuse_order_book(symbol_state: &SymbolState) -> Option<FusedOrderBook> {
    let mut bids = Vec::new();
    let mut asks = Vec::new();
    let mut timestamp = 0;
    let mut any = false;

    for slot in symbol_state.exchanges.values() {
        if let Some(book) = &slot.order_book {
            any = true;
            bids.extend_from_slice(&book.bids);
            asks.extend_from_slice(&book.asks);
            timestamp = timestamp.max(book.timestamp);
        }
    }
    if !any {
        return None;
    }

    bids.sort_by(|a, b| b.price.total_cmp(&a.price));
    asks.sort_by(|a, b| a.price.total_cmp(&b.price));
    bids.truncate(MAX_BOOK_LEVELS);
    asks.truncate(MAX_BOOK_LEVELS);

    Some(FusedOrderBook {
        bids,
        asks,
        timestamp,
    })
}

fn fuse_trades(symbol_state: &SymbolState) -> Vec<NormalizedTrade> {
    let mut trades: Vec<NormalizedTrade> = symbol_state
        .exchanges
        .values()
        .flat_map(|slot| slot.trades.iter().cloned())
        .collect();
    trades.sort_by_key(|trade| std::cmp::Reverse(trade.timestamp));
    trades.truncate(MAX_RECENT_TRADES);
    trades
}
