use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use market_fusion::alerts::AlertDetector;
use market_fusion::api::types::{
    OptionContract, PricePoint, SentimentResult, SentimentScores,
};
use market_fusion::api::{HistoricalDataSource, OptionsSource, SentimentSource};
use market_fusion::core::config::BreakersConfig;
use market_fusion::feeds::{ExchangeId, MarketFeed, StreamKind};
use market_fusion::fusion::{MarketContext, OutboundMessage};
use market_fusion::pipeline::{DataAcquisitionPipeline, PipelineConfig, PipelineSources};

struct StaticHistory(Vec<PricePoint>);

#[async_trait]
impl HistoricalDataSource for StaticHistory {
    async fn historical_prices(&self, _asset: &str, _days: u32) -> Result<Vec<PricePoint>> {
        Ok(self.0.clone())
    }
}

struct FailingHistory;

#[async_trait]
impl HistoricalDataSource for FailingHistory {
    async fn historical_prices(&self, _asset: &str, _days: u32) -> Result<Vec<PricePoint>> {
        Err(anyhow!("upstream unavailable"))
    }
}

struct StaticSentiment(f64);

#[async_trait]
impl SentimentSource for StaticSentiment {
    async fn market_sentiment(&self) -> Result<SentimentResult> {
        Ok(SentimentResult {
            overall: SentimentScores {
                positive: 0.6,
                negative: 0.1,
                neutral: 0.3,
                compound: self.0,
            },
            article_count: 25,
            timestamp: 1_700_000_000_000,
            error: None,
        })
    }
}

struct EmptyOptions;

#[async_trait]
impl OptionsSource for EmptyOptions {
    async fn options_chain(&self, _underlying: &str) -> Result<Vec<OptionContract>> {
        Ok(Vec::new())
    }
}

struct CountingFeed {
    id: ExchangeId,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

#[async_trait]
impl MarketFeed for CountingFeed {
    fn exchange(&self) -> ExchangeId {
        self.id
    }

    async fn subscribe(&self, _symbol: &str, _kinds: &[StreamKind]) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    async fn unsubscribe(&self, _symbol: &str) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

fn daily_points(count: usize) -> Vec<PricePoint> {
    (0..count)
        .map(|i| PricePoint {
            timestamp: 1_700_000_000_000 + i as i64 * 86_400_000,
            price: if i % 2 == 0 { 100.0 } else { 103.0 },
        })
        .collect()
}

fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        interval_ms: 5000,
        historical_days: 30,
        assets: vec!["bitcoin".to_string()],
        symbols: vec!["BTCUSDT".to_string()],
    }
}

fn breakers() -> BreakersConfig {
    BreakersConfig {
        market_failure_threshold: 5,
        market_recovery_ms: 60_000,
        sentiment_failure_threshold: 3,
        sentiment_recovery_ms: 300_000,
    }
}

fn build_pipeline(
    historical: Arc<dyn HistoricalDataSource>,
    context: Arc<MarketContext>,
    detector: Arc<AlertDetector>,
) -> Arc<DataAcquisitionPipeline> {
    Arc::new(DataAcquisitionPipeline::new(
        pipeline_config(),
        PipelineSources {
            historical,
            sentiment: Arc::new(StaticSentiment(0.45)),
            options: Arc::new(EmptyOptions),
        },
        context,
        detector,
        &breakers(),
    ))
}

#[tokio::test]
async fn subscriber_sees_pipeline_output_end_to_end() {
    let detector = Arc::new(AlertDetector::new());
    let context = Arc::new(MarketContext::new(vec![], detector.clone(), 30_000));
    let pipeline = build_pipeline(
        Arc::new(StaticHistory(daily_points(30))),
        context.clone(),
        detector,
    );

    let (sender, mut receiver) = mpsc::unbounded_channel();
    let connection = Uuid::new_v4();
    context.register_connection(connection, sender).await;
    context.subscribe(connection, "BTCUSDT").await;

    // Initial snapshot is empty before the first cycle.
    match receiver.recv().await.unwrap() {
        OutboundMessage::MarketUpdate { data, .. } => assert!(data.sentiment.is_none()),
        other => panic!("expected initial snapshot, got {other:?}"),
    }

    pipeline.run_cycle().await;

    match receiver.recv().await.unwrap() {
        OutboundMessage::MarketUpdate { symbol, data } => {
            assert_eq!(symbol, "BTCUSDT");
            let sentiment = data.sentiment.expect("sentiment after cycle");
            assert!((sentiment.overall.compound - 0.45).abs() < f64::EPSILON);
            let volatility = data.volatility.expect("volatility after cycle");
            assert!(volatility.historical_volatility.unwrap() > 0.0);
            assert!(data.account_balance.is_some());
            assert!(data.last_update > 0);
        }
        other => panic!("expected market update, got {other:?}"),
    }
}

#[tokio::test]
async fn permanently_failing_history_degrades_gracefully() {
    let detector = Arc::new(AlertDetector::new());
    let context = Arc::new(MarketContext::new(vec![], detector.clone(), 30_000));
    let pipeline = build_pipeline(Arc::new(FailingHistory), context.clone(), detector);

    // Enough cycles to trip the historical circuit breaker and keep going.
    for _ in 0..8 {
        pipeline.run_cycle().await;
    }

    let view = context.fused_view("BTCUSDT").await;
    assert!(view.volatility.is_none());
    let sentiment = view.sentiment.expect("sentiment survives historical outage");
    assert!(sentiment.error.is_none());

    let status = pipeline.status().await;
    assert!(status.last_update.is_some());
    assert_eq!(status.assets, vec!["bitcoin".to_string()]);
}

#[tokio::test]
async fn feed_lifecycle_follows_subscriber_set() {
    let binance = Arc::new(CountingFeed {
        id: ExchangeId::Binance,
        starts: AtomicUsize::new(0),
        stops: AtomicUsize::new(0),
    });
    let delta = Arc::new(CountingFeed {
        id: ExchangeId::Delta,
        starts: AtomicUsize::new(0),
        stops: AtomicUsize::new(0),
    });
    let detector = Arc::new(AlertDetector::new());
    let context = Arc::new(MarketContext::new(
        vec![binance.clone() as Arc<dyn MarketFeed>, delta.clone()],
        detector,
        30_000,
    ));

    let (sender, _receiver) = mpsc::unbounded_channel();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    context.register_connection(first, sender.clone()).await;
    context.register_connection(second, sender).await;

    context.subscribe(first, "BTCUSDT").await;
    context.subscribe(second, "BTCUSDT").await;
    assert_eq!(binance.starts.load(Ordering::SeqCst), 1);
    assert_eq!(delta.starts.load(Ordering::SeqCst), 1);

    // Dropping one connection keeps the feeds; dropping the last tears down.
    context.drop_connection(first).await;
    assert_eq!(binance.stops.load(Ordering::SeqCst), 0);

    context.drop_connection(second).await;
    assert_eq!(binance.stops.load(Ordering::SeqCst), 1);
    assert_eq!(delta.stops.load(Ordering::SeqCst), 1);
    assert_eq!(context.subscriber_count("BTCUSDT").await, 0);
}
