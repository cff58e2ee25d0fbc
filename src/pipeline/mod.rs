pub mod cache;

pub use cache::{CacheStats, TtlCache};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::alerts::{AlertDetector, Observation};
use crate::api::types::{AccountBalance, OptionContract, PricePoint, SentimentResult};
use crate::api::{HistoricalDataSource, OptionsSource, SentimentSource};
use crate::core::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::core::config::BreakersConfig;
use crate::fusion::{MarketContext, PipelineUpdate};
use crate::volatility::{VolatilityEngine, DEFAULT_RISK_FREE_RATE};

const MIN_PRICE_POINTS: usize = 21;
const HISTORICAL_CACHE_TTL: Duration = Duration::from_secs(300);
const SENTIMENT_CACHE_TTL: Duration = Duration::from_secs(300);
const OPTIONS_CACHE_TTL: Duration = Duration::from_secs(60);
const SENTIMENT_CACHE_KEY: &str = "market";

/// Per-asset volatility metrics for one cycle. A per-asset calculation error
/// is recorded here instead of failing the cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolatilityResult {
    pub historical_volatility: Option<f64>,
    pub implied_volatility: Option<f64>,
    pub spot_price: Option<f64>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One asset's cached price series plus any degradation marker from the
/// fetch that produced it.
#[derive(Debug, Clone)]
pub struct AssetSeries {
    pub asset: String,
    pub points: Vec<PricePoint>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub interval_ms: u64,
    pub historical_days: u32,
    pub assets: Vec<String>,
    pub symbols: Vec<String>,
}

pub struct PipelineSources {
    pub historical: Arc<dyn HistoricalDataSource>,
    pub sentiment: Arc<dyn SentimentSource>,
    pub options: Arc<dyn OptionsSource>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineCacheStats {
    pub historical: CacheStats,
    pub sentiment: CacheStats,
    pub options: CacheStats,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    pub is_running: bool,
    pub interval_ms: u64,
    pub assets: Vec<String>,
    pub symbols: Vec<String>,
    pub last_update: Option<DateTime<Utc>>,
    pub cache: PipelineCacheStats,
}

/// Timer-driven acquisition orchestrator: pulls historical prices, sentiment
/// and options chains through circuit breakers and caches, runs the
/// volatility engine, and pushes the assembled bundle into the aggregator.
/// Every step degrades in place; a cycle never fails as a whole.
pub struct DataAcquisitionPipeline {
    config: PipelineConfig,
    historical_source: Arc<dyn HistoricalDataSource>,
    sentiment_source: Arc<dyn SentimentSource>,
    options_source: Arc<dyn OptionsSource>,
    engine: VolatilityEngine,
    context: Arc<MarketContext>,
    alert_detector: Arc<AlertDetector>,
    historical_breaker: CircuitBreaker,
    sentiment_breaker: CircuitBreaker,
    options_breaker: CircuitBreaker,
    historical_cache: TtlCache<String, Vec<PricePoint>>,
    sentiment_cache: TtlCache<String, SentimentResult>,
    options_cache: TtlCache<String, Vec<OptionContract>>,
    running: RwLock<bool>,
    last_update: RwLock<Option<DateTime<Utc>>>,
    shutdown: watch::Sender<bool>,
}

impl DataAcquisitionPipeline {
    pub fn new(
        config: PipelineConfig,
        sources: PipelineSources,
        context: Arc<MarketContext>,
        alert_detector: Arc<AlertDetector>,
        breakers: &BreakersConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            historical_source: sources.historical,
            sentiment_source: sources.sentiment,
            options_source: sources.options,
            engine: VolatilityEngine::new(),
            context,
            alert_detector,
            historical_breaker: CircuitBreaker::new(
                "historical-data",
                breakers.market_failure_threshold,
                Duration::from_millis(breakers.market_recovery_ms),
            ),
            sentiment_breaker: CircuitBreaker::new(
                "sentiment",
                breakers.sentiment_failure_threshold,
                Duration::from_millis(breakers.sentiment_recovery_ms),
            ),
            options_breaker: CircuitBreaker::new(
                "options-chain",
                breakers.market_failure_threshold,
                Duration::from_millis(breakers.market_recovery_ms),
            ),
            historical_cache: TtlCache::new(HISTORICAL_CACHE_TTL),
            sentiment_cache: TtlCache::new(SENTIMENT_CACHE_TTL),
            options_cache: TtlCache::new(OPTIONS_CACHE_TTL),
            running: RwLock::new(false),
            last_update: RwLock::new(None),
            shutdown,
        }
    }

    /// Spawn the cycle loop. Cycles are serialized: the next tick fires only
    /// after the previous cycle returned.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let pipeline = self;
        tokio::spawn(async move {
            {
                let mut running = pipeline.running.write().await;
                if *running {
                    info!("pipeline already running");
                    return;
                }
                *running = true;
            }

            info!(
                interval_ms = pipeline.config.interval_ms,
                assets = ?pipeline.config.assets,
                "starting data acquisition pipeline"
            );

            let mut shutdown = pipeline.shutdown.subscribe();
            let mut interval =
                tokio::time::interval(Duration::from_millis(pipeline.config.interval_ms));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => pipeline.run_cycle().await,
                    _ = shutdown.changed() => break,
                }
            }

            *pipeline.running.write().await = false;
            info!("pipeline stopped");
        })
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// One acquisition cycle. Each step substitutes cached or fallback data
    /// on failure, so the cycle itself always completes and the next one is
    /// always scheduled.
    pub async fn run_cycle(&self) {
        debug!("starting acquisition cycle");
        let started = std::time::Instant::now();

        let historical = self.fetch_historical_data().await;
        let sentiment = self.fetch_market_sentiment().await;
        let volatility = self.compute_volatility(&historical).await;
        self.publish(sentiment, volatility).await;

        *self.last_update.write().await = Some(Utc::now());
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "acquisition cycle completed"
        );
    }

    /// Historical series per tracked asset: cache first, then the guarded
    /// source. On failure or an open circuit the last cached series (or an
    /// empty one) is served with an error marker.
    pub async fn fetch_historical_data(&self) -> Vec<AssetSeries> {
        let mut series = Vec::with_capacity(self.config.assets.len());

        for asset in &self.config.assets {
            if let Some(points) = self.historical_cache.get(asset) {
                series.push(AssetSeries {
                    asset: asset.clone(),
                    points,
                    error: None,
                });
                continue;
            }

            let source = Arc::clone(&self.historical_source);
            let asset_name = asset.clone();
            let days = self.config.historical_days;
            let result = self
                .historical_breaker
                .execute(|| async move { source.historical_prices(&asset_name, days).await })
                .await;

            let (points, error) = match result {
                Ok(points) => {
                    self.historical_cache.set(asset.clone(), points.clone());
                    (points, None)
                }
                Err(CircuitBreakerError::Open(_)) => {
                    warn!(asset = %asset, "historical data circuit open, serving cached series");
                    (
                        self.historical_cache.get(asset).unwrap_or_default(),
                        Some("historical data circuit open".to_string()),
                    )
                }
                Err(err) => {
                    warn!(asset = %asset, error = %err, "historical data fetch failed");
                    (
                        self.historical_cache.get(asset).unwrap_or_default(),
                        Some(err.to_string()),
                    )
                }
            };
            series.push(AssetSeries {
                asset: asset.clone(),
                points,
                error,
            });
        }

        series
    }

    /// Aggregate sentiment: cache first, then the guarded provider, then the
    /// neutral fallback tagged with an error marker.
    pub async fn fetch_market_sentiment(&self) -> SentimentResult {
        if let Some(cached) = self.sentiment_cache.get(&SENTIMENT_CACHE_KEY.to_string()) {
            return cached;
        }

        let source = Arc::clone(&self.sentiment_source);
        match self
            .sentiment_breaker
            .execute(|| async move { source.market_sentiment().await })
            .await
        {
            Ok(sentiment) => {
                self.sentiment_cache
                    .set(SENTIMENT_CACHE_KEY.to_string(), sentiment.clone());
                sentiment
            }
            Err(err) => {
                warn!(error = %err, "sentiment fetch failed, using neutral fallback");
                SentimentResult::neutral_fallback()
            }
        }
    }

    /// Volatility metrics for every asset with enough cached history. A
    /// failing asset records its error and never stops the others.
    async fn compute_volatility(
        &self,
        historical: &[AssetSeries],
    ) -> HashMap<String, VolatilityResult> {
        let mut volatility = HashMap::new();

        for series in historical {
            if series.points.len() < MIN_PRICE_POINTS {
                debug!(
                    asset = %series.asset,
                    points = series.points.len(),
                    "not enough price history for volatility"
                );
                continue;
            }

            let prices: Vec<f64> = series.points.iter().map(|point| point.price).collect();
            let Some(&spot_price) = prices.last() else {
                continue;
            };

            let entry = match self.engine.historical_volatility(&prices) {
                Ok(hv) => {
                    let options = self.fetch_options_data(&series.asset).await;
                    let iv = if options.is_empty() {
                        None
                    } else {
                        self.engine.average_implied_volatility(
                            &options,
                            spot_price,
                            DEFAULT_RISK_FREE_RATE,
                        )
                    };
                    VolatilityResult {
                        historical_volatility: Some(hv),
                        implied_volatility: iv,
                        spot_price: Some(spot_price),
                        timestamp: Utc::now().timestamp_millis(),
                        error: None,
                    }
                }
                Err(err) => {
                    warn!(asset = %series.asset, error = %err, "volatility calculation failed");
                    VolatilityResult {
                        historical_volatility: None,
                        implied_volatility: None,
                        spot_price: None,
                        timestamp: Utc::now().timestamp_millis(),
                        error: Some(err.to_string()),
                    }
                }
            };
            volatility.insert(series.asset.clone(), entry);
        }

        volatility
    }

    async fn fetch_options_data(&self, asset: &str) -> Vec<OptionContract> {
        if let Some(cached) = self.options_cache.get(&asset.to_string()) {
            return cached;
        }

        let underlying = underlying_symbol(asset);
        let source = Arc::clone(&self.options_source);
        match self
            .options_breaker
            .execute(|| async move { source.options_chain(&underlying).await })
            .await
        {
            Ok(options) => {
                self.options_cache
                    .set_with_ttl(asset.to_string(), options.clone(), OPTIONS_CACHE_TTL);
                options
            }
            Err(err) => {
                warn!(asset, error = %err, "options chain fetch failed");
                Vec::new()
            }
        }
    }

    /// Push the assembled bundle into the aggregator for every tracked
    /// symbol, then feed the derived metrics to the alert detector.
    async fn publish(
        &self,
        sentiment: SentimentResult,
        volatility: HashMap<String, VolatilityResult>,
    ) {
        let account_balance = self.account_balance();

        for symbol in &self.config.symbols {
            let asset = asset_for_symbol(symbol);
            let asset_volatility = volatility.get(&asset).cloned();

            let observation = Observation {
                volatility: asset_volatility
                    .as_ref()
                    .and_then(|entry| entry.historical_volatility),
                sentiment: Some(sentiment.overall.compound),
                price: asset_volatility.as_ref().and_then(|entry| entry.spot_price),
            };

            self.context
                .update_pipeline(
                    symbol,
                    PipelineUpdate {
                        sentiment: sentiment.clone(),
                        volatility: asset_volatility,
                        account_balance,
                    },
                )
                .await;

            self.alert_detector.check(symbol, observation).await;
        }
    }

    // Placeholder until account endpoints are wired to a funded exchange
    // account; carried through the fused view for its consumers.
    fn account_balance(&self) -> AccountBalance {
        AccountBalance {
            total: 10_000.0,
            available: 9_500.0,
            in_orders: 500.0,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub async fn status(&self) -> PipelineStatus {
        PipelineStatus {
            is_running: *self.running.read().await,
            interval_ms: self.config.interval_ms,
            assets: self.config.assets.clone(),
            symbols: self.config.symbols.clone(),
            last_update: *self.last_update.read().await,
            cache: PipelineCacheStats {
                historical: self.historical_cache.stats(),
                sentiment: self.sentiment_cache.stats(),
                options: self.options_cache.stats(),
            },
        }
    }

    pub fn clear_cache(&self) {
        self.historical_cache.clear();
        self.sentiment_cache.clear();
        self.options_cache.clear();
        info!("pipeline caches cleared");
    }
}

fn asset_for_symbol(symbol: &str) -> String {
    let base = symbol
        .trim_end_matches("USDT")
        .trim_end_matches("USD")
        .to_lowercase();
    match base.as_str() {
        "btc" => "bitcoin".to_string(),
        "eth" => "ethereum".to_string(),
        _ => base,
    }
}

fn underlying_symbol(asset: &str) -> String {
    match asset {
        "bitcoin" => "BTCUSD".to_string(),
        "ethereum" => "ETHUSD".to_string(),
        other => format!("{}USD", other.to_uppercase()),
    }
}
