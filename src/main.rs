use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use market_fusion::alerts::AlertDetector;
use market_fusion::api::{CoinGeckoClient, DeltaOptionsClient, SentimentClient};
use market_fusion::core::{logging, Config, HealthChecker};
use market_fusion::feeds::{BinanceFeedClient, DeltaFeedClient, FeedUpdate, MarketFeed};
use market_fusion::fusion::MarketContext;
use market_fusion::pipeline::{DataAcquisitionPipeline, PipelineConfig, PipelineSources};
use market_fusion::server::{self, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    logging::init_logging(&config.server.log_level);

    tracing::info!("🚀 Market fusion server starting...");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "Tracking {} assets across {} symbols",
        config.acquisition.assets.len(),
        config.acquisition.symbols.len()
    );

    let health = Arc::new(HealthChecker::new());
    let alert_detector = Arc::new(AlertDetector::new());

    // Feed clients push normalized frames into the aggregator over one
    // bounded channel; a missing credential set disables that exchange
    // instead of failing startup.
    let (update_tx, update_rx) = mpsc::channel::<FeedUpdate>(config.feeds.update_buffer_size);
    let mut feeds: Vec<Arc<dyn MarketFeed>> = Vec::new();

    if config.feeds.binance.is_some() {
        feeds.push(Arc::new(BinanceFeedClient::binance(
            config.feeds.binance_feed_config(),
            update_tx.clone(),
        )));
        health.update_component("binance_feed", true).await;
    } else {
        tracing::warn!("Binance credentials missing, feed unavailable");
    }

    if config.feeds.delta.is_some() {
        feeds.push(Arc::new(DeltaFeedClient::delta(
            config.feeds.delta_feed_config(),
            update_tx.clone(),
        )));
        health.update_component("delta_feed", true).await;
    } else {
        tracing::warn!("Delta credentials missing, feed unavailable");
    }

    let context = Arc::new(MarketContext::new(
        feeds,
        alert_detector.clone(),
        config.feeds.primary_staleness_ms,
    ));
    tokio::spawn({
        let context = context.clone();
        async move { context.run(update_rx).await }
    });

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let sources = PipelineSources {
        historical: Arc::new(CoinGeckoClient::new(
            http.clone(),
            config.apis.coingecko_base_url.clone(),
        )),
        sentiment: Arc::new(SentimentClient::new(
            http.clone(),
            config.apis.sentiment_api_url.clone(),
        )),
        options: Arc::new(DeltaOptionsClient::new(
            http,
            config.apis.delta_base_url.clone(),
        )),
    };

    let pipeline = Arc::new(DataAcquisitionPipeline::new(
        PipelineConfig {
            interval_ms: config.acquisition.interval_ms,
            historical_days: config.acquisition.historical_days,
            assets: config.acquisition.assets.clone(),
            symbols: config.acquisition.symbols.clone(),
        },
        sources,
        context.clone(),
        alert_detector.clone(),
        &config.breakers,
    ));
    pipeline.clone().start();
    health.update_component("pipeline", true).await;

    let state = Arc::new(AppState {
        context,
        pipeline,
        alert_detector,
        health,
    });

    let port = config.server.port;
    tracing::info!("✅ Listening on port {}", port);
    warp::serve(server::routes(state)).run(([0, 0, 0, 0], port)).await;

    Ok(())
}
