use anyhow::Result;
use std::env;

use crate::feeds::FeedConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub acquisition: AcquisitionConfig,
    pub feeds: FeedsConfig,
    pub apis: ApiConfig,
    pub breakers: BreakersConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    pub interval_ms: u64,
    pub historical_days: u32,
    pub assets: Vec<String>,
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExchangeCredentials {
    pub api_key: String,
    pub api_secret: String,
}

#[derive(Debug, Clone)]
pub struct FeedsConfig {
    pub binance: Option<ExchangeCredentials>,
    pub delta: Option<ExchangeCredentials>,
    pub binance_ws_url: String,
    pub delta_ws_url: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub connect_timeout_secs: u64,
    pub update_buffer_size: usize,
    pub primary_staleness_ms: i64,
}

impl FeedsConfig {
    pub fn binance_feed_config(&self) -> FeedConfig {
        FeedConfig {
            ws_url: self.binance_ws_url.clone(),
            max_reconnect_attempts: self.max_reconnect_attempts,
            reconnect_base_delay_ms: self.reconnect_base_delay_ms,
            connect_timeout_secs: self.connect_timeout_secs,
        }
    }

    pub fn delta_feed_config(&self) -> FeedConfig {
        FeedConfig {
            ws_url: self.delta_ws_url.clone(),
            max_reconnect_attempts: self.max_reconnect_attempts,
            reconnect_base_delay_ms: self.reconnect_base_delay_ms,
            connect_timeout_secs: self.connect_timeout_secs,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub coingecko_base_url: String,
    pub delta_base_url: String,
    pub sentiment_api_url: String,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakersConfig {
    pub market_failure_threshold: u32,
    pub market_recovery_ms: u64,
    pub sentiment_failure_threshold: u32,
    pub sentiment_recovery_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        Ok(Config {
            acquisition: AcquisitionConfig {
                interval_ms: parse_env("ACQUISITION_INTERVAL_MS", 5000),
                historical_days: parse_env("HISTORICAL_DAYS", 30),
                assets: list_env("TRACKED_ASSETS", &["bitcoin", "ethereum"]),
                symbols: list_env("TRACKED_SYMBOLS", &["BTCUSDT", "ETHUSDT"]),
            },
            feeds: FeedsConfig {
                binance: credentials_env("BINANCE_API_KEY", "BINANCE_SECRET_KEY"),
                delta: credentials_env("DELTA_API_KEY", "DELTA_SECRET_KEY"),
                binance_ws_url: string_env(
                    "BINANCE_WS_URL",
                    "wss://stream.binance.com:9443",
                ),
                delta_ws_url: string_env("DELTA_WS_URL", "wss://socket.delta.exchange"),
                max_reconnect_attempts: parse_env("FEED_MAX_RECONNECT_ATTEMPTS", 5),
                reconnect_base_delay_ms: parse_env("FEED_RECONNECT_BASE_DELAY_MS", 1000),
                connect_timeout_secs: parse_env("FEED_CONNECT_TIMEOUT_SECS", 10),
                update_buffer_size: parse_env("FEED_UPDATE_BUFFER_SIZE", 4096),
                primary_staleness_ms: parse_env("PRIMARY_TICKER_STALENESS_MS", 30_000),
            },
            apis: ApiConfig {
                coingecko_base_url: string_env(
                    "COINGECKO_BASE_URL",
                    "https://api.coingecko.com/api/v3",
                ),
                delta_base_url: string_env("DELTA_BASE_URL", "https://api.delta.exchange"),
                sentiment_api_url: string_env(
                    "SENTIMENT_API_URL",
                    "http://localhost:8085/sentiment/market",
                ),
            },
            breakers: BreakersConfig {
                market_failure_threshold: parse_env("MARKET_BREAKER_THRESHOLD", 5),
                market_recovery_ms: parse_env("MARKET_BREAKER_RECOVERY_MS", 60_000),
                sentiment_failure_threshold: parse_env("SENTIMENT_BREAKER_THRESHOLD", 3),
                sentiment_recovery_ms: parse_env("SENTIMENT_BREAKER_RECOVERY_MS", 300_000),
            },
            server: ServerConfig {
                port: parse_env("SERVER_PORT", 3001),
                log_level: string_env("LOG_LEVEL", "info"),
            },
        })
    }
}

fn string_env(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn list_env(key: &str, default: &[&str]) -> Vec<String> {
    match env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect(),
        Err(_) => default.iter().map(|part| part.to_string()).collect(),
    }
}

fn credentials_env(key_var: &str, secret_var: &str) -> Option<ExchangeCredentials> {
    match (env::var(key_var).ok(), env::var(secret_var).ok()) {
        (Some(api_key), Some(api_secret)) if !api_key.is_empty() && !api_secret.is_empty() => {
            Some(ExchangeCredentials {
                api_key,
                api_secret,
            })
        }
        _ => None,
    }
}
