use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

const ALERT_HISTORY_LIMIT: usize = 100;
const ALERT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    VolatilitySpike,
    SentimentShift,
    PriceGap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub symbol: String,
    pub message: String,
    pub severity: AlertSeverity,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertThresholds {
    /// Relative volatility increase, percent.
    pub volatility_spike: f64,
    /// Absolute sentiment delta, points.
    pub sentiment_shift: f64,
    /// Relative price move, percent.
    pub price_gap: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            volatility_spike: 50.0,
            sentiment_shift: 20.0,
            price_gap: 10.0,
        }
    }
}

/// One fused data point's worth of metrics to compare against the previous
/// observation. Missing fields skip their check.
#[derive(Debug, Clone, Copy, Default)]
pub struct Observation {
    pub volatility: Option<f64>,
    pub sentiment: Option<f64>,
    pub price: Option<f64>,
}

#[derive(Debug, Default)]
struct PreviousValues {
    volatility: Option<f64>,
    sentiment: Option<f64>,
    price: Option<f64>,
}

/// Threshold comparator over consecutive observations per symbol. Breaches
/// fan out globally over a broadcast channel and land in a bounded replay
/// buffer for late subscribers.
pub struct AlertDetector {
    thresholds: RwLock<AlertThresholds>,
    previous: RwLock<HashMap<String, PreviousValues>>,
    history: RwLock<VecDeque<Alert>>,
    events: broadcast::Sender<Alert>,
}

impl AlertDetector {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            thresholds: RwLock::new(AlertThresholds::default()),
            previous: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::with_capacity(ALERT_HISTORY_LIMIT)),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.events.subscribe()
    }

    /// Compare one observation against the stored previous values. Previous
    /// values are updated unconditionally, so thresholds always compare
    /// consecutive observations rather than observation-vs-baseline.
    pub async fn check(&self, symbol: &str, observation: Observation) -> Vec<Alert> {
        let thresholds = *self.thresholds.read().await;
        let mut alerts = Vec::new();

        {
            let mut previous_map = self.previous.write().await;
            let previous = previous_map.entry(symbol.to_string()).or_default();

            if let Some(volatility) = observation.volatility {
                if let Some(prev) = previous.volatility {
                    if prev > 0.0 && volatility > prev * (1.0 + thresholds.volatility_spike / 100.0)
                    {
                        alerts.push(Alert {
                            id: Uuid::new_v4(),
                            kind: AlertKind::VolatilitySpike,
                            symbol: symbol.to_string(),
                            message: format!(
                                "Volatility spike detected for {symbol}: {volatility:.2}% (previous: {prev:.2}%)"
                            ),
                            severity: AlertSeverity::High,
                            timestamp: Utc::now(),
                            data: json!({
                                "current": volatility,
                                "previous": prev,
                                "changePercent": (volatility - prev) / prev * 100.0,
                            }),
                        });
                    }
                }
                previous.volatility = Some(volatility);
            }

            if let Some(sentiment) = observation.sentiment {
                if let Some(prev) = previous.sentiment {
                    let change = (sentiment - prev).abs();
                    if change > thresholds.sentiment_shift {
                        alerts.push(Alert {
                            id: Uuid::new_v4(),
                            kind: AlertKind::SentimentShift,
                            symbol: symbol.to_string(),
                            message: format!(
                                "Sentiment shift detected for {symbol}: {sentiment:.2} (previous: {prev:.2})"
                            ),
                            severity: AlertSeverity::Medium,
                            timestamp: Utc::now(),
                            data: json!({
                                "current": sentiment,
                                "previous": prev,
                                "change": change,
                            }),
                        });
                    }
                }
                previous.sentiment = Some(sentiment);
            }

            if let Some(price) = observation.price {
                if let Some(prev) = previous.price {
                    if prev != 0.0 {
                        let change_percent = ((price - prev) / prev * 100.0).abs();
                        if change_percent > thresholds.price_gap {
                            alerts.push(Alert {
                                id: Uuid::new_v4(),
                                kind: AlertKind::PriceGap,
                                symbol: symbol.to_string(),
                                message: format!(
                                    "Price gap detected for {symbol}: {price:.2} (previous: {prev:.2})"
                                ),
                                severity: AlertSeverity::High,
                                timestamp: Utc::now(),
                                data: json!({
                                    "current": price,
                                    "previous": prev,
                                    "changePercent": change_percent,
                                }),
                            });
                        }
                    }
                }
                previous.price = Some(price);
            }
        }

        for alert in &alerts {
            self.emit(alert.clone()).await;
        }
        alerts
    }

    async fn emit(&self, alert: Alert) {
        warn!(kind = ?alert.kind, symbol = %alert.symbol, "{}", alert.message);

        {
            let mut history = self.history.write().await;
            history.push_back(alert.clone());
            while history.len() > ALERT_HISTORY_LIMIT {
                history.pop_front();
            }
        }

        // No receivers connected is not an error.
        let _ = self.events.send(alert);
    }

    /// Most recent `limit` alerts in insertion order, oldest first.
    pub async fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        let history = self.history.read().await;
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Replace the active thresholds, effective for the next comparison.
    pub async fn update_thresholds(&self, thresholds: AlertThresholds) {
        *self.thresholds.write().await = thresholds;
        info!(?thresholds, "alert thresholds updated");
    }

    pub async fn thresholds(&self) -> AlertThresholds {
        *self.thresholds.read().await
    }

    /// Drop a symbol's stored baselines, e.g. when its last subscriber leaves.
    pub async fn clear_symbol(&self, symbol: &str) {
        self.previous.write().await.remove(symbol);
    }
}

impl Default for AlertDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volatility(value: f64) -> Observation {
        Observation {
            volatility: Some(value),
            ..Default::default()
        }
    }

    fn price(value: f64) -> Observation {
        Observation {
            price: Some(value),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn volatility_spike_boundary_is_strict() {
        let detector = AlertDetector::new();
        detector.check("BTCUSDT", volatility(10.0)).await;

        // Exactly +50% must not trigger.
        let alerts = detector.check("BTCUSDT", volatility(15.0)).await;
        assert!(alerts.is_empty());

        // The baseline moved to 15.0; just over +50% from there does.
        let alerts = detector.check("BTCUSDT", volatility(15.0 * 1.5001)).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::VolatilitySpike);
        assert_eq!(alerts[0].severity, AlertSeverity::High);
    }

    #[tokio::test]
    async fn first_observation_never_alerts() {
        let detector = AlertDetector::new();
        let alerts = detector
            .check(
                "ETHUSDT",
                Observation {
                    volatility: Some(80.0),
                    sentiment: Some(90.0),
                    price: Some(4000.0),
                },
            )
            .await;
        assert!(alerts.is_empty());
    }

    #[tokio::test]
    async fn sentiment_shift_uses_absolute_delta() {
        let detector = AlertDetector::new();
        detector
            .check("BTCUSDT", Observation { sentiment: Some(40.0), ..Default::default() })
            .await;
        let alerts = detector
            .check("BTCUSDT", Observation { sentiment: Some(19.0), ..Default::default() })
            .await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::SentimentShift);
        assert_eq!(alerts[0].severity, AlertSeverity::Medium);
    }

    #[tokio::test]
    async fn price_gap_compares_consecutive_observations() {
        let detector = AlertDetector::new();
        detector.check("BTCUSDT", price(100.0)).await;

        let alerts = detector.check("BTCUSDT", price(200.0)).await;
        assert_eq!(alerts.len(), 1);

        // The previous value advanced to 200 even though it breached.
        let alerts = detector.check("BTCUSDT", price(205.0)).await;
        assert!(alerts.is_empty());

        let alerts = detector.check("BTCUSDT", price(400.0)).await;
        assert_eq!(alerts.len(), 1);
    }

    #[tokio::test]
    async fn missing_fields_skip_their_checks() {
        let detector = AlertDetector::new();
        detector.check("BTCUSDT", price(100.0)).await;
        let alerts = detector.check("BTCUSDT", Observation::default()).await;
        assert!(alerts.is_empty());

        // The price baseline survived the empty observation.
        let alerts = detector.check("BTCUSDT", price(150.0)).await;
        assert_eq!(alerts.len(), 1);
    }

    #[tokio::test]
    async fn updated_thresholds_take_effect_immediately() {
        let detector = AlertDetector::new();
        detector
            .update_thresholds(AlertThresholds {
                price_gap: 40.0,
                ..Default::default()
            })
            .await;

        detector.check("BTCUSDT", price(100.0)).await;
        assert!(detector.check("BTCUSDT", price(130.0)).await.is_empty());
        assert_eq!(detector.check("BTCUSDT", price(200.0)).await.len(), 1);
    }

    #[tokio::test]
    async fn history_is_bounded_to_last_100() {
        let detector = AlertDetector::new();
        detector.check("BTCUSDT", price(1.0)).await;
        for i in 0..120 {
            // Alternate far apart so every observation breaches.
            let value = if i % 2 == 0 { 1000.0 } else { 1.0 };
            detector.check("BTCUSDT", price(value)).await;
        }

        let all = detector.recent_alerts(usize::MAX).await;
        assert_eq!(all.len(), 100);

        let last_five = detector.recent_alerts(5).await;
        assert_eq!(last_five.len(), 5);
        assert_eq!(last_five.last().unwrap().id, all.last().unwrap().id);
    }

    #[tokio::test]
    async fn alerts_fan_out_to_subscribers() {
        let detector = AlertDetector::new();
        let mut receiver = detector.subscribe();

        detector.check("BTCUSDT", price(100.0)).await;
        detector.check("BTCUSDT", price(300.0)).await;

        let alert = receiver.recv().await.unwrap();
        assert_eq!(alert.kind, AlertKind::PriceGap);
        assert_eq!(alert.symbol, "BTCUSDT");
    }

    #[tokio::test]
    async fn clear_symbol_resets_the_baseline() {
        let detector = AlertDetector::new();
        detector.check("BTCUSDT", price(100.0)).await;
        detector.clear_symbol("BTCUSDT").await;

        // Post-clear this is a first observation again.
        let alerts = detector.check("BTCUSDT", price(500.0)).await;
        assert!(alerts.is_empty());
    }
}
