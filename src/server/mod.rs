use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;
use warp::Filter;

use crate::alerts::{AlertDetector, AlertThresholds};
use crate::core::HealthChecker;
use crate::fusion::{ConnectionId, MarketContext, OutboundMessage};
use crate::pipeline::DataAcquisitionPipeline;

const DEFAULT_ALERT_HISTORY: usize = 50;

pub struct AppState {
    pub context: Arc<MarketContext>,
    pub pipeline: Arc<DataAcquisitionPipeline>,
    pub alert_detector: Arc<AlertDetector>,
    pub health: Arc<HealthChecker>,
}

/// Requests a connected client can make over the socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
enum ClientMessage {
    SubscribeMarket { symbol: String },
    UnsubscribeMarket { symbol: String },
    GetAlertHistory { limit: Option<usize> },
    UpdateAlertThresholds { thresholds: AlertThresholds },
}

pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let health = warp::path("health")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(health_handler);

    let status = warp::path!("api" / "status")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(status_handler);

    let alerts = warp::path!("api" / "alerts")
        .and(warp::get())
        .and(warp::query::<AlertQuery>())
        .and(with_state(state.clone()))
        .and_then(alerts_handler);

    let thresholds = warp::path!("api" / "alerts" / "thresholds")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(thresholds_handler);

    let ws = warp::path("ws")
        .and(warp::ws())
        .and(with_state(state))
        .map(|ws: warp::ws::Ws, state: Arc<AppState>| {
            ws.on_upgrade(move |socket| client_connection(socket, state))
        });

    health.or(status).or(alerts).or(thresholds).or(ws)
}

fn with_state(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Arc<AppState>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

#[derive(Debug, Deserialize)]
struct AlertQuery {
    limit: Option<usize>,
}

async fn health_handler(state: Arc<AppState>) -> Result<impl warp::Reply, Infallible> {
    Ok(warp::reply::json(&state.health.get_status().await))
}

async fn status_handler(state: Arc<AppState>) -> Result<impl warp::Reply, Infallible> {
    Ok(warp::reply::json(&state.pipeline.status().await))
}

async fn alerts_handler(
    query: AlertQuery,
    state: Arc<AppState>,
) -> Result<impl warp::Reply, Infallible> {
    let alerts = state
        .alert_detector
        .recent_alerts(query.limit.unwrap_or(DEFAULT_ALERT_HISTORY))
        .await;
    Ok(warp::reply::json(&serde_json::json!({ "alerts": alerts })))
}

async fn thresholds_handler(
    thresholds: AlertThresholds,
    state: Arc<AppState>,
) -> Result<impl warp::Reply, Infallible> {
    state.alert_detector.update_thresholds(thresholds).await;
    Ok(warp::reply::json(&serde_json::json!({ "success": true })))
}

/// One task per connected client: outbound frames funnel through an
/// unbounded channel, inbound frames drive subscription changes. Dropping
/// the socket unsubscribes the connection everywhere.
async fn client_connection(socket: warp::ws::WebSocket, state: Arc<AppState>) {
    let connection: ConnectionId = Uuid::new_v4();
    info!(%connection, "websocket client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundMessage>();
    state.context.register_connection(connection, out_tx.clone()).await;

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "failed to serialize outbound message");
                    continue;
                }
            };
            if ws_tx.send(warp::ws::Message::text(text)).await.is_err() {
                break;
            }
        }
    });

    // Alerts broadcast globally, not just to symbol subscribers.
    let mut alert_rx = state.alert_detector.subscribe();
    let alert_out = out_tx.clone();
    let alert_task = tokio::spawn(async move {
        loop {
            match alert_rx.recv().await {
                Ok(alert) => {
                    if alert_out.send(OutboundMessage::Alert { alert }).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "alert stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    while let Some(result) = ws_rx.next().await {
        let message = match result {
            Ok(message) => message,
            Err(err) => {
                debug!(%connection, error = %err, "websocket read error");
                break;
            }
        };
        let Ok(text) = message.to_str() else {
            continue;
        };
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(request) => handle_client_message(request, connection, &state, &out_tx).await,
            Err(err) => {
                debug!(%connection, error = %err, "ignoring unparseable client message");
            }
        }
    }

    info!(%connection, "websocket client disconnected");
    state.context.drop_connection(connection).await;
    alert_task.abort();
    drop(out_tx);
    let _ = writer.await;
}

async fn handle_client_message(
    request: ClientMessage,
    connection: ConnectionId,
    state: &Arc<AppState>,
    out_tx: &mpsc::UnboundedSender<OutboundMessage>,
) {
    match request {
        ClientMessage::SubscribeMarket { symbol } => {
            info!(%connection, symbol, "subscribing to market");
            state.context.subscribe(connection, &symbol).await;
        }
        ClientMessage::UnsubscribeMarket { symbol } => {
            info!(%connection, symbol, "unsubscribing from market");
            state.context.unsubscribe(connection, &symbol).await;
        }
        ClientMessage::GetAlertHistory { limit } => {
            let alerts = state
                .alert_detector
                .recent_alerts(limit.unwrap_or(DEFAULT_ALERT_HISTORY))
                .await;
            let _ = out_tx.send(OutboundMessage::AlertHistory { alerts });
        }
        ClientMessage::UpdateAlertThresholds { thresholds } => {
            state.alert_detector.update_thresholds(thresholds).await;
            let _ = out_tx.send(OutboundMessage::ThresholdsUpdated { success: true });
        }
    }
}
