use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::{
    ConnectionStatus, ExchangeId, FeedConfig, FeedUpdate, MarketEvent, MarketFeed, StreamKind,
};

/// Exchange-specific wire behaviour plugged into the shared connection runner.
pub trait ExchangeProtocol: Send + Sync + 'static {
    fn exchange(&self) -> ExchangeId;

    /// URL to open for one symbol's streams.
    fn connect_url(&self, ws_url: &str, symbol: &str, kinds: &[StreamKind]) -> String;

    /// Frame sent right after connecting, for exchanges that expect an
    /// explicit subscribe message rather than stream-encoded URLs.
    fn subscribe_frame(&self, symbol: &str, kinds: &[StreamKind]) -> Option<String>;

    /// Map one raw text frame to a normalized event. `Ok(None)` for frames
    /// that carry no market data (acks, heartbeats); `Err` for malformed
    /// frames, which are logged and dropped without closing the connection.
    fn parse_frame(&self, symbol: &str, raw: &str) -> Result<Option<MarketEvent>>;
}

struct Subscription {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    status: Arc<RwLock<ConnectionStatus>>,
}

/// One streaming client per exchange. Each subscribed symbol owns a
/// connection task with its own reconnect/backoff loop; `unsubscribe` cancels
/// the task deterministically, including any pending backoff sleep.
pub struct FeedClient<P: ExchangeProtocol> {
    protocol: Arc<P>,
    config: FeedConfig,
    updates: mpsc::Sender<FeedUpdate>,
    subscriptions: Arc<RwLock<HashMap<String, Subscription>>>,
}

impl<P: ExchangeProtocol> FeedClient<P> {
    pub fn new(protocol: P, config: FeedConfig, updates: mpsc::Sender<FeedUpdate>) -> Self {
        Self {
            protocol: Arc::new(protocol),
            config,
            updates,
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn subscribe(&self, symbol: &str, kinds: &[StreamKind]) {
        let mut subscriptions = self.subscriptions.write().await;
        if let Some(existing) = subscriptions.get(symbol) {
            if !existing.task.is_finished() {
                debug!(exchange = %self.protocol.exchange(), symbol, "already subscribed");
                return;
            }
            // The runner gave up earlier; a fresh subscribe restarts it with a
            // reset attempt counter.
            subscriptions.remove(symbol);
        }

        info!(exchange = %self.protocol.exchange(), symbol, "starting feed subscription");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let status = Arc::new(RwLock::new(ConnectionStatus::Reconnecting));
        let runner = ConnectionRunner {
            protocol: Arc::clone(&self.protocol),
            config: self.config.clone(),
            updates: self.updates.clone(),
            symbol: symbol.to_string(),
            kinds: kinds.to_vec(),
            status: Arc::clone(&status),
        };
        let task = tokio::spawn(runner.run(shutdown_rx));

        subscriptions.insert(
            symbol.to_string(),
            Subscription {
                shutdown: shutdown_tx,
                task,
                status,
            },
        );
    }

    pub async fn unsubscribe(&self, symbol: &str) {
        let subscription = self.subscriptions.write().await.remove(symbol);
        match subscription {
            Some(subscription) => {
                info!(exchange = %self.protocol.exchange(), symbol, "stopping feed subscription");
                let _ = subscription.shutdown.send(true);
            }
            None => {
                debug!(exchange = %self.protocol.exchange(), symbol, "unsubscribe for unknown symbol");
            }
        }
    }

    pub async fn status(&self, symbol: &str) -> Option<ConnectionStatus> {
        let subscriptions = self.subscriptions.read().await;
        match subscriptions.get(symbol) {
            Some(subscription) => Some(*subscription.status.read().await),
            None => None,
        }
    }

    pub async fn active_symbols(&self) -> Vec<String> {
        self.subscriptions.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl<P: ExchangeProtocol> MarketFeed for FeedClient<P> {
    fn exchange(&self) -> ExchangeId {
        self.protocol.exchange()
    }

    async fn subscribe(&self, symbol: &str, kinds: &[StreamKind]) {
        FeedClient::subscribe(self, symbol, kinds).await;
    }

    async fn unsubscribe(&self, symbol: &str) {
        FeedClient::unsubscribe(self, symbol).await;
    }
}

enum SessionEnd {
    Shutdown,
    Lost,
}

struct ConnectionRunner<P: ExchangeProtocol> {
    protocol: Arc<P>,
    config: FeedConfig,
    updates: mpsc::Sender<FeedUpdate>,
    symbol: String,
    kinds: Vec<StreamKind>,
    status: Arc<RwLock<ConnectionStatus>>,
}

impl<P: ExchangeProtocol> ConnectionRunner<P> {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let exchange = self.protocol.exchange();
        let mut attempt: u32 = 0;

        loop {
            match self.connect_and_stream(&mut shutdown, &mut attempt).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost => {
                    if attempt >= self.config.max_reconnect_attempts {
                        error!(
                            %exchange,
                            symbol = %self.symbol,
                            attempts = attempt,
                            "max reconnect attempts reached, giving up on symbol"
                        );
                        break;
                    }

                    let delay = Duration::from_millis(
                        self.config.reconnect_base_delay_ms * 2u64.pow(attempt),
                    );
                    attempt += 1;
                    *self.status.write().await = ConnectionStatus::Reconnecting;
                    warn!(
                        %exchange,
                        symbol = %self.symbol,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "reconnecting after backoff"
                    );

                    tokio::select! {
                        _ = time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        *self.status.write().await = ConnectionStatus::Closed;
    }

    async fn connect_and_stream(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        attempt: &mut u32,
    ) -> SessionEnd {
        let exchange = self.protocol.exchange();
        let url = self
            .protocol
            .connect_url(&self.config.ws_url, &self.symbol, &self.kinds);

        let connect = time::timeout(
            Duration::from_secs(self.config.connect_timeout_secs),
            connect_async(url.as_str()),
        );
        let (ws_stream, _) = tokio::select! {
            result = connect => match result {
                Ok(Ok(pair)) => pair,
                Ok(Err(err)) => {
                    error!(%exchange, symbol = %self.symbol, error = %err, "connection failed");
                    return SessionEnd::Lost;
                }
                Err(_) => {
                    error!(%exchange, symbol = %self.symbol, "connection timed out");
                    return SessionEnd::Lost;
                }
            },
            _ = shutdown.changed() => return SessionEnd::Shutdown,
        };

        info!(%exchange, symbol = %self.symbol, "websocket connected");
        *attempt = 0;
        *self.status.write().await = ConnectionStatus::Connected;

        let (mut write, mut read) = ws_stream.split();

        if let Some(frame) = self.protocol.subscribe_frame(&self.symbol, &self.kinds) {
            if let Err(err) = write.send(Message::Text(frame)).await {
                error!(%exchange, symbol = %self.symbol, error = %err, "failed to send subscribe frame");
                return SessionEnd::Lost;
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => return SessionEnd::Shutdown,
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        warn!(%exchange, symbol = %self.symbol, "websocket closed by server");
                        return SessionEnd::Lost;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        error!(%exchange, symbol = %self.symbol, error = %err, "websocket error");
                        return SessionEnd::Lost;
                    }
                    None => {
                        warn!(%exchange, symbol = %self.symbol, "websocket stream ended");
                        return SessionEnd::Lost;
                    }
                }
            }
        }
    }

    /// Fire-and-forget per frame: malformed frames and full channels drop the
    /// frame, never the connection.
    fn handle_frame(&self, raw: &str) {
        match self.protocol.parse_frame(&self.symbol, raw) {
            Ok(Some(event)) => {
                let update = FeedUpdate {
                    exchange: self.protocol.exchange(),
                    symbol: self.symbol.clone(),
                    event,
                };
                match self.updates.try_send(update) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            exchange = %self.protocol.exchange(),
                            symbol = %self.symbol,
                            "update channel full, dropping frame"
                        );
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!(
                            exchange = %self.protocol.exchange(),
                            symbol = %self.symbol,
                            "update channel closed"
                        );
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(
                    exchange = %self.protocol.exchange(),
                    symbol = %self.symbol,
                    error = %err,
                    "dropping malformed frame"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    struct NoopProtocol;

    impl ExchangeProtocol for NoopProtocol {
        fn exchange(&self) -> ExchangeId {
            ExchangeId::Binance
        }

        fn connect_url(&self, ws_url: &str, _symbol: &str, _kinds: &[StreamKind]) -> String {
            ws_url.to_string()
        }

        fn subscribe_frame(&self, _symbol: &str, _kinds: &[StreamKind]) -> Option<String> {
            None
        }

        fn parse_frame(&self, _symbol: &str, _raw: &str) -> Result<Option<MarketEvent>> {
            Err(anyhow!("unused"))
        }
    }

    fn client() -> FeedClient<NoopProtocol> {
        let (updates, _rx) = mpsc::channel(16);
        FeedClient::new(
            NoopProtocol,
            FeedConfig {
                // Nothing listens here; the runner burns through its attempts.
                ws_url: "ws://127.0.0.1:1".to_string(),
                max_reconnect_attempts: 1,
                reconnect_base_delay_ms: 1,
                connect_timeout_secs: 1,
            },
            updates,
        )
    }

    #[tokio::test]
    async fn subscribe_registers_symbol_and_unsubscribe_is_idempotent() {
        let client = client();
        client.subscribe("BTCUSDT", &super::super::DEFAULT_STREAM_KINDS).await;
        assert_eq!(client.active_symbols().await, vec!["BTCUSDT".to_string()]);

        client.unsubscribe("BTCUSDT").await;
        assert!(client.active_symbols().await.is_empty());

        // Second unsubscribe is a no-op.
        client.unsubscribe("BTCUSDT").await;
        assert!(client.status("BTCUSDT").await.is_none());
    }

    #[tokio::test]
    async fn duplicate_subscribe_reuses_the_connection_task() {
        let client = client();
        client.subscribe("ETHUSDT", &super::super::DEFAULT_STREAM_KINDS).await;
        client.subscribe("ETHUSDT", &super::super::DEFAULT_STREAM_KINDS).await;
        assert_eq!(client.active_symbols().await.len(), 1);
        client.unsubscribe("ETHUSDT").await;
    }
}
