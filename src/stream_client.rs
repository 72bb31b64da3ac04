use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

use crate::model::OrderStatus;
use crate::rest_client::cents_to_dollars;
use crate::signing::Signer;

const DEFAULT_MAX_SILENCE_SECS: u64 = 30;
const MAX_RECONNECT_DELAY_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub enum StreamEvent {
    TickerUpdate { ticker: String, best_bid: Decimal, best_ask: Decimal, last_price: Decimal, volume_24h: Decimal, ts_ms: i64 },
    OrderBookDelta { ticker: String, bids: Vec<(Decimal, Decimal)>, asks: Vec<(Decimal, Decimal)>, ts_ms: i64 },
    Trade { ticker: String, price: Decimal, size: Decimal, ts_ms: i64 },
    Fill { order_id: String, count: i64, price: Decimal },
    OrderUpdate { order_id: String, status: OrderStatus, remaining: i64 },
    Disconnected,
    Reconnected,
}

/// Tracks whether the last `max_silence` window produced any message.
/// RiskManager's stream-disconnect breaker reads this, not raw socket state.
#[derive(Clone)]
pub struct WatchdogFlag(Arc<AtomicBool>);

impl WatchdogFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn is_silent(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for WatchdogFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    ticker: String,
    #[serde(default)]
    id: Option<u64>,
}

/// Authenticated bidirectional market/order stream. Owns the subscription
/// set so a reconnect can restore it exactly (§4.4); hands typed events to
/// the caller over an mpsc channel rather than via callback, matching the
/// queue-based event delivery the executor relies on.
pub struct StreamClient {
    url: String,
    signer: Arc<Signer>,
    tickers: HashSet<String>,
    next_msg_id: AtomicU64,
    max_silence: Duration,
    watchdog: WatchdogFlag,
}

impl StreamClient {
    pub fn new(url: impl Into<String>, signer: Arc<Signer>, tickers: HashSet<String>, max_silence_secs: Option<u64>) -> Self {
        Self {
            url: url.into(),
            signer,
            tickers,
            next_msg_id: AtomicU64::new(1),
            max_silence: Duration::from_secs(max_silence_secs.unwrap_or(DEFAULT_MAX_SILENCE_SECS)),
            watchdog: WatchdogFlag::new(),
        }
    }

    pub fn watchdog(&self) -> WatchdogFlag {
        self.watchdog.clone()
    }

    fn next_id(&self) -> u64 {
        self.next_msg_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Runs forever, reconnecting on any error. Never returns unless the
    /// channel receiver is dropped.
    pub async fn run(&self, tx: mpsc::Sender<StreamEvent>) {
        let mut attempt: u32 = 0;
        let last_message = Arc::new(tokio::sync::Mutex::new(tokio::time::Instant::now()));

        {
            let last_message = last_message.clone();
            let watchdog = self.watchdog.clone();
            let max_silence = self.max_silence;
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    let elapsed = last_message.lock().await.elapsed();
                    watchdog.0.store(elapsed >= max_silence, Ordering::SeqCst);
                }
            });
        }

        loop {
            info!("connecting to stream {}", self.url);
            match connect_async(match Url::parse(&self.url) {
                Ok(u) => u,
                Err(e) => {
                    error!("invalid stream url: {}", e);
                    return;
                }
            })
            .await
            {
                Ok((ws_stream, _)) => {
                    info!("stream connected");
                    if attempt > 0 {
                        let _ = tx.send(StreamEvent::Reconnected).await;
                    }
                    attempt = 0;
                    *last_message.lock().await = tokio::time::Instant::now();

                    let (mut write, mut read) = ws_stream.split();

                    let now_ms = chrono::Utc::now().timestamp_millis();
                    let auth = self.signer.sign("GET", "/stream", now_ms);
                    let auth_msg = serde_json::json!({
                        "type": "auth",
                        "access_key": auth.access_key_id,
                        "signature": auth.signature_b64,
                        "ts_ms": auth.timestamp_ms,
                    });
                    if let Err(e) = write.send(Message::Text(auth_msg.to_string())).await {
                        warn!("failed sending auth: {}", e);
                        attempt += 1;
                        self.sleep_backoff(attempt).await;
                        continue;
                    }

                    let sub_id = self.next_id();
                    let sub_msg = serde_json::json!({
                        "type": "subscribe",
                        "id": sub_id,
                        "channels": ["orderbook_delta", "ticker", "trade", "fill", "order_update"],
                        "tickers": self.tickers.iter().collect::<Vec<_>>(),
                    });
                    if let Err(e) = write.send(Message::Text(sub_msg.to_string())).await {
                        warn!("failed subscribing: {}", e);
                        attempt += 1;
                        self.sleep_backoff(attempt).await;
                        continue;
                    }

                    let mut seen_ids: HashSet<u64> = HashSet::new();

                    while let Some(msg) = read.next().await {
                        *last_message.lock().await = tokio::time::Instant::now();
                        match msg {
                            Ok(Message::Text(text)) => {
                                if let Some(event) = parse_event(&text, &mut seen_ids) {
                                    if !dispatch(&tx, event).await {
                                        return;
                                    }
                                }
                            }
                            Ok(Message::Ping(data)) => {
                                let _ = write.send(Message::Pong(data)).await;
                            }
                            Ok(Message::Close(_)) => {
                                warn!("stream closed by venue");
                                break;
                            }
                            Err(e) => {
                                warn!("stream error: {}", e);
                                break;
                            }
                            _ => {}
                        }
                    }

                    let _ = tx.send(StreamEvent::Disconnected).await;
                }
                Err(e) => {
                    warn!("stream connect failed: {}", e);
                }
            }

            attempt += 1;
            self.sleep_backoff(attempt).await;
        }
    }

    async fn sleep_backoff(&self, attempt: u32) {
        let secs = (2u64.saturating_pow(attempt.min(10))).min(MAX_RECONNECT_DELAY_SECS);
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }
}

/// Sends `event` to the executor queue. High-priority events (fills, order
/// updates, connection state) always go through, blocking if needed; a
/// market-data event that finds the queue full is dropped since a fresher
/// update for the same ticker will follow shortly. Returns `false` only when
/// the receiver has gone away.
async fn dispatch(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> bool {
    let high_priority = matches!(
        event,
        StreamEvent::Fill { .. } | StreamEvent::OrderUpdate { .. } | StreamEvent::Disconnected | StreamEvent::Reconnected
    );
    if high_priority {
        return tx.send(event).await.is_ok();
    }
    match tx.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => true,
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

fn parse_event(text: &str, seen_ids: &mut HashSet<u64>) -> Option<StreamEvent> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let envelope: WireEnvelope = serde_json::from_value(value.clone()).ok()?;

    if let Some(id) = envelope.id {
        if !seen_ids.insert(id) {
            return None;
        }
    }

    match envelope.kind.as_str() {
        "ticker" => Some(StreamEvent::TickerUpdate {
            ticker: envelope.ticker,
            best_bid: cents_to_dollars(value["best_bid"].as_i64()?),
            best_ask: cents_to_dollars(value["best_ask"].as_i64()?),
            last_price: cents_to_dollars(value["last_price"].as_i64()?),
            volume_24h: cents_to_dollars(value["volume_24h"].as_i64().unwrap_or(0)),
            ts_ms: value["ts_ms"].as_i64().unwrap_or(0),
        }),
        "orderbook_delta" => {
            let bids = value["bids"]
                .as_array()?
                .iter()
                .filter_map(|l| Some((cents_to_dollars(l["price"].as_i64()?), cents_to_dollars(l["size"].as_i64()?))))
                .collect();
            let asks = value["asks"]
                .as_array()?
                .iter()
                .filter_map(|l| Some((cents_to_dollars(l["price"].as_i64()?), cents_to_dollars(l["size"].as_i64()?))))
                .collect();
            Some(StreamEvent::OrderBookDelta { ticker: envelope.ticker, bids, asks, ts_ms: value["ts_ms"].as_i64().unwrap_or(0) })
        }
        "trade" => Some(StreamEvent::Trade {
            ticker: envelope.ticker,
            price: cents_to_dollars(value["price"].as_i64()?),
            size: cents_to_dollars(value["size"].as_i64()?),
            ts_ms: value["ts_ms"].as_i64().unwrap_or(0),
        }),
        "fill" => Some(StreamEvent::Fill {
            order_id: value["order_id"].as_str()?.to_string(),
            count: value["count"].as_i64()?,
            price: cents_to_dollars(value["price"].as_i64()?),
        }),
        "order_update" => {
            let status = match value["status"].as_str()? {
                "resting" => OrderStatus::Open,
                "executed" => OrderStatus::Filled,
                "canceled" | "cancelled" => OrderStatus::Cancelled,
                _ => OrderStatus::Open,
            };
            Some(StreamEvent::OrderUpdate {
                order_id: value["order_id"].as_str()?.to_string(),
                status,
                remaining: value["remaining"].as_i64().unwrap_or(0),
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_message_ids_are_ignored() {
        let mut seen = HashSet::new();
        let msg = r#"{"type":"ticker","id":5,"ticker":"T","best_bid":90,"best_ask":91,"last_price":90,"volume_24h":1000,"ts_ms":1}"#;
        assert!(parse_event(msg, &mut seen).is_some());
        assert!(parse_event(msg, &mut seen).is_none());
    }

    #[test]
    fn unknown_event_type_is_ignored() {
        let mut seen = HashSet::new();
        let msg = r#"{"type":"heartbeat"}"#;
        assert!(parse_event(msg, &mut seen).is_none());
    }

    #[test]
    fn ticker_update_converts_cents_to_dollars() {
        let mut seen = HashSet::new();
        let msg = r#"{"type":"ticker","ticker":"T","best_bid":90,"best_ask":91,"last_price":90,"volume_24h":1000,"ts_ms":1}"#;
        match parse_event(msg, &mut seen).unwrap() {
            StreamEvent::TickerUpdate { best_bid, best_ask, .. } => {
                assert_eq!(best_bid, cents_to_dollars(90));
                assert_eq!(best_ask, cents_to_dollars(91));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn watchdog_starts_quiet() {
        let flag = WatchdogFlag::new();
        assert!(!flag.is_silent());
    }
}
