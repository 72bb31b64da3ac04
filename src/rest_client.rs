use std::time::Duration;

use rand::Rng;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::errors::{AgentError, AgentResult};
use crate::model::{Order, OrderStatus, Side};
use crate::rate_limiter::{RateKind, RateLimiter};
use crate::signing::Signer;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFFS_MS: [u64; 3] = [100, 400, 1600];

#[derive(Debug, Deserialize)]
pub struct MarketPage {
    pub markets: Vec<MarketDto>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MarketDto {
    pub ticker: String,
    pub yes_bid: i64,
    pub yes_ask: i64,
    pub last_price: i64,
    pub volume_24h: i64,
    pub status: String,
    pub close_time: String,
}

#[derive(Debug, Deserialize)]
pub struct OrderBookLevel {
    pub price: i64,
    pub size: i64,
}

#[derive(Debug, Deserialize)]
pub struct OrderBook {
    pub yes: Vec<OrderBookLevel>,
    pub no: Vec<OrderBookLevel>,
}

/// Converts a dollar amount and a unit price into an integer contract count,
/// rounding down per §3. Returns the residual dust that stays reserved.
pub fn dollars_to_count(dollars: Decimal, price_dollars: Decimal) -> (i64, Decimal) {
    if price_dollars.is_zero() {
        return (0, dollars);
    }
    let count = (dollars / price_dollars).trunc();
    let spent = count * price_dollars;
    (count.try_into().unwrap_or(0), dollars - spent)
}

pub fn cents_to_dollars(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

pub fn dollars_to_cents(dollars: Decimal) -> i64 {
    (dollars * Decimal::ONE_HUNDRED).round().try_into().unwrap_or(0)
}

/// Single entry point for venue REST. Every call passes through the shared
/// RateLimiter then the Signer; retryable failures are retried in-place
/// with jittered exponential backoff (§4.3).
pub struct RestClient {
    base_url: String,
    client: reqwest::Client,
    limiter: RateLimiter,
    signer: Signer,
    success_count: std::sync::atomic::AtomicU64,
    error_count: std::sync::atomic::AtomicU64,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, signer: Signer, read_rate: u32, write_rate: u32) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            limiter: RateLimiter::new(read_rate, write_rate),
            signer,
            success_count: std::sync::atomic::AtomicU64::new(0),
            error_count: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Fraction of the trailing window that errored, for RiskManager's API
    /// error-rate breaker. Resets neither counter; RiskManager samples both.
    pub fn error_rate(&self) -> (u64, u64) {
        (
            self.error_count.load(std::sync::atomic::Ordering::Relaxed),
            self.success_count.load(std::sync::atomic::Ordering::Relaxed),
        )
    }

    async fn request(
        &self,
        kind: RateKind,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> AgentResult<serde_json::Value> {
        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            self.limiter.acquire(kind).await;

            let now_ms = chrono::Utc::now().timestamp_millis();
            let headers = self.signer.sign(method.as_str(), path, now_ms);

            let url = format!("{}{}", self.base_url, path);
            let mut req = self
                .client
                .request(method.clone(), &url)
                .timeout(REQUEST_TIMEOUT)
                .header("KALSHI-ACCESS-KEY", headers.access_key_id)
                .header("KALSHI-ACCESS-SIGNATURE", headers.signature_b64)
                .header("KALSHI-ACCESS-TIMESTAMP", headers.timestamp_ms.to_string());
            if let Some(ref b) = body {
                req = req.json(b);
            }

            let outcome = req.send().await;
            match outcome {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if status == 429 {
                        self.limiter.note_rate_limited(kind).await;
                        self.error_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        last_err = Some(AgentError::transient(path, "429 rate limited"));
                        continue;
                    }
                    if status == 401 || status == 403 {
                        self.error_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        return Err(AgentError::authz(path, format!("status {}", status)));
                    }
                    if status == 404 {
                        self.success_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        return Err(AgentError::state_conflict(path, "404"));
                    }
                    if status >= 500 && status != 501 {
                        self.error_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        last_err = Some(AgentError::transient(path, format!("status {}", status)));
                        self.backoff_sleep(attempt).await;
                        continue;
                    }
                    if status >= 400 {
                        self.error_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        let text = resp.text().await.unwrap_or_default();
                        return Err(AgentError::Validation(format!("{} {}: {}", path, status, text)));
                    }

                    self.limiter.note_success(kind).await;
                    self.success_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    let value = resp.json::<serde_json::Value>().await.map_err(|e| {
                        AgentError::transient(path, format!("decoding response: {}", e))
                    })?;
                    return Ok(value);
                }
                Err(e) if e.is_timeout() => {
                    self.error_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    last_err = Some(AgentError::transient(path, "timeout"));
                    self.backoff_sleep(attempt).await;
                }
                Err(e) => {
                    self.error_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    return Err(AgentError::transient(path, e.to_string()));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| AgentError::transient(path, "exhausted retries")))
    }

    async fn backoff_sleep(&self, attempt: u32) {
        let base = RETRY_BACKOFFS_MS[attempt.min(2) as usize];
        let jitter = rand::thread_rng().gen_range(0..=base / 4);
        tokio::time::sleep(Duration::from_millis(base + jitter)).await;
    }

    pub async fn list_markets(&self, cursor: Option<&str>) -> AgentResult<MarketPage> {
        let path = match cursor {
            Some(c) => format!("/markets?cursor={}", c),
            None => "/markets".to_string(),
        };
        let value = self.request(RateKind::Read, reqwest::Method::GET, &path, None).await?;
        serde_json::from_value(value).map_err(|e| AgentError::Validation(e.to_string()))
    }

    pub async fn get_orderbook(&self, ticker: &str) -> AgentResult<OrderBook> {
        let path = format!("/markets/{}/orderbook", ticker);
        let value = self.request(RateKind::Read, reqwest::Method::GET, &path, None).await?;
        serde_json::from_value(value).map_err(|e| AgentError::Validation(e.to_string()))
    }

    pub async fn submit_order(
        &self,
        ticker: &str,
        side: Side,
        price_dollars: Decimal,
        count: i64,
    ) -> AgentResult<String> {
        if count <= 0 {
            return Err(AgentError::Validation("order count must be positive".into()));
        }
        let price_cents = dollars_to_cents(price_dollars).clamp(1, 99);
        let body = serde_json::json!({
            "ticker": ticker,
            "side": if matches!(side, Side::Buy) { "yes" } else { "no" },
            "price": price_cents,
            "count": count,
        });
        let value = self
            .request(RateKind::Write, reqwest::Method::POST, "/portfolio/orders", Some(body))
            .await?;
        value["order_id"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| AgentError::Validation("missing order_id in response".into()))
    }

    /// Idempotent: a 404 (already gone) is treated as success.
    pub async fn cancel_order(&self, venue_id: &str) -> AgentResult<()> {
        let path = format!("/portfolio/orders/{}", venue_id);
        match self.request(RateKind::Write, reqwest::Method::DELETE, &path, None).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_idempotent_success() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn get_order(&self, venue_id: &str) -> AgentResult<(OrderStatus, Decimal)> {
        let path = format!("/portfolio/orders/{}", venue_id);
        let value = self.request(RateKind::Read, reqwest::Method::GET, &path, None).await?;
        let status = parse_status(value["status"].as_str().unwrap_or(""));
        let filled_cents = value["filled_count"].as_i64().unwrap_or(0) * value["price"].as_i64().unwrap_or(0);
        Ok((status, cents_to_dollars(filled_cents)))
    }

    pub async fn get_active_orders(&self) -> AgentResult<Vec<Order>> {
        let value = self.request(RateKind::Read, reqwest::Method::GET, "/portfolio/orders?status=open", None).await?;
        let raw = value["orders"].as_array().cloned().unwrap_or_default();
        Ok(raw
            .into_iter()
            .filter_map(|o| {
                let ticker = o["ticker"].as_str()?.to_string();
                let side = if o["side"].as_str() == Some("yes") { Side::Buy } else { Side::Sell };
                let price = cents_to_dollars(o["price"].as_i64()?);
                let size = cents_to_dollars(o["count"].as_i64()? * o["price"].as_i64()?);
                let mut order = Order::new(ticker, side, price, size, crate::model::OrderPurpose::Entry);
                order.venue_id = o["order_id"].as_str().map(|s| s.to_string());
                order.status = parse_status(o["status"].as_str().unwrap_or(""));
                Some(order)
            })
            .collect())
    }

    pub async fn get_balance(&self) -> AgentResult<Decimal> {
        let value = self.request(RateKind::Read, reqwest::Method::GET, "/portfolio/balance", None).await?;
        let cents = value["balance"].as_i64().unwrap_or(0);
        Ok(cents_to_dollars(cents))
    }
}

fn parse_status(raw: &str) -> OrderStatus {
    match raw {
        "resting" => OrderStatus::Open,
        "executed" => OrderStatus::Filled,
        "canceled" | "cancelled" => OrderStatus::Cancelled,
        "pending" => OrderStatus::Pending,
        _ => OrderStatus::Open,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn cents_dollars_roundtrip_is_identity() {
        for cents in 1..=99 {
            let dollars = cents_to_dollars(cents);
            assert_eq!(dollars_to_cents(dollars), cents);
        }
    }

    #[test]
    fn dollars_to_count_rounds_down_with_residual() {
        let (count, dust) = dollars_to_count(dec!(100.00), dec!(0.91));
        assert_eq!(count, 109);
        assert!(dust < dec!(0.91));
        assert!(dust >= Decimal::ZERO);
    }

    #[test]
    fn zero_price_does_not_panic() {
        let (count, dust) = dollars_to_count(dec!(100.00), Decimal::ZERO);
        assert_eq!(count, 0);
        assert_eq!(dust, dec!(100.00));
    }
}
