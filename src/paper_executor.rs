use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::errors::{AgentError, AgentResult};
use crate::executor::ExecutionBackend;
use crate::market_store::MarketStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RestingSide {
    Buy,
    Sell,
}

struct RestingOrder {
    ticker: String,
    side: RestingSide,
    price: Decimal,
}

/// Mirrors Executor but substitutes a simulated matching engine: a BUY LIMIT
/// fills when `best_ask <= price`, a SELL LIMIT fills when `best_bid >=
/// price`. Shares PositionTracker/OrderManager/Account/RiskManager code
/// paths unchanged — the primary testability lever (§4.13).
pub struct PaperExecutor {
    resting: Mutex<std::collections::HashMap<String, RestingOrder>>,
}

impl PaperExecutor {
    pub fn new() -> Self {
        Self { resting: Mutex::new(std::collections::HashMap::new()) }
    }

    /// Evaluated on every MarketUpdate for `ticker`: returns venue ids whose
    /// resting order just crossed the market and should be reported as
    /// filled upstream.
    pub fn check_fills(&self, ticker: &str, store: &MarketStore) -> Vec<String> {
        let market = match store.get(ticker) {
            Some(m) => m,
            None => return vec![],
        };
        let mut resting = self.resting.lock().unwrap();
        let mut filled = Vec::new();
        resting.retain(|venue_id, order| {
            if order.ticker != ticker {
                return true;
            }
            let crosses = match order.side {
                RestingSide::Buy => market.best_ask <= order.price,
                RestingSide::Sell => market.best_bid >= order.price,
            };
            if crosses {
                filled.push(venue_id.clone());
                false
            } else {
                true
            }
        });
        filled
    }
}

impl Default for PaperExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionBackend for PaperExecutor {
    async fn submit_entry(&self, ticker: &str, price: Decimal, size: Decimal) -> AgentResult<String> {
        if size <= Decimal::ZERO {
            return Err(AgentError::Validation("order size must be positive".into()));
        }
        let venue_id = format!("paper-{}", Uuid::new_v4());
        self.resting.lock().unwrap().insert(venue_id.clone(), RestingOrder { ticker: ticker.to_string(), side: RestingSide::Buy, price });
        Ok(venue_id)
    }

    async fn submit_exit_pair(&self, ticker: &str, _size: Decimal, sl_price: Decimal, tp_price: Decimal) -> AgentResult<(String, String)> {
        let sl_id = format!("paper-{}", Uuid::new_v4());
        let tp_id = format!("paper-{}", Uuid::new_v4());
        let mut resting = self.resting.lock().unwrap();
        resting.insert(sl_id.clone(), RestingOrder { ticker: ticker.to_string(), side: RestingSide::Sell, price: sl_price });
        resting.insert(tp_id.clone(), RestingOrder { ticker: ticker.to_string(), side: RestingSide::Sell, price: tp_price });
        Ok((sl_id, tp_id))
    }

    async fn cancel(&self, venue_id: &str) -> AgentResult<()> {
        let mut resting = self.resting.lock().unwrap();
        if resting.remove(venue_id).is_none() {
            return Err(AgentError::state_conflict(venue_id, "already resolved"));
        }
        Ok(())
    }

    async fn emergency_exit(&self, ticker: &str, size: Decimal, floor_bid: Decimal) -> AgentResult<String> {
        let _ = size;
        let venue_id = format!("paper-{}", Uuid::new_v4());
        self.resting.lock().unwrap().insert(venue_id.clone(), RestingOrder { ticker: ticker.to_string(), side: RestingSide::Sell, price: floor_bid });
        Ok(venue_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_client::StreamEvent;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn buy_limit_fills_when_ask_crosses() {
        let paper = PaperExecutor::new();
        let venue_id = paper.submit_entry("T", dec!(0.91), dec!(100)).await.unwrap();

        let mut store = MarketStore::new();
        store.apply(&StreamEvent::TickerUpdate { ticker: "T".into(), best_bid: dec!(0.92), best_ask: dec!(0.93), last_price: dec!(0.92), volume_24h: dec!(0), ts_ms: 1 });
        assert!(paper.check_fills("T", &store).is_empty());

        store.apply(&StreamEvent::TickerUpdate { ticker: "T".into(), best_bid: dec!(0.90), best_ask: dec!(0.91), last_price: dec!(0.91), volume_24h: dec!(0), ts_ms: 2 });
        let filled = paper.check_fills("T", &store);
        assert_eq!(filled, vec![venue_id]);
    }

    #[tokio::test]
    async fn cancel_unknown_order_is_state_conflict() {
        let paper = PaperExecutor::new();
        let result = paper.cancel("nonexistent").await;
        assert!(matches!(result, Err(AgentError::StateConflict { .. })));
    }

    #[tokio::test]
    async fn sell_limit_fills_when_bid_crosses() {
        let paper = PaperExecutor::new();
        let (sl_id, tp_id) = paper.submit_exit_pair("T", dec!(100), dec!(0.90), dec!(0.93)).await.unwrap();

        let mut store = MarketStore::new();
        store.apply(&StreamEvent::TickerUpdate { ticker: "T".into(), best_bid: dec!(0.935), best_ask: dec!(0.94), last_price: dec!(0.935), volume_24h: dec!(0), ts_ms: 1 });
        let filled = paper.check_fills("T", &store);
        assert_eq!(filled, vec![tp_id]);
        let _ = sl_id;
    }
}
