use chrono::Utc;
use rust_decimal::Decimal;

use crate::account::Account;
use crate::config::AgentConfig;
use crate::filter;
use crate::market_store::MarketStore;
use crate::model::{ExitReason, Market, Position, PositionStatus, Signal};
use crate::order_manager::OrderManager;
use crate::position_tracker::PositionTracker;

#[derive(Debug, Clone)]
pub struct ExitIntent {
    pub position_id: uuid::Uuid,
    pub reason: ExitReason,
}

/// Signal generation on `MarketUpdate`, plus the periodic (3 s) exit
/// evaluation for timeouts and market-close proximity. Price-based exits
/// (SL/TP) are resting venue orders and never originate here.
pub struct StrategyEngine;

impl StrategyEngine {
    /// Evaluate a single ticker after a `MarketUpdate`. Returns a Signal iff
    /// the filter passes and there's no open position or pending entry.
    pub fn on_market_update(
        ticker: &str,
        store: &MarketStore,
        positions: &PositionTracker,
        orders: &OrderManager,
        account: &Account,
        cfg: &AgentConfig,
    ) -> Option<Signal> {
        let market = store.get(ticker)?;
        if !filter::passes(market, cfg) {
            return None;
        }
        if positions.has_open(ticker) {
            return None;
        }
        if orders.has_pending_entry(ticker) {
            return None;
        }

        let entry = market.best_ask;
        let size = account.position_size(cfg);
        if size.is_zero() {
            return None;
        }
        let stop = entry * (Decimal::ONE - cfg.stop_loss);
        let take = entry * (Decimal::ONE + cfg.profit_target);
        let confidence = market.best_bid.clamp(Decimal::ZERO, Decimal::ONE);

        Some(Signal {
            ticker: ticker.to_string(),
            entry_price: entry,
            size,
            stop_loss_price: stop,
            take_profit_price: take,
            confidence,
            created_at: Utc::now(),
        })
    }

    /// Periodic (3 s) pass over open positions for timeout/close exits.
    pub fn evaluate_exits(positions: &PositionTracker, store: &MarketStore, cfg: &AgentConfig) -> Vec<ExitIntent> {
        let now = Utc::now();
        let mut intents = Vec::new();
        for pos in positions.open_positions() {
            if pos.status != PositionStatus::Entered {
                continue;
            }
            if now - pos.entered_at >= pos.max_hold {
                intents.push(ExitIntent { position_id: pos.id, reason: ExitReason::Timeout });
                continue;
            }
            if let Some(market) = store.get(&pos.ticker) {
                if close_buffer_breached(market, now, cfg) {
                    intents.push(ExitIntent { position_id: pos.id, reason: ExitReason::MarketClosed });
                }
            }
        }
        intents
    }
}

fn close_buffer_breached(market: &Market, now: chrono::DateTime<Utc>, cfg: &AgentConfig) -> bool {
    let buffer = chrono::Duration::minutes(cfg.close_buffer_minutes);
    market.end_time - now <= buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn market(best_bid: Decimal, best_ask: Decimal) -> Market {
        Market {
            ticker: "T".into(),
            best_bid,
            best_ask,
            last_price: best_bid,
            bid_liquidity: dec!(600),
            ask_liquidity: dec!(600),
            volume_24h: dec!(20000),
            bid_ladder: vec![],
            ask_ladder: vec![],
            active: true,
            end_time: Utc::now() + chrono::Duration::hours(4),
            last_update_ts: Utc::now(),
        }
    }

    fn new_position() -> Position {
        Position {
            id: uuid::Uuid::new_v4(),
            ticker: "T".into(),
            entry_price: dec!(0.91),
            size: dec!(100),
            status: PositionStatus::Entered,
            entry_order_id: uuid::Uuid::new_v4(),
            stop_loss_order_id: Some(uuid::Uuid::new_v4()),
            take_profit_order_id: Some(uuid::Uuid::new_v4()),
            stop_loss_price: dec!(0.9009),
            take_profit_price: dec!(0.9282),
            max_hold: chrono::Duration::hours(2),
            entered_at: Utc::now(),
            closed_at: None,
            exit_price: None,
            exit_reason: None,
            realized_pnl: None,
        }
    }

    #[test]
    fn scenario_1_produces_correct_signal() {
        let mut store = MarketStore::new();
        store.apply(&crate::stream_client::StreamEvent::TickerUpdate {
            ticker: "T".into(),
            best_bid: dec!(0.90),
            best_ask: dec!(0.91),
            last_price: dec!(0.905),
            volume_24h: dec!(20000),
            ts_ms: 1,
        });
        store.apply(&crate::stream_client::StreamEvent::OrderBookDelta {
            ticker: "T".into(),
            bids: vec![(dec!(0.90), dec!(200)), (dec!(0.89), dec!(200)), (dec!(0.88), dec!(200))],
            asks: vec![],
            ts_ms: 2,
        });
        let positions = PositionTracker::new();
        let orders = OrderManager::new();
        let account = Account::new(dec!(1000));
        let cfg = AgentConfig::default();

        let signal = StrategyEngine::on_market_update("T", &store, &positions, &orders, &account, &cfg).unwrap();
        assert_eq!(signal.entry_price, dec!(0.91));
        assert_eq!(signal.size, dec!(100));
        assert_eq!(signal.stop_loss_price, dec!(0.9009));
        assert_eq!(signal.take_profit_price, dec!(0.9282));
    }

    #[test]
    fn no_signal_when_position_already_open() {
        let mut store = MarketStore::new();
        store.apply(&crate::stream_client::StreamEvent::TickerUpdate {
            ticker: "T".into(),
            best_bid: dec!(0.90),
            best_ask: dec!(0.91),
            last_price: dec!(0.905),
            volume_24h: dec!(20000),
            ts_ms: 1,
        });
        let mut positions = PositionTracker::new();
        positions.open(new_position());
        let orders = OrderManager::new();
        let account = Account::new(dec!(1000));
        let cfg = AgentConfig::default();

        assert!(StrategyEngine::on_market_update("T", &store, &positions, &orders, &account, &cfg).is_none());
    }

    #[test]
    fn timeout_exit_emitted_after_max_hold() {
        let mut positions = PositionTracker::new();
        let mut pos = new_position();
        pos.entered_at = Utc::now() - chrono::Duration::hours(2) - chrono::Duration::seconds(1);
        positions.open(pos.clone());
        let mut store = MarketStore::new();
        store.apply(&crate::stream_client::StreamEvent::TickerUpdate {
            ticker: "T".into(),
            best_bid: dec!(0.90),
            best_ask: dec!(0.91),
            last_price: dec!(0.905),
            volume_24h: dec!(20000),
            ts_ms: 1,
        });
        let cfg = AgentConfig::default();
        let intents = StrategyEngine::evaluate_exits(&positions, &store, &cfg);
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].reason, ExitReason::Timeout);
    }
}
