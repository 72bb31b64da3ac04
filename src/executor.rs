use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::account::Account;
use crate::config::AgentConfig;
use crate::errors::AgentResult;
use crate::model::{ExitReason, Order, OrderPurpose, OrderStatus, Position, PositionStatus, Side, Signal};
use crate::order_manager::OrderManager;
use crate::position_tracker::PositionTracker;
use crate::rest_client::RestClient;

const ENTRY_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_CANCEL_RETRIES: u32 = 3;

/// Result of sweeping one expired entry deadline (§4.11 step 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryTimeoutOutcome {
    NotFound,
    AlreadyTerminal,
    PartialFillAccepted,
    Discarded,
}

/// The capability set Executor and PaperExecutor both implement. Everything
/// else in the crate is concrete; this is the one polymorphic boundary
/// (§9 Design Notes).
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn submit_entry(&self, ticker: &str, price: Decimal, size: Decimal) -> AgentResult<String>;
    async fn submit_exit_pair(&self, ticker: &str, size: Decimal, sl_price: Decimal, tp_price: Decimal) -> AgentResult<(String, String)>;
    async fn cancel(&self, venue_id: &str) -> AgentResult<()>;
    async fn emergency_exit(&self, ticker: &str, size: Decimal, floor_bid: Decimal) -> AgentResult<String>;
}

/// Live execution backend: every call is a real RestClient submission.
pub struct Executor {
    rest: RestClient,
}

impl Executor {
    pub fn new(rest: RestClient) -> Self {
        Self { rest }
    }

    pub fn error_rate(&self) -> (u64, u64) {
        self.rest.error_rate()
    }

    /// Startup/reconnect recovery (§4.11): the venue's view of open orders,
    /// used to cancel orphans the executor has no client-side record of.
    pub async fn active_orders(&self) -> AgentResult<Vec<Order>> {
        self.rest.get_active_orders().await
    }
}

#[async_trait]
impl ExecutionBackend for Executor {
    async fn submit_entry(&self, ticker: &str, price: Decimal, size: Decimal) -> AgentResult<String> {
        let (count, _dust) = crate::rest_client::dollars_to_count(size, price);
        self.rest.submit_order(ticker, Side::Buy, price, count).await
    }

    async fn submit_exit_pair(&self, ticker: &str, size: Decimal, sl_price: Decimal, tp_price: Decimal) -> AgentResult<(String, String)> {
        let (count, _) = crate::rest_client::dollars_to_count(size, sl_price);
        let sl = self.rest.submit_order(ticker, Side::Sell, sl_price, count).await?;
        let tp = self.rest.submit_order(ticker, Side::Sell, tp_price, count).await?;
        Ok((sl, tp))
    }

    async fn cancel(&self, venue_id: &str) -> AgentResult<()> {
        self.rest.cancel_order(venue_id).await
    }

    async fn emergency_exit(&self, ticker: &str, size: Decimal, floor_bid: Decimal) -> AgentResult<String> {
        let price = floor_bid.max(Decimal::new(1, 2));
        let (count, _) = crate::rest_client::dollars_to_count(size, price);
        self.rest.submit_order(ticker, Side::Sell, price, count).await
    }
}

/// Central state machine driving entry → paired exits → fill/cancel/exit
/// (§4.11). Holds the handles Account/OrderManager/PositionTracker are
/// mutated through; nothing outside the executor task touches them.
pub struct ExecutorState<B: ExecutionBackend> {
    pub backend: B,
    pub account: Account,
    pub orders: OrderManager,
    pub positions: PositionTracker,
    entry_deadlines: HashMap<Uuid, chrono::DateTime<chrono::Utc>>,
}

impl<B: ExecutionBackend> ExecutorState<B> {
    pub fn new(backend: B, starting_balance: Decimal) -> Self {
        Self {
            backend,
            account: Account::new(starting_balance),
            orders: OrderManager::new(),
            positions: PositionTracker::new(),
            entry_deadlines: HashMap::new(),
        }
    }

    /// Step 1-4 of §4.11: reserve, create, submit, track.
    pub async fn handle_signal(&mut self, signal: Signal, cfg: &AgentConfig) -> AgentResult<()> {
        self.account.reserve(signal.size)?;

        let mut entry = Order::new(&signal.ticker, Side::Buy, signal.entry_price, signal.size, OrderPurpose::Entry);
        let client_id = entry.client_id;

        match self.backend.submit_entry(&signal.ticker, signal.entry_price, signal.size).await {
            Ok(venue_id) => {
                entry.venue_id = Some(venue_id.clone());
                entry.status = OrderStatus::Pending;
                entry.submitted_at = Some(chrono::Utc::now());
                self.orders.track(entry);
                let timeout = chrono::Duration::from_std(Duration::from_secs(cfg.entry_timeout_s)).unwrap_or(chrono::Duration::from_std(ENTRY_TIMEOUT).unwrap());
                self.entry_deadlines.insert(client_id, chrono::Utc::now() + timeout);

                let position = Position {
                    id: Uuid::new_v4(),
                    ticker: signal.ticker.clone(),
                    entry_price: signal.entry_price,
                    size: signal.size,
                    status: PositionStatus::Entering,
                    entry_order_id: client_id,
                    stop_loss_order_id: None,
                    take_profit_order_id: None,
                    stop_loss_price: signal.stop_loss_price,
                    take_profit_price: signal.take_profit_price,
                    max_hold: chrono::Duration::hours(cfg.max_hold_hours),
                    entered_at: chrono::Utc::now(),
                    closed_at: None,
                    exit_price: None,
                    exit_reason: None,
                    realized_pnl: None,
                };
                self.positions.open(position);
                self.account.open_exposure(signal.size);
                Ok(())
            }
            Err(e) => {
                self.account.release(signal.size);
                Err(e)
            }
        }
    }

    /// Called when the entry order's venue_id reaches a fill. Submits the
    /// paired SL/TP and transitions the position to ENTERED.
    pub async fn handle_entry_fill(&mut self, client_id: Uuid, fill_price: Decimal, filled_size: Decimal, cfg: &AgentConfig) -> AgentResult<()> {
        let order = match self.orders.get(client_id) {
            Some(o) => o.clone(),
            None => return Ok(()),
        };
        let position_id = match self.positions.by_entry_order(client_id) {
            Some(id) => id,
            None => return Ok(()),
        };

        let unused = order.size - filled_size;
        if unused > Decimal::ZERO {
            self.account.release(unused);
            self.account.close_exposure(unused);
        }

        let stop_loss_price = fill_price * (Decimal::ONE - cfg.stop_loss);
        let take_profit_price = fill_price * (Decimal::ONE + cfg.profit_target);

        let (sl_venue, tp_venue) = self.backend.submit_exit_pair(&order.ticker, filled_size, stop_loss_price, take_profit_price).await?;

        let mut sl_order = Order::new(&order.ticker, Side::Sell, stop_loss_price, filled_size, OrderPurpose::StopLoss);
        sl_order.venue_id = Some(sl_venue);
        sl_order.status = OrderStatus::Open;
        sl_order.position_id = Some(position_id);
        let sl_id = sl_order.client_id;
        self.orders.track(sl_order);

        let mut tp_order = Order::new(&order.ticker, Side::Sell, take_profit_price, filled_size, OrderPurpose::TakeProfit);
        tp_order.venue_id = Some(tp_venue);
        tp_order.status = OrderStatus::Open;
        tp_order.position_id = Some(position_id);
        let tp_id = tp_order.client_id;
        self.orders.track(tp_order);

        self.positions.mark_entered(position_id, fill_price, filled_size);
        self.positions.attach_exits(position_id, sl_id, tp_id);
        self.entry_deadlines.remove(&client_id);
        Ok(())
    }

    /// Entry orders whose fill-or-cancel deadline has passed (§4.11 step 5).
    pub fn expired_entries(&self) -> Vec<Uuid> {
        let now = chrono::Utc::now();
        self.entry_deadlines.iter().filter(|(_, deadline)| **deadline <= now).map(|(id, _)| *id).collect()
    }

    /// Resolves one expired entry: a partial fill is accepted as-is and
    /// gets its paired exits; a bare timeout cancels and releases the
    /// reservation, discarding the never-entered position.
    pub async fn resolve_entry_timeout(&mut self, client_id: Uuid, cfg: &AgentConfig) -> AgentResult<EntryTimeoutOutcome> {
        self.entry_deadlines.remove(&client_id);
        let order = match self.orders.get(client_id) {
            Some(o) => o.clone(),
            None => return Ok(EntryTimeoutOutcome::NotFound),
        };
        if order.status.is_terminal() {
            return Ok(EntryTimeoutOutcome::AlreadyTerminal);
        }

        if let Some(venue_id) = &order.venue_id {
            self.backend.cancel(venue_id).await?;
        }
        self.orders.force_cancel(client_id);

        if order.filled_size > Decimal::ZERO {
            self.handle_entry_fill(client_id, order.price, order.filled_size, cfg).await?;
            Ok(EntryTimeoutOutcome::PartialFillAccepted)
        } else {
            self.account.release(order.size);
            self.account.close_exposure(order.size);
            if let Some(position_id) = self.positions.by_entry_order(client_id) {
                self.positions.discard(position_id);
            }
            Ok(EntryTimeoutOutcome::Discarded)
        }
    }

    /// Step 6 of §4.11: one exit fills, cancel the sibling, close the
    /// position. A non-404 cancel failure is retried up to 3 times; if
    /// still failing the position stays EXITING rather than double-closing.
    pub async fn handle_exit_fill(&mut self, filled_venue_id: &str, fill_price: Decimal) -> AgentResult<bool> {
        let order = match self.orders.get_by_venue_id(filled_venue_id) {
            Some(o) => o.clone(),
            None => return Ok(false),
        };
        let position_id = match order.position_id {
            Some(id) => id,
            None => return Ok(false),
        };
        let position = match self.positions.get(position_id) {
            Some(p) => p.clone(),
            None => return Ok(false),
        };
        if position.status == PositionStatus::Closed {
            return Ok(false);
        }

        let sibling_venue = if order.purpose == OrderPurpose::StopLoss {
            position.take_profit_order_id.and_then(|id| self.orders.get(id)).and_then(|o| o.venue_id.clone())
        } else {
            position.stop_loss_order_id.and_then(|id| self.orders.get(id)).and_then(|o| o.venue_id.clone())
        };

        if let Some(venue_id) = sibling_venue {
            let mut attempts = 0;
            loop {
                match self.backend.cancel(&venue_id).await {
                    Ok(()) => break,
                    Err(_) if attempts < MAX_CANCEL_RETRIES => {
                        attempts += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let reason = if order.purpose == OrderPurpose::StopLoss { ExitReason::StopLoss } else { ExitReason::TakeProfit };
        self.positions.close(position_id, fill_price, reason);
        self.account.close_exposure(position.size);
        let realized = (fill_price - position.entry_price) * position.size;
        self.account.apply_close(realized);
        Ok(true)
    }

    /// Step 7 of §4.11: strategy-driven exit (timeout/close/emergency).
    /// Cancels both resting exits and submits an aggressive limit sell.
    pub async fn begin_strategy_exit(&mut self, position_id: Uuid, current_bid: Decimal) -> AgentResult<()> {
        let position = match self.positions.get(position_id) {
            Some(p) => p.clone(),
            None => return Ok(()),
        };
        self.positions.begin_exit(position_id);

        if let Some(sl_id) = position.stop_loss_order_id {
            if let Some(venue_id) = self.orders.get(sl_id).and_then(|o| o.venue_id.clone()) {
                let _ = self.backend.cancel(&venue_id).await;
            }
        }
        if let Some(tp_id) = position.take_profit_order_id {
            if let Some(venue_id) = self.orders.get(tp_id).and_then(|o| o.venue_id.clone()) {
                let _ = self.backend.cancel(&venue_id).await;
            }
        }

        let floor = (current_bid * rust_decimal_macros::dec!(0.95)).max(Decimal::new(1, 2));
        self.backend.emergency_exit(&position.ticker, position.size, floor).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    struct FakeBackend {
        entry_calls: Mutex<u32>,
    }

    #[async_trait]
    impl ExecutionBackend for FakeBackend {
        async fn submit_entry(&self, _ticker: &str, _price: Decimal, _size: Decimal) -> AgentResult<String> {
            *self.entry_calls.lock().unwrap() += 1;
            Ok("v-entry".into())
        }
        async fn submit_exit_pair(&self, _ticker: &str, _size: Decimal, _sl: Decimal, _tp: Decimal) -> AgentResult<(String, String)> {
            Ok(("v-sl".into(), "v-tp".into()))
        }
        async fn cancel(&self, _venue_id: &str) -> AgentResult<()> {
            Ok(())
        }
        async fn emergency_exit(&self, _ticker: &str, _size: Decimal, _floor: Decimal) -> AgentResult<String> {
            Ok("v-emergency".into())
        }
    }

    fn cfg() -> AgentConfig {
        AgentConfig::default()
    }

    fn signal() -> Signal {
        Signal {
            ticker: "T".into(),
            entry_price: dec!(0.91),
            size: dec!(100),
            stop_loss_price: dec!(0.9009),
            take_profit_price: dec!(0.9282),
            confidence: dec!(0.9),
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn handle_signal_reserves_and_tracks_entry() {
        let backend = FakeBackend { entry_calls: Mutex::new(0) };
        let mut exec = ExecutorState::new(backend, dec!(1000));
        exec.handle_signal(signal(), &cfg()).await.unwrap();
        assert_eq!(exec.account.locked_balance, dec!(100));
        assert!(exec.positions.has_open("T"));
    }

    #[tokio::test]
    async fn handle_signal_opens_exposure() {
        let backend = FakeBackend { entry_calls: Mutex::new(0) };
        let mut exec = ExecutorState::new(backend, dec!(1000));
        exec.handle_signal(signal(), &cfg()).await.unwrap();
        assert_eq!(exec.account.total_exposure, dec!(100));
    }

    #[tokio::test]
    async fn entry_fill_submits_paired_exits_and_enters_position() {
        let backend = FakeBackend { entry_calls: Mutex::new(0) };
        let mut exec = ExecutorState::new(backend, dec!(1000));
        exec.handle_signal(signal(), &cfg()).await.unwrap();
        let client_id = exec.orders.get_by_venue_id("v-entry").unwrap().client_id;

        exec.handle_entry_fill(client_id, dec!(0.91), dec!(100), &cfg()).await.unwrap();
        let position_id = exec.positions.get_by_ticker("T").unwrap().id;
        let position = exec.positions.get(position_id).unwrap();
        assert_eq!(position.status, PositionStatus::Entered);
        assert!(position.stop_loss_order_id.is_some());
        assert!(position.take_profit_order_id.is_some());
    }

    #[tokio::test]
    async fn exit_fill_closes_position_and_updates_account() {
        let backend = FakeBackend { entry_calls: Mutex::new(0) };
        let mut exec = ExecutorState::new(backend, dec!(1000));
        exec.handle_signal(signal(), &cfg()).await.unwrap();
        let client_id = exec.orders.get_by_venue_id("v-entry").unwrap().client_id;
        exec.handle_entry_fill(client_id, dec!(0.91), dec!(100), &cfg()).await.unwrap();

        let closed = exec.handle_exit_fill("v-tp", dec!(0.9282)).await.unwrap();
        assert!(closed);
        assert_eq!(exec.account.realized_pnl, dec!(1.82));
        assert!(!exec.positions.has_open("T"));
    }

    #[tokio::test]
    async fn unfilled_entry_timeout_cancels_and_releases_reservation() {
        let backend = FakeBackend { entry_calls: Mutex::new(0) };
        let mut exec = ExecutorState::new(backend, dec!(1000));
        exec.handle_signal(signal(), &cfg()).await.unwrap();
        let client_id = exec.orders.get_by_venue_id("v-entry").unwrap().client_id;

        let outcome = exec.resolve_entry_timeout(client_id, &cfg()).await.unwrap();
        assert_eq!(outcome, EntryTimeoutOutcome::Discarded);
        assert_eq!(exec.account.locked_balance, dec!(0));
        assert_eq!(exec.account.total_exposure, dec!(0));
        assert!(!exec.positions.has_open("T"));
        assert_eq!(exec.orders.get(client_id).unwrap().status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn partial_entry_timeout_accepts_fill_and_submits_exits() {
        let backend = FakeBackend { entry_calls: Mutex::new(0) };
        let mut exec = ExecutorState::new(backend, dec!(1000));
        exec.handle_signal(signal(), &cfg()).await.unwrap();
        let client_id = exec.orders.get_by_venue_id("v-entry").unwrap().client_id;
        exec.orders.apply_fill("v-entry", 50, dec!(0.91));

        let outcome = exec.resolve_entry_timeout(client_id, &cfg()).await.unwrap();
        assert_eq!(outcome, EntryTimeoutOutcome::PartialFillAccepted);
        let position = exec.positions.get_by_ticker("T").unwrap();
        assert_eq!(position.status, PositionStatus::Entered);
    }
}
