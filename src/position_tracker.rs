use std::collections::HashMap;

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::model::{ExitReason, Position, PositionStatus};

/// Stores `Position` objects, indexed by id and by ticker. Enforces the
/// one-non-closed-position-per-ticker invariant (§8, property 3) at the
/// `open` call site.
pub struct PositionTracker {
    by_id: HashMap<Uuid, Position>,
    by_ticker: HashMap<String, Uuid>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self { by_id: HashMap::new(), by_ticker: HashMap::new() }
    }

    pub fn has_open(&self, ticker: &str) -> bool {
        self.by_ticker.contains_key(ticker)
    }

    pub fn open(&mut self, pos: Position) {
        self.by_ticker.insert(pos.ticker.clone(), pos.id);
        self.by_id.insert(pos.id, pos);
    }

    pub fn get(&self, id: Uuid) -> Option<&Position> {
        self.by_id.get(&id)
    }

    pub fn get_by_ticker(&self, ticker: &str) -> Option<&Position> {
        self.by_ticker.get(ticker).and_then(|id| self.by_id.get(id))
    }

    pub fn by_entry_order(&self, entry_order_id: Uuid) -> Option<Uuid> {
        self.by_id.values().find(|p| p.entry_order_id == entry_order_id).map(|p| p.id)
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.by_id.values().filter(|p| p.status != PositionStatus::Closed)
    }

    pub fn mark_entered(&mut self, id: Uuid, fill_price: Decimal, fill_size: Decimal) {
        if let Some(pos) = self.by_id.get_mut(&id) {
            pos.entry_price = fill_price;
            pos.size = fill_size;
            pos.status = PositionStatus::Entered;
            pos.entered_at = Utc::now();
        }
    }

    pub fn attach_exits(&mut self, id: Uuid, sl_id: Uuid, tp_id: Uuid) {
        if let Some(pos) = self.by_id.get_mut(&id) {
            pos.stop_loss_order_id = Some(sl_id);
            pos.take_profit_order_id = Some(tp_id);
        }
    }

    pub fn begin_exit(&mut self, id: Uuid) {
        if let Some(pos) = self.by_id.get_mut(&id) {
            pos.status = PositionStatus::Exiting;
        }
    }

    pub fn close(&mut self, id: Uuid, exit_price: Decimal, reason: ExitReason) -> Option<Position> {
        let pos = self.by_id.get_mut(&id)?;
        let realized = (exit_price - pos.entry_price) * pos.size;
        pos.status = PositionStatus::Closed;
        pos.closed_at = Some(Utc::now());
        pos.exit_price = Some(exit_price);
        pos.exit_reason = Some(reason);
        pos.realized_pnl = Some(realized);
        self.by_ticker.remove(&pos.ticker);
        Some(pos.clone())
    }

    /// Removes a position that never reached ENTERED (its entry order timed
    /// out unfilled) — it has no fill to record and never occupied exposure.
    pub fn discard(&mut self, id: Uuid) -> Option<Position> {
        let pos = self.by_id.remove(&id)?;
        self.by_ticker.remove(&pos.ticker);
        Some(pos)
    }
}

impl Default for PositionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn new_position(ticker: &str) -> Position {
        Position {
            id: Uuid::new_v4(),
            ticker: ticker.into(),
            entry_price: dec!(0.91),
            size: dec!(100),
            status: PositionStatus::Entering,
            entry_order_id: Uuid::new_v4(),
            stop_loss_order_id: None,
            take_profit_order_id: None,
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
    fn close_computes_realized_pnl_and_frees_ticker() {
        let mut tracker = PositionTracker::new();
        let pos = new_position("T");
        let id = pos.id;
        tracker.open(pos);
        assert!(tracker.has_open("T"));

        let closed = tracker.close(id, dec!(0.9282), ExitReason::TakeProfit).unwrap();
        assert_eq!(closed.realized_pnl.unwrap(), dec!(1.82));
        assert!(!tracker.has_open("T"));
    }

    #[test]
    fn mark_entered_updates_fill_details() {
        let mut tracker = PositionTracker::new();
        let pos = new_position("T");
        let id = pos.id;
        tracker.open(pos);
        tracker.mark_entered(id, dec!(0.90), dec!(90));
        let p = tracker.get(id).unwrap();
        assert_eq!(p.entry_price, dec!(0.90));
        assert_eq!(p.size, dec!(90));
        assert_eq!(p.status, PositionStatus::Entered);
    }
}
