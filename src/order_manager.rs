use std::collections::HashMap;

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::model::{Order, OrderStatus};

/// In-memory store keyed by `client_id` and `venue_id`. Only ever observes
/// `OrderUpdate`/`Fill` events — it never submits or cancels, so fill/cancel
/// races resolve in exactly one place (the executor).
pub struct OrderManager {
    by_client_id: HashMap<Uuid, Order>,
    venue_to_client: HashMap<String, Uuid>,
}

impl OrderManager {
    pub fn new() -> Self {
        Self { by_client_id: HashMap::new(), venue_to_client: HashMap::new() }
    }

    pub fn track(&mut self, order: Order) {
        if let Some(venue_id) = order.venue_id.clone() {
            self.venue_to_client.insert(venue_id, order.client_id);
        }
        self.by_client_id.insert(order.client_id, order);
    }

    pub fn attach_venue_id(&mut self, client_id: Uuid, venue_id: String) {
        self.venue_to_client.insert(venue_id.clone(), client_id);
        if let Some(order) = self.by_client_id.get_mut(&client_id) {
            order.venue_id = Some(venue_id);
            order.status = OrderStatus::Pending;
            order.submitted_at = Some(chrono::Utc::now());
        }
    }

    pub fn get(&self, client_id: Uuid) -> Option<&Order> {
        self.by_client_id.get(&client_id)
    }

    pub fn get_by_venue_id(&self, venue_id: &str) -> Option<&Order> {
        self.venue_to_client.get(venue_id).and_then(|id| self.by_client_id.get(id))
    }

    /// True if a non-terminal ENTRY order exists for `ticker`. StrategyEngine
    /// uses this to avoid emitting a duplicate Signal while one is in flight.
    pub fn has_pending_entry(&self, ticker: &str) -> bool {
        self.by_client_id
            .values()
            .any(|o| o.ticker == ticker && o.purpose == crate::model::OrderPurpose::Entry && !o.status.is_terminal())
    }

    /// Applies a fill; returns the order if it just became terminal so the
    /// executor can react exactly once.
    pub fn apply_fill(&mut self, venue_id: &str, filled_count: i64, fill_price: Decimal) -> Option<Order> {
        let client_id = *self.venue_to_client.get(venue_id)?;
        let order = self.by_client_id.get_mut(&client_id)?;
        if order.status.is_terminal() {
            return None;
        }
        order.filled_size = (order.filled_size + Decimal::from(filled_count) * fill_price).min(order.size);
        order.status = if order.filled_size >= order.size { OrderStatus::Filled } else { OrderStatus::PartiallyFilled };
        if order.status == OrderStatus::Filled {
            order.filled_at = Some(chrono::Utc::now());
            return Some(order.clone());
        }
        None
    }

    /// Applies a venue order-status update; returns the order if it just
    /// became terminal.
    pub fn apply_status(&mut self, venue_id: &str, status: OrderStatus) -> Option<Order> {
        let client_id = *self.venue_to_client.get(venue_id)?;
        let order = self.by_client_id.get_mut(&client_id)?;
        if order.status.is_terminal() {
            return None;
        }
        order.status = status;
        if status.is_terminal() {
            order.filled_at = Some(chrono::Utc::now());
            return Some(order.clone());
        }
        None
    }

    /// Forces an order straight to CANCELLED, bypassing the venue-status
    /// path. Used by the entry-timeout sweep, which cancels locally ahead
    /// of the venue's own order_update echo.
    pub fn force_cancel(&mut self, client_id: Uuid) -> Option<Order> {
        let order = self.by_client_id.get_mut(&client_id)?;
        if order.status.is_terminal() {
            return None;
        }
        order.status = OrderStatus::Cancelled;
        Some(order.clone())
    }
}

impl Default for OrderManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OrderPurpose, Side};
    use rust_decimal_macros::dec;

    #[test]
    fn terminal_status_is_absorbing() {
        let mut mgr = OrderManager::new();
        let order = Order::new("T", Side::Buy, dec!(0.90), dec!(100), OrderPurpose::Entry);
        let client_id = order.client_id;
        mgr.track(order);
        mgr.attach_venue_id(client_id, "v1".into());
        mgr.apply_status("v1", OrderStatus::Cancelled);
        let result = mgr.apply_status("v1", OrderStatus::Open);
        assert!(result.is_none());
        assert_eq!(mgr.get(client_id).unwrap().status, OrderStatus::Cancelled);
    }

    #[test]
    fn fill_never_exceeds_size() {
        let mut mgr = OrderManager::new();
        let order = Order::new("T", Side::Buy, dec!(0.90), dec!(100), OrderPurpose::Entry);
        let client_id = order.client_id;
        mgr.track(order);
        mgr.attach_venue_id(client_id, "v1".into());
        mgr.apply_fill("v1", 200, dec!(0.90));
        assert_eq!(mgr.get(client_id).unwrap().filled_size, dec!(100));
    }

    #[test]
    fn fill_reaching_size_returns_terminal_order() {
        let mut mgr = OrderManager::new();
        let order = Order::new("T", Side::Buy, dec!(0.90), dec!(90), OrderPurpose::Entry);
        let client_id = order.client_id;
        mgr.track(order);
        mgr.attach_venue_id(client_id, "v1".into());
        let terminal = mgr.apply_fill("v1", 100, dec!(0.90));
        assert!(terminal.is_some());
        assert_eq!(terminal.unwrap().status, OrderStatus::Filled);
    }
}
