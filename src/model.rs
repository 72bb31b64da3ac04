// Shared domain types. Kept free of behavior beyond small derived helpers;
// the components in this crate own the state transitions over these types.
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Created,
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderPurpose {
    Entry,
    StopLoss,
    TakeProfit,
}

impl OrderPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderPurpose::Entry => "ENTRY",
            OrderPurpose::StopLoss => "STOP_LOSS",
            OrderPurpose::TakeProfit => "TAKE_PROFIT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Entering,
    Entered,
    Exiting,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    Timeout,
    MarketClosed,
    Emergency,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "TAKE_PROFIT",
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::Timeout => "TIMEOUT",
            ExitReason::MarketClosed => "MARKET_CLOSED",
            ExitReason::Emergency => "EMERGENCY",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub ticker: String,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub last_price: Decimal,
    pub bid_liquidity: Decimal,
    pub ask_liquidity: Decimal,
    pub volume_24h: Decimal,
    pub bid_ladder: Vec<PriceLevel>,
    pub ask_ladder: Vec<PriceLevel>,
    pub active: bool,
    pub end_time: DateTime<Utc>,
    pub last_update_ts: DateTime<Utc>,
}

impl Market {
    pub fn spread(&self) -> Decimal {
        if self.best_bid.is_zero() {
            return Decimal::ZERO;
        }
        (self.best_ask - self.best_bid) / self.best_bid
    }

    pub fn mid(&self) -> Decimal {
        (self.best_bid + self.best_ask) / Decimal::TWO
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub client_id: Uuid,
    pub venue_id: Option<String>,
    pub ticker: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub filled_size: Decimal,
    pub status: OrderStatus,
    pub purpose: OrderPurpose,
    pub position_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub filled_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn new(ticker: impl Into<String>, side: Side, price: Decimal, size: Decimal, purpose: OrderPurpose) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            venue_id: None,
            ticker: ticker.into(),
            side,
            price,
            size,
            filled_size: Decimal::ZERO,
            status: OrderStatus::Created,
            purpose,
            position_id: None,
            created_at: Utc::now(),
            submitted_at: None,
            filled_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub ticker: String,
    pub entry_price: Decimal,
    pub size: Decimal,
    pub status: PositionStatus,
    pub entry_order_id: Uuid,
    pub stop_loss_order_id: Option<Uuid>,
    pub take_profit_order_id: Option<Uuid>,
    pub stop_loss_price: Decimal,
    pub take_profit_price: Decimal,
    pub max_hold: chrono::Duration,
    pub entered_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub exit_price: Option<Decimal>,
    pub exit_reason: Option<ExitReason>,
    pub realized_pnl: Option<Decimal>,
}

impl Position {
    pub fn unrealized_pnl(&self, current_price: Decimal) -> Decimal {
        (current_price - self.entry_price) * self.size
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub ticker: String,
    pub entry_price: Decimal,
    pub size: Decimal,
    pub stop_loss_price: Decimal,
    pub take_profit_price: Decimal,
    pub confidence: Decimal,
    pub created_at: DateTime<Utc>,
}

impl Signal {
    pub fn risk_reward(&self) -> Decimal {
        let downside = self.entry_price - self.stop_loss_price;
        if downside.is_zero() {
            return Decimal::ZERO;
        }
        (self.take_profit_price - self.entry_price) / downside
    }
}

#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerState {
    pub active: bool,
    pub reason: Option<String>,
    pub tripped_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn market_spread_and_mid() {
        let m = Market {
            ticker: "T".into(),
            best_bid: dec!(0.90),
            best_ask: dec!(0.91),
            last_price: dec!(0.905),
            bid_liquidity: dec!(600),
            ask_liquidity: dec!(600),
            volume_24h: dec!(20000),
            bid_ladder: vec![],
            ask_ladder: vec![],
            active: true,
            end_time: Utc::now(),
            last_update_ts: Utc::now(),
        };
        assert_eq!(m.mid(), dec!(0.905));
        assert!((m.spread() - dec!(0.011111111111111111111111111)).abs() < dec!(0.0001));
    }

    #[test]
    fn signal_risk_reward() {
        let s = Signal {
            ticker: "T".into(),
            entry_price: dec!(0.91),
            size: dec!(100),
            stop_loss_price: dec!(0.9009),
            take_profit_price: dec!(0.9282),
            confidence: dec!(0.9),
            created_at: Utc::now(),
        };
        assert!(s.risk_reward() >= dec!(2.0));
    }

    #[test]
    fn order_status_terminal() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(!OrderStatus::Open.is_terminal());
    }
}
