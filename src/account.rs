use chrono::{DateTime, NaiveTime, Utc};
use rust_decimal::Decimal;

use crate::config::AgentConfig;
use crate::errors::{AgentError, AgentResult};

/// Single source of truth for cash and P&L. All mutation happens from the
/// executor task (§5); nothing outside it holds a mutable reference.
#[derive(Debug, Clone)]
pub struct Account {
    pub starting_balance: Decimal,
    pub current_balance: Decimal,
    pub locked_balance: Decimal,
    pub total_exposure: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub daily_pnl: Decimal,
    pub daily_trades: u32,
    pub daily_wins: u32,
    pub daily_losses: u32,
    pub consecutive_losses: u32,
    pub daily_starting_balance: Decimal,
    last_reset_date: chrono::NaiveDate,
}

impl Account {
    pub fn new(starting_balance: Decimal) -> Self {
        Self {
            starting_balance,
            current_balance: starting_balance,
            locked_balance: Decimal::ZERO,
            total_exposure: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            daily_pnl: Decimal::ZERO,
            daily_trades: 0,
            daily_wins: 0,
            daily_losses: 0,
            consecutive_losses: 0,
            daily_starting_balance: starting_balance,
            last_reset_date: Utc::now().date_naive(),
        }
    }

    pub fn available_balance(&self) -> Decimal {
        self.current_balance - self.locked_balance
    }

    /// Half-Kelly fixed-fraction sizing, capped by what's actually free.
    pub fn position_size(&self, cfg: &AgentConfig) -> Decimal {
        let by_pct = (cfg.max_position_pct * self.current_balance).min(Decimal::new(10, 2) * self.current_balance);
        by_pct.min(self.available_balance()).max(Decimal::ZERO)
    }

    /// Moves `amount` from available to locked. Fails if insufficient cash
    /// is free; the caller must not have submitted anything yet.
    pub fn reserve(&mut self, amount: Decimal) -> AgentResult<()> {
        if amount > self.available_balance() {
            return Err(AgentError::Validation(format!(
                "insufficient available balance: have {}, need {}",
                self.available_balance(),
                amount
            )));
        }
        self.locked_balance += amount;
        Ok(())
    }

    /// Releases a previously reserved amount back to available balance.
    /// Used for unused reservation dust, rejected orders, and timeouts.
    pub fn release(&mut self, amount: Decimal) {
        self.locked_balance = (self.locked_balance - amount).max(Decimal::ZERO);
    }

    pub fn open_exposure(&mut self, notional: Decimal) {
        self.total_exposure += notional;
    }

    pub fn close_exposure(&mut self, notional: Decimal) {
        self.total_exposure = (self.total_exposure - notional).max(Decimal::ZERO);
    }

    pub fn exposure_fits(&self, additional: Decimal, cfg: &AgentConfig) -> bool {
        self.total_exposure + additional <= cfg.max_exposure_pct * self.current_balance
    }

    /// Applies a realized close: updates balance, realized P&L, daily
    /// counters, and the consecutive-loss streak (reset on any win).
    pub fn apply_close(&mut self, realized_pnl: Decimal) {
        self.maybe_reset_daily();
        self.current_balance += realized_pnl;
        self.realized_pnl += realized_pnl;
        self.daily_pnl += realized_pnl;
        self.daily_trades += 1;
        if realized_pnl >= Decimal::ZERO {
            self.daily_wins += 1;
            self.consecutive_losses = 0;
        } else {
            self.daily_losses += 1;
            self.consecutive_losses += 1;
        }
    }

    pub fn daily_loss_fraction(&self) -> Decimal {
        if self.daily_starting_balance.is_zero() {
            return Decimal::ZERO;
        }
        (-self.daily_pnl / self.daily_starting_balance).max(Decimal::ZERO)
    }

    /// Resets daily counters if UTC midnight has passed since the last
    /// reset. Called opportunistically from the risk timer and on close.
    pub fn maybe_reset_daily(&mut self) {
        let today = Utc::now().date_naive();
        if today != self.last_reset_date {
            self.last_reset_date = today;
            self.daily_pnl = Decimal::ZERO;
            self.daily_trades = 0;
            self.daily_wins = 0;
            self.daily_losses = 0;
            self.daily_starting_balance = self.current_balance;
        }
    }

    pub fn next_utc_midnight(&self) -> DateTime<Utc> {
        let tomorrow = Utc::now().date_naive().succ_opt().unwrap_or(Utc::now().date_naive());
        tomorrow.and_time(NaiveTime::MIN).and_utc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn cfg() -> AgentConfig {
        AgentConfig::default()
    }

    #[test]
    fn position_size_capped_by_available() {
        let mut acc = Account::new(dec!(1000));
        acc.reserve(dec!(950)).unwrap();
        let size = acc.position_size(&cfg());
        assert_eq!(size, dec!(50));
    }

    #[test]
    fn position_size_honors_max_position_pct() {
        let acc = Account::new(dec!(1000));
        assert_eq!(acc.position_size(&cfg()), dec!(100));
    }

    #[test]
    fn reserve_rejects_over_available() {
        let mut acc = Account::new(dec!(100));
        assert!(acc.reserve(dec!(200)).is_err());
    }

    #[test]
    fn reserve_then_release_restores_available() {
        let mut acc = Account::new(dec!(1000));
        acc.reserve(dec!(100)).unwrap();
        assert_eq!(acc.available_balance(), dec!(900));
        acc.release(dec!(100));
        assert_eq!(acc.available_balance(), dec!(1000));
    }

    #[test]
    fn apply_close_win_resets_consecutive_losses() {
        let mut acc = Account::new(dec!(1000));
        acc.consecutive_losses = 3;
        acc.apply_close(dec!(2.00));
        assert_eq!(acc.consecutive_losses, 0);
        assert_eq!(acc.daily_wins, 1);
        assert_eq!(acc.current_balance, dec!(1002.00));
    }

    #[test]
    fn apply_close_loss_increments_consecutive_losses() {
        let mut acc = Account::new(dec!(1000));
        acc.apply_close(dec!(-1.00));
        assert_eq!(acc.consecutive_losses, 1);
        assert_eq!(acc.daily_losses, 1);
    }

    #[test]
    fn exposure_fits_respects_cap() {
        let mut acc = Account::new(dec!(1000));
        acc.open_exposure(dec!(250));
        assert!(!acc.exposure_fits(dec!(100), &cfg()));
        assert!(acc.exposure_fits(dec!(40), &cfg()));
    }
}
