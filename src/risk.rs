use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::account::Account;
use crate::config::AgentConfig;
use crate::model::{CircuitBreakerState, Signal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerKind {
    DailyLoss,
    ConsecutiveLoss,
    ApiErrorRate,
    StreamDisconnect,
}

struct Breaker {
    kind: BreakerKind,
    state: CircuitBreakerState,
}

impl Breaker {
    fn new(kind: BreakerKind) -> Self {
        Self { kind, state: CircuitBreakerState::default() }
    }

    fn trip(&mut self, reason: impl Into<String>) {
        if !self.state.active {
            self.state.active = true;
            self.state.reason = Some(reason.into());
            self.state.tripped_at = Some(Utc::now());
        }
    }

    fn reset(&mut self) {
        self.state = CircuitBreakerState::default();
    }
}

/// Pre-trade validation plus four independently-tripped circuit breakers.
/// Any active breaker rejects new entries; existing positions keep their
/// resting exits regardless of breaker state.
pub struct RiskManager {
    breakers: Vec<Breaker>,
    stream_silent_since: Option<DateTime<Utc>>,
}

impl RiskManager {
    pub fn new() -> Self {
        Self {
            breakers: vec![
                Breaker::new(BreakerKind::DailyLoss),
                Breaker::new(BreakerKind::ConsecutiveLoss),
                Breaker::new(BreakerKind::ApiErrorRate),
                Breaker::new(BreakerKind::StreamDisconnect),
            ],
            stream_silent_since: None,
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.breakers.iter().any(|b| b.state.active)
    }

    pub fn active_reasons(&self) -> Vec<String> {
        self.breakers.iter().filter(|b| b.state.active).filter_map(|b| b.state.reason.clone()).collect()
    }

    fn breaker_mut(&mut self, kind: BreakerKind) -> &mut Breaker {
        self.breakers.iter_mut().find(|b| b.kind == kind).expect("all breaker kinds registered")
    }

    /// Evaluate the daily-loss and consecutive-loss breakers against the
    /// account's own counters. Called from the risk timer (10 s) and after
    /// every close.
    pub fn evaluate_account_breakers(&mut self, account: &Account, cfg: &AgentConfig) {
        if account.daily_loss_fraction() >= cfg.daily_loss_limit {
            self.breaker_mut(BreakerKind::DailyLoss).trip("daily_loss_limit");
        }
        if account.consecutive_losses >= cfg.max_consecutive_losses {
            self.breaker_mut(BreakerKind::ConsecutiveLoss).trip("consecutive_losses");
        } else {
            self.breaker_mut(BreakerKind::ConsecutiveLoss).reset();
        }
    }

    /// Resets the daily-loss breaker; called once per UTC-midnight rollover.
    pub fn reset_daily_loss(&mut self) {
        self.breaker_mut(BreakerKind::DailyLoss).reset();
    }

    /// `error_count` / `total_count` are RestClient's cumulative counters;
    /// treated as a recency approximation of the trailing-100 window since
    /// the REST layer doesn't keep a ring buffer of outcomes.
    pub fn evaluate_api_error_rate(&mut self, error_count: u64, total_count: u64, cfg: &AgentConfig) {
        if total_count == 0 {
            return;
        }
        let rate = Decimal::from(error_count) / Decimal::from(total_count);
        if rate >= cfg.api_error_rate_limit {
            self.breaker_mut(BreakerKind::ApiErrorRate).trip("api_error_rate");
        }
    }

    /// Manual reset for the API error-rate breaker (admin action per the
    /// breaker table's Reset column).
    pub fn admin_reset_api_error_rate(&mut self) {
        self.breaker_mut(BreakerKind::ApiErrorRate).reset();
    }

    /// Tracks stream silence locally so elapsed-time comparisons don't
    /// depend on polling cadence. Returns `ForceExit` once silence exceeds
    /// `stream_force_exit_s`.
    pub fn evaluate_stream(&mut self, is_silent: bool, cfg: &AgentConfig) -> StreamVerdict {
        match (is_silent, self.stream_silent_since) {
            (true, None) => {
                self.stream_silent_since = Some(Utc::now());
                StreamVerdict::Ok
            }
            (true, Some(since)) => {
                let elapsed = (Utc::now() - since).num_seconds().max(0) as u64;
                if elapsed >= cfg.stream_silence_s {
                    self.breaker_mut(BreakerKind::StreamDisconnect).trip("stream_disconnect");
                }
                if elapsed >= cfg.stream_force_exit_s {
                    StreamVerdict::ForceExit
                } else {
                    StreamVerdict::Ok
                }
            }
            (false, Some(_)) => {
                self.stream_silent_since = None;
                self.breaker_mut(BreakerKind::StreamDisconnect).reset();
                StreamVerdict::Recovered
            }
            (false, None) => StreamVerdict::Ok,
        }
    }

    /// Full pre-trade validation for a candidate Signal.
    pub fn validate_signal(
        &self,
        signal: &Signal,
        account: &Account,
        open_positions: usize,
        best_ask: Decimal,
        cfg: &AgentConfig,
    ) -> Result<(), String> {
        if self.is_tripped() {
            return Err(self.active_reasons().join(","));
        }
        if account.available_balance() < signal.size {
            return Err("insufficient_available_balance".into());
        }
        if open_positions >= cfg.max_positions {
            return Err("max_positions".into());
        }
        if !account.exposure_fits(signal.size, cfg) {
            return Err("max_exposure_pct".into());
        }
        if signal.size > cfg.max_position_pct * account.current_balance {
            return Err("max_position_pct".into());
        }
        if signal.size < cfg.min_position_dollars {
            return Err("min_position_dollars".into());
        }
        if signal.entry_price < Decimal::new(1, 2) || signal.entry_price > Decimal::new(95, 2) {
            return Err("entry_out_of_range".into());
        }
        if signal.entry_price > cfg.slippage_cap * best_ask {
            return Err("slippage_cap".into());
        }
        if signal.risk_reward() < cfg.min_risk_reward {
            return Err("min_risk_reward".into());
        }
        Ok(())
    }
}

impl Default for RiskManager {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamVerdict {
    Ok,
    ForceExit,
    Recovered,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

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
            created_at: Utc::now(),
        }
    }

    #[test]
    fn four_losses_stay_alive_fifth_trips() {
        let mut risk = RiskManager::new();
        let mut account = Account::new(dec!(1000));
        for _ in 0..4 {
            account.apply_close(dec!(-1));
            risk.evaluate_account_breakers(&account, &cfg());
            assert!(!risk.is_tripped());
        }
        account.apply_close(dec!(-1));
        risk.evaluate_account_breakers(&account, &cfg());
        assert!(risk.is_tripped());
    }

    #[test]
    fn daily_loss_breaker_trips_at_5_percent() {
        let mut risk = RiskManager::new();
        let mut account = Account::new(dec!(1000));
        account.apply_close(dec!(-50));
        risk.evaluate_account_breakers(&account, &cfg());
        assert!(risk.is_tripped());
    }

    #[test]
    fn api_error_rate_breaker_trips_at_10_percent() {
        let mut risk = RiskManager::new();
        risk.evaluate_api_error_rate(10, 100, &cfg());
        assert!(risk.is_tripped());
    }

    #[test]
    fn stream_force_exit_after_30s() {
        let mut risk = RiskManager::new();
        risk.stream_silent_since = Some(Utc::now() - chrono::Duration::seconds(31));
        let verdict = risk.evaluate_stream(true, &cfg());
        assert_eq!(verdict, StreamVerdict::ForceExit);
        assert!(risk.is_tripped());
    }

    #[test]
    fn stream_recovery_resets_breaker() {
        let mut risk = RiskManager::new();
        risk.stream_silent_since = Some(Utc::now() - chrono::Duration::seconds(20));
        risk.evaluate_stream(true, &cfg());
        assert!(risk.is_tripped());
        let verdict = risk.evaluate_stream(false, &cfg());
        assert_eq!(verdict, StreamVerdict::Recovered);
        assert!(!risk.is_tripped());
    }

    #[test]
    fn validate_signal_rejects_below_min_risk_reward() {
        let risk = RiskManager::new();
        let account = Account::new(dec!(1000));
        let mut sig = signal();
        sig.take_profit_price = dec!(0.92);
        let result = risk.validate_signal(&sig, &account, 0, dec!(0.91), &cfg());
        assert_eq!(result, Err("min_risk_reward".into()));
    }

    #[test]
    fn validate_signal_accepts_scenario_1() {
        let risk = RiskManager::new();
        let account = Account::new(dec!(1000));
        let result = risk.validate_signal(&signal(), &account, 0, dec!(0.91), &cfg());
        assert!(result.is_ok());
    }
}
