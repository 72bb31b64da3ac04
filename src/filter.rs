use rust_decimal::Decimal;

use crate::config::AgentConfig;
use crate::model::Market;

/// Pure predicate over `(Market, config)` — no side effects, no state.
/// Grouped separately from StrategyEngine so the admission rule can be
/// tested in isolation from signal construction.
pub fn passes(market: &Market, cfg: &AgentConfig) -> bool {
    if !market.active {
        return false;
    }
    if market.best_bid < cfg.entry_threshold {
        return false;
    }
    if market.bid_liquidity < cfg.min_liquidity {
        return false;
    }
    if market.volume_24h < cfg.min_volume {
        return false;
    }
    if market.spread() > cfg.max_spread {
        return false;
    }
    headroom_ok(market.best_bid, cfg.profit_target)
}

/// The take-profit ceiling check: `best_bid * (1 + profit_target) <= 0.95`.
fn headroom_ok(best_bid: Decimal, profit_target: Decimal) -> bool {
    best_bid * (Decimal::ONE + profit_target) <= Decimal::new(95, 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn market(best_bid: Decimal, best_ask: Decimal, liq: Decimal, vol: Decimal) -> Market {
        Market {
            ticker: "T".into(),
            best_bid,
            best_ask,
            last_price: best_bid,
            bid_liquidity: liq,
            ask_liquidity: liq,
            volume_24h: vol,
            bid_ladder: vec![],
            ask_ladder: vec![],
            active: true,
            end_time: Utc::now(),
            last_update_ts: Utc::now(),
        }
    }

    #[test]
    fn boundary_entry_threshold_085_passes_0_8499_fails() {
        let cfg = AgentConfig::default();
        let m1 = market(dec!(0.85), dec!(0.86), dec!(600), dec!(20000));
        assert!(passes(&m1, &cfg));

        let m2 = market(dec!(0.8499), dec!(0.86), dec!(600), dec!(20000));
        assert!(!passes(&m2, &cfg));
    }

    #[test]
    fn headroom_rule_admits_093_rejects_094() {
        let cfg = AgentConfig::default();
        assert!(headroom_ok(dec!(0.93), cfg.profit_target));
        assert!(!headroom_ok(dec!(0.94), cfg.profit_target));
    }

    #[test]
    fn insufficient_liquidity_fails() {
        let cfg = AgentConfig::default();
        let m = market(dec!(0.90), dec!(0.91), dec!(100), dec!(20000));
        assert!(!passes(&m, &cfg));
    }

    #[test]
    fn inactive_market_fails() {
        let cfg = AgentConfig::default();
        let mut m = market(dec!(0.90), dec!(0.91), dec!(600), dec!(20000));
        m.active = false;
        assert!(!passes(&m, &cfg));
    }

    #[test]
    fn wide_spread_fails() {
        let cfg = AgentConfig::default();
        let m = market(dec!(0.90), dec!(0.95), dec!(600), dec!(20000));
        assert!(!passes(&m, &cfg));
    }
}
