use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::model::{Market, PriceLevel};
use crate::stream_client::StreamEvent;

/// Per-ticker `Market` state fed by ticker, orderbook-delta, and trade
/// events. Applies updates in arrival order and drops anything older than
/// what it already has.
pub struct MarketStore {
    markets: HashMap<String, Market>,
}

impl MarketStore {
    pub fn new() -> Self {
        Self { markets: HashMap::new() }
    }

    pub fn get(&self, ticker: &str) -> Option<&Market> {
        self.markets.get(ticker)
    }

    pub fn tickers(&self) -> impl Iterator<Item = &String> {
        self.markets.keys()
    }

    fn entry(&mut self, ticker: &str) -> &mut Market {
        self.markets.entry(ticker.to_string()).or_insert_with(|| Market {
            ticker: ticker.to_string(),
            best_bid: Decimal::ZERO,
            best_ask: Decimal::ZERO,
            last_price: Decimal::ZERO,
            bid_liquidity: Decimal::ZERO,
            ask_liquidity: Decimal::ZERO,
            volume_24h: Decimal::ZERO,
            bid_ladder: vec![],
            ask_ladder: vec![],
            active: true,
            end_time: Utc::now(),
            last_update_ts: DateTime::<Utc>::MIN_UTC,
        })
    }

    /// Applies one stream event, returning the ticker that changed iff the
    /// event was accepted (not stale). Callers coalesce repeated hits on the
    /// same ticker within one batch into a single `MarketUpdate` emission.
    pub fn apply(&mut self, event: &StreamEvent) -> Option<String> {
        match event {
            StreamEvent::TickerUpdate { ticker, best_bid, best_ask, last_price, volume_24h, ts_ms } => {
                let ts = ms_to_ts(*ts_ms);
                let market = self.entry(ticker);
                if ts < market.last_update_ts {
                    return None;
                }
                market.best_bid = *best_bid;
                market.best_ask = *best_ask;
                market.last_price = *last_price;
                market.volume_24h = *volume_24h;
                market.last_update_ts = ts;
                Some(ticker.clone())
            }
            StreamEvent::OrderBookDelta { ticker, bids, asks, ts_ms } => {
                let ts = ms_to_ts(*ts_ms);
                let market = self.entry(ticker);
                if ts < market.last_update_ts {
                    return None;
                }
                apply_levels(&mut market.bid_ladder, bids);
                apply_levels(&mut market.ask_ladder, asks);
                market.bid_liquidity = top_n_sum(&market.bid_ladder, 3);
                market.ask_liquidity = top_n_sum(&market.ask_ladder, 3);
                market.last_update_ts = ts;
                Some(ticker.clone())
            }
            StreamEvent::Trade { ticker, price, ts_ms, .. } => {
                let ts = ms_to_ts(*ts_ms);
                let market = self.entry(ticker);
                if ts < market.last_update_ts {
                    return None;
                }
                market.last_price = *price;
                market.last_update_ts = ts;
                Some(ticker.clone())
            }
            _ => None,
        }
    }
}

impl Default for MarketStore {
    fn default() -> Self {
        Self::new()
    }
}

fn ms_to_ts(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Merges incoming (price, size) deltas into an existing ladder: size 0
/// removes the level, otherwise it's upserted by price.
fn apply_levels(ladder: &mut Vec<PriceLevel>, deltas: &[(Decimal, Decimal)]) {
    for (price, size) in deltas {
        ladder.retain(|l| l.price != *price);
        if !size.is_zero() {
            ladder.push(PriceLevel { price: *price, size: *size });
        }
    }
}

fn top_n_sum(ladder: &[PriceLevel], n: usize) -> Decimal {
    let mut sorted: Vec<&PriceLevel> = ladder.iter().collect();
    sorted.sort_by(|a, b| b.price.cmp(&a.price));
    sorted.iter().take(n).map(|l| l.size).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn out_of_order_ticker_update_is_dropped() {
        let mut store = MarketStore::new();
        store.apply(&StreamEvent::TickerUpdate {
            ticker: "T".into(),
            best_bid: dec!(0.90),
            best_ask: dec!(0.91),
            last_price: dec!(0.905),
            volume_24h: dec!(1000),
            ts_ms: 1000,
        });
        let result = store.apply(&StreamEvent::TickerUpdate {
            ticker: "T".into(),
            best_bid: dec!(0.80),
            best_ask: dec!(0.81),
            last_price: dec!(0.805),
            volume_24h: dec!(1000),
            ts_ms: 500,
        });
        assert!(result.is_none());
        assert_eq!(store.get("T").unwrap().best_bid, dec!(0.90));
    }

    #[test]
    fn orderbook_delta_removes_zero_size_levels_and_sums_top3() {
        let mut store = MarketStore::new();
        store.apply(&StreamEvent::OrderBookDelta {
            ticker: "T".into(),
            bids: vec![(dec!(0.90), dec!(100)), (dec!(0.89), dec!(200)), (dec!(0.88), dec!(300)), (dec!(0.87), dec!(400))],
            asks: vec![],
            ts_ms: 1000,
        });
        assert_eq!(store.get("T").unwrap().bid_liquidity, dec!(600));

        store.apply(&StreamEvent::OrderBookDelta {
            ticker: "T".into(),
            bids: vec![(dec!(0.90), Decimal::ZERO)],
            asks: vec![],
            ts_ms: 1001,
        });
        assert_eq!(store.get("T").unwrap().bid_liquidity, dec!(900));
    }

    #[test]
    fn trade_updates_last_price() {
        let mut store = MarketStore::new();
        store.apply(&StreamEvent::Trade { ticker: "T".into(), price: dec!(0.92), size: dec!(10), ts_ms: 1 });
        assert_eq!(store.get("T").unwrap().last_price, dec!(0.92));
    }
}
