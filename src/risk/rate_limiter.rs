//! Sliding 24h order limiter.
//!
//! Blocks an instrument once its buys and sells drift too far apart in
//! count or notional over the last day. A strategy stuck in a loop keeps
//! trading one way; a healthy one alternates.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

use crate::exchange::OrderSide;

/// Default cap on the buy/sell count imbalance.
pub const DEFAULT_MAX_COUNT: usize = 10;

#[derive(Debug, Default)]
struct RateWindow {
    events: VecDeque<(DateTime<Utc>, Decimal)>,
}

impl RateWindow {
    fn prune(&mut self, cutoff: DateTime<Utc>) {
        while let Some((ts, _)) = self.events.front() {
            if *ts < cutoff {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    fn count(&self) -> usize {
        self.events.len()
    }

    fn notional(&self) -> Decimal {
        self.events.iter().map(|(_, amount)| *amount).sum()
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    windows: HashMap<(String, OrderSide), RateWindow>,
    blocked: u64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            window: Duration::hours(24),
            windows: HashMap::new(),
            blocked: 0,
        }
    }

    /// Check and record an order at the current time.
    pub fn check(
        &mut self,
        instrument: &str,
        side: OrderSide,
        amount: Decimal,
        max_amount: Decimal,
        max_count: usize,
    ) -> bool {
        self.check_at(Utc::now(), instrument, side, amount, max_amount, max_count)
    }

    /// Returns `true` and records the order when allowed.
    pub fn check_at(
        &mut self,
        now: DateTime<Utc>,
        instrument: &str,
        side: OrderSide,
        amount: Decimal,
        max_amount: Decimal,
        max_count: usize,
    ) -> bool {
        let cutoff = now - self.window;
        self.prune(cutoff);
        let (buy_count, buy_amount) = self.side_totals(instrument, OrderSide::Buy);
        let (sell_count, sell_amount) = self.side_totals(instrument, OrderSide::Sell);

        let count_gap = buy_count.abs_diff(sell_count);
        if count_gap > max_count {
            self.blocked += 1;
            warn!(
                %instrument,
                %side,
                buy_count,
                sell_count,
                max_count,
                "Order blocked: buy/sell count imbalance over 24h"
            );
            return false;
        }

        let amount_gap = (buy_amount - sell_amount).abs();
        if amount_gap > max_amount {
            self.blocked += 1;
            warn!(
                %instrument,
                %side,
                %buy_amount,
                %sell_amount,
                %max_amount,
                "Order blocked: buy/sell notional imbalance over 24h"
            );
            return false;
        }

        self.windows
            .entry((instrument.to_string(), side))
            .or_default()
            .events
            .push_back((now, amount));
        debug!(%instrument, %side, %amount, "Order admitted by limiter");
        true
    }

    /// Orders refused since startup.
    pub fn blocked_count(&self) -> u64 {
        self.blocked
    }

    /// Drop expired events everywhere, and windows left empty.
    fn prune(&mut self, cutoff: DateTime<Utc>) {
        self.windows.retain(|_, window| {
            window.prune(cutoff);
            window.count() > 0
        });
    }

    fn side_totals(&self, instrument: &str, side: OrderSide) -> (usize, Decimal) {
        self.windows
            .get(&(instrument.to_string(), side))
            .map(|window| (window.count(), window.notional()))
            .unwrap_or((0, Decimal::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 14, 0, 0).unwrap()
    }

    #[test]
    fn test_count_imbalance_blocks_then_expires() {
        let mut limiter = RateLimiter::new();
        let now = t0();
        for i in 0..=DEFAULT_MAX_COUNT {
            let at = now + Duration::minutes(i as i64);
            assert!(limiter.check_at(at, "US.AAPL", OrderSide::Buy, dec!(10), dec!(1000000), DEFAULT_MAX_COUNT));
        }
        let later = now + Duration::minutes(30);
        assert!(!limiter.check_at(later, "US.AAPL", OrderSide::Buy, dec!(10), dec!(1000000), DEFAULT_MAX_COUNT));
        assert!(!limiter.check_at(later, "US.AAPL", OrderSide::Sell, dec!(10), dec!(1000000), DEFAULT_MAX_COUNT));
        assert_eq!(limiter.blocked_count(), 2);

        // other instruments are unaffected
        assert!(limiter.check_at(later, "US.MSFT", OrderSide::Buy, dec!(10), dec!(1000000), DEFAULT_MAX_COUNT));

        let next_day = now + Duration::hours(25);
        assert!(limiter.check_at(next_day, "US.AAPL", OrderSide::Buy, dec!(10), dec!(1000000), DEFAULT_MAX_COUNT));
    }

    #[test]
    fn test_alternating_orders_stay_allowed() {
        let mut limiter = RateLimiter::new();
        for i in 0..50 {
            let side = if i % 2 == 0 { OrderSide::Buy } else { OrderSide::Sell };
            let at = t0() + Duration::minutes(i);
            assert!(limiter.check_at(at, "HK.00700", side, dec!(500), dec!(1000), 2));
        }
        assert_eq!(limiter.blocked_count(), 0);
    }

    #[test]
    fn test_notional_imbalance_blocks() {
        let mut limiter = RateLimiter::new();
        let now = t0();
        assert!(limiter.check_at(now, "US.AAPL", OrderSide::Buy, dec!(600), dec!(1000), 10));
        assert!(limiter.check_at(now, "US.AAPL", OrderSide::Buy, dec!(600), dec!(1000), 10));
        assert!(!limiter.check_at(now, "US.AAPL", OrderSide::Buy, dec!(600), dec!(1000), 10));

        // refused on either side while the gap stands
        assert!(!limiter.check_at(now, "US.AAPL", OrderSide::Sell, dec!(600), dec!(1000), 10));
    }

    #[test]
    fn test_sells_offset_buys() {
        let mut limiter = RateLimiter::new();
        let now = t0();
        assert!(limiter.check_at(now, "US.AAPL", OrderSide::Sell, dec!(100), dec!(150), 10));
        assert!(limiter.check_at(now, "US.AAPL", OrderSide::Buy, dec!(100), dec!(150), 10));
        assert!(limiter.check_at(now, "US.AAPL", OrderSide::Buy, dec!(100), dec!(150), 10));
        assert!(limiter.check_at(now, "US.AAPL", OrderSide::Buy, dec!(100), dec!(150), 10));
        assert!(!limiter.check_at(now, "US.AAPL", OrderSide::Buy, dec!(100), dec!(150), 10));
    }

    #[test]
    fn test_idle_instruments_are_forgotten() {
        let mut limiter = RateLimiter::new();
        let now = t0();
        assert!(limiter.check_at(now, "US.TSLA", OrderSide::Sell, dec!(500), dec!(1000), 10));
        assert!(limiter.check_at(now, "US.AAPL", OrderSide::Buy, dec!(100), dec!(1000), 10));
        assert_eq!(limiter.windows.len(), 2);

        // TSLA never trades again; a check on AAPL a day later clears it
        let next_day = now + Duration::hours(25);
        assert!(limiter.check_at(next_day, "US.AAPL", OrderSide::Buy, dec!(100), dec!(1000), 10));
        assert_eq!(limiter.windows.len(), 1);
        assert!(limiter.windows.contains_key(&("US.AAPL".to_string(), OrderSide::Buy)));
    }
}
