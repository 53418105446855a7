//! Grid ladder strategy.
//!
//! The band `[min, max]` is split into `count` steps. The cursor marks the
//! step of the last deal; a buy fill moves it down one step, a sell fill up
//! one step. Orders are quoted at the neighbouring steps and sized so the
//! cash share matches the weighting policy there.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{error, info, warn};

use super::weights::{GridType, GridWeights};
use super::{
    min3, AutoTune, FillDelta, MarketTick, OrderIntent, StrategyEngine, StrategyState,
    StrategyStatus, TradeIntent,
};
use crate::config::{InstrumentConfig, StrategyKind};
use crate::error::StrategyError;
use crate::utils::decimal::{round_to_i64, round_to_precision, safe_div};

/// 0.618³, scales volatility into a grid step.
const GOLDEN_CUBED: Decimal = dec!(0.236029032);

#[derive(Debug, Clone)]
pub struct GridStrategy {
    state: StrategyState,
    weights: GridWeights,
    min_price: Decimal,
    max_price: Decimal,
    mid_price: Decimal,
    max_fees: Decimal,
    need_reposition: bool,
    cursor: i64,
    step: Decimal,
    last_deal_price: Decimal,
}

impl GridStrategy {
    pub fn new(cfg: &InstrumentConfig, market: &str, tune: &AutoTune) -> Self {
        let params = &cfg.grid;
        let mut min_price = params.grid_min_price;
        let mut max_price = params.grid_max_price;
        let mut count = params.grid_count;

        let centre = (min_price + max_price) * dec!(0.5);
        let start_price = cfg.start_price.filter(|p| *p > Decimal::ZERO).unwrap_or(centre);
        let mut mid_price = cfg.mid_price.filter(|p| *p > Decimal::ZERO).unwrap_or(centre);

        if cfg.self_adaption_mid_price && tune.average > Decimal::ZERO && mid_price > Decimal::ZERO {
            let deviation = cfg.mid_price_max_deviation;
            let ratio = tune.average / mid_price;
            let adapted = if ratio < safe_div(Decimal::ONE, deviation) {
                safe_div(mid_price, deviation)
            } else if ratio > deviation {
                mid_price * deviation
            } else {
                tune.average
            };
            mid_price = round_to_precision(adapted * tune.jitter, cfg.price_precision);
            let width = max_price - min_price;
            min_price = mid_price - width * dec!(0.5);
            max_price = mid_price + width * dec!(0.5);
        }

        if cfg.self_adaption_threshold && tune.volatility > Decimal::ZERO {
            let per_step = mid_price * tune.volatility * dec!(2) * GOLDEN_CUBED;
            if per_step > Decimal::ZERO {
                let tuned = round_to_i64((max_price - min_price) / per_step);
                count = u32::try_from(tuned.max(2)).unwrap_or(u32::MAX);
            }
        }

        let state = StrategyState::new(cfg, market, StrategyKind::Grid, tune.invest_total, start_price);
        info!(
            instrument = %state.instrument,
            invest = %state.invest,
            %min_price,
            %max_price,
            %mid_price,
            count,
            grid_type = ?params.grid_type,
            "Grid strategy configured"
        );

        Self {
            state,
            weights: GridWeights::new(params.grid_type, count, params.geo_ratio, params.arith_delta),
            min_price,
            max_price,
            mid_price,
            max_fees: cfg.max_fees,
            need_reposition: cfg.need_reposition,
            cursor: 0,
            step: Decimal::ZERO,
            last_deal_price: Decimal::ZERO,
        }
    }

    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    pub fn step(&self) -> Decimal {
        self.step
    }

    pub fn count(&self) -> u32 {
        self.weights.count
    }

    pub fn bounds(&self) -> (Decimal, Decimal) {
        (self.min_price, self.max_price)
    }

    pub fn mid_price(&self) -> Decimal {
        self.mid_price
    }

    pub fn last_deal_price(&self) -> Decimal {
        self.last_deal_price
    }

    pub fn reposition_count(&self) -> u64 {
        self.state.reposition_count
    }

    fn grid_type(&self) -> GridType {
        self.weights.grid_type
    }

    fn count_i64(&self) -> i64 {
        i64::from(self.weights.count)
    }

    fn want_balance(&self, cursor: i64, total: Decimal) -> Decimal {
        self.weights
            .want_balance(cursor, total, self.cursor, self.state.balance)
    }

    fn clamp_cursor(&mut self) -> bool {
        if self.grid_type().is_band_free() {
            return false;
        }
        let clamped = self.cursor.clamp(0, self.count_i64());
        let changed = clamped != self.cursor;
        self.cursor = clamped;
        changed
    }

    /// Walk the ladder one step when price has left the band.
    fn reposition(&mut self, last_price: Decimal) -> bool {
        if !self.need_reposition || self.grid_type().is_band_free() {
            return false;
        }
        if self.cursor > 0 && self.cursor < self.count_i64() {
            return false;
        }

        let count = Decimal::from(self.weights.count);
        if last_price < self.min_price - self.step {
            self.min_price -= self.step;
            self.max_price = self.min_price + count * self.step;
            self.cursor = 0;
            self.last_deal_price = self.min_price;
        } else if last_price > self.max_price + self.step {
            self.max_price += self.step;
            self.min_price = self.max_price - count * self.step;
            self.cursor = self.count_i64();
            self.last_deal_price = self.max_price;
        } else {
            return false;
        }

        self.state.reposition_count += 1;
        info!(
            instrument = %self.state.instrument,
            cursor = self.cursor,
            min_price = %self.min_price,
            max_price = %self.max_price,
            repositions = self.state.reposition_count,
            %last_price,
            "Grid re-positioned"
        );
        true
    }
}

impl StrategyEngine for GridStrategy {
    fn state(&self) -> &StrategyState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut StrategyState {
        &mut self.state
    }

    fn open(&mut self, last_price: Decimal, balance: Decimal, holdings: Decimal) -> Decimal {
        if self.state.is_open() {
            error!(instrument = %self.state.instrument, "Grid already open");
            return balance;
        }
        if self.weights.count < 1 {
            error!(
                instrument = %self.state.instrument,
                error = %StrategyError::InvalidGridCount(self.weights.count),
                "Cannot open grid"
            );
            return balance;
        }
        if last_price == Decimal::ZERO {
            self.state.enter_half_open(balance, holdings);
            warn!(instrument = %self.state.instrument, %balance, %holdings, "Grid half-open, no price yet");
            return balance;
        }

        self.state.start(last_price, balance, holdings);
        let count = Decimal::from(self.weights.count);
        self.step = (self.max_price - self.min_price) / count;
        self.cursor = round_to_i64(safe_div(last_price - self.min_price, self.step));
        self.clamp_cursor();
        self.last_deal_price = self.min_price + Decimal::from(self.cursor) * self.step;

        let value = balance + self.last_deal_price * holdings;
        let mut want = self.want_balance(self.cursor, value);
        let balance_step = value / count;
        let gap = want - balance;
        if self.cursor > 0
            && dec!(0.5) * balance_step < gap
            && gap < dec!(1.5) * balance_step
        {
            want -= balance_step;
            self.cursor -= 1;
        } else if self.cursor < self.count_i64()
            && dec!(-1.5) * balance_step < gap
            && gap < dec!(-0.5) * balance_step
        {
            want += balance_step;
            self.cursor += 1;
        }

        self.state.status = StrategyStatus::Open;
        info!(
            instrument = %self.state.instrument,
            %last_price,
            %balance,
            %holdings,
            want_balance = %want,
            cursor = self.cursor,
            count = self.weights.count,
            step = %self.step,
            last_deal_price = %self.last_deal_price,
            "Grid opened"
        );
        want
    }

    fn close(&mut self) {
        self.state.close();
        info!(instrument = %self.state.instrument, "Grid closed");
    }

    fn begin_transact(&mut self, tick: &MarketTick) -> TradeIntent {
        let last = tick.last_price;
        let balance = tick.balance;
        let holdings = tick.holdings;

        if self.state.drifted(balance, holdings) {
            warn!(
                instrument = %self.state.instrument,
                %balance,
                %holdings,
                tracked_balance = %self.state.balance,
                tracked_holdings = %self.state.holdings,
                "Balance or holdings drifted, reconciling"
            );
            let fill = FillDelta::reconcile(
                last,
                balance - self.state.balance,
                holdings - self.state.holdings,
                tick.min_qty,
            );
            if let Err(e) = self.end_transact(&fill) {
                error!(instrument = %self.state.instrument, error = %e, "Reconciliation failed");
            }
            return TradeIntent::none();
        }
        if last == Decimal::ZERO
            || (balance == Decimal::ZERO && holdings == Decimal::ZERO)
            || !self.state.is_open()
        {
            error!(
                instrument = %self.state.instrument,
                %last,
                %balance,
                %holdings,
                status = ?self.state.status,
                "Grid cannot transact"
            );
            return TradeIntent::none();
        }

        self.state.observe(last, balance, holdings);
        self.reposition(last);

        let band_free = self.grid_type().is_band_free();
        let base = self.min_price + Decimal::from(self.cursor) * self.step;
        let higher = base + self.step;
        let lower = base - self.step;
        let now_value = balance + holdings * last;
        let balance_step = now_value / Decimal::from(self.weights.count);

        let mut intent = TradeIntent::none();
        if (self.cursor > 0 || band_free) && lower > Decimal::ZERO {
            let want_lower = self.want_balance(self.cursor - 1, balance + holdings * lower);
            let fee_price = self.max_fees * lower;
            let volume = min3(
                safe_div(balance - want_lower, fee_price),
                safe_div(balance, fee_price),
                dec!(2) * balance_step / lower,
            );
            if volume > Decimal::ZERO {
                intent.buy = Some(OrderIntent { price: lower, volume });
            }
        }
        if (self.cursor < self.count_i64() || band_free) && higher > Decimal::ZERO {
            let want_higher = self.want_balance(self.cursor + 1, balance + holdings * higher);
            let volume = min3(
                (want_higher - balance) / higher,
                holdings,
                dec!(2) * balance_step / higher,
            );
            if volume > Decimal::ZERO {
                intent.sell = Some(OrderIntent { price: higher, volume });
            }
        }

        if !intent.is_empty() {
            info!(
                instrument = %self.state.instrument,
                profit = %safe_div(now_value, self.state.invest),
                benchmark = %safe_div(last, self.state.start_price),
                cursor = self.cursor,
                count = self.weights.count,
                %last,
                buy = ?intent.buy,
                sell = ?intent.sell,
                "Grid intent"
            );
        }
        intent
    }

    fn end_transact(&mut self, fill: &FillDelta) -> Result<(), StrategyError> {
        if !self.state.is_open() {
            error!(instrument = %self.state.instrument, "Grid end_transact while not open");
            return Err(StrategyError::NotOpen(self.state.instrument.clone()));
        }

        self.state.apply(fill);
        if fill.cursor_step != 0 {
            self.cursor += fill.cursor_step;
            self.last_deal_price = fill.deal_price;
            let before = self.cursor;
            if self.clamp_cursor() {
                warn!(
                    instrument = %self.state.instrument,
                    cursor = before,
                    clamped = self.cursor,
                    count = self.weights.count,
                    cursor_step = fill.cursor_step,
                    "Grid cursor out of band, clamped"
                );
            }
        }

        info!(
            instrument = %self.state.instrument,
            balance_delta = %fill.balance_delta,
            holdings_delta = %fill.holdings_delta,
            cursor_step = fill.cursor_step,
            deal_price = %fill.deal_price,
            cursor = self.cursor,
            count = self.weights.count,
            "Grid fill applied"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GridParams;

    fn grid_config(grid_type: GridType) -> InstrumentConfig {
        let mut cfg = InstrumentConfig::new("US.TEST", Some(Decimal::ONE));
        cfg.grid = GridParams {
            grid_count: 10,
            grid_min_price: dec!(300),
            grid_max_price: dec!(500),
            grid_type,
            geo_ratio: dec!(0.6),
            arith_delta: dec!(-0.12),
        };
        cfg
    }

    fn open_grid(grid_type: GridType) -> GridStrategy {
        let mut grid = GridStrategy::new(&grid_config(grid_type), "US", &AutoTune::fixed(dec!(10000)));
        grid.open(dec!(400), dec!(10000), Decimal::ZERO);
        grid
    }

    fn tick(last: Decimal, balance: Decimal, holdings: Decimal) -> MarketTick {
        MarketTick {
            last_price: last,
            balance,
            holdings,
            bid: Some(last - dec!(0.01)),
            ask: Some(last + dec!(0.01)),
            spread: dec!(0.01),
            min_qty: Decimal::ONE,
            force_lurker: false,
            blind: false,
        }
    }

    fn fill(step: i64, balance_delta: Decimal, holdings_delta: Decimal, price: Decimal) -> FillDelta {
        FillDelta {
            last_price: price,
            balance_delta,
            holdings_delta,
            cursor_step: step,
            deal_price: price,
            min_qty: Decimal::ONE,
        }
    }

    #[test]
    fn test_open_normal_grid_at_centre() {
        let mut grid = GridStrategy::new(&grid_config(GridType::Normal), "US", &AutoTune::fixed(dec!(10000)));
        let want = grid.open(dec!(400), dec!(10000), Decimal::ZERO);

        assert_eq!(grid.step(), dec!(20));
        assert_eq!(grid.cursor(), 5);
        assert_eq!(want, dec!(5000));
        assert_eq!(grid.last_deal_price(), dec!(400));
        assert!(grid.is_open());
    }

    #[test]
    fn test_open_nudges_cursor_toward_actual_balance() {
        let mut grid = GridStrategy::new(&grid_config(GridType::Normal), "US", &AutoTune::fixed(dec!(10000)));
        let want = grid.open(dec!(400), dec!(5900), dec!(9.75));
        // value 9800, want(5) 4900, gap -1000 lies in (-1470, -490): move up
        assert_eq!(grid.cursor(), 6);
        assert_eq!(want, dec!(4900) + dec!(980));
    }

    #[test]
    fn test_open_half_open_without_price() {
        let mut grid = GridStrategy::new(&grid_config(GridType::Normal), "US", &AutoTune::fixed(dec!(10000)));
        let want = grid.open(Decimal::ZERO, dec!(1234), dec!(2));

        assert_eq!(want, dec!(1234));
        assert!(grid.is_half_open());
        assert_eq!(grid.balance(), dec!(1234));
        assert_eq!(grid.holdings(), dec!(2));
    }

    #[test]
    fn test_open_twice_returns_balance_unchanged() {
        let mut grid = open_grid(GridType::Normal);
        assert_eq!(grid.open(dec!(350), dec!(777), Decimal::ZERO), dec!(777));
        assert_eq!(grid.cursor(), 5);
    }

    #[test]
    fn test_open_with_zero_count_fails() {
        let mut cfg = grid_config(GridType::Normal);
        cfg.grid.grid_count = 0;
        cfg.self_adaption_threshold = false;
        let mut grid = GridStrategy::new(&cfg, "US", &AutoTune::fixed(dec!(10000)));
        assert_eq!(grid.open(dec!(400), dec!(10000), Decimal::ZERO), dec!(10000));
        assert!(!grid.is_open());
    }

    #[test]
    fn test_begin_transact_quotes_neighbouring_steps() {
        let mut grid = open_grid(GridType::Normal);
        grid.end_transact(&fill(0, dec!(-5000), dec!(12.5), dec!(400))).unwrap();

        let intent = grid.begin_transact(&tick(dec!(400), dec!(5000), dec!(12.5)));
        let buy = intent.buy.unwrap();
        let sell = intent.sell.unwrap();

        assert_eq!(buy.price, dec!(380));
        assert_eq!(sell.price, dec!(420));
        // lower value 5000 + 12.5*380 = 9750, want(4) = 3900, buy (5000-3900)/380
        assert_eq!(buy.volume, dec!(1100) / dec!(380));
        // higher value 5250 + 5000 = 10250, want(6) = 6150, sell (6150-5000)/420
        assert_eq!(sell.volume, dec!(1150) / dec!(420));
    }

    #[test]
    fn test_drift_forces_reconciliation_without_intent() {
        let mut grid = open_grid(GridType::Normal);

        let intent = grid.begin_transact(&tick(dec!(400), dec!(10050), Decimal::ZERO));

        assert!(intent.is_empty());
        assert_eq!(grid.balance(), dec!(10050));
        assert_eq!(grid.cursor(), 5);
    }

    #[test]
    fn test_begin_transact_requires_open() {
        let mut grid = GridStrategy::new(&grid_config(GridType::Normal), "US", &AutoTune::fixed(dec!(10000)));
        assert!(grid.begin_transact(&tick(dec!(400), Decimal::ZERO, Decimal::ZERO)).is_empty());
    }

    #[test]
    fn test_end_transact_requires_open() {
        let mut grid = GridStrategy::new(&grid_config(GridType::Normal), "US", &AutoTune::fixed(dec!(10000)));
        let err = grid.end_transact(&fill(-1, dec!(-380), dec!(1), dec!(380))).unwrap_err();
        assert_eq!(err, StrategyError::NotOpen("US.TEST".into()));
    }

    #[test]
    fn test_cursor_stays_in_band_for_any_step_sequence() {
        for grid_type in [GridType::Normal, GridType::KTable, GridType::Arith] {
            let mut grid = open_grid(grid_type);
            let steps = [-1, -1, -1, -1, -1, -1, -1, -3, 2, 7, 1, 1, 1, 4, -12, 5, 20, -1];
            for step in steps {
                grid.end_transact(&fill(step, Decimal::ZERO, Decimal::ZERO, dec!(400))).unwrap();
                assert!(
                    (0..=10).contains(&grid.cursor()),
                    "{:?} cursor {}",
                    grid_type,
                    grid.cursor()
                );
            }
        }
    }

    #[test]
    fn test_band_free_cursor_is_not_clamped() {
        let mut grid = open_grid(GridType::Geo);
        for _ in 0..8 {
            grid.end_transact(&fill(-1, Decimal::ZERO, Decimal::ZERO, dec!(300))).unwrap();
        }
        assert_eq!(grid.cursor(), -3);
    }

    #[test]
    fn test_reposition_walks_ladder_down() {
        let mut cfg = grid_config(GridType::Normal);
        cfg.need_reposition = true;
        let mut grid = GridStrategy::new(&cfg, "US", &AutoTune::fixed(dec!(10000)));
        grid.open(dec!(290), dec!(100), dec!(30));
        assert_eq!(grid.cursor(), 0);

        grid.begin_transact(&tick(dec!(270), dec!(100), dec!(30)));

        assert_eq!(grid.bounds(), (dec!(280), dec!(480)));
        assert_eq!(grid.cursor(), 0);
        assert_eq!(grid.reposition_count(), 1);
        assert_eq!(grid.last_deal_price(), dec!(280));
    }

    #[test]
    fn test_reposition_needs_edge_cursor() {
        let mut cfg = grid_config(GridType::Normal);
        cfg.need_reposition = true;
        let mut grid = GridStrategy::new(&cfg, "US", &AutoTune::fixed(dec!(10000)));
        grid.open(dec!(400), dec!(5000), dec!(12.5));

        grid.begin_transact(&tick(dec!(250), dec!(5000), dec!(12.5)));

        assert_eq!(grid.bounds(), (dec!(300), dec!(500)));
        assert_eq!(grid.reposition_count(), 0);
    }

    #[test]
    fn test_auto_tune_recentres_and_sets_count() {
        let cfg = grid_config(GridType::Normal);
        let tune = AutoTune {
            invest_total: dec!(10000),
            average: dec!(420),
            volatility: dec!(0.02),
            jitter: Decimal::ONE,
        };
        let grid = GridStrategy::new(&cfg, "US", &tune);

        assert_eq!(grid.mid_price(), dec!(420));
        assert_eq!(grid.bounds(), (dec!(320), dec!(520)));
        // 200 / (420 * 0.02 * 2 * 0.236029032) = 50.44
        assert_eq!(grid.count(), 50);
    }

    #[test]
    fn test_auto_tune_clamps_mid_price_deviation() {
        let cfg = grid_config(GridType::Normal);
        let tune = AutoTune {
            invest_total: dec!(10000),
            average: dec!(4000),
            volatility: Decimal::ZERO,
            jitter: Decimal::ONE,
        };
        let grid = GridStrategy::new(&cfg, "US", &tune);
        assert_eq!(grid.mid_price(), dec!(2000));
        assert_eq!(grid.count(), 10);
    }
}
