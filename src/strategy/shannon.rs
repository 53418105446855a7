//! Leveraged constant-ratio rebalancing.
//!
//! The engine keeps a virtual balance/holdings pair whose notional is
//! `0.5 * leverage` times the real value. Trades are sized on the virtual
//! pair and fire once its cash/stock split drifts past `threshold`; fills
//! are applied to both the real and the virtual ledger.

use std::sync::Arc;

use rust_decimal::{Decimal, MathematicalOps};
use rust_decimal_macros::dec;
use tracing::{error, info, warn};

use super::{
    min3, AutoTune, FillDelta, MarketTick, OrderIntent, StrategyEngine, StrategyState,
    StrategyStatus, TradeIntent,
};
use crate::config::{ExecutionConfig, InstrumentConfig, StrategyKind};
use crate::error::StrategyError;
use crate::utils::decimal::{round_to_precision, safe_div};

const GOLDEN_CUBED: Decimal = dec!(0.236029032);
const FALLBACK_THRESHOLD: Decimal = dec!(0.01);
/// Buys above last price by more than this are not placed (sells mirrored).
const CHASE_LIMIT: Decimal = dec!(0.005);

/// Diagnostics counters, logged after every fill.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShannonStats {
    pub ticks: u64,
    pub ratio_below: u64,
    pub ratio_above: u64,
    pub sum_ratio_above: Decimal,
    pub lurker: u64,
    pub placed: u64,
    pub deals: u64,
    pub not_deals: i64,
    pub money_buy: Decimal,
    pub money_sell: Decimal,
    pub qty_buy: Decimal,
    pub qty_sell: Decimal,
}

impl ShannonStats {
    pub fn average_ratio_above(&self) -> Decimal {
        if self.ratio_above == 0 {
            return Decimal::ZERO;
        }
        self.sum_ratio_above / Decimal::from(self.ratio_above)
    }
}

#[derive(Debug, Clone)]
pub struct ShannonStrategy {
    state: StrategyState,
    execution: Arc<ExecutionConfig>,
    threshold: Decimal,
    base_price: Decimal,
    min_price: Decimal,
    max_price: Decimal,
    use_optimal_leverage: bool,
    base_leverage: Decimal,
    leverage: Decimal,
    mid_price: Decimal,
    max_fees: Decimal,
    need_reposition: bool,
    virtual_balance: Decimal,
    virtual_holdings: Decimal,
    stats: ShannonStats,
}

impl ShannonStrategy {
    pub fn new(
        cfg: &InstrumentConfig,
        market: &str,
        execution: Arc<ExecutionConfig>,
        tune: &AutoTune,
    ) -> Self {
        let params = &cfg.shannon;
        let precision = cfg.price_precision;
        let mut threshold = params.threshold;
        let mut base_price = params.base_price;
        let mut min_price = params.min_price;
        let mut max_price = params.max_price;
        let mut mid_price = cfg.mid_price.unwrap_or(Decimal::ZERO);
        let start_price = cfg.start_price.filter(|p| *p > Decimal::ZERO).unwrap_or(mid_price);

        if cfg.self_adaption_mid_price && tune.average > Decimal::ZERO {
            let deviation = cfg.mid_price_max_deviation;
            let adapted = if mid_price <= Decimal::ZERO {
                tune.average
            } else {
                let ratio = tune.average / mid_price;
                if ratio < safe_div(Decimal::ONE, deviation) {
                    safe_div(mid_price, deviation)
                } else if ratio > deviation {
                    mid_price * deviation
                } else {
                    tune.average
                }
            };
            mid_price = round_to_precision(adapted * tune.jitter, precision);
        }

        if cfg.self_adaption_threshold && tune.volatility > Decimal::ZERO {
            threshold = threshold.max(round_to_precision(tune.volatility * GOLDEN_CUBED, 6));
        }

        if min_price <= Decimal::ZERO || max_price <= Decimal::ZERO {
            let lev = params.base_leverage;
            let half = dec!(0.5) * lev;
            let m = params.mid_position;
            base_price = if half - (Decimal::ONE - m) > Decimal::ZERO && half - m > Decimal::ZERO {
                round_to_precision(mid_price * (half - (Decimal::ONE - m)) / (half - m), precision)
            } else {
                mid_price
            };
            if lev > dec!(2.0001) {
                min_price = round_to_precision(base_price * (lev - dec!(2)) / lev, precision);
                max_price = round_to_precision(base_price * lev / (lev - dec!(2)), precision);
            } else {
                min_price = base_price * dec!(0.0001);
                max_price = base_price * dec!(10000);
            }
        }

        if base_price <= Decimal::ZERO {
            let geometric = (min_price * max_price).sqrt().unwrap_or(Decimal::ZERO);
            base_price = round_to_precision(geometric, precision);
        }

        let state = StrategyState::new(cfg, market, StrategyKind::Shannon, tune.invest_total, start_price);
        info!(
            instrument = %state.instrument,
            invest = %state.invest,
            %threshold,
            %base_price,
            %min_price,
            %max_price,
            %mid_price,
            base_leverage = %params.base_leverage,
            be_lurker = execution.be_lurker,
            be_maker = execution.be_maker,
            "Shannon strategy configured"
        );

        Self {
            state,
            execution,
            threshold,
            base_price,
            min_price,
            max_price,
            use_optimal_leverage: params.use_optimal_leverage,
            base_leverage: params.base_leverage,
            leverage: params.base_leverage,
            mid_price,
            max_fees: cfg.max_fees,
            need_reposition: cfg.need_reposition,
            virtual_balance: Decimal::ZERO,
            virtual_holdings: Decimal::ZERO,
            stats: ShannonStats::default(),
        }
    }

    pub fn stats(&self) -> &ShannonStats {
        &self.stats
    }

    pub fn threshold(&self) -> Decimal {
        self.threshold
    }

    pub fn leverage(&self) -> Decimal {
        self.leverage
    }

    pub fn base_price(&self) -> Decimal {
        self.base_price
    }

    pub fn bounds(&self) -> (Decimal, Decimal) {
        (self.min_price, self.max_price)
    }

    pub fn mid_price(&self) -> Decimal {
        self.mid_price
    }

    pub fn virtual_balance(&self) -> Decimal {
        self.virtual_balance
    }

    pub fn virtual_holdings(&self) -> Decimal {
        self.virtual_holdings
    }

    /// Share of the virtual notional held in stock at `price`.
    pub fn virtual_position(&self, price: Decimal) -> Decimal {
        let stock = self.virtual_holdings * price;
        safe_div(stock, self.virtual_balance + stock)
    }

    fn optimal_leverage(&self) -> Option<Decimal> {
        let (base, min, max) = (self.base_price, self.min_price, self.max_price);
        if base <= Decimal::ZERO
            || min < Decimal::ZERO
            || max <= Decimal::ZERO
            || min >= base
            || max <= base
        {
            return None;
        }
        let at_min = dec!(2) * base / (base - min);
        let at_max = dec!(2) * max / (max - base);
        Some(at_min.min(at_max))
    }

    /// Re-centre the virtual pair so the real cash share moves toward `target`.
    fn recentre(&mut self, now_value: Decimal, position: Decimal, target: Decimal, last: Decimal) {
        let cash_share = Decimal::ONE - position;
        let half = dec!(0.5) * self.leverage;
        self.virtual_balance = now_value * (half + cash_share - target);
        self.virtual_holdings = safe_div(now_value * (half - cash_share + target), last);
        self.state.reposition_count += 1;
    }

    fn log_stats(&self) {
        let s = &self.stats;
        info!(
            instrument = %self.state.instrument,
            money_buy = %s.money_buy,
            money_sell = %s.money_sell,
            qty_buy = %s.qty_buy,
            qty_sell = %s.qty_sell,
            ticks = s.ticks,
            ratio_below = s.ratio_below,
            ratio_above = s.ratio_above,
            average_ratio = %s.average_ratio_above(),
            lurker = s.lurker,
            placed = s.placed,
            deals = s.deals,
            not_deals = s.not_deals,
            repositions = self.state.reposition_count,
            "Shannon statistics"
        );
    }
}

impl StrategyEngine for ShannonStrategy {
    fn state(&self) -> &StrategyState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut StrategyState {
        &mut self.state
    }

    fn open(&mut self, last_price: Decimal, balance: Decimal, holdings: Decimal) -> Decimal {
        if self.state.is_open() {
            error!(instrument = %self.state.instrument, "Shannon already open");
            return balance;
        }
        if last_price == Decimal::ZERO {
            self.state.enter_half_open(balance, holdings);
            warn!(instrument = %self.state.instrument, %balance, %holdings, "Shannon half-open, no price yet");
            return balance;
        }

        self.state.start(last_price, balance, holdings);

        if self.threshold <= Decimal::ZERO || self.threshold >= Decimal::ONE {
            error!(
                instrument = %self.state.instrument,
                threshold = %self.threshold,
                "Threshold outside (0, 1), reset to 0.01"
            );
            self.threshold = FALLBACK_THRESHOLD;
        }

        if self.use_optimal_leverage {
            match self.optimal_leverage() {
                Some(lev) => self.base_leverage = lev,
                None => error!(
                    instrument = %self.state.instrument,
                    base_price = %self.base_price,
                    min_price = %self.min_price,
                    max_price = %self.max_price,
                    "Optimal leverage requested but prices are not set properly"
                ),
            }
        }

        if self.base_leverage <= Decimal::ZERO {
            error!(
                instrument = %self.state.instrument,
                base_leverage = %self.base_leverage,
                "Base leverage must be positive, reset to 1"
            );
            self.base_leverage = Decimal::ONE;
        }
        self.leverage = self.base_leverage;

        let half = dec!(0.5) * self.leverage;
        let p_base = if self.base_price > Decimal::ZERO {
            self.base_price
        } else {
            last_price
        };
        let value = balance + holdings * last_price;
        let want = (p_base - half * p_base + half * last_price) * value / (p_base + last_price);
        self.virtual_balance = half * value + balance - want;
        self.virtual_holdings = (half * value - balance + want) / last_price;

        self.state.status = StrategyStatus::Open;
        info!(
            instrument = %self.state.instrument,
            open_value = %value,
            %last_price,
            %balance,
            %holdings,
            threshold = %self.threshold,
            leverage = %self.leverage,
            base_price = %p_base,
            virtual_balance = %self.virtual_balance,
            virtual_holdings = %self.virtual_holdings,
            want_balance = %want,
            "Shannon opened"
        );
        want
    }

    fn close(&mut self) {
        self.state.close();
        info!(instrument = %self.state.instrument, "Shannon closed");
    }

    fn begin_transact(&mut self, tick: &MarketTick) -> TradeIntent {
        self.stats.ticks += 1;
        let last = tick.last_price;
        let balance = tick.balance;
        let holdings = tick.holdings;

        if self.state.drifted(balance, holdings) {
            warn!(
                instrument = %self.state.instrument,
                %last,
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
                "Shannon cannot transact"
            );
            return TradeIntent::none();
        }

        self.state.observe(last, balance, holdings);

        let touch = |p: Option<Decimal>| p.filter(|p| *p >= dec!(0.01)).unwrap_or(last);
        let bid = touch(tick.bid);
        let ask = touch(tick.ask);
        let (mut price_buy, mut price_sell) = if self.execution.be_maker || tick.force_lurker {
            (bid + tick.spread, ask - tick.spread)
        } else {
            (ask, bid)
        };

        let (vb, vh) = (self.virtual_balance, self.virtual_holdings);
        let mut diff_buy = Decimal::ZERO;
        let mut diff_sell = Decimal::ZERO;
        let mut ratio = Decimal::ZERO;
        if vb - vh * price_buy > Decimal::ZERO {
            diff_buy = dec!(0.5) * (vb - vh * price_buy);
            ratio = safe_div(diff_buy, dec!(0.5) * (vb + vh * price_buy));
        } else if vb - vh * price_sell < Decimal::ZERO {
            diff_sell = dec!(0.5) * (vb - vh * price_sell);
            ratio = safe_div(diff_sell, dec!(0.5) * (vb + vh * price_sell));
        }

        let t = self.threshold;
        let mut lurking = false;
        if ratio.abs() < t || tick.blind {
            self.stats.ratio_below += 1;
            if (self.execution.be_lurker || tick.force_lurker) && vh > Decimal::ZERO && t < Decimal::ONE {
                price_buy = vb * (Decimal::ONE - t) / (vh * (Decimal::ONE + t));
                diff_buy = vb * t / (Decimal::ONE + t);
                price_sell = vb * (Decimal::ONE + t) / (vh * (Decimal::ONE - t));
                diff_sell = -vb * t / (Decimal::ONE - t);
                lurking = true;
                self.stats.lurker += 1;
            } else {
                info!(
                    instrument = %self.state.instrument,
                    %ratio,
                    threshold = %t,
                    %last,
                    price_buy = %price_buy,
                    price_sell = %price_sell,
                    equilibrium = %safe_div(vb, vh),
                    "Ratio below threshold"
                );
                return TradeIntent::none();
            }
        } else {
            self.stats.ratio_above += 1;
            self.stats.sum_ratio_above += ratio.abs();
        }

        let now_value = balance + holdings * last;
        let balance_step = now_value * dec!(0.5) * self.leverage * t;
        let mut intent = TradeIntent::none();

        if ratio > Decimal::ZERO || lurking {
            let volume = min3(
                safe_div(diff_buy, price_buy),
                safe_div(balance, self.max_fees * price_buy),
                safe_div(dec!(2) * balance_step, price_buy),
            );
            let offset = (price_buy - last) / last;
            let in_range = dec!(-4) * t < offset && offset < CHASE_LIMIT;
            if volume > Decimal::ZERO && price_buy > Decimal::ZERO && in_range {
                intent.buy = Some(OrderIntent { price: price_buy, volume });
            }
            self.stats.placed += 1;
        }

        if ratio < Decimal::ZERO || lurking {
            let volume = min3(
                safe_div(-diff_sell, price_sell),
                holdings,
                safe_div(dec!(2) * balance_step, price_sell),
            );
            let offset = (price_sell - last) / last;
            let in_range = -CHASE_LIMIT < offset && offset < dec!(4) * t;
            if volume > Decimal::ZERO && price_sell > Decimal::ZERO && in_range {
                intent.sell = Some(OrderIntent { price: price_sell, volume });
            }
            self.stats.placed += 1;
        }

        info!(
            instrument = %self.state.instrument,
            profit = %safe_div(now_value, self.state.invest),
            benchmark = %safe_div(last, self.state.start_price),
            position = %safe_div(holdings * last, now_value),
            virtual_position = %self.virtual_position(last),
            %last,
            buy = ?intent.buy,
            sell = ?intent.sell,
            lurking,
            blind = tick.blind,
            "Shannon intent"
        );

        if self.need_reposition && intent.is_empty() {
            // idle tick still runs the re-position check
            let idle = FillDelta::reconcile(last, Decimal::ZERO, Decimal::ZERO, tick.min_qty);
            if self.end_transact(&idle).is_ok() {
                self.stats.not_deals -= 1;
            }
        }
        intent
    }

    fn end_transact(&mut self, fill: &FillDelta) -> Result<(), StrategyError> {
        if !self.state.is_open() {
            error!(instrument = %self.state.instrument, "Shannon end_transact while not open");
            return Err(StrategyError::NotOpen(self.state.instrument.clone()));
        }

        let bd = fill.balance_delta;
        let hd = fill.holdings_delta;
        if bd > Decimal::ZERO {
            self.stats.money_sell += bd;
        } else {
            self.stats.money_buy -= bd;
        }
        if hd > Decimal::ZERO {
            self.stats.qty_buy += hd;
        } else {
            self.stats.qty_sell -= hd;
        }
        if bd != Decimal::ZERO {
            self.stats.deals += 1;
        } else {
            self.stats.not_deals += 1;
        }

        self.virtual_balance += bd;
        self.virtual_holdings += hd;
        self.state.apply(fill);

        let last = fill.last_price;
        let now_value = self.state.value_at(last);
        let position = safe_div(self.state.holdings * last, now_value);
        if self.need_reposition && last > Decimal::ZERO {
            let band = dec!(0.5) * self.threshold * self.leverage;
            if self.state.holdings < fill.min_qty {
                self.recentre(now_value, position, (Decimal::ONE - band).max(dec!(0.5)), last);
                info!(
                    instrument = %self.state.instrument,
                    repositions = self.state.reposition_count,
                    "Shannon re-positioned up"
                );
            } else if self.state.balance < fill.min_qty * last * self.max_fees {
                self.recentre(now_value, position, band.min(dec!(0.5)), last);
                info!(
                    instrument = %self.state.instrument,
                    repositions = self.state.reposition_count,
                    "Shannon re-positioned down"
                );
            }
        }

        info!(
            instrument = %self.state.instrument,
            profit = %safe_div(now_value, self.state.invest),
            benchmark = %safe_div(last, self.state.start_price),
            leverage = %self.leverage,
            %position,
            virtual_position = %self.virtual_position(last),
            balance = %self.state.balance,
            holdings = %self.state.holdings,
            virtual_balance = %self.virtual_balance,
            virtual_holdings = %self.virtual_holdings,
            balance_delta = %bd,
            holdings_delta = %hd,
            "Shannon fill applied"
        );
        self.log_stats();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: Decimal = dec!(0.0000001);

    fn shannon_config() -> InstrumentConfig {
        let mut cfg = InstrumentConfig::new("US.TEST", Some(Decimal::ONE));
        cfg.mid_price = Some(dec!(100));
        cfg.shannon.base_leverage = dec!(2);
        cfg.shannon.threshold = dec!(0.05);
        cfg
    }

    fn build(cfg: &InstrumentConfig, execution: ExecutionConfig) -> ShannonStrategy {
        ShannonStrategy::new(cfg, "US", Arc::new(execution), &AutoTune::fixed(dec!(1000)))
    }

    fn tick(last: Decimal, balance: Decimal, holdings: Decimal) -> MarketTick {
        MarketTick {
            last_price: last,
            balance,
            holdings,
            bid: None,
            ask: None,
            spread: Decimal::ZERO,
            min_qty: Decimal::ONE,
            force_lurker: false,
            blind: false,
        }
    }

    /// Open at 100 with 1000 cash and take the half-way buy.
    fn balanced(execution: ExecutionConfig) -> ShannonStrategy {
        let mut s = build(&shannon_config(), execution);
        s.open(dec!(100), dec!(1000), Decimal::ZERO);
        let buy = FillDelta {
            last_price: dec!(100),
            balance_delta: dec!(-500),
            holdings_delta: dec!(5),
            cursor_step: -1,
            deal_price: dec!(100),
            min_qty: Decimal::ONE,
        };
        s.end_transact(&buy).unwrap();
        s
    }

    #[test]
    fn test_open_builds_virtual_pair() {
        let mut s = build(&shannon_config(), ExecutionConfig::default());
        let want = s.open(dec!(100), dec!(1000), Decimal::ZERO);

        assert_eq!(s.base_price(), dec!(100));
        assert_eq!(want, dec!(500));
        assert_eq!(s.virtual_balance(), dec!(1500));
        assert_eq!(s.virtual_holdings(), dec!(5));
        assert!(s.is_open());
    }

    #[test]
    fn test_virtual_position_is_half_once_target_reached() {
        let s = balanced(ExecutionConfig::default());
        assert_eq!(s.virtual_balance(), dec!(1000));
        assert_eq!(s.virtual_holdings(), dec!(10));
        assert_eq!(s.virtual_position(dec!(100)), dec!(0.5));
        assert_eq!(s.stats().deals, 1);
        assert_eq!(s.stats().money_buy, dec!(500));
        assert_eq!(s.stats().qty_buy, dec!(5));
    }

    #[test]
    fn test_open_half_open_without_price() {
        let mut s = build(&shannon_config(), ExecutionConfig::default());
        assert_eq!(s.open(Decimal::ZERO, dec!(800), dec!(1)), dec!(800));
        assert!(s.is_half_open());
        assert_eq!(s.virtual_balance(), Decimal::ZERO);
    }

    #[test]
    fn test_open_resets_invalid_threshold_and_leverage() {
        let mut cfg = shannon_config();
        cfg.shannon.threshold = Decimal::ZERO;
        cfg.shannon.base_leverage = dec!(-3);
        let mut s = build(&cfg, ExecutionConfig::default());
        s.open(dec!(100), dec!(1000), Decimal::ZERO);

        assert_eq!(s.threshold(), dec!(0.01));
        assert_eq!(s.leverage(), Decimal::ONE);
    }

    #[test]
    fn test_optimal_leverage_from_bounds() {
        let mut cfg = shannon_config();
        cfg.shannon.use_optimal_leverage = true;
        cfg.shannon.base_price = dec!(100);
        cfg.shannon.min_price = dec!(80);
        cfg.shannon.max_price = dec!(200);
        let mut s = build(&cfg, ExecutionConfig::default());
        s.open(dec!(100), dec!(1000), Decimal::ZERO);

        // min(2*100/20, 2*200/100)
        assert_eq!(s.leverage(), dec!(4));
    }

    #[test]
    fn test_optimal_leverage_keeps_configured_on_bad_bounds() {
        let mut cfg = shannon_config();
        cfg.shannon.use_optimal_leverage = true;
        cfg.shannon.base_price = dec!(100);
        cfg.shannon.min_price = dec!(120);
        cfg.shannon.max_price = dec!(200);
        let mut s = build(&cfg, ExecutionConfig::default());
        s.open(dec!(100), dec!(1000), Decimal::ZERO);

        assert_eq!(s.leverage(), dec!(2));
    }

    #[test]
    fn test_taker_buy_after_open() {
        let mut s = build(&shannon_config(), ExecutionConfig::default());
        s.open(dec!(100), dec!(1000), Decimal::ZERO);

        let mut t = tick(dec!(100), dec!(1000), Decimal::ZERO);
        t.bid = Some(dec!(99.99));
        t.ask = Some(dec!(100.01));
        t.spread = dec!(0.01);
        let intent = s.begin_transact(&t);

        let buy = intent.buy.unwrap();
        assert_eq!(buy.price, dec!(100.01));
        // capped at two balance steps: 2 * 1000 * 0.5 * 2 * 0.05
        assert!((buy.volume - dec!(100) / dec!(100.01)).abs() < EPS);
        assert!(intent.sell.is_none());
        assert_eq!(s.stats().ratio_above, 1);
        assert_eq!(s.stats().placed, 1);
    }

    #[test]
    fn test_below_threshold_without_lurker_is_idle() {
        let mut s = balanced(ExecutionConfig::default());
        let intent = s.begin_transact(&tick(dec!(100), dec!(500), dec!(5)));

        assert!(intent.is_empty());
        assert_eq!(s.stats().ratio_below, 1);
        assert_eq!(s.stats().lurker, 0);
    }

    #[test]
    fn test_lurker_quotes_both_sides() {
        let execution = ExecutionConfig {
            be_lurker: true,
            ..ExecutionConfig::default()
        };
        let mut s = balanced(execution);
        let intent = s.begin_transact(&tick(dec!(100), dec!(500), dec!(5)));

        let buy = intent.buy.unwrap();
        let sell = intent.sell.unwrap();
        assert_eq!(buy.price, dec!(1000) * dec!(0.95) / (dec!(10) * dec!(1.05)));
        assert_eq!(sell.price, dec!(1000) * dec!(1.05) / (dec!(10) * dec!(0.95)));
        assert!(buy.price < dec!(100) && sell.price > dec!(100));
        assert!((sell.volume - dec!(0.5)).abs() < EPS);
        assert_eq!(s.stats().lurker, 1);
        assert_eq!(s.stats().placed, 2);
    }

    #[test]
    fn test_forced_lurker_when_blind() {
        let mut s = balanced(ExecutionConfig::default());
        let mut t = tick(dec!(100), dec!(500), dec!(5));
        t.force_lurker = true;
        t.blind = true;
        let intent = s.begin_transact(&t);

        assert!(intent.buy.is_some() && intent.sell.is_some());
        assert_eq!(s.stats().lurker, 1);
    }

    #[test]
    fn test_drift_reconciles_without_intent() {
        let mut s = build(&shannon_config(), ExecutionConfig::default());
        s.open(dec!(100), dec!(1000), Decimal::ZERO);

        let intent = s.begin_transact(&tick(dec!(100), dec!(1050), Decimal::ZERO));

        assert!(intent.is_empty());
        assert_eq!(s.balance(), dec!(1050));
        assert_eq!(s.virtual_balance(), dec!(1550));
        assert_eq!(s.stats().deals, 1);
    }

    #[test]
    fn test_reposition_up_when_holdings_exhausted() {
        let mut cfg = shannon_config();
        cfg.need_reposition = true;
        let mut s = build(&cfg, ExecutionConfig::default());
        s.open(dec!(100), dec!(1000), Decimal::ZERO);

        s.end_transact(&FillDelta::reconcile(dec!(100), Decimal::ZERO, Decimal::ZERO, Decimal::ONE))
            .unwrap();

        // cash share 1, target max(0.5, 1 - 0.05)
        assert_eq!(s.virtual_balance(), dec!(1050));
        assert_eq!(s.virtual_holdings(), dec!(9.5));
        assert_eq!(s.state().reposition_count, 1);
        assert_eq!(s.stats().not_deals, 1);
    }

    #[test]
    fn test_reposition_down_when_cash_exhausted() {
        let mut cfg = shannon_config();
        cfg.need_reposition = true;
        let mut s = build(&cfg, ExecutionConfig::default());
        s.open(dec!(100), Decimal::ZERO, dec!(10));

        s.end_transact(&FillDelta::reconcile(dec!(100), Decimal::ZERO, Decimal::ZERO, Decimal::ONE))
            .unwrap();

        // cash share 0, target min(0.5, 0.05)
        assert_eq!(s.virtual_balance(), dec!(1000) * (Decimal::ONE - dec!(0.05)));
        assert_eq!(s.virtual_holdings(), dec!(1000) * (Decimal::ONE + dec!(0.05)) / dec!(100));
        assert_eq!(s.state().reposition_count, 1);
    }

    #[test]
    fn test_end_transact_requires_open() {
        let mut s = build(&shannon_config(), ExecutionConfig::default());
        let err = s
            .end_transact(&FillDelta::reconcile(dec!(100), dec!(1), Decimal::ZERO, Decimal::ONE))
            .unwrap_err();
        assert_eq!(err, StrategyError::NotOpen("US.TEST".into()));
    }

    #[test]
    fn test_default_band_from_leverage() {
        let mut cfg = InstrumentConfig::new("US.TEST", Some(Decimal::ONE));
        cfg.mid_price = Some(dec!(100));
        let s = build(&cfg, ExecutionConfig::default());

        // leverage 20, mid position 0.5: base = mid, band 18/20 .. 20/18
        assert_eq!(s.base_price(), dec!(100));
        assert_eq!(s.bounds(), (dec!(90), dec!(111.11)));
    }

    #[test]
    fn test_auto_tune_threshold_and_zero_mid() {
        let cfg = InstrumentConfig::new("US.TEST", Some(Decimal::ONE));
        let tune = AutoTune {
            invest_total: dec!(1000),
            average: dec!(50),
            volatility: dec!(0.05),
            jitter: Decimal::ONE,
        };
        let s = ShannonStrategy::new(&cfg, "US", Arc::new(ExecutionConfig::default()), &tune);

        assert_eq!(s.mid_price(), dec!(50));
        assert_eq!(s.threshold(), dec!(0.011801));
    }
}
