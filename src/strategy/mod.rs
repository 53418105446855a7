//! Per-instrument strategy engines.
//!
//! Each engine owns its instrument's balance/holdings bookkeeping and turns
//! a [`MarketTick`] into at most one buy and one sell [`OrderIntent`]. Fills
//! come back through [`StrategyEngine::end_transact`], always from the
//! scheduler task.
//!
//! - `grid`: price ladder with six weighting policies
//! - `shannon`: leveraged constant-ratio rebalancing on a virtual ledger

mod grid;
mod shannon;
mod weights;

pub use grid::GridStrategy;
pub use shannon::{ShannonStats, ShannonStrategy};
pub use weights::{GridType, GridWeights};

use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::fmt;
use std::sync::Arc;

use crate::config::{ExecutionConfig, InstrumentConfig, StrategyKind};
use crate::error::StrategyError;
use crate::utils::decimal::from_f64;

/// Observed balance further than this from the tracked one counts as drift.
pub const BALANCE_DRIFT_TOLERANCE: Decimal = Decimal::ONE;
/// Observed holdings further than this from the tracked ones count as drift.
pub const HOLDINGS_DRIFT_TOLERANCE: Decimal = dec!(0.5);

/// Tri-state lifecycle flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyStatus {
    Closed,
    /// Opened without a tradable price; waits for continuous trading.
    HalfOpen,
    Open,
}

/// One cycle's inputs for [`StrategyEngine::begin_transact`].
#[derive(Debug, Clone)]
pub struct MarketTick {
    pub last_price: Decimal,
    /// Reconciled balance assigned to the strategy
    pub balance: Decimal,
    /// Holdings observed at the broker
    pub holdings: Decimal,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub spread: Decimal,
    /// Minimum tradable quantity (lot size)
    pub min_qty: Decimal,
    /// Continuous bidding unavailable: quote passively
    pub force_lurker: bool,
    /// Quotes are not reliable right now
    pub blind: bool,
}

/// A confirmed change to a strategy's balance and holdings.
#[derive(Debug, Clone, PartialEq)]
pub struct FillDelta {
    pub last_price: Decimal,
    pub balance_delta: Decimal,
    pub holdings_delta: Decimal,
    /// -1 after a buy, +1 after a sell, 0 for reconciliation
    pub cursor_step: i64,
    pub deal_price: Decimal,
    pub min_qty: Decimal,
}

impl FillDelta {
    /// Zero-step delta recording an external change.
    pub fn reconcile(
        last_price: Decimal,
        balance_delta: Decimal,
        holdings_delta: Decimal,
        min_qty: Decimal,
    ) -> Self {
        Self {
            last_price,
            balance_delta,
            holdings_delta,
            cursor_step: 0,
            deal_price: last_price,
            min_qty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderIntent {
    pub price: Decimal,
    pub volume: Decimal,
}

/// Output of one decision: an optional order on each side.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TradeIntent {
    pub buy: Option<OrderIntent>,
    pub sell: Option<OrderIntent>,
}

impl TradeIntent {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.buy.is_none() && self.sell.is_none()
    }
}

/// Parameters derived from recent quote statistics at construction time.
#[derive(Debug, Clone)]
pub struct AutoTune {
    pub invest_total: Decimal,
    /// Recent average price, zero when unknown
    pub average: Decimal,
    /// Recent relative volatility, zero when unknown
    pub volatility: Decimal,
    /// Multiplier applied to an adapted mid price
    pub jitter: Decimal,
}

impl AutoTune {
    /// Tuning inputs with a random mid-price jitter in [0.999, 1.001].
    pub fn sample(invest_total: Decimal, average: Decimal, volatility: Decimal) -> Self {
        let jitter = dec!(0.999) + dec!(0.002) * from_f64(rand::thread_rng().gen::<f64>());
        Self {
            invest_total,
            average,
            volatility,
            jitter,
        }
    }

    /// Tuning inputs without statistics or jitter.
    pub fn fixed(invest_total: Decimal) -> Self {
        Self {
            invest_total,
            average: Decimal::ZERO,
            volatility: Decimal::ZERO,
            jitter: Decimal::ONE,
        }
    }
}

/// Identity, capital and runtime bookkeeping common to both engines.
#[derive(Debug, Clone)]
pub struct StrategyState {
    pub instrument: String,
    pub market: String,
    pub strategy: StrategyKind,
    pub invest: Decimal,
    pub invest_ratio: Option<Decimal>,
    pub start_price: Decimal,
    pub status: StrategyStatus,
    pub balance: Decimal,
    pub holdings: Decimal,
    pub last_price: Decimal,
    pub init_price: Decimal,
    pub init_balance: Decimal,
    pub init_holdings: Decimal,
    pub reposition_count: u64,
}

impl StrategyState {
    pub fn new(
        cfg: &InstrumentConfig,
        market: &str,
        strategy: StrategyKind,
        invest_total: Decimal,
        start_price: Decimal,
    ) -> Self {
        Self {
            instrument: cfg.code.clone(),
            market: market.to_string(),
            strategy,
            invest: cfg.resolve_invest(invest_total),
            invest_ratio: cfg.invest_ratio,
            start_price,
            status: StrategyStatus::Closed,
            balance: Decimal::ZERO,
            holdings: Decimal::ZERO,
            last_price: Decimal::ZERO,
            init_price: Decimal::ZERO,
            init_balance: Decimal::ZERO,
            init_holdings: Decimal::ZERO,
            reposition_count: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == StrategyStatus::Open
    }

    /// Remember the amounts and wait for a tradable price.
    fn enter_half_open(&mut self, balance: Decimal, holdings: Decimal) {
        self.status = StrategyStatus::HalfOpen;
        self.balance = balance;
        self.holdings = holdings;
        self.last_price = Decimal::ZERO;
    }

    fn start(&mut self, last_price: Decimal, balance: Decimal, holdings: Decimal) {
        self.init_price = last_price;
        self.init_balance = balance;
        self.init_holdings = holdings;
        self.observe(last_price, balance, holdings);
    }

    fn observe(&mut self, last_price: Decimal, balance: Decimal, holdings: Decimal) {
        self.balance = balance;
        self.holdings = holdings;
        self.last_price = last_price;
    }

    fn apply(&mut self, fill: &FillDelta) {
        self.balance += fill.balance_delta;
        self.holdings += fill.holdings_delta;
        self.last_price = fill.last_price;
    }

    /// External change too large to be rounding noise.
    fn drifted(&self, balance: Decimal, holdings: Decimal) -> bool {
        (balance - self.balance).abs() > BALANCE_DRIFT_TOLERANCE
            || (holdings - self.holdings).abs() > HOLDINGS_DRIFT_TOLERANCE
    }

    fn close(&mut self) {
        self.status = StrategyStatus::Closed;
    }

    pub fn value_at(&self, price: Decimal) -> Decimal {
        self.balance + self.holdings * price
    }
}

/// Stateful decision function for one instrument.
pub trait StrategyEngine: Send + Sync + fmt::Debug {
    fn state(&self) -> &StrategyState;

    /// Restores saved bookkeeping (start price) before `open`.
    fn state_mut(&mut self) -> &mut StrategyState;

    /// Enter the open (or half-open) state and return the target balance.
    fn open(&mut self, last_price: Decimal, balance: Decimal, holdings: Decimal) -> Decimal;

    fn close(&mut self);

    /// Decide this cycle's orders. External drift is absorbed here and
    /// produces no intent.
    fn begin_transact(&mut self, tick: &MarketTick) -> TradeIntent;

    /// Apply a settled fill.
    fn end_transact(&mut self, fill: &FillDelta) -> Result<(), StrategyError>;

    fn instrument(&self) -> &str {
        &self.state().instrument
    }

    fn status(&self) -> StrategyStatus {
        self.state().status
    }

    fn is_open(&self) -> bool {
        self.state().status == StrategyStatus::Open
    }

    fn is_half_open(&self) -> bool {
        self.state().status == StrategyStatus::HalfOpen
    }

    fn balance(&self) -> Decimal {
        self.state().balance
    }

    fn holdings(&self) -> Decimal {
        self.state().holdings
    }

    fn last_price(&self) -> Decimal {
        self.state().last_price
    }

    fn invest(&self) -> Decimal {
        self.state().invest
    }

    fn invest_ratio(&self) -> Option<Decimal> {
        self.state().invest_ratio
    }

    fn start_price(&self) -> Decimal {
        self.state().start_price
    }
}

/// Construct the engine for one instrument.
pub fn build_strategy(
    kind: StrategyKind,
    cfg: &InstrumentConfig,
    market: &str,
    execution: Arc<ExecutionConfig>,
    tune: &AutoTune,
) -> Box<dyn StrategyEngine> {
    match kind {
        StrategyKind::Grid => Box::new(GridStrategy::new(cfg, market, tune)),
        StrategyKind::Shannon => Box::new(ShannonStrategy::new(cfg, market, execution, tune)),
    }
}

/// `min` over three decimals.
pub(crate) fn min3(a: Decimal, b: Decimal, c: Decimal) -> Decimal {
    a.min(b).min(c)
}
