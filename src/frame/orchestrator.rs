//! The scheduling loop.
//!
//! One task owns the orchestrator and is the only writer of strategy state.
//! Broker callbacks touch the order ledger only; their fills reach the
//! strategies here, through [`Orchestrator::deal_handle`].

use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::assets::AssetSummary;
use super::supervisor::Shutdown;
use super::tolerate;
use crate::config::{Config, ExecutionConfig, StrategyKind};
use crate::engine::TradeEngine;
use crate::error::{TradeError, TradeResult};
use crate::exchange::{tick_size, OrderSide};
use crate::orders::{AccountState, Order};
use crate::persistence::{QuoteStats, RunSnapshot, SnapshotStore};
use crate::risk::RateLimiter;
use crate::strategy::{
    build_strategy, AutoTune, FillDelta, MarketTick, StrategyEngine, HOLDINGS_DRIFT_TOLERANCE,
};
use crate::utils::decimal::safe_div;

/// Dealt quantities at or below this are treated as nothing dealt.
const DEALT_EPSILON: Decimal = dec!(0.00000001);
/// Cached average/volatility older than this is refreshed at init.
const QUOTE_STATS_MAX_AGE_HOURS: i64 = 12;
/// Drift is only attributed to external trades while the price is this close.
const REASSIGN_PRICE_BAND: Decimal = dec!(0.2);
const MIN_FORCED_WAIT_SECS: f64 = 60.0;

/// Why a cycle, or the whole run, stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CycleOutcome {
    Continue,
    /// No pool instrument accepts orders any more.
    SessionClosed,
    /// Trading day boundary; the next run starts from `init`.
    DayRollover,
    /// Shutdown was requested mid-run.
    Interrupted,
}

/// Counters since startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameStats {
    pub cycles: u64,
    pub settled: u64,
    pub dealt: u64,
    pub not_dealt: u64,
    pub cancelled: u64,
    pub limiter_blocks: u64,
}

pub struct Orchestrator {
    pub(super) config: Config,
    execution: Arc<ExecutionConfig>,
    pub(super) engine: TradeEngine,
    pub(super) store: SnapshotStore,
    pub(super) limiter: RateLimiter,
    pub(super) strategies: HashMap<String, Box<dyn StrategyEngine>>,
    initialized: bool,
    run_counter: u64,
    pub(super) stats: FrameStats,
    pub(super) last_report_at: Option<DateTime<Utc>>,
    shutdown: Shutdown,
}

impl Orchestrator {
    pub fn new(config: Config, engine: TradeEngine, store: SnapshotStore, shutdown: Shutdown) -> Self {
        Self {
            execution: Arc::new(config.execution.clone()),
            config,
            engine,
            store,
            limiter: RateLimiter::new(),
            strategies: HashMap::new(),
            initialized: false,
            run_counter: 0,
            stats: FrameStats::default(),
            last_report_at: None,
            shutdown,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &TradeEngine {
        &self.engine
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn strategy(&self, code: &str) -> Option<&dyn StrategyEngine> {
        self.strategies.get(code).map(|s| s.as_ref())
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            limiter_blocks: self.limiter.blocked_count(),
            ..self.stats.clone()
        }
    }

    /// Last persisted snapshot of this run key.
    pub fn load_saved(&self) -> TradeResult<Option<RunSnapshot>> {
        self.store
            .load_snapshot(&self.config.run_key())
            .map_err(TradeError::Persistence)
    }

    /// Build and open one strategy per pool instrument.
    ///
    /// Balances and holdings resume from the last snapshot; capital added
    /// or removed in the configuration since then lands in the balance.
    /// Returns `false` when already initialized.
    pub async fn init(&mut self) -> TradeResult<bool> {
        if self.initialized {
            info!("Orchestrator already initialized");
            return Ok(false);
        }

        let account = self.engine.refresh_account().await?;
        let quotes = self.engine.refresh_quotes().await?;
        let saved = self.load_saved()?;
        let assets = AssetSummary::from_saved(self.engine.pool(), saved.as_ref(), &quotes, &account, self.engine.config().invest_total);
        let pool = self.engine.pool().to_vec();
        let stats = self.load_quote_stats(&pool).await?;

        let kind = self.config.frame.strategy;
        let invest_total = self.engine.config().invest_total;
        let mut changed = false;

        for code in &pool {
            let Some(cfg) = self.config.instrument(code) else {
                continue;
            };
            let quote_last = quotes.get(code).map(|q| q.last).unwrap_or(Decimal::ZERO);
            let (average, volatility) = stats
                .get(code)
                .map(|s| (s.average, s.volatility))
                .unwrap_or((Decimal::ZERO, Decimal::ZERO));
            let tune = AutoTune::sample(invest_total, average, volatility);
            let mut strategy = build_strategy(kind, cfg, &self.config.frame.market, Arc::clone(&self.execution), &tune);

            if cfg.start_price.is_none() {
                let saved_start = saved
                    .as_ref()
                    .and_then(|s| s.instruments.get(code))
                    .map(|r| r.start_price)
                    .filter(|p| *p > Decimal::ZERO);
                if let Some(start_price) = saved_start {
                    strategy.state_mut().start_price = start_price;
                }
            }

            let entry = assets.instruments.get(code);
            let saved_invest = entry.map(|e| e.invest).unwrap_or(Decimal::ZERO);
            let holdings = entry.map(|e| e.holdings).unwrap_or(Decimal::ZERO);
            let last = entry.map(|e| e.last_price).unwrap_or(quote_last);
            let mut balance = entry.map(|e| e.balance).unwrap_or(Decimal::ZERO);

            let invest_change = strategy.invest() - saved_invest;
            if invest_change.abs() > Decimal::ONE {
                warn!(
                    %code,
                    previous = %saved_invest,
                    current = %strategy.invest(),
                    "Invested capital changed"
                );
                balance += invest_change;
                changed = true;
            }

            let target = strategy.open(last, balance, holdings);
            info!(
                %code,
                %last,
                %balance,
                %holdings,
                %target,
                half_open = strategy.is_half_open(),
                "Strategy opened"
            );
            self.strategies.insert(code.clone(), strategy);
        }

        self.initialized = true;
        info!(strategies = self.strategies.len(), strategy = kind.as_str(), "Orchestrator initialized");
        if changed {
            self.save_assets().await?;
        }
        Ok(true)
    }

    /// Loop cycles until the session ends, the day rolls over or shutdown.
    pub async fn run(&mut self) -> TradeResult<CycleOutcome> {
        if !self.initialized {
            return Err(TradeError::NotInitialized);
        }
        self.run_counter = 0;

        loop {
            if self.shutdown.is_triggered() {
                return Ok(CycleOutcome::Interrupted);
            }
            match self.run_cycle().await {
                Ok(CycleOutcome::Continue) => {}
                Ok(outcome) => {
                    info!(?outcome, cycles = self.run_counter, "Run loop finished");
                    return Ok(outcome);
                }
                Err(e) if !e.is_fatal() => {
                    warn!(error = %e, "Cycle failed, retrying after the loop interval");
                    let interval = Duration::from_secs(self.config.frame.loop_interval_secs);
                    self.shutdown.sleep(interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One pass over the pool: snapshot, decide, place, housekeep, wait.
    pub async fn run_cycle(&mut self) -> TradeResult<CycleOutcome> {
        if !self.initialized {
            return Err(TradeError::NotInitialized);
        }
        let gateway = Arc::clone(self.engine.gateway());
        if !gateway.market_open() {
            info!("Outside trading hours, run ends");
            return Ok(CycleOutcome::SessionClosed);
        }
        if gateway.is_day_rollover() {
            info!("Trading day rolled over, run ends");
            return Ok(CycleOutcome::DayRollover);
        }

        let account = self.engine.refresh_account().await?;
        let quotes = self.engine.refresh_quotes().await?;
        let assets = AssetSummary::from_live(self.engine.pool(), &self.strategies, &quotes, &account, self.engine.config().invest_total);
        let pool = self.engine.pool().to_vec();
        let unsettled = self.engine.ledger().unsettled_by_instrument(&pool).await?;

        let mut forced = false;
        for code in &pool {
            let busy = unsettled.get(code).is_some_and(|orders| !orders.is_empty());
            forced |= self.trade_instrument(code, &account, &assets, busy).await?;
        }

        self.run_counter += 1;
        self.stats.cycles += 1;
        info!(
            cycle = self.run_counter,
            profit = %safe_div(assets.invest_total_now_value, self.engine.config().invest_total).round_dp(4),
            invest_total_now_value = %assets.invest_total_now_value.round_dp(2),
            buying_power = %account.buying_power,
            "Cycle placed"
        );

        let period = self.config.frame.other_handle_period.max(1);
        if self.run_counter % period == 2.min(period - 1) && self.housekeeping().await? {
            self.save_assets().await?;
        }

        if !forced {
            let factor = rand::thread_rng().gen_range(0.8..1.2);
            let secs = (self.config.frame.loop_interval_secs as f64 * factor).round();
            debug!(secs, "Sleeping before the fill wait");
            if !self.shutdown.sleep(Duration::from_secs_f64(secs)).await {
                return Ok(CycleOutcome::Interrupted);
            }
        }

        if self.wait_for_deal(forced).await? {
            self.save_assets().await?;
        }
        if !self.shutdown.sleep(Duration::from_secs(self.config.frame.cycle_pause_secs)).await {
            return Ok(CycleOutcome::Interrupted);
        }
        Ok(CycleOutcome::Continue)
    }

    /// Decide and place this cycle's orders for one instrument.
    ///
    /// Returns whether the instrument is outside continuous bidding, which
    /// forces the cycle into a long passive wait.
    async fn trade_instrument(
        &mut self,
        code: &str,
        account: &AccountState,
        assets: &AssetSummary,
        busy: bool,
    ) -> TradeResult<bool> {
        let gateway = Arc::clone(self.engine.gateway());
        let mut quote = self.engine.quote(code).await?;

        if quote.as_ref().is_some_and(|q| q.suspended) || !gateway.can_place_order(code) {
            debug!(%code, "Instrument not tradable now");
            return Ok(false);
        }
        let continuous = gateway.is_continuous_bidding(code);
        let blind = gateway.is_blind(code);
        if busy {
            info!(%code, "Orders still unsettled, skipping");
            return Ok(!continuous);
        }

        let known_last = quote.as_ref().map(|q| q.last).unwrap_or(Decimal::ZERO);
        if known_last == Decimal::ZERO && continuous {
            if let Some(resolved) = self.engine.resolve_quote(code).await? {
                quote = Some(resolved);
            }
        }
        let Some(quote) = quote.filter(|q| q.last > Decimal::ZERO) else {
            debug!(%code, "No price yet");
            return Ok(!continuous);
        };
        let last = quote.last;

        let Some(strategy) = self.strategies.get_mut(code) else {
            warn!(%code, "No strategy for pool instrument");
            return Ok(!continuous);
        };

        if strategy.is_half_open() && continuous {
            let reopen_at = assets
                .last_price(code)
                .filter(|p| *p > Decimal::ZERO)
                .unwrap_or(last);
            let (balance, holdings) = (strategy.balance(), strategy.holdings());
            strategy.close();
            let target = strategy.open(reopen_at, balance, holdings);
            info!(%code, %reopen_at, %balance, %holdings, %target, "Half-open strategy reopened");
        }
        if !strategy.is_open() {
            return Ok(!continuous);
        }

        let observed = account.holding_qty(code);
        let tracked_price = strategy.last_price();
        let tracked_value = strategy.state().value_at(tracked_price);
        let mut assign_balance = strategy.balance();
        if (observed - strategy.holdings()).abs() > HOLDINGS_DRIFT_TOLERANCE
            && (Decimal::ONE - safe_div(tracked_price, last)).abs() < REASSIGN_PRICE_BAND
        {
            assign_balance = tracked_value - observed * last;
            info!(
                %code,
                %observed,
                tracked = %strategy.holdings(),
                %assign_balance,
                "Holdings drifted, balance reassigned"
            );
        }

        let spread = if quote.spread > Decimal::ZERO {
            quote.spread
        } else {
            tick_size(code)
        };
        let lot = if quote.lot_size > Decimal::ZERO {
            quote.lot_size
        } else {
            Decimal::ONE
        };
        let tick = MarketTick {
            last_price: last,
            balance: assign_balance,
            holdings: observed,
            bid: Some(quote.bid.unwrap_or(last - spread)),
            ask: Some(quote.ask.unwrap_or(last + spread)),
            spread,
            min_qty: lot,
            force_lurker: !continuous,
            blind,
        };
        let intent = strategy.begin_transact(&tick);
        if intent.is_empty() {
            return Ok(!continuous);
        }

        let max_amount = tracked_value / dec!(2);
        let max_count = self.config.frame.max_orders_in_24h;

        if let Some(buy) = intent.buy {
            let (vol, price) = self
                .engine
                .round_order_param(code, OrderSide::Buy, buy.volume, buy.price, false)
                .await?;
            if vol > Decimal::ZERO
                && price > Decimal::ZERO
                && self.limiter.check(code, OrderSide::Buy, buy.price * buy.volume, max_amount, max_count)
            {
                tolerate(self.engine.buy(code, buy.volume, buy.price).await, "buy")?;
            }
        }
        if let Some(sell) = intent.sell {
            let (vol, price) = self
                .engine
                .round_order_param(code, OrderSide::Sell, sell.volume, sell.price, false)
                .await?;
            if vol > Decimal::ZERO
                && price > Decimal::ZERO
                && self.limiter.check(code, OrderSide::Sell, sell.price * sell.volume, max_amount, max_count)
            {
                tolerate(self.engine.sell(code, sell.volume, sell.price, true).await, "sell")?;
            }
        }
        Ok(!continuous)
    }

    /// Hand one order's fill to its strategy and mark it settled.
    ///
    /// Returns whether anything was dealt.
    pub async fn settle_order(&mut self, order: &Order) -> TradeResult<bool> {
        let Some(side) = order.side.filter(|_| !order.order_id.is_empty()) else {
            error!(order_id = %order.order_id, "Order without side or id cannot be settled");
            return Ok(false);
        };

        let lot = match order.instrument.as_deref() {
            Some(code) => self
                .engine
                .quote(code)
                .await?
                .map(|q| q.lot_size)
                .filter(|l| *l > Decimal::ZERO)
                .unwrap_or(Decimal::ONE),
            None => Decimal::ONE,
        };
        let avg = order.avg_price();
        let qty = order.dealt_qty;

        let dealt = qty > DEALT_EPSILON;
        if dealt {
            let fill = FillDelta {
                last_price: avg,
                balance_delta: match side {
                    OrderSide::Buy => -qty * avg,
                    OrderSide::Sell => qty * avg,
                },
                holdings_delta: match side {
                    OrderSide::Buy => qty,
                    OrderSide::Sell => -qty,
                },
                cursor_step: side.cursor_step(),
                deal_price: avg,
                min_qty: lot,
            };
            info!(
                order_id = %order.order_id,
                instrument = ?order.instrument,
                %side,
                dealt_qty = %qty,
                dealt_avg_price = %avg,
                "Order dealt"
            );
            if let Some(strategy) = order.instrument.as_deref().and_then(|c| self.strategies.get_mut(c)) {
                if let Err(e) = strategy.end_transact(&fill) {
                    warn!(order_id = %order.order_id, error = %e, "Fill not applied to strategy");
                }
            }
            self.stats.dealt += 1;
        } else {
            info!(order_id = %order.order_id, instrument = ?order.instrument, "Order closed with nothing dealt");
            self.stats.not_dealt += 1;
        }

        self.engine.ledger().mark_settled(&order.order_id).await?;
        self.stats.settled += 1;
        Ok(dealt)
    }

    /// Settle every closed order of the pool.
    ///
    /// When an instrument has a closed order, its other open orders are
    /// settled with their partial fills and cancelled.
    pub async fn deal_handle(&mut self) -> TradeResult<bool> {
        let pool = self.engine.pool().to_vec();
        let unsettled = self.engine.ledger().unsettled_by_instrument(&pool).await?;
        let mut dealt = false;

        for code in &pool {
            let Some(orders) = unsettled.get(code) else {
                continue;
            };
            let mut any_closed = false;
            for order in orders.iter().filter(|o| o.is_closed) {
                any_closed = true;
                dealt |= self.settle_order(order).await?;
            }
            if any_closed {
                for order in orders.iter().filter(|o| !o.is_closed) {
                    dealt |= self.settle_order(order).await?;
                    self.cancel_quietly(&order.order_id).await?;
                }
            }
        }
        Ok(dealt)
    }

    /// Cancel pool orders open for longer than `overtime_secs`.
    pub async fn cancel_overtime_orders_at(&mut self, now: DateTime<Utc>, overtime_secs: u64) -> TradeResult<bool> {
        let open = self.engine.ledger().open_orders(self.engine.pool()).await?;
        let mut cancelling = false;
        for order in open {
            let age = order.age_secs(now);
            if age > overtime_secs as i64 {
                info!(order_id = %order.order_id, age_secs = age, overtime_secs, "Cancelling overtime order");
                self.cancel_quietly(&order.order_id).await?;
                cancelling = true;
            }
        }
        Ok(cancelling)
    }

    pub(super) async fn cancel_quietly(&mut self, order_id: &str) -> TradeResult<()> {
        if tolerate(self.engine.cancel_order(order_id).await, "cancel_order")?.is_some() {
            self.stats.cancelled += 1;
        }
        Ok(())
    }

    /// Longest an order may rest before it is cancelled.
    pub fn max_wait_secs(&self, forced: bool) -> u64 {
        max_wait_secs(self.config.frame.strategy, &self.execution, self.config.frame.max_wait_secs_for_deal, forced)
    }

    /// Park until fills arrive or the session-dependent timeout passes,
    /// then settle. Returns whether anything was dealt.
    pub async fn wait_for_deal(&mut self, forced: bool) -> TradeResult<bool> {
        let unsettled = self.engine.ledger().unsettled_by_instrument(self.engine.pool()).await?;
        if unsettled.is_empty() {
            debug!("No unsettled orders, nothing to wait for");
            return Ok(false);
        }

        let max_wait = self.max_wait_secs(forced);
        self.cancel_overtime_orders_at(Utc::now(), max_wait).await?;
        tolerate(self.engine.sync_open_orders().await, "sync_open_orders")?;

        let gateway = Arc::clone(self.engine.gateway());
        let wait = fill_wait_secs(
            forced,
            self.execution.be_lurker,
            max_wait,
            self.config.frame.loop_interval_secs,
            gateway.secs_to_preopen_end(),
            gateway.secs_to_afterhours_end(),
            rand::thread_rng().gen::<f64>(),
        );
        info!(
            orders = unsettled.values().map(Vec::len).sum::<usize>(),
            forced,
            max_wait_secs = max_wait,
            wait_secs = wait.round(),
            "Waiting for fills"
        );

        let ledger = Arc::clone(self.engine.ledger());
        tokio::select! {
            woke = ledger.wait_for_fill(Duration::from_secs_f64(wait)) => {
                debug!(woke, "Fill wait finished");
            }
            _ = self.shutdown.triggered() => {
                info!("Fill wait interrupted by shutdown");
            }
        }
        self.deal_handle().await
    }

    /// Cached average/volatility, refreshed from the broker when stale.
    async fn load_quote_stats(&self, codes: &[String]) -> TradeResult<BTreeMap<String, QuoteStats>> {
        let now = Utc::now();
        let always = self.engine.config().always_refresh_stats;
        let mut result = BTreeMap::new();

        for code in codes {
            let cached = self.store.load_quote_stats(code).map_err(TradeError::Persistence)?;
            let stale = always
                || cached
                    .as_ref()
                    .map_or(true, |s| now - s.updated_at > chrono::Duration::hours(QUOTE_STATS_MAX_AGE_HOURS));

            let stats = if stale {
                match self.engine.average_and_volatility(code).await {
                    Ok((average, volatility)) => {
                        let merged = merge_quote_stats(cached, average, volatility, now);
                        self.store
                            .save_quote_stats(code, &merged)
                            .map_err(TradeError::Persistence)?;
                        debug!(%code, average = %merged.average, volatility = %merged.volatility, "Quote stats refreshed");
                        Some(merged)
                    }
                    Err(e) => {
                        warn!(%code, error = %e, "Average/volatility unavailable, using cache");
                        cached
                    }
                }
            } else {
                cached
            };
            if let Some(stats) = stats {
                result.insert(code.clone(), stats);
            }
        }
        Ok(result)
    }

    /// Settle what is left, save, and drop every strategy.
    ///
    /// Never fails: errors are logged so that shutdown always completes.
    pub async fn close(&mut self, cancel_all: bool) {
        if cancel_all && self.engine.gateway().is_connected() {
            if let Err(e) = self.engine.cancel_all().await {
                error!(error = %e, "Cancel-all failed during close");
            }
        }
        if let Err(e) = self.deal_handle().await {
            error!(error = %e, "Settlement failed during close");
        }
        if let Err(e) = self.save_assets().await {
            error!(error = %e, "Saving assets failed during close");
        }

        for strategy in self.strategies.values_mut() {
            if strategy.is_open() {
                strategy.close();
            }
        }
        self.strategies.clear();
        self.initialized = false;
        info!(run_key = %self.config.run_key(), "Orchestrator closed");
    }
}

/// Max order age before cancellation for the configured strategy.
pub(crate) fn max_wait_secs(kind: StrategyKind, execution: &ExecutionConfig, grid_max_wait: u64, forced: bool) -> u64 {
    match kind {
        StrategyKind::Grid => grid_max_wait,
        StrategyKind::Shannon if forced || execution.be_lurker => execution.max_wait_secs_lurker,
        StrategyKind::Shannon if execution.be_maker => execution.max_wait_secs_maker,
        StrategyKind::Shannon => execution.max_wait_secs_taker,
    }
}

/// Seconds to park waiting for fills.
///
/// Outside continuous bidding the wait runs to the end of the pre-open (or
/// after-hours) window plus up to 30s, at least 60s and at most `max_wait`.
pub(crate) fn fill_wait_secs(
    forced: bool,
    be_lurker: bool,
    max_wait: u64,
    loop_interval: u64,
    secs_to_preopen_end: i64,
    secs_to_afterhours_end: i64,
    jitter: f64,
) -> f64 {
    if forced {
        let window_end = if secs_to_preopen_end == 0 {
            secs_to_afterhours_end
        } else {
            secs_to_preopen_end
        };
        (max_wait as f64)
            .min(window_end as f64 + 30.0 * jitter)
            .max(MIN_FORCED_WAIT_SECS)
    } else if be_lurker {
        max_wait as f64
    } else {
        loop_interval.min(max_wait) as f64
    }
}

/// Keep cached values where the fresh ones are zero. The timestamp only
/// moves with a fresh average.
fn merge_quote_stats(
    cached: Option<QuoteStats>,
    average: Decimal,
    volatility: Decimal,
    now: DateTime<Utc>,
) -> QuoteStats {
    let mut stats = cached.unwrap_or(QuoteStats {
        average: Decimal::ZERO,
        volatility: Decimal::ZERO,
        updated_at: DateTime::<Utc>::UNIX_EPOCH,
    });
    if average != Decimal::ZERO {
        stats.average = average;
        stats.updated_at = now;
    }
    if volatility != Decimal::ZERO {
        stats.volatility = volatility;
    }
    stats
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::tests::{config, paper_config};
    use crate::exchange::{MarketCalendar, OrderRequest, PaperGateway, TradingGateway};
    use crate::orders::{AccountBook, OrderLedger};
    use crate::strategy::StrategyStatus;

    pub(crate) async fn paper_orchestrator() -> (Orchestrator, Arc<PaperGateway>, Shutdown) {
        paper_orchestrator_with(config(), SnapshotStore::in_memory().unwrap()).await
    }

    pub(crate) async fn paper_orchestrator_with(
        config: Config,
        store: SnapshotStore,
    ) -> (Orchestrator, Arc<PaperGateway>, Shutdown) {
        let ledger = Arc::new(OrderLedger::new(Arc::new(AccountBook::new())));
        let gateway = Arc::new(PaperGateway::new(
            paper_config(),
            Arc::clone(&ledger),
            MarketCalendar::new(config.pool()),
        ));
        gateway.set_session(true, true);
        gateway.open_api().await.unwrap();
        let engine = TradeEngine::new(gateway.clone(), ledger, &config);
        let shutdown = Shutdown::new();
        let orchestrator = Orchestrator::new(config, engine, store, shutdown.clone());
        (orchestrator, gateway, shutdown)
    }

    #[test]
    fn test_max_wait_secs_by_mode() {
        let mut exec = ExecutionConfig::default();
        assert_eq!(max_wait_secs(StrategyKind::Grid, &exec, 18000, true), 18000);
        assert_eq!(max_wait_secs(StrategyKind::Shannon, &exec, 18000, false), 300);
        assert_eq!(max_wait_secs(StrategyKind::Shannon, &exec, 18000, true), 18000);

        exec.be_maker = true;
        assert_eq!(max_wait_secs(StrategyKind::Shannon, &exec, 18000, false), 600);
        exec.be_lurker = true;
        assert_eq!(max_wait_secs(StrategyKind::Shannon, &exec, 18000, false), 18000);
    }

    #[test]
    fn test_fill_wait_secs() {
        // continuous: one loop interval, capped by max wait
        assert_eq!(fill_wait_secs(false, false, 300, 60, 0, 0, 0.5), 60.0);
        assert_eq!(fill_wait_secs(false, false, 30, 60, 0, 0, 0.5), 30.0);
        assert_eq!(fill_wait_secs(false, true, 18000, 60, 0, 0, 0.5), 18000.0);

        // forced: until the pre-open ends, else until after-hours end
        assert_eq!(fill_wait_secs(true, false, 18000, 60, 1200, 5000, 0.5), 1215.0);
        assert_eq!(fill_wait_secs(true, false, 18000, 60, 0, 5000, 0.0), 5000.0);
        assert_eq!(fill_wait_secs(true, false, 900, 60, 0, 5000, 0.0), 900.0);
        assert_eq!(fill_wait_secs(true, false, 18000, 60, 0, 0, 0.0), 60.0);
    }

    #[test]
    fn test_merge_quote_stats_keeps_cached_values() {
        let earlier = DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::days(1);
        let now = earlier + chrono::Duration::days(1);
        let cached = QuoteStats {
            average: dec!(100),
            volatility: dec!(0.02),
            updated_at: earlier,
        };

        let merged = merge_quote_stats(Some(cached.clone()), Decimal::ZERO, dec!(0.03), now);
        assert_eq!(merged.average, dec!(100));
        assert_eq!(merged.volatility, dec!(0.03));
        assert_eq!(merged.updated_at, earlier);

        let merged = merge_quote_stats(Some(cached), dec!(105), Decimal::ZERO, now);
        assert_eq!(merged.average, dec!(105));
        assert_eq!(merged.volatility, dec!(0.02));
        assert_eq!(merged.updated_at, now);
    }

    #[tokio::test]
    async fn test_init_opens_pool_and_credits_new_capital() {
        let (mut orch, _gw, _shutdown) = paper_orchestrator().await;
        assert!(orch.init().await.unwrap());
        assert!(!orch.init().await.unwrap());

        // priced instrument opens with its whole invest as balance
        let aapl = orch.strategy("US.AAPL").unwrap();
        assert_eq!(aapl.status(), StrategyStatus::Open);
        assert_eq!(aapl.balance(), dec!(5000));
        assert_eq!(aapl.holdings(), Decimal::ZERO);

        // no paper price: waits half-open
        let msft = orch.strategy("US.MSFT").unwrap();
        assert_eq!(msft.status(), StrategyStatus::HalfOpen);

        let saved = orch.load_saved().unwrap().unwrap();
        assert_eq!(saved.instruments["US.AAPL"].invest, dec!(5000));
        assert_eq!(saved.instruments["US.AAPL"].balance, dec!(5000));
        assert!(saved.total.is_some());
    }

    #[tokio::test]
    async fn test_restart_resumes_from_snapshot() {
        let dir = std::env::temp_dir().join(format!("tick-rebalancer-resume-{}", std::process::id()));
        let path = dir.join("snapshots.db");
        let _ = std::fs::remove_file(&path);

        {
            let (mut orch, _gw, _s) = paper_orchestrator_with(config(), SnapshotStore::open(&path).unwrap()).await;
            orch.init().await.unwrap();
            let strategy = orch.strategies.get_mut("US.AAPL").unwrap();
            strategy
                .end_transact(&FillDelta::reconcile(dec!(100), dec!(-1000), dec!(10), Decimal::ONE))
                .unwrap();
            strategy.state_mut().start_price = dec!(88);
            orch.close(false).await;
        }

        let (mut orch, _gw, _s) = paper_orchestrator_with(config(), SnapshotStore::open(&path).unwrap()).await;
        orch.init().await.unwrap();
        let aapl = orch.strategy("US.AAPL").unwrap();
        assert_eq!(aapl.balance(), dec!(4000));
        assert_eq!(aapl.holdings(), dec!(10));
        assert_eq!(aapl.invest_ratio(), Some(dec!(0.5)));
        assert_eq!(aapl.start_price(), dec!(88));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_run_requires_init() {
        let (mut orch, _gw, _s) = paper_orchestrator().await;
        assert!(matches!(orch.run().await, Err(TradeError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_settle_order_applies_fill_once() {
        let (mut orch, gw, _s) = paper_orchestrator().await;
        orch.init().await.unwrap();

        let id = gw
            .place_order(&OrderRequest::market("US.AAPL", OrderSide::Buy, dec!(5), dec!(100)))
            .await
            .unwrap();
        let order = orch.engine().ledger().get(&id).await.unwrap().unwrap();
        assert!(order.is_closed);

        assert!(orch.settle_order(&order).await.unwrap());
        let aapl = orch.strategy("US.AAPL").unwrap();
        assert_eq!(aapl.balance(), dec!(4500));
        assert_eq!(aapl.holdings(), dec!(5));

        // already settled: deal_handle finds nothing left
        assert!(!orch.deal_handle().await.unwrap());
        let aapl = orch.strategy("US.AAPL").unwrap();
        assert_eq!(aapl.holdings(), dec!(5));
        assert_eq!(orch.stats().settled, 1);
        assert_eq!(orch.stats().dealt, 1);
    }

    #[tokio::test]
    async fn test_not_dealt_order_is_counted() {
        let (mut orch, gw, _s) = paper_orchestrator().await;
        orch.init().await.unwrap();

        let id = gw
            .place_order(&OrderRequest::limit("US.AAPL", OrderSide::Buy, dec!(5), dec!(90)))
            .await
            .unwrap();
        gw.cancel_order(&id).await.unwrap();
        let order = orch.engine().ledger().get(&id).await.unwrap().unwrap();

        assert!(!orch.settle_order(&order).await.unwrap());
        let aapl = orch.strategy("US.AAPL").unwrap();
        assert_eq!(aapl.balance(), dec!(5000));
        assert_eq!(aapl.holdings(), Decimal::ZERO);
        assert_eq!(orch.stats().not_dealt, 1);
    }

    #[tokio::test]
    async fn test_order_without_side_is_not_settled() {
        let (mut orch, _gw, _s) = paper_orchestrator().await;
        orch.init().await.unwrap();
        let order = orch
            .engine()
            .ledger()
            .record_update(crate::exchange::OrderUpdate::new("ghost").dealt(dec!(1), dec!(100)).closed(true))
            .await
            .unwrap()
            .unwrap();

        assert!(!orch.settle_order(&order).await.unwrap());
        assert!(!orch.engine().ledger().get("ghost").await.unwrap().unwrap().is_settled);
    }

    #[tokio::test]
    async fn test_fill_on_one_side_cancels_the_other() {
        let (mut orch, gw, _s) = paper_orchestrator().await;
        orch.init().await.unwrap();

        let buy = orch.engine().buy("US.AAPL", dec!(2), dec!(99)).await.unwrap().unwrap();
        let filled = gw
            .place_order(&OrderRequest::market("US.AAPL", OrderSide::Buy, dec!(3), dec!(100)))
            .await
            .unwrap();

        assert!(orch.deal_handle().await.unwrap());
        let ledger = orch.engine().ledger();
        assert!(ledger.get(&filled).await.unwrap().unwrap().is_settled);
        let resting = ledger.get(&buy).await.unwrap().unwrap();
        assert!(resting.is_settled);
        assert!(resting.is_closed);
        assert!(!ledger.has_unsettled().await.unwrap());
        assert_eq!(orch.stats().cancelled, 1);
        assert!(gw.open_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_overtime_orders() {
        let (mut orch, _gw, _s) = paper_orchestrator().await;
        orch.init().await.unwrap();
        let id = orch.engine().buy("US.AAPL", dec!(1), dec!(90)).await.unwrap().unwrap();
        let now = Utc::now();

        assert!(!orch.cancel_overtime_orders_at(now, 300).await.unwrap());
        assert!(orch
            .cancel_overtime_orders_at(now + chrono::Duration::seconds(301), 300)
            .await
            .unwrap());
        let order = orch.engine().ledger().get(&id).await.unwrap().unwrap();
        assert!(order.is_closed);
        assert_eq!(order.dealt_qty, Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_deal_wakes_on_fill() {
        let (mut orch, gw, _s) = paper_orchestrator().await;
        orch.init().await.unwrap();
        orch.engine().buy("US.AAPL", dec!(2), dec!(99)).await.unwrap().unwrap();

        let mover = Arc::clone(&gw);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            mover.set_price("US.AAPL", dec!(98.5)).await;
        });

        let started = tokio::time::Instant::now();
        assert!(orch.wait_for_deal(false).await.unwrap());
        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(orch.strategy("US.AAPL").unwrap().holdings(), dec!(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_deal_without_orders_returns_at_once() {
        let (mut orch, _gw, _s) = paper_orchestrator().await;
        orch.init().await.unwrap();
        assert!(!orch.wait_for_deal(false).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_ends_when_session_closes() {
        let (mut orch, gw, _s) = paper_orchestrator().await;
        orch.init().await.unwrap();

        assert_eq!(orch.run_cycle().await.unwrap(), CycleOutcome::Continue);
        assert_eq!(orch.stats().cycles, 1);

        gw.set_session(false, false);
        assert_eq!(orch.run().await.unwrap(), CycleOutcome::SessionClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_run() {
        let (mut orch, _gw, shutdown) = paper_orchestrator().await;
        orch.init().await.unwrap();
        shutdown.trigger();
        assert_eq!(orch.run().await.unwrap(), CycleOutcome::Interrupted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_trade_is_absorbed_without_orders() {
        let (mut orch, gw, _s) = paper_orchestrator().await;
        orch.init().await.unwrap();

        // bought outside the strategy
        gw.place_order(&OrderRequest::market("US.AAPL", OrderSide::Buy, dec!(3), dec!(100)))
            .await
            .unwrap();
        orch.engine().ledger().clear().await.unwrap();

        let account = orch.engine.refresh_account().await.unwrap();
        let quotes = orch.engine.refresh_quotes().await.unwrap();
        let assets = AssetSummary::from_live(orch.engine.pool(), &orch.strategies, &quotes, &account, dec!(10000));
        orch.trade_instrument("US.AAPL", &account, &assets, false).await.unwrap();

        let aapl = orch.strategy("US.AAPL").unwrap();
        assert_eq!(aapl.holdings(), dec!(3));
        // value is preserved: tracked 5000, now 3 shares worth 300
        assert_eq!(aapl.balance(), dec!(4700));
        assert!(orch.engine().ledger().open_orders(&[]).await.unwrap().is_empty());
    }
}
