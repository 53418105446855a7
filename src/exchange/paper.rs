//! In-process simulated broker for paper trading and tests.
//!
//! Prices follow a bounded random walk. Market orders fill immediately at
//! the current price; limit orders rest until the price crosses them. Every
//! fill or cancel is pushed to the [`OrderLedger`] the same way a broker
//! callback would be.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::session::{tick_size, MarketCalendar};
use super::traits::TradingGateway;
use super::types::{AccountSnapshot, Holding, OrderRequest, OrderSide, OrderUpdate, Quote};
use crate::config::PaperConfig;
use crate::error::GatewayError;
use crate::orders::OrderLedger;
use crate::utils::decimal::{from_f64, round_to_tick, safe_div};

/// Price points kept per instrument for average/volatility.
const HISTORY_LEN: usize = 64;
/// Window used for the recent average and volatility.
const STATS_WINDOW: usize = 5;

#[derive(Debug, Clone)]
struct PaperMarket {
    price: Decimal,
    lot_size: Decimal,
    history: VecDeque<Decimal>,
}

impl PaperMarket {
    fn new(price: Decimal, lot_size: Decimal) -> Self {
        let mut history = VecDeque::with_capacity(HISTORY_LEN);
        history.push_back(price);
        Self {
            price,
            lot_size,
            history,
        }
    }

    fn push(&mut self, price: Decimal) {
        self.price = price;
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(price);
    }
}

#[derive(Debug, Clone)]
struct RestingOrder {
    request: OrderRequest,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PaperState {
    cash: Decimal,
    reserved_cash: Decimal,
    holdings: HashMap<String, Holding>,
    reserved_qty: HashMap<String, Decimal>,
    markets: HashMap<String, PaperMarket>,
    resting: HashMap<String, RestingOrder>,
    finished: HashMap<String, OrderUpdate>,
}

impl PaperState {
    fn available_qty(&self, code: &str) -> Decimal {
        let held = self.holdings.get(code).map(|h| h.qty).unwrap_or(Decimal::ZERO);
        held - self.reserved_qty.get(code).copied().unwrap_or(Decimal::ZERO)
    }

    fn release(&mut self, request: &OrderRequest) {
        match request.side {
            OrderSide::Buy => self.reserved_cash -= request.qty * request.price,
            OrderSide::Sell => {
                *self.reserved_qty.entry(request.instrument.clone()).or_default() -= request.qty;
            }
        }
    }

    /// Move cash and holdings for a fill of `qty` at `price`.
    fn settle_fill(&mut self, code: &str, side: OrderSide, qty: Decimal, price: Decimal) {
        let value = qty * price;
        let holding = self.holdings.entry(code.to_string()).or_default();
        match side {
            OrderSide::Buy => {
                let total_cost = holding.cost_price * holding.qty + value;
                holding.qty += qty;
                holding.cost_price = safe_div(total_cost, holding.qty);
                self.cash -= value;
            }
            OrderSide::Sell => {
                holding.qty -= qty;
                self.cash += value;
            }
        }
    }
}

/// Session override for tests and offline runs.
#[derive(Debug, Default)]
struct SessionOverride {
    active: AtomicBool,
    open: AtomicBool,
    continuous: AtomicBool,
}

pub struct PaperGateway {
    config: PaperConfig,
    ledger: Arc<OrderLedger>,
    calendar: MarketCalendar,
    state: RwLock<PaperState>,
    order_id_counter: AtomicU64,
    connected: AtomicBool,
    session: SessionOverride,
}

impl PaperGateway {
    pub fn new(config: PaperConfig, ledger: Arc<OrderLedger>, calendar: MarketCalendar) -> Self {
        let mut state = PaperState {
            cash: config.initial_cash,
            ..PaperState::default()
        };
        for seed in &config.prices {
            state
                .markets
                .insert(seed.code.clone(), PaperMarket::new(seed.price, seed.lot_size));
        }
        info!(
            cash = %config.initial_cash,
            instruments = state.markets.len(),
            "Paper gateway created"
        );
        Self {
            config,
            ledger,
            calendar,
            state: RwLock::new(state),
            order_id_counter: AtomicU64::new(1),
            connected: AtomicBool::new(false),
            session: SessionOverride::default(),
        }
    }

    /// Pin the session predicates instead of following the calendar.
    pub fn set_session(&self, open: bool, continuous: bool) {
        self.session.open.store(open, Ordering::SeqCst);
        self.session.continuous.store(continuous, Ordering::SeqCst);
        self.session.active.store(true, Ordering::SeqCst);
    }

    pub async fn price(&self, code: &str) -> Option<Decimal> {
        self.state.read().await.markets.get(code).map(|m| m.price)
    }

    /// Move an instrument to `price` and fill whatever it crosses.
    pub async fn set_price(&self, code: &str, price: Decimal) {
        let fills = {
            let mut state = self.state.write().await;
            match state.markets.get_mut(code) {
                Some(market) => market.push(price),
                None => {
                    state
                        .markets
                        .insert(code.to_string(), PaperMarket::new(price, Decimal::ONE));
                }
            }
            Self::match_resting(&mut state, code, price)
        };
        self.publish(fills).await;
    }

    /// One random-walk step for every simulated instrument.
    pub async fn step(&self) {
        let moves: Vec<(String, Decimal)> = {
            let state = self.state.read().await;
            let mut rng = rand::thread_rng();
            state
                .markets
                .iter()
                .map(|(code, market)| {
                    let shock = from_f64(rng.gen_range(-1.0..1.0)) * self.config.step_volatility;
                    let tick = tick_size(code);
                    let next = round_to_tick(market.price * (Decimal::ONE + shock), tick).max(tick);
                    (code.clone(), next)
                })
                .collect()
        };
        for (code, price) in moves {
            self.set_price(&code, price).await;
        }
    }

    /// Drive the random walk until the gateway is dropped elsewhere.
    pub fn spawn_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let gateway = Arc::clone(self);
        let period = Duration::from_millis(self.config.tick_millis.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if gateway.is_connected() {
                    gateway.step().await;
                }
            }
        })
    }

    fn match_resting(state: &mut PaperState, code: &str, price: Decimal) -> Vec<OrderUpdate> {
        let crossed: Vec<String> = state
            .resting
            .iter()
            .filter(|(_, o)| {
                o.request.instrument == code
                    && match o.request.side {
                        OrderSide::Buy => price <= o.request.price,
                        OrderSide::Sell => price >= o.request.price,
                    }
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut updates = Vec::with_capacity(crossed.len());
        for id in crossed {
            let Some(order) = state.resting.remove(&id) else {
                continue;
            };
            let req = &order.request;
            state.release(req);
            state.settle_fill(code, req.side, req.qty, req.price);
            let update = Self::full_update(&id, req).dealt(req.qty, req.price).closed(true);
            debug!(
                order_id = %id,
                %code,
                side = %req.side,
                qty = %req.qty,
                price = %req.price,
                age_secs = (Utc::now() - order.created_at).num_seconds(),
                "Resting order filled"
            );
            state.finished.insert(id.clone(), update.clone());
            updates.push(update);
        }
        updates
    }

    fn full_update(order_id: &str, req: &OrderRequest) -> OrderUpdate {
        OrderUpdate::new(order_id)
            .instrument(&req.instrument)
            .side(req.side)
            .qty(req.qty)
            .price(req.price)
    }

    async fn publish(&self, updates: Vec<OrderUpdate>) {
        for update in updates {
            if let Err(e) = self.ledger.record_update(update).await {
                warn!(error = %e, "Failed to deliver paper fill to the ledger");
            }
        }
    }

    fn ensure_connected(&self) -> Result<(), GatewayError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(GatewayError::Disconnected)
        }
    }

    fn quote_of(code: &str, market: &PaperMarket) -> Quote {
        let tick = tick_size(code);
        Quote::new(market.price, tick, market.lot_size)
            .with_book((market.price - tick).max(tick), market.price + tick)
    }
}

#[async_trait]
impl TradingGateway for PaperGateway {
    async fn open_api(&self) -> Result<(), GatewayError> {
        self.connected.store(true, Ordering::SeqCst);
        info!("Paper gateway connected");
        Ok(())
    }

    async fn close_api(&self) -> Result<(), GatewayError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!("Paper gateway disconnected");
            self.ledger.notify_connection_closed();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn account_snapshot(&self) -> Result<AccountSnapshot, GatewayError> {
        self.ensure_connected()?;
        let state = self.state.read().await;
        let holdings_value: Decimal = state
            .holdings
            .iter()
            .map(|(code, h)| {
                h.qty * state.markets.get(code).map(|m| m.price).unwrap_or(h.cost_price)
            })
            .sum();
        Ok(AccountSnapshot {
            balance: state.cash,
            buying_power: state.cash - state.reserved_cash,
            total_assets: state.cash + holdings_value,
            holdings: state
                .holdings
                .iter()
                .filter(|(_, h)| h.qty != Decimal::ZERO)
                .map(|(c, h)| (c.clone(), h.clone()))
                .collect(),
        })
    }

    async fn market_snapshot(
        &self,
        instruments: &[String],
    ) -> Result<HashMap<String, Quote>, GatewayError> {
        self.ensure_connected()?;
        let state = self.state.read().await;
        Ok(instruments
            .iter()
            .filter_map(|code| {
                state
                    .markets
                    .get(code)
                    .map(|m| (code.clone(), Self::quote_of(code, m)))
            })
            .collect())
    }

    async fn resolve_quote(&self, instrument: &str) -> Result<Quote, GatewayError> {
        self.ensure_connected()?;
        let state = self.state.read().await;
        state
            .markets
            .get(instrument)
            .map(|m| Self::quote_of(instrument, m))
            .ok_or_else(|| GatewayError::NoQuote(instrument.to_string()))
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<String, GatewayError> {
        self.ensure_connected()?;
        if order.qty <= Decimal::ZERO {
            return Err(GatewayError::Rejected(format!("quantity {}", order.qty)));
        }
        let order_id = format!(
            "paper-{}",
            self.order_id_counter.fetch_add(1, Ordering::SeqCst)
        );

        let fills = {
            let mut state = self.state.write().await;
            let last = state
                .markets
                .get(&order.instrument)
                .map(|m| m.price)
                .ok_or_else(|| GatewayError::NoQuote(order.instrument.clone()))?;

            let marketable = order.is_market
                || match order.side {
                    OrderSide::Buy => order.price >= last,
                    OrderSide::Sell => order.price <= last,
                };
            let exec_price = if marketable { last } else { order.price };

            match order.side {
                OrderSide::Buy => {
                    let power = state.cash - state.reserved_cash;
                    if order.qty * exec_price > power {
                        return Err(GatewayError::Rejected(format!(
                            "insufficient buying power {power}"
                        )));
                    }
                }
                OrderSide::Sell => {
                    let available = state.available_qty(&order.instrument);
                    if order.qty > available {
                        return Err(GatewayError::Rejected(format!(
                            "insufficient holdings {available}"
                        )));
                    }
                }
            }

            if marketable {
                state.settle_fill(&order.instrument, order.side, order.qty, exec_price);
                let update = Self::full_update(&order_id, order)
                    .dealt(order.qty, exec_price)
                    .closed(true);
                state.finished.insert(order_id.clone(), update.clone());
                vec![update]
            } else {
                match order.side {
                    OrderSide::Buy => state.reserved_cash += order.qty * order.price,
                    OrderSide::Sell => {
                        *state.reserved_qty.entry(order.instrument.clone()).or_default() +=
                            order.qty;
                    }
                }
                state.resting.insert(
                    order_id.clone(),
                    RestingOrder {
                        request: order.clone(),
                        created_at: Utc::now(),
                    },
                );
                Vec::new()
            }
        };

        debug!(
            %order_id,
            instrument = %order.instrument,
            side = %order.side,
            qty = %order.qty,
            price = %order.price,
            filled = !fills.is_empty(),
            "Paper order accepted"
        );
        self.publish(fills).await;
        Ok(order_id)
    }

    async fn query_order(&self, order_id: &str) -> Result<OrderUpdate, GatewayError> {
        self.ensure_connected()?;
        let state = self.state.read().await;
        if let Some(resting) = state.resting.get(order_id) {
            return Ok(Self::full_update(order_id, &resting.request)
                .dealt(Decimal::ZERO, resting.request.price)
                .closed(false));
        }
        state
            .finished
            .get(order_id)
            .cloned()
            .ok_or_else(|| GatewayError::OrderNotFound(order_id.to_string()))
    }

    async fn open_orders(&self) -> Result<Vec<OrderUpdate>, GatewayError> {
        self.ensure_connected()?;
        let state = self.state.read().await;
        Ok(state
            .resting
            .iter()
            .map(|(id, o)| Self::full_update(id, &o.request).closed(false))
            .collect())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError> {
        self.ensure_connected()?;
        let update = {
            let mut state = self.state.write().await;
            match state.resting.remove(order_id) {
                Some(order) => {
                    state.release(&order.request);
                    let update = Self::full_update(order_id, &order.request)
                        .dealt(Decimal::ZERO, order.request.price)
                        .closed(true);
                    state.finished.insert(order_id.to_string(), update.clone());
                    update
                }
                None if state.finished.contains_key(order_id) => return Ok(()),
                None => return Err(GatewayError::OrderNotFound(order_id.to_string())),
            }
        };
        debug!(%order_id, "Paper order cancelled");
        self.publish(vec![update]).await;
        Ok(())
    }

    async fn cancel_all_orders(&self) -> Result<(), GatewayError> {
        let ids: Vec<String> = self.state.read().await.resting.keys().cloned().collect();
        for id in ids {
            self.cancel_order(&id).await?;
        }
        Ok(())
    }

    async fn average_and_volatility(
        &self,
        instrument: &str,
    ) -> Result<(Decimal, Decimal), GatewayError> {
        self.ensure_connected()?;
        let state = self.state.read().await;
        let Some(market) = state.markets.get(instrument) else {
            return Ok((Decimal::ZERO, Decimal::ZERO));
        };

        let recent: Vec<Decimal> = market
            .history
            .iter()
            .rev()
            .take(STATS_WINDOW + 1)
            .copied()
            .collect();
        let window = &recent[..recent.len().min(STATS_WINDOW)];
        let average = safe_div(
            window.iter().copied().sum(),
            Decimal::from(window.len() as u64),
        );

        let moves: Vec<Decimal> = recent
            .windows(2)
            .map(|pair| (safe_div(pair[0], pair[1]) - Decimal::ONE).abs())
            .collect();
        let volatility = safe_div(moves.iter().copied().sum(), Decimal::from(moves.len() as u64));
        Ok((average, volatility))
    }

    fn can_place_order(&self, instrument: &str) -> bool {
        if self.session.active.load(Ordering::SeqCst) {
            return self.session.open.load(Ordering::SeqCst);
        }
        self.calendar.can_place_order_at(instrument, Utc::now())
    }

    fn market_open(&self) -> bool {
        if self.session.active.load(Ordering::SeqCst) {
            return self.session.open.load(Ordering::SeqCst);
        }
        self.calendar.market_open_at(Utc::now())
    }

    fn is_continuous_bidding(&self, instrument: &str) -> bool {
        if self.session.active.load(Ordering::SeqCst) {
            return self.session.continuous.load(Ordering::SeqCst);
        }
        self.calendar.is_continuous_at(instrument, Utc::now())
    }

    fn pool_continuous(&self) -> bool {
        if self.session.active.load(Ordering::SeqCst) {
            return self.session.continuous.load(Ordering::SeqCst);
        }
        self.calendar.pool_continuous_at(Utc::now())
    }

    fn is_blind(&self, instrument: &str) -> bool {
        !self.is_continuous_bidding(instrument)
    }

    fn secs_to_open(&self) -> i64 {
        if self.session.active.load(Ordering::SeqCst) {
            return if self.session.open.load(Ordering::SeqCst) { 0 } else { 60 };
        }
        self.calendar.secs_to_open_at(Utc::now())
    }

    fn secs_to_preopen_end(&self) -> i64 {
        if self.session.active.load(Ordering::SeqCst) {
            return 0;
        }
        self.calendar.secs_to_preopen_end_at(Utc::now())
    }

    fn secs_to_afterhours_end(&self) -> i64 {
        if self.session.active.load(Ordering::SeqCst) {
            return 0;
        }
        self.calendar.secs_to_afterhours_end_at(Utc::now())
    }

    fn has_preopen(&self) -> bool {
        !self.session.active.load(Ordering::SeqCst) && self.calendar.has_preopen()
    }

    fn is_day_rollover(&self) -> bool {
        !self.session.active.load(Ordering::SeqCst) && self.calendar.is_day_rollover_at(Utc::now())
    }
}
