//! Trade engine: the orchestrator's view of the broker.
//!
//! Wraps the gateway with the order ledger, the cached account and a quote
//! cache, and applies lot/tick/power rounding before anything is sent.

mod smart;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{Config, EngineConfig};
use crate::error::{GatewayError, TradeError, TradeResult};
use crate::exchange::{price_precision, OrderRequest, OrderSide, Quote, TradingGateway};
use crate::orders::{AccountBook, AccountState, Order, OrderLedger};
use crate::utils::decimal::{round_to_lot, round_to_precision, round_to_tick, safe_div};
use crate::utils::TimedMutex;

/// Attempts for order queries and cancels before the error is escalated.
pub const ORDER_CALL_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct TradeEngine {
    gateway: Arc<dyn TradingGateway>,
    ledger: Arc<OrderLedger>,
    config: EngineConfig,
    pool: Vec<String>,
    precisions: HashMap<String, u32>,
    quotes: TimedMutex<HashMap<String, Quote>>,
}

impl TradeEngine {
    pub fn new(gateway: Arc<dyn TradingGateway>, ledger: Arc<OrderLedger>, config: &Config) -> Self {
        Self {
            gateway,
            ledger,
            config: config.engine.clone(),
            pool: config.pool(),
            precisions: config
                .instruments
                .iter()
                .map(|i| (i.code.clone(), i.price_precision))
                .collect(),
            quotes: TimedMutex::new("quotes", HashMap::new()),
        }
    }

    pub fn gateway(&self) -> &Arc<dyn TradingGateway> {
        &self.gateway
    }

    pub fn ledger(&self) -> &Arc<OrderLedger> {
        &self.ledger
    }

    pub fn account(&self) -> &Arc<AccountBook> {
        self.ledger.account()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &[String] {
        &self.pool
    }

    pub fn precision(&self, code: &str) -> u32 {
        self.precisions
            .get(code)
            .copied()
            .unwrap_or_else(|| price_precision(code))
    }

    /// Pull a fresh account snapshot. Failure is run-fatal.
    pub async fn refresh_account(&self) -> TradeResult<AccountState> {
        let snapshot = self
            .gateway
            .account_snapshot()
            .await
            .map_err(TradeError::SnapshotUnavailable)?;
        self.account().replace(&snapshot).await?;
        self.account().snapshot().await
    }

    /// Codes worth quoting: the pool, the default instrument and anything held.
    pub fn quote_codes(&self, account: &AccountState) -> Vec<String> {
        let mut codes = self.pool.clone();
        if let Some(default) = &self.config.default_instrument {
            codes.push(default.clone());
        }
        let mut held: Vec<&String> = account
            .holdings
            .iter()
            .filter(|(_, h)| h.qty != Decimal::ZERO)
            .map(|(code, _)| code)
            .collect();
        held.sort();
        codes.extend(held.into_iter().cloned());

        let mut seen = std::collections::HashSet::new();
        codes.retain(|c| seen.insert(c.clone()));
        codes
    }

    /// Pull a fresh market snapshot. Failure is run-fatal.
    pub async fn refresh_quotes(&self) -> TradeResult<HashMap<String, Quote>> {
        let account = self.account().snapshot().await?;
        let codes = self.quote_codes(&account);
        let quotes = self
            .gateway
            .market_snapshot(&codes)
            .await
            .map_err(TradeError::SnapshotUnavailable)?;
        debug!(requested = codes.len(), received = quotes.len(), "Market snapshot refreshed");
        *self.quotes.lock().await? = quotes.clone();
        Ok(quotes)
    }

    pub async fn quotes(&self) -> TradeResult<HashMap<String, Quote>> {
        Ok(self.quotes.lock().await?.clone())
    }

    pub async fn quote(&self, code: &str) -> TradeResult<Option<Quote>> {
        Ok(self.quotes.lock().await?.get(code).cloned())
    }

    pub async fn set_quote(&self, code: &str, quote: Quote) -> TradeResult<()> {
        self.quotes.lock().await?.insert(code.to_string(), quote);
        Ok(())
    }

    /// Ask the broker for a quote whose snapshot price came back empty.
    pub async fn resolve_quote(&self, code: &str) -> TradeResult<Option<Quote>> {
        match self.gateway.resolve_quote(code).await {
            Ok(quote) => {
                info!(%code, last = %quote.last, "Missing price resolved");
                self.set_quote(code, quote.clone()).await?;
                Ok(Some(quote))
            }
            Err(e) => {
                warn!(%code, error = %e, "Could not resolve missing price");
                Ok(None)
            }
        }
    }

    /// Round volume to lots and price to ticks, then cap by power or holdings.
    ///
    /// Returns `(volume, price)`; a zero volume means nothing can be sent.
    pub async fn round_order_param(
        &self,
        code: &str,
        side: OrderSide,
        volume: Decimal,
        price: Decimal,
        is_market: bool,
    ) -> TradeResult<(Decimal, Decimal)> {
        let quote = self.quote(code).await?;
        let precision = self.precision(code);
        let lot = quote
            .as_ref()
            .map(|q| q.lot_size)
            .filter(|l| *l > Decimal::ZERO)
            .unwrap_or(Decimal::ONE);
        let tick = quote
            .as_ref()
            .map(|q| q.spread)
            .filter(|s| *s > Decimal::ZERO)
            .unwrap_or_else(|| Decimal::new(1, precision));
        let last = quote.as_ref().map(|q| q.last).unwrap_or(Decimal::ZERO);

        let mut vol = round_to_lot(volume, lot);
        let mut price = if price == Decimal::ZERO { last } else { price };
        if is_market {
            price = match side {
                OrderSide::Buy => quote.as_ref().and_then(|q| q.ask).unwrap_or(last) * dec!(1.01),
                OrderSide::Sell => quote.as_ref().and_then(|q| q.bid).unwrap_or(last) * dec!(0.99),
            };
        }
        let price = round_to_precision(round_to_tick(price, tick), precision).max(tick);

        let account = self.account().snapshot().await?;
        match side {
            OrderSide::Buy => {
                let fees = self.config.max_fees;
                if fees * price * vol > account.buying_power {
                    let affordable = safe_div(account.buying_power, fees * price);
                    vol = if affordable > dec!(0.2) * volume {
                        (safe_div(affordable, lot).round() - Decimal::ONE) * lot
                    } else {
                        Decimal::ZERO
                    };
                    info!(
                        %code,
                        %volume,
                        rounded = %vol,
                        %price,
                        buying_power = %account.buying_power,
                        "Buy volume capped by buying power"
                    );
                }
            }
            OrderSide::Sell => {
                let held = account.holding_qty(code);
                if vol > held {
                    info!(%code, %volume, held = %held, "Sell volume capped by holdings");
                    vol = held;
                }
            }
        }

        Ok((vol.max(Decimal::ZERO), price))
    }

    /// Round and submit an order. `None` when nothing was sent.
    async fn place(
        &self,
        code: &str,
        side: OrderSide,
        volume: Decimal,
        price: Decimal,
        is_market: bool,
    ) -> TradeResult<Option<String>> {
        let (vol, price) = self
            .round_order_param(code, side, volume, price, is_market)
            .await?;
        if vol <= Decimal::ZERO || price <= Decimal::ZERO {
            info!(%code, %side, %volume, %vol, %price, "Order skipped after rounding");
            return Ok(None);
        }

        let request = if is_market {
            OrderRequest::market(code, side, vol, price)
        } else {
            OrderRequest::limit(code, side, vol, price)
        };
        let order_id = match self.gateway.place_order(&request).await {
            Ok(id) => id,
            Err(GatewayError::Rejected(reason)) => {
                warn!(%code, %side, %vol, %price, %reason, "Order rejected");
                return Ok(None);
            }
            Err(e) => return Err(TradeError::gateway("place_order", e)),
        };

        if side.is_buy() {
            self.account()
                .reserve_power(vol * price * self.config.max_fees)
                .await?;
        }
        self.ledger.record_placed(&order_id, &request).await?;
        Ok(Some(order_id))
    }

    pub async fn buy(&self, code: &str, volume: Decimal, price: Decimal) -> TradeResult<Option<String>> {
        self.place(code, OrderSide::Buy, volume, price, false).await
    }

    /// Limit sell; with `keep_one_lot` never sells the last lot held.
    pub async fn sell(
        &self,
        code: &str,
        volume: Decimal,
        price: Decimal,
        keep_one_lot: bool,
    ) -> TradeResult<Option<String>> {
        let volume = if keep_one_lot {
            volume.min(self.sellable_keeping_lot(code).await?)
        } else {
            volume
        };
        self.place(code, OrderSide::Sell, volume, price, false).await
    }

    pub(crate) async fn place_market(
        &self,
        code: &str,
        side: OrderSide,
        volume: Decimal,
    ) -> TradeResult<Option<String>> {
        self.place(code, side, volume, Decimal::ZERO, true).await
    }

    async fn sellable_keeping_lot(&self, code: &str) -> TradeResult<Decimal> {
        let held = self.account().holding_qty(code).await?;
        let lot = self
            .quote(code)
            .await?
            .map(|q| q.lot_size)
            .filter(|l| *l > Decimal::ZERO)
            .unwrap_or(Decimal::ONE);
        Ok(held - lot)
    }

    /// Query an order and merge the answer into the ledger.
    pub async fn query_order(&self, order_id: &str) -> TradeResult<Order> {
        let mut attempt = 1;
        loop {
            match self.gateway.query_order(order_id).await {
                Ok(update) => {
                    return self
                        .ledger
                        .record_update(update)
                        .await?
                        .ok_or_else(|| TradeError::OrderLost(order_id.to_string()));
                }
                Err(e) if attempt < ORDER_CALL_ATTEMPTS && e.is_retryable() => {
                    warn!(%order_id, attempt, error = %e, "Order query failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => return Err(TradeError::gateway("query_order", e)),
            }
        }
    }

    /// Cancel an order. Succeeds if a re-query shows it already closed.
    pub async fn cancel_order(&self, order_id: &str) -> TradeResult<()> {
        let mut last_err = GatewayError::Timeout;
        for attempt in 1..=ORDER_CALL_ATTEMPTS {
            match self.gateway.cancel_order(order_id).await {
                Ok(()) => {
                    debug!(%order_id, "Order cancelled");
                    return Ok(());
                }
                Err(e) => {
                    warn!(%order_id, attempt, error = %e, "Order cancel failed");
                    if let Ok(order) = self.query_order(order_id).await {
                        if order.is_closed {
                            info!(%order_id, "Order already closed, cancel not needed");
                            return Ok(());
                        }
                    }
                    if !e.is_retryable() {
                        return Err(TradeError::gateway("cancel_order", e));
                    }
                    last_err = e;
                    if attempt < ORDER_CALL_ATTEMPTS {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(TradeError::gateway("cancel_order", last_err))
    }

    /// Merge the broker's working orders into the ledger.
    pub async fn sync_open_orders(&self) -> TradeResult<usize> {
        let open = self
            .gateway
            .open_orders()
            .await
            .map_err(|e| TradeError::gateway("open_orders", e))?;
        let count = open.len();
        for update in open {
            self.ledger.record_update(update).await?;
        }
        debug!(count, "Open orders synced");
        Ok(count)
    }

    pub async fn cancel_all(&self) -> TradeResult<()> {
        self.gateway
            .cancel_all_orders()
            .await
            .map_err(|e| TradeError::gateway("cancel_all_orders", e))?;
        info!("All open orders cancelled");
        Ok(())
    }

    pub async fn average_and_volatility(&self, code: &str) -> TradeResult<(Decimal, Decimal)> {
        self.gateway
            .average_and_volatility(code)
            .await
            .map_err(|e| TradeError::gateway("average_and_volatility", e))
    }
}
