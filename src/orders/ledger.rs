//! Order ledger: every order this run has placed or heard about.
//!
//! Updates arrive from two directions: the scheduler (placement, queries)
//! and broker callbacks. Both merge through [`OrderLedger::record_update`],
//! which books a closed order against the account exactly once and wakes
//! any task parked in [`OrderLedger::wait_for_fill`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use super::account::AccountBook;
use crate::error::TradeResult;
use crate::exchange::{OrderRequest, OrderSide, OrderUpdate};
use crate::utils::TimedMutex;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Order {
    pub order_id: String,
    pub instrument: Option<String>,
    pub side: Option<OrderSide>,
    pub qty: Decimal,
    pub price: Decimal,
    pub dealt_qty: Decimal,
    pub dealt_avg_price: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub is_closed: bool,
    /// Fill has been handed to the owning strategy.
    pub is_settled: bool,
    /// Account has been credited for the close.
    pub balance_added_back: bool,
}

impl Order {
    fn new(order_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            order_id: order_id.to_string(),
            instrument: None,
            side: None,
            qty: Decimal::ZERO,
            price: Decimal::ZERO,
            dealt_qty: Decimal::ZERO,
            dealt_avg_price: None,
            created_at: now,
            is_closed: false,
            is_settled: false,
            balance_added_back: false,
        }
    }

    /// Average fill price, falling back to the limit price.
    pub fn avg_price(&self) -> Decimal {
        match self.dealt_avg_price {
            Some(p) if p > Decimal::ZERO => p,
            _ => self.price,
        }
    }

    pub fn is_buy(&self) -> bool {
        self.side.map(|s| s.is_buy()).unwrap_or(false)
    }

    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_seconds()
    }

    /// Closing is one-way: once closed, later updates cannot reopen the
    /// order or rewrite its fill.
    fn merge(&mut self, update: &OrderUpdate) {
        if self.is_closed {
            if update.is_closed == Some(false) || update.dealt_qty.is_some() {
                debug!(order_id = %self.order_id, ?update, "Stale update for closed order ignored");
            }
            self.fill_missing(update);
            return;
        }
        if let Some(instrument) = &update.instrument {
            self.instrument = Some(instrument.clone());
        }
        if let Some(side) = update.side {
            self.side = Some(side);
        }
        if let Some(qty) = update.qty {
            self.qty = qty;
        }
        if let Some(price) = update.price {
            self.price = price;
        }
        if let Some(dealt) = update.dealt_qty {
            self.dealt_qty = dealt;
        }
        if let Some(avg) = update.dealt_avg_price {
            self.dealt_avg_price = Some(avg);
        }
        if let Some(closed) = update.is_closed {
            self.is_closed |= closed;
        }
    }

    fn fill_missing(&mut self, update: &OrderUpdate) {
        if self.instrument.is_none() {
            self.instrument = update.instrument.clone();
        }
        if self.side.is_none() {
            self.side = update.side;
        }
    }
}

/// Per-instrument traded totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DealtSummary {
    pub buy_qty: Decimal,
    pub buy_value: Decimal,
    pub sell_qty: Decimal,
    pub sell_value: Decimal,
}

#[derive(Debug)]
pub struct OrderLedger {
    orders: TimedMutex<HashMap<String, Order>>,
    account: Arc<AccountBook>,
    fills: Notify,
}

impl OrderLedger {
    pub fn new(account: Arc<AccountBook>) -> Self {
        Self {
            orders: TimedMutex::new("orders", HashMap::new()),
            account,
            fills: Notify::new(),
        }
    }

    pub fn account(&self) -> &Arc<AccountBook> {
        &self.account
    }

    /// Merge a partial update into the stored order.
    ///
    /// Returns the merged order, or `None` for an update without an id.
    pub async fn record_update(&self, update: OrderUpdate) -> TradeResult<Option<Order>> {
        self.record_update_at(update, Utc::now()).await
    }

    pub async fn record_update_at(
        &self,
        update: OrderUpdate,
        now: DateTime<Utc>,
    ) -> TradeResult<Option<Order>> {
        if update.order_id.is_empty() {
            error!(?update, "Order update without an order id ignored");
            return Ok(None);
        }

        let (merged, credit) = {
            let mut orders = self.orders.lock().await?;
            let order = orders
                .entry(update.order_id.clone())
                .or_insert_with(|| Order::new(&update.order_id, now));
            order.merge(&update);

            let credit = order.is_closed && !order.balance_added_back;
            if credit {
                order.balance_added_back = true;
            }
            (order.clone(), credit)
        };

        if credit {
            match (&merged.instrument, merged.side) {
                (Some(instrument), Some(side)) => {
                    self.account
                        .apply_closed(
                            instrument,
                            side,
                            merged.qty,
                            merged.dealt_qty,
                            merged.avg_price(),
                        )
                        .await?;
                }
                _ => error!(
                    order_id = %merged.order_id,
                    "Closed order has no instrument or side, account not credited"
                ),
            }
        }

        debug!(
            order_id = %merged.order_id,
            dealt_qty = %merged.dealt_qty,
            is_closed = merged.is_closed,
            "Order update merged"
        );

        if merged.is_closed && !merged.is_settled {
            self.fills.notify_one();
        }
        Ok(Some(merged))
    }

    /// Record an order the engine has just submitted.
    pub async fn record_placed(&self, order_id: &str, request: &OrderRequest) -> TradeResult<Order> {
        let update = OrderUpdate::new(order_id)
            .instrument(&request.instrument)
            .side(request.side)
            .qty(request.qty)
            .price(request.price);
        let merged = self.record_update(update).await?;
        info!(
            %order_id,
            instrument = %request.instrument,
            side = %request.side,
            qty = %request.qty,
            price = %request.price,
            market = request.is_market,
            "Order placed"
        );
        merged.ok_or_else(|| crate::error::TradeError::OrderLost(order_id.to_string()))
    }

    /// Mark an order as handed to its strategy. Settled orders are closed.
    pub async fn mark_settled(&self, order_id: &str) -> TradeResult<()> {
        let mut orders = self.orders.lock().await?;
        if let Some(order) = orders.get_mut(order_id) {
            order.is_settled = true;
            order.is_closed = true;
        }
        Ok(())
    }

    pub async fn get(&self, order_id: &str) -> TradeResult<Option<Order>> {
        Ok(self.orders.lock().await?.get(order_id).cloned())
    }

    /// Orders not yet closed, limited to `instruments` unless it is empty.
    pub async fn open_orders(&self, instruments: &[String]) -> TradeResult<Vec<Order>> {
        let orders = self.orders.lock().await?;
        let mut open: Vec<Order> = orders
            .values()
            .filter(|o| !o.is_closed && matches_instruments(o, instruments))
            .cloned()
            .collect();
        open.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.order_id.cmp(&b.order_id)));
        Ok(open)
    }

    /// Unsettled orders grouped by instrument, oldest first.
    pub async fn unsettled_by_instrument(
        &self,
        instruments: &[String],
    ) -> TradeResult<BTreeMap<String, Vec<Order>>> {
        let orders = self.orders.lock().await?;
        let mut grouped: BTreeMap<String, Vec<Order>> = BTreeMap::new();
        for order in orders.values() {
            if order.is_settled || !matches_instruments(order, instruments) {
                continue;
            }
            if let Some(instrument) = &order.instrument {
                grouped.entry(instrument.clone()).or_default().push(order.clone());
            }
        }
        for list in grouped.values_mut() {
            list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.order_id.cmp(&b.order_id)));
        }
        Ok(grouped)
    }

    pub async fn has_unsettled(&self) -> TradeResult<bool> {
        Ok(self.orders.lock().await?.values().any(|o| !o.is_settled))
    }

    pub async fn clear(&self) -> TradeResult<()> {
        self.orders.lock().await?.clear();
        Ok(())
    }

    pub async fn dealt_summary(&self) -> TradeResult<BTreeMap<String, DealtSummary>> {
        let orders = self.orders.lock().await?;
        let mut summary: BTreeMap<String, DealtSummary> = BTreeMap::new();
        for order in orders.values() {
            let (Some(instrument), Some(side)) = (&order.instrument, order.side) else {
                continue;
            };
            if order.dealt_qty <= Decimal::ZERO {
                continue;
            }
            let entry = summary.entry(instrument.clone()).or_default();
            let value = order.dealt_qty * order.avg_price();
            match side {
                OrderSide::Buy => {
                    entry.buy_qty += order.dealt_qty;
                    entry.buy_value += value;
                }
                OrderSide::Sell => {
                    entry.sell_qty += order.dealt_qty;
                    entry.sell_value += value;
                }
            }
        }
        Ok(summary)
    }

    /// Wake the scheduler so it stops waiting on a dead connection.
    pub fn notify_connection_closed(&self) {
        info!("Broker connection closed, waking fill waiter");
        self.fills.notify_one();
    }

    /// Park until a fill or disconnect arrives, or `timeout` elapses.
    ///
    /// A wake-up sent while nobody was waiting is kept and consumed by the
    /// next call. Returns whether a wake-up arrived.
    pub async fn wait_for_fill(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.fills.notified())
            .await
            .is_ok()
    }
}

fn matches_instruments(order: &Order, instruments: &[String]) -> bool {
    instruments.is_empty()
        || order
            .instrument
            .as_ref()
            .map(|i| instruments.contains(i))
            .unwrap_or(false)
}
