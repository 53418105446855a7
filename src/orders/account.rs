//! Cached broker account: cash, buying power and holdings.

use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::error::TradeResult;
use crate::exchange::{AccountSnapshot, Holding, OrderSide};
use crate::utils::TimedMutex;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountState {
    pub balance: Decimal,
    pub buying_power: Decimal,
    pub total_assets: Decimal,
    pub holdings: HashMap<String, Holding>,
}

impl AccountState {
    pub fn holding_qty(&self, instrument: &str) -> Decimal {
        self.holdings
            .get(instrument)
            .map(|h| h.qty)
            .unwrap_or(Decimal::ZERO)
    }
}

/// Account state shared between the scheduler and broker callbacks.
#[derive(Debug)]
pub struct AccountBook {
    inner: TimedMutex<AccountState>,
}

impl Default for AccountBook {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountBook {
    pub fn new() -> Self {
        Self {
            inner: TimedMutex::new("account", AccountState::default()),
        }
    }

    pub async fn snapshot(&self) -> TradeResult<AccountState> {
        Ok(self.inner.lock().await?.clone())
    }

    /// Replace everything with a fresh broker snapshot.
    pub async fn replace(&self, snapshot: &AccountSnapshot) -> TradeResult<()> {
        let mut state = self.inner.lock().await?;
        state.balance = snapshot.balance;
        state.buying_power = snapshot.buying_power;
        state.total_assets = snapshot.total_assets;
        state.holdings = snapshot.holdings.clone();
        debug!(
            balance = %state.balance,
            buying_power = %state.buying_power,
            total_assets = %state.total_assets,
            holdings = state.holdings.len(),
            "Account snapshot applied"
        );
        Ok(())
    }

    /// Book the outcome of a closed order.
    ///
    /// A buy releases the unfilled part of its reservation; a sell adds the
    /// proceeds to buying power.
    pub async fn apply_closed(
        &self,
        instrument: &str,
        side: OrderSide,
        qty: Decimal,
        dealt_qty: Decimal,
        avg_price: Decimal,
    ) -> TradeResult<()> {
        let mut state = self.inner.lock().await?;
        let dealt_value = dealt_qty * avg_price;
        match side {
            OrderSide::Buy => {
                state.buying_power += qty * avg_price - dealt_value;
                state.balance -= dealt_value;
                state.holdings.entry(instrument.to_string()).or_default().qty += dealt_qty;
            }
            OrderSide::Sell => {
                state.buying_power += dealt_value;
                state.balance += dealt_value;
                state.holdings.entry(instrument.to_string()).or_default().qty -= dealt_qty;
            }
        }
        info!(
            %instrument,
            %side,
            %dealt_qty,
            %avg_price,
            balance = %state.balance,
            buying_power = %state.buying_power,
            "Closed order booked"
        );
        Ok(())
    }

    /// Hold back buying power for a resting buy.
    pub async fn reserve_power(&self, amount: Decimal) -> TradeResult<()> {
        let mut state = self.inner.lock().await?;
        state.buying_power -= amount;
        Ok(())
    }

    pub async fn holding_qty(&self, instrument: &str) -> TradeResult<Decimal> {
        Ok(self.inner.lock().await?.holding_qty(instrument))
    }

    pub async fn buying_power(&self) -> TradeResult<Decimal> {
        Ok(self.inner.lock().await?.buying_power)
    }
}
