//! Broker-neutral account, quote and order types.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn is_buy(&self) -> bool {
        matches!(self, OrderSide::Buy)
    }

    pub fn from_is_buy(is_buy: bool) -> Self {
        if is_buy {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        }
    }

    /// Grid cursor movement after a fill on this side.
    pub fn cursor_step(&self) -> i64 {
        match self {
            OrderSide::Buy => -1,
            OrderSide::Sell => 1,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Market snapshot for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub last: Decimal,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    /// Price tick
    pub spread: Decimal,
    pub lot_size: Decimal,
    pub suspended: bool,
}

impl Quote {
    pub fn new(last: Decimal, spread: Decimal, lot_size: Decimal) -> Self {
        Self {
            last,
            bid: None,
            ask: None,
            spread,
            lot_size,
            suspended: false,
        }
    }

    pub fn with_book(mut self, bid: Decimal, ask: Decimal) -> Self {
        self.bid = Some(bid);
        self.ask = Some(ask);
        self
    }
}

/// Position in one instrument as reported by the broker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub qty: Decimal,
    pub cost_price: Decimal,
}

/// Account state as reported by the broker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountSnapshot {
    pub balance: Decimal,
    pub buying_power: Decimal,
    pub total_assets: Decimal,
    pub holdings: HashMap<String, Holding>,
}

/// New order request.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub instrument: String,
    pub side: OrderSide,
    pub qty: Decimal,
    pub price: Decimal,
    pub is_market: bool,
}

impl OrderRequest {
    pub fn limit(instrument: &str, side: OrderSide, qty: Decimal, price: Decimal) -> Self {
        Self {
            instrument: instrument.to_string(),
            side,
            qty,
            price,
            is_market: false,
        }
    }

    pub fn market(instrument: &str, side: OrderSide, qty: Decimal, price: Decimal) -> Self {
        Self {
            is_market: true,
            ..Self::limit(instrument, side, qty, price)
        }
    }
}

/// Partial order state from a query or a broker callback.
///
/// `None` fields leave the ledger's stored value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderUpdate {
    pub order_id: String,
    pub instrument: Option<String>,
    pub side: Option<OrderSide>,
    pub qty: Option<Decimal>,
    pub price: Option<Decimal>,
    pub dealt_qty: Option<Decimal>,
    pub dealt_avg_price: Option<Decimal>,
    pub is_closed: Option<bool>,
}

impl OrderUpdate {
    pub fn new(order_id: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            ..Self::default()
        }
    }

    pub fn instrument(mut self, instrument: &str) -> Self {
        self.instrument = Some(instrument.to_string());
        self
    }

    pub fn side(mut self, side: OrderSide) -> Self {
        self.side = Some(side);
        self
    }

    pub fn qty(mut self, qty: Decimal) -> Self {
        self.qty = Some(qty);
        self
    }

    pub fn price(mut self, price: Decimal) -> Self {
        self.price = Some(price);
        self
    }

    pub fn dealt(mut self, qty: Decimal, avg_price: Decimal) -> Self {
        self.dealt_qty = Some(qty);
        self.dealt_avg_price = Some(avg_price);
        self
    }

    pub fn closed(mut self, is_closed: bool) -> Self {
        self.is_closed = Some(is_closed);
        self
    }
}
