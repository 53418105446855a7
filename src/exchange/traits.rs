//! Broker capability interface.
//!
//! The orchestrator and trade engine depend only on [`TradingGateway`]; a
//! concrete broker adapter (or the in-process [`PaperGateway`]) is injected
//! at startup.
//!
//! [`PaperGateway`]: super::PaperGateway

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;

use super::types::{AccountSnapshot, OrderRequest, OrderUpdate, Quote};
use crate::error::GatewayError;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TradingGateway: Send + Sync {
    async fn open_api(&self) -> Result<(), GatewayError>;

    async fn close_api(&self) -> Result<(), GatewayError>;

    fn is_connected(&self) -> bool;

    async fn account_snapshot(&self) -> Result<AccountSnapshot, GatewayError>;

    async fn market_snapshot(
        &self,
        instruments: &[String],
    ) -> Result<HashMap<String, Quote>, GatewayError>;

    /// Fresh quote for an instrument whose snapshot price was missing.
    async fn resolve_quote(&self, instrument: &str) -> Result<Quote, GatewayError>;

    /// Submit an order and return the broker's order id.
    async fn place_order(&self, order: &OrderRequest) -> Result<String, GatewayError>;

    async fn query_order(&self, order_id: &str) -> Result<OrderUpdate, GatewayError>;

    /// Every order the broker still has working.
    async fn open_orders(&self) -> Result<Vec<OrderUpdate>, GatewayError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError>;

    async fn cancel_all_orders(&self) -> Result<(), GatewayError>;

    /// Recent average price and relative volatility, zeros when unknown.
    async fn average_and_volatility(
        &self,
        instrument: &str,
    ) -> Result<(Decimal, Decimal), GatewayError>;

    fn can_place_order(&self, instrument: &str) -> bool;

    /// Some instrument of the pool accepts orders.
    fn market_open(&self) -> bool;

    fn is_continuous_bidding(&self, instrument: &str) -> bool;

    /// Every instrument of the pool is in continuous bidding.
    fn pool_continuous(&self) -> bool;

    /// Quotes are unreliable for this instrument right now.
    fn is_blind(&self, instrument: &str) -> bool;

    fn secs_to_open(&self) -> i64;

    fn secs_to_preopen_end(&self) -> i64;

    fn secs_to_afterhours_end(&self) -> i64;

    fn has_preopen(&self) -> bool;

    /// The trading day is over and the next run should start fresh.
    fn is_day_rollover(&self) -> bool;
}
