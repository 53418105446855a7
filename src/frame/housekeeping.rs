//! Periodic account housekeeping outside the strategy pool.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{debug, info};

use super::orchestrator::Orchestrator;
use super::tolerate;
use crate::error::TradeResult;
use crate::exchange::OrderSide;

/// Share of one segment sold per housekeeping pass.
const SELLOUT_SEGMENT_SHARE: Decimal = dec!(0.99);

impl Orchestrator {
    /// Sell-down and default-instrument passes. Returns whether anything
    /// traded, in which case the caller saves a snapshot.
    pub async fn housekeeping(&mut self) -> TradeResult<bool> {
        let mut did = false;
        if self.engine.config().sellout_other_holdings {
            did |= tolerate(self.sellout_other().await, "sellout_other")?.unwrap_or(false);
        }
        did |= tolerate(self.run_default_instrument().await, "run_default_instrument")?.unwrap_or(false);
        Ok(did)
    }

    /// Work holdings outside the pool (and not the default instrument) out
    /// of the account, one segment per pass.
    pub async fn sellout_other(&mut self) -> TradeResult<bool> {
        let account = self.engine.account().snapshot().await?;
        let pool = self.engine.pool().to_vec();
        let default = self.engine.config().default_instrument.clone();
        let segment = self.engine.config().smart_amount_segment;
        let max_amount = segment * self.config.frame.max_amount_multiplier;
        let max_count = self.config.frame.max_orders_in_24h;
        let gateway = Arc::clone(self.engine.gateway());

        let mut others: Vec<(String, Decimal)> = account
            .holdings
            .iter()
            .filter(|(code, h)| {
                h.qty > Decimal::ZERO && !pool.contains(*code) && default.as_ref() != Some(*code)
            })
            .map(|(code, h)| (code.clone(), h.qty))
            .collect();
        others.sort();

        let mut did = false;
        for (code, qty) in others {
            for order in self.engine.ledger().open_orders(std::slice::from_ref(&code)).await? {
                self.cancel_quietly(&order.order_id).await?;
            }

            if gateway.is_continuous_bidding(&code) {
                let last = self
                    .engine
                    .quote(&code)
                    .await?
                    .map(|q| q.last)
                    .unwrap_or(Decimal::ZERO);
                let sell_qty = if last > Decimal::ZERO {
                    (SELLOUT_SEGMENT_SHARE * segment / last).min(qty)
                } else {
                    qty
                };
                info!(%code, held = %qty, %sell_qty, %last, "Selling out holding outside the pool");
                if self
                    .limiter
                    .check(&code, OrderSide::Sell, sell_qty * last, max_amount, max_count)
                {
                    self.engine
                        .smart_market_order(&code, OrderSide::Sell, sell_qty)
                        .await?;
                }
            }
            did = true;
        }
        Ok(did)
    }

    /// Keep buying power inside `[balance_reserved_min, balance_reserved_max]`
    /// by trading the default instrument toward the middle of the band.
    pub async fn run_default_instrument(&mut self) -> TradeResult<bool> {
        let cfg = self.engine.config().clone();
        let Some(code) = cfg.default_instrument.clone().filter(|_| cfg.default_instrument_autorun) else {
            return Ok(false);
        };
        let (min, max) = (cfg.balance_reserved_min, cfg.balance_reserved_max);
        if min <= Decimal::ZERO || max <= Decimal::ZERO {
            return Ok(false);
        }
        if !self.engine.gateway().is_continuous_bidding(&code) {
            debug!(%code, "Default instrument not in continuous bidding");
            return Ok(false);
        }

        let account = self.engine.refresh_account().await?;
        let power = account.buying_power;
        let mid = (min + max) / dec!(2);
        let segment = cfg.smart_amount_segment;

        let (side, amount) = if power > max {
            (OrderSide::Buy, segment.min(power - mid))
        } else if power < min {
            (OrderSide::Sell, segment.min(mid - power))
        } else {
            debug!(%code, %power, %min, %max, "Buying power inside the reserved band");
            return Ok(false);
        };

        let last = self
            .engine
            .quote(&code)
            .await?
            .map(|q| q.last)
            .unwrap_or(Decimal::ZERO);
        let volume = if last > Decimal::ZERO {
            amount / last
        } else {
            Decimal::ONE
        };
        info!(%code, %side, %power, %amount, %volume, %last, "Rebalancing the default instrument");

        let max_amount = segment * self.config.frame.max_amount_multiplier;
        if !self
            .limiter
            .check(&code, side, amount, max_amount, self.config.frame.max_orders_in_24h)
        {
            return Ok(false);
        }
        let (balance_delta, holdings_delta) = self.engine.smart_market_order(&code, side, volume).await?;
        debug!(%code, %balance_delta, %holdings_delta, "Default instrument rebalanced");
        Ok(balance_delta != Decimal::ZERO)
    }
}
