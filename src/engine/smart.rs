//! Segmented market orders that wait for each slice to fill.

use rand::Rng;
use rust_decimal::Decimal;
use std::time::Duration;
use tracing::{error, info, warn};

use super::TradeEngine;
use crate::error::{TradeError, TradeResult};
use crate::exchange::OrderSide;
use crate::utils::decimal::{from_f64, round_down_to_lot, safe_div, to_duration};

/// Consecutive unfilled slices before giving up.
const MAX_NOT_DEALT: u32 = 3;
const LAST_SLICE_WAIT_SECS: u64 = 10;

impl TradeEngine {
    /// Work `volume` through the market in slices of roughly
    /// `smart_amount_segment` notional, waiting for each to fill.
    ///
    /// Returns `(balance_delta, holdings_delta)`, signed from the account's
    /// point of view.
    pub async fn smart_market_order(
        &self,
        code: &str,
        side: OrderSide,
        volume: Decimal,
    ) -> TradeResult<(Decimal, Decimal)> {
        let quote = self.quote(code).await?;
        let mut last = quote.as_ref().map(|q| q.last).unwrap_or(Decimal::ZERO);
        let lot = quote
            .as_ref()
            .map(|q| q.lot_size)
            .filter(|l| *l > Decimal::ZERO)
            .unwrap_or(Decimal::ONE);
        let initial_qty = self.account().holding_qty(code).await?;

        info!(%code, %side, %volume, %initial_qty, %last, %lot, "Smart market order started");
        if volume < lot {
            warn!(%code, %volume, %lot, "Smart market order below one lot");
            return Ok((Decimal::ZERO, Decimal::ZERO));
        }

        let volume = round_down_to_lot(volume, lot);
        let mut segment = self.segment_size(last, lot);
        let mut dealt_sum = Decimal::ZERO;
        let mut dealt_value = Decimal::ZERO;
        let mut not_dealt = 0;

        while dealt_sum < volume {
            let slice = segment.min(volume - dealt_sum);
            let Some(order_id) = self.place_market(code, side, slice).await? else {
                break;
            };

            let wait = if dealt_sum + slice < volume {
                let jitter = from_f64(rand::thread_rng().gen_range(0.5..1.5));
                let minutes = self.config.smart_wait_minutes * jitter * safe_div(slice, segment);
                Duration::from_secs(30) + to_duration((Decimal::from(60) * minutes).round())
            } else {
                Duration::from_secs(LAST_SLICE_WAIT_SECS)
            };
            info!(%code, %order_id, %slice, %segment, %dealt_sum, wait_secs = wait.as_secs(), "Waiting for slice");
            tokio::time::sleep(wait).await;

            let mut order = self.query_order(&order_id).await?;
            if !order.is_closed {
                not_dealt += 1;
                if let Err(e) = self.cancel_order(&order_id).await {
                    warn!(%order_id, error = %e, "Slice cancel failed");
                }
                order = self.query_order(&order_id).await?;
                warn!(%code, %order_id, closed = order.is_closed, "Slice did not fill in time");
            }
            if !order.is_closed {
                error!(%code, %order_id, "Slice still open after cancel");
                return Err(TradeError::OrderLost(order_id));
            }

            dealt_sum += order.dealt_qty;
            dealt_value += order.dealt_qty * order.avg_price();
            self.ledger.mark_settled(&order_id).await?;
            if last == Decimal::ZERO {
                last = order.avg_price();
                segment = self.segment_size(last, lot);
            }
            if not_dealt >= MAX_NOT_DEALT {
                warn!(%code, not_dealt, "Smart market order aborted");
                break;
            }
        }

        let (balance_delta, holdings_delta) = match side {
            OrderSide::Buy => (-dealt_value, dealt_sum),
            OrderSide::Sell => (dealt_value, -dealt_sum),
        };

        let account = self.refresh_account().await?;
        let observed = account.holding_qty(code) - initial_qty;
        if (observed - holdings_delta).abs() > Decimal::ONE {
            error!(
                %code,
                expected = %holdings_delta,
                %observed,
                "Smart market order holdings mismatch"
            );
        }
        info!(%code, %side, %volume, %dealt_sum, %balance_delta, "Smart market order finished");
        Ok((balance_delta, holdings_delta))
    }

    fn segment_size(&self, last: Decimal, lot: Decimal) -> Decimal {
        if last <= Decimal::ZERO {
            return lot;
        }
        let lots = safe_div(self.config.smart_amount_segment, last * lot).round();
        lot.max(lot * lots)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::paper_engine;
    use super::*;
    use crate::exchange::TradingGateway;
    use rust_decimal_macros::dec;

    #[tokio::test(start_paused = true)]
    async fn test_below_one_lot_does_nothing() {
        let (engine, _gw) = paper_engine().await;
        let (b, h) = engine
            .smart_market_order("US.AAPL", OrderSide::Buy, dec!(0.4))
            .await
            .unwrap();
        assert_eq!((b, h), (Decimal::ZERO, Decimal::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_buy_in_slices() {
        let (mut engine, gw) = paper_engine().await;
        engine.config.smart_amount_segment = dec!(1000);

        let (balance, holdings) = engine
            .smart_market_order("US.AAPL", OrderSide::Buy, dec!(25))
            .await
            .unwrap();
        assert_eq!(holdings, dec!(25));
        assert_eq!(balance, dec!(-2500));

        let snapshot = gw.account_snapshot().await.unwrap();
        assert_eq!(snapshot.holdings["US.AAPL"].qty, dec!(25));
        // every slice is handed off as settled
        assert!(!engine.ledger().has_unsettled().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sell_returns_signed_deltas() {
        let (engine, gw) = paper_engine().await;
        engine
            .smart_market_order("US.AAPL", OrderSide::Buy, dec!(10))
            .await
            .unwrap();
        gw.set_price("US.AAPL", dec!(110)).await;
        engine.refresh_quotes().await.unwrap();

        let (balance, holdings) = engine
            .smart_market_order("US.AAPL", OrderSide::Sell, dec!(4))
            .await
            .unwrap();
        assert_eq!(holdings, dec!(-4));
        assert_eq!(balance, dec!(440));
    }

    #[tokio::test]
    async fn test_segment_size() {
        let (engine, _gw) = paper_engine().await;
        assert_eq!(engine.segment_size(dec!(100), dec!(1)), dec!(100));
        assert_eq!(engine.segment_size(dec!(350), dec!(100)), dec!(100));
        assert_eq!(engine.segment_size(Decimal::ZERO, dec!(100)), dec!(100));
    }
}
