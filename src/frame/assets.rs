//! Asset accounting: what each strategy owns, what it is worth, and the
//! snapshot a restart resumes from.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error, info, warn};

use super::orchestrator::{FrameStats, Orchestrator};
use crate::error::{TradeError, TradeResult};
use crate::exchange::Quote;
use crate::orders::AccountState;
use crate::persistence::{InstrumentRecord, RunSnapshot, TotalRecord};
use crate::strategy::{StrategyEngine, StrategyStatus};
use crate::utils::decimal::safe_div;

/// Minimum spacing between two daily reports.
const REPORT_INTERVAL_HOURS: i64 = 17;

/// Current assets of one pool instrument.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InstrumentAssets {
    pub balance: Decimal,
    pub holdings: Decimal,
    pub last_price: Decimal,
    pub start_price: Decimal,
    pub invest: Decimal,
    pub invest_now_value: Decimal,
}

/// Pool-wide view used for sizing, logging and snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AssetSummary {
    pub instruments: BTreeMap<String, InstrumentAssets>,
    /// Configured capital plus every strategy's gain or loss.
    pub invest_total_now_value: Decimal,
    /// Pool holdings at broker quantities and current quotes.
    pub holdings_value: Decimal,
}

impl AssetSummary {
    /// Assets as tracked by the live strategies, valued at current quotes.
    pub fn from_live(
        pool: &[String],
        strategies: &HashMap<String, Box<dyn StrategyEngine>>,
        quotes: &HashMap<String, Quote>,
        account: &AccountState,
        invest_total: Decimal,
    ) -> Self {
        let mut instruments = BTreeMap::new();
        for code in pool {
            let Some(strategy) = strategies.get(code) else {
                continue;
            };
            if strategy.status() == StrategyStatus::Closed {
                continue;
            }
            let last_price = quote_last(quotes, code)
                .filter(|p| *p > Decimal::ZERO)
                .unwrap_or_else(|| strategy.last_price());
            instruments.insert(
                code.clone(),
                InstrumentAssets {
                    balance: strategy.balance(),
                    holdings: strategy.holdings(),
                    last_price,
                    start_price: strategy.start_price(),
                    invest: strategy.invest(),
                    invest_now_value: strategy.balance() + strategy.holdings() * last_price,
                },
            );
        }
        Self::summarize(pool, instruments, quotes, account, invest_total)
    }

    /// Assets as last saved. Records without a price take the quote.
    pub fn from_saved(
        pool: &[String],
        saved: Option<&RunSnapshot>,
        quotes: &HashMap<String, Quote>,
        account: &AccountState,
        invest_total: Decimal,
    ) -> Self {
        let mut instruments = BTreeMap::new();
        if let Some(saved) = saved {
            for code in pool {
                let Some(record) = saved.instruments.get(code) else {
                    continue;
                };
                let last_price = if record.last_price > Decimal::ZERO {
                    record.last_price
                } else {
                    quote_last(quotes, code).unwrap_or(Decimal::ZERO)
                };
                instruments.insert(
                    code.clone(),
                    InstrumentAssets {
                        balance: record.balance,
                        holdings: record.holdings,
                        last_price,
                        start_price: record.start_price,
                        invest: record.invest,
                        invest_now_value: record.balance + record.holdings * last_price,
                    },
                );
            }
        }
        Self::summarize(pool, instruments, quotes, account, invest_total)
    }

    fn summarize(
        pool: &[String],
        instruments: BTreeMap<String, InstrumentAssets>,
        quotes: &HashMap<String, Quote>,
        account: &AccountState,
        invest_total: Decimal,
    ) -> Self {
        let gains: Decimal = instruments
            .values()
            .map(|a| a.invest_now_value - a.invest)
            .sum();
        let holdings_value = pool
            .iter()
            .map(|code| account.holding_qty(code) * quote_last(quotes, code).unwrap_or(Decimal::ZERO))
            .sum();
        Self {
            instruments,
            invest_total_now_value: invest_total + gains,
            holdings_value,
        }
    }

    pub fn last_price(&self, code: &str) -> Option<Decimal> {
        self.instruments.get(code).map(|a| a.last_price)
    }
}

fn quote_last(quotes: &HashMap<String, Quote>, code: &str) -> Option<Decimal> {
    quotes.get(code).map(|q| q.last)
}

/// Half the instrument's own move: what a 50/50 buy-and-hold would return.
fn half_benchmark(last: Decimal, start: Decimal) -> Decimal {
    (safe_div(last, start) - Decimal::ONE) * dec!(0.5) + Decimal::ONE
}

/// Per-instrument section of the daily report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstrumentReport {
    pub code: String,
    pub balance: Decimal,
    pub holdings: Decimal,
    pub last_price: Decimal,
    pub invest: Decimal,
    pub now_value: Decimal,
    pub profit: Decimal,
    pub buy_qty: Decimal,
    pub buy_value: Decimal,
    pub sell_qty: Decimal,
    pub sell_value: Decimal,
}

/// End-of-session summary, logged as one JSON line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyReport {
    pub run_key: String,
    pub generated_at: DateTime<Utc>,
    pub invest_total: Decimal,
    pub invest_total_now_value: Decimal,
    pub strategy_profit: Decimal,
    pub total_assets: Decimal,
    pub buying_power: Decimal,
    pub holdings_value: Decimal,
    pub instruments: Vec<InstrumentReport>,
    pub stats: FrameStats,
}

impl Orchestrator {
    /// Assets of the running strategies at the cached quotes.
    pub async fn load_assets(&self) -> TradeResult<AssetSummary> {
        let account = self.engine.account().snapshot().await?;
        let quotes = self.engine.quotes().await?;
        let invest_total = self.engine.config().invest_total;
        if self.is_initialized() {
            Ok(AssetSummary::from_live(self.engine.pool(), &self.strategies, &quotes, &account, invest_total))
        } else {
            let saved = self.load_saved()?;
            Ok(AssetSummary::from_saved(self.engine.pool(), saved.as_ref(), &quotes, &account, invest_total))
        }
    }

    /// Persist every pool strategy plus the TOTAL record.
    ///
    /// Returns `false` without writing unless every pool strategy is at
    /// least half-open.
    pub async fn save_assets(&mut self) -> TradeResult<bool> {
        if !self.is_initialized() {
            debug!("Not initialized, nothing to save");
            return Ok(false);
        }
        let pool = self.engine.pool().to_vec();
        let ready = pool.iter().all(|code| {
            self.strategies
                .get(code)
                .is_some_and(|s| s.status() != StrategyStatus::Closed)
        });
        if !ready {
            warn!("Some pool strategies are closed, snapshot not saved");
            return Ok(false);
        }

        let account = self.engine.account().snapshot().await?;
        let quotes = self.engine.quotes().await?;
        let engine_cfg = self.engine.config().clone();
        let invest_total = engine_cfg.invest_total;

        let mut instruments = BTreeMap::new();
        for code in &pool {
            let Some(strategy) = self.strategies.get(code) else {
                continue;
            };
            let last = strategy.last_price();
            let holdings_value = strategy.holdings() * last;
            let now_value = strategy.balance() + holdings_value;
            let cost_price = account
                .holdings
                .get(code)
                .map(|h| h.cost_price)
                .unwrap_or(Decimal::ZERO);
            instruments.insert(
                code.clone(),
                InstrumentRecord {
                    balance: strategy.balance(),
                    holdings: strategy.holdings(),
                    last_price: last,
                    cost_price,
                    start_price: strategy.start_price(),
                    invest_ratio: strategy.invest_ratio().unwrap_or(Decimal::ZERO),
                    invest: strategy.invest(),
                    invest_now_value: now_value.round_dp(2),
                    holdings_value: holdings_value.round_dp(2),
                    profit: safe_div(now_value, strategy.invest()).round_dp(4),
                    profit_benchmark: half_benchmark(last, strategy.start_price()).round_dp(4),
                },
            );
        }

        let assets = AssetSummary::from_live(&pool, &self.strategies, &quotes, &account, invest_total);
        let itnv = assets.invest_total_now_value;
        let assets_minus_extra = account.total_assets - engine_cfg.balance_extra;

        let default_code = engine_cfg.default_instrument.clone();
        let (default_qty, default_cost) = default_code
            .as_deref()
            .and_then(|c| account.holdings.get(c))
            .map(|h| (h.qty, h.cost_price))
            .unwrap_or((Decimal::ZERO, Decimal::ZERO));
        let default_last = default_code
            .as_deref()
            .and_then(|c| quote_last(&quotes, c))
            .unwrap_or(Decimal::ZERO);
        let default_start = engine_cfg.default_instrument_start_price;
        let profit_benchmark = if default_last > Decimal::ZERO {
            safe_div(default_last, default_start)
        } else {
            Decimal::ONE
        };

        let total = TotalRecord {
            profit_total: safe_div(assets_minus_extra, invest_total).round_dp(4),
            profit_benchmark: profit_benchmark.round_dp(4),
            invest_total,
            assets_minus_extra: assets_minus_extra.round_dp(2),
            assets_from_engine: account.total_assets.round_dp(2),
            buying_power: account.buying_power.round_dp(2),
            holdings_value: assets.holdings_value.round_dp(2),
            invest_total_now_value: itnv.round_dp(2),
            strategy_profit: safe_div(itnv, invest_total).round_dp(4),
            balance_extra: engine_cfg.balance_extra,
            others_profit: (assets_minus_extra - itnv).round_dp(2),
            default_instrument: default_code,
            default_autorun: engine_cfg.default_instrument_autorun,
            default_qty,
            default_last_price: default_last,
            default_cost_price: default_cost,
            default_start_price: default_start,
            default_now_value: (default_qty * default_last).round_dp(2),
            default_profit: safe_div(default_last, default_start).round_dp(4),
        };

        let snapshot = RunSnapshot {
            instruments,
            total: Some(total),
            saved_at: Utc::now(),
        };
        self.store
            .save_snapshot(&self.config.run_key(), &snapshot)
            .map_err(TradeError::Persistence)?;
        info!(
            run_key = %self.config.run_key(),
            invest_total_now_value = %itnv.round_dp(2),
            assets_minus_extra = %assets_minus_extra.round_dp(2),
            "Assets saved"
        );
        Ok(true)
    }

    /// Build the end-of-session report from live or saved assets.
    pub async fn daily_report(&self) -> TradeResult<DailyReport> {
        let assets = self.load_assets().await?;
        let account = self.engine.account().snapshot().await?;
        let dealt = self.engine.ledger().dealt_summary().await?;
        let invest_total = self.engine.config().invest_total;

        let instruments = assets
            .instruments
            .iter()
            .map(|(code, a)| {
                let d = dealt.get(code).cloned().unwrap_or_default();
                InstrumentReport {
                    code: code.clone(),
                    balance: a.balance.round_dp(2),
                    holdings: a.holdings,
                    last_price: a.last_price,
                    invest: a.invest,
                    now_value: a.invest_now_value.round_dp(2),
                    profit: safe_div(a.invest_now_value, a.invest).round_dp(4),
                    buy_qty: d.buy_qty,
                    buy_value: d.buy_value.round_dp(2),
                    sell_qty: d.sell_qty,
                    sell_value: d.sell_value.round_dp(2),
                }
            })
            .collect();

        Ok(DailyReport {
            run_key: self.config.run_key(),
            generated_at: Utc::now(),
            invest_total,
            invest_total_now_value: assets.invest_total_now_value.round_dp(2),
            strategy_profit: safe_div(assets.invest_total_now_value, invest_total).round_dp(4),
            total_assets: account.total_assets.round_dp(2),
            buying_power: account.buying_power.round_dp(2),
            holdings_value: assets.holdings_value.round_dp(2),
            instruments,
            stats: self.stats(),
        })
    }

    /// Log the daily report, at most once per 17 hours.
    pub async fn report_daily(&mut self) {
        let now = Utc::now();
        if let Some(last) = self.last_report_at {
            if now - last < chrono::Duration::hours(REPORT_INTERVAL_HOURS) {
                debug!(last_report_at = %last, "Daily report already sent");
                return;
            }
        }

        let report = match self.daily_report().await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Daily report unavailable");
                return;
            }
        };
        match serde_json::to_string(&report) {
            Ok(json) => info!(report = %json, "Daily report"),
            Err(e) => error!(error = %e, "Daily report could not be encoded"),
        }
        self.last_report_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::config;
    use crate::frame::orchestrator::tests::{paper_orchestrator, paper_orchestrator_with};
    use crate::persistence::SnapshotStore;
    use crate::exchange::{Holding, OrderRequest, OrderSide, TradingGateway};
    use crate::strategy::FillDelta;

    fn quotes(pairs: &[(&str, Decimal)]) -> HashMap<String, Quote> {
        pairs
            .iter()
            .map(|(c, p)| (c.to_string(), Quote::new(*p, dec!(0.01), Decimal::ONE)))
            .collect()
    }

    #[test]
    fn test_half_benchmark() {
        assert_eq!(half_benchmark(dec!(120), dec!(100)), dec!(1.1));
        assert_eq!(half_benchmark(dec!(80), dec!(100)), dec!(0.9));
        assert_eq!(half_benchmark(dec!(80), Decimal::ZERO), dec!(0.5));
    }

    #[test]
    fn test_from_saved_values_each_instrument() {
        let pool = vec!["US.AAPL".to_string(), "US.MSFT".to_string()];
        let mut instruments = BTreeMap::new();
        instruments.insert(
            "US.AAPL".to_string(),
            InstrumentRecord {
                balance: dec!(4000),
                holdings: dec!(10),
                last_price: dec!(110),
                invest: dec!(5000),
                ..InstrumentRecord::default()
            },
        );
        instruments.insert(
            "US.MSFT".to_string(),
            InstrumentRecord {
                balance: dec!(5000),
                holdings: dec!(2),
                invest: dec!(5000),
                ..InstrumentRecord::default()
            },
        );
        let saved = RunSnapshot {
            instruments,
            total: None,
            saved_at: Utc::now(),
        };
        let mut account = AccountState::default();
        account.holdings.insert(
            "US.AAPL".to_string(),
            Holding {
                qty: dec!(12),
                cost_price: dec!(95),
            },
        );

        let quotes = quotes(&[("US.AAPL", dec!(100)), ("US.MSFT", dec!(300))]);
        let summary = AssetSummary::from_saved(&pool, Some(&saved), &quotes, &account, dec!(10000));

        // saved price wins; missing price falls back to the quote
        assert_eq!(summary.last_price("US.AAPL"), Some(dec!(110)));
        assert_eq!(summary.last_price("US.MSFT"), Some(dec!(300)));
        assert_eq!(summary.instruments["US.AAPL"].invest_now_value, dec!(5100));
        assert_eq!(summary.instruments["US.MSFT"].invest_now_value, dec!(5600));
        assert_eq!(summary.invest_total_now_value, dec!(10700));
        assert_eq!(summary.holdings_value, dec!(1200));
    }

    #[test]
    fn test_from_saved_without_snapshot_is_empty() {
        let pool = vec!["US.AAPL".to_string()];
        let summary = AssetSummary::from_saved(&pool, None, &HashMap::new(), &AccountState::default(), dec!(10000));
        assert!(summary.instruments.is_empty());
        assert_eq!(summary.invest_total_now_value, dec!(10000));
    }

    #[tokio::test]
    async fn test_save_requires_every_strategy_ready() {
        let (mut orch, _gw, _s) = paper_orchestrator().await;
        assert!(!orch.save_assets().await.unwrap());

        orch.init().await.unwrap();
        assert!(orch.save_assets().await.unwrap());

        orch.strategies.get_mut("US.MSFT").unwrap().close();
        assert!(!orch.save_assets().await.unwrap());
    }

    #[tokio::test]
    async fn test_saved_totals() {
        let mut config = config();
        config.engine.balance_extra = dec!(1000);
        let (mut orch, gw, _s) = paper_orchestrator_with(config, SnapshotStore::in_memory().unwrap()).await;
        orch.init().await.unwrap();

        // AAPL strategy owns 10 shares bought at 100; price moves to 120
        gw.place_order(&OrderRequest::market("US.AAPL", OrderSide::Buy, dec!(10), dec!(100)))
            .await
            .unwrap();
        orch.strategies
            .get_mut("US.AAPL")
            .unwrap()
            .end_transact(&FillDelta::reconcile(dec!(120), dec!(-1000), dec!(10), Decimal::ONE))
            .unwrap();
        gw.set_price("US.AAPL", dec!(120)).await;
        orch.engine.refresh_account().await.unwrap();
        orch.engine.refresh_quotes().await.unwrap();

        assert!(orch.save_assets().await.unwrap());
        let saved = orch.load_saved().unwrap().unwrap();

        let aapl = &saved.instruments["US.AAPL"];
        assert_eq!(aapl.balance, dec!(4000));
        assert_eq!(aapl.holdings, dec!(10));
        assert_eq!(aapl.invest_now_value, dec!(5200));
        assert_eq!(aapl.profit, dec!(1.04));
        assert_eq!(aapl.cost_price, dec!(100));

        let total = saved.total.unwrap();
        // account: 9000 cash + 10 * 120
        assert_eq!(total.assets_from_engine, dec!(10200));
        assert_eq!(total.assets_minus_extra, dec!(9200));
        assert_eq!(total.invest_total_now_value, dec!(10200));
        assert_eq!(total.strategy_profit, dec!(1.02));
        assert_eq!(total.others_profit, dec!(-1000));
        assert_eq!(total.holdings_value, dec!(1200));
        assert_eq!(total.profit_benchmark, Decimal::ONE);
    }

    #[tokio::test]
    async fn test_daily_report_is_throttled() {
        let (mut orch, gw, _s) = paper_orchestrator().await;
        orch.init().await.unwrap();
        gw.place_order(&OrderRequest::market("US.AAPL", OrderSide::Buy, dec!(2), dec!(100)))
            .await
            .unwrap();

        let report = orch.daily_report().await.unwrap();
        assert_eq!(report.run_key, "CC.grid");
        let aapl = report.instruments.iter().find(|r| r.code == "US.AAPL").unwrap();
        assert_eq!(aapl.buy_qty, dec!(2));
        assert_eq!(aapl.buy_value, dec!(200));

        orch.report_daily().await;
        let first = orch.last_report_at.unwrap();
        orch.report_daily().await;
        assert_eq!(orch.last_report_at, Some(first));
    }
}
