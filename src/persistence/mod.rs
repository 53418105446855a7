//! SQLite persistence for run snapshots.
//!
//! Persists what a restart needs to resume:
//! - Per-instrument strategy assets (balance, holdings, prices, invest)
//! - The aggregate TOTAL record of the last save
//! - Cached average/volatility per instrument
//!
//! Decimals are stored as text so they round-trip exactly.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Saved assets of one instrument's strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstrumentRecord {
    pub balance: Decimal,
    pub holdings: Decimal,
    pub last_price: Decimal,
    pub cost_price: Decimal,
    pub start_price: Decimal,
    pub invest_ratio: Decimal,
    pub invest: Decimal,
    pub invest_now_value: Decimal,
    pub holdings_value: Decimal,
    pub profit: Decimal,
    pub profit_benchmark: Decimal,
}

/// Portfolio-wide figures saved next to the instrument records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TotalRecord {
    pub profit_total: Decimal,
    pub profit_benchmark: Decimal,
    pub invest_total: Decimal,
    pub assets_minus_extra: Decimal,
    pub assets_from_engine: Decimal,
    pub buying_power: Decimal,
    pub holdings_value: Decimal,
    pub invest_total_now_value: Decimal,
    pub strategy_profit: Decimal,
    pub balance_extra: Decimal,
    pub others_profit: Decimal,
    pub default_instrument: Option<String>,
    pub default_autorun: bool,
    pub default_qty: Decimal,
    pub default_last_price: Decimal,
    pub default_cost_price: Decimal,
    pub default_start_price: Decimal,
    pub default_now_value: Decimal,
    pub default_profit: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    pub instruments: BTreeMap<String, InstrumentRecord>,
    pub total: Option<TotalRecord>,
    pub saved_at: DateTime<Utc>,
}

/// Cached auto-tuning inputs for one instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteStats {
    pub average: Decimal,
    pub volatility: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// SQLite-backed snapshot store. One database holds every run key.
pub struct SnapshotStore {
    conn: Mutex<Connection>,
}

impl SnapshotStore {
    /// Open (or create) the database, creating its directory if needed.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create data directory {:?}", dir))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!("Snapshot store opened at {:?}", path);
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("snapshot store connection lock poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS strategy_assets (
                run_key TEXT NOT NULL,
                code TEXT NOT NULL,
                balance TEXT NOT NULL,
                holdings TEXT NOT NULL,
                last_price TEXT NOT NULL,
                cost_price TEXT NOT NULL,
                start_price TEXT NOT NULL,
                invest_ratio TEXT NOT NULL,
                invest TEXT NOT NULL,
                invest_now_value TEXT NOT NULL,
                holdings_value TEXT NOT NULL,
                profit TEXT NOT NULL,
                profit_benchmark TEXT NOT NULL,
                PRIMARY KEY (run_key, code)
            );

            -- TOTAL record, one row per run key
            CREATE TABLE IF NOT EXISTS portfolio_totals (
                run_key TEXT PRIMARY KEY,
                saved_at TEXT NOT NULL,
                total_json TEXT
            );

            CREATE TABLE IF NOT EXISTS quote_stats (
                code TEXT PRIMARY KEY,
                average TEXT NOT NULL,
                volatility TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;
        debug!("Snapshot schema initialized");
        Ok(())
    }

    /// Replace everything saved under `run_key`.
    pub fn save_snapshot(&self, run_key: &str, snapshot: &RunSnapshot) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM strategy_assets WHERE run_key = ?1", params![run_key])?;
        for (code, rec) in &snapshot.instruments {
            tx.execute(
                r#"
                INSERT INTO strategy_assets (run_key, code, balance, holdings, last_price,
                                             cost_price, start_price, invest_ratio, invest,
                                             invest_now_value, holdings_value, profit,
                                             profit_benchmark)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                "#,
                params![
                    run_key,
                    code,
                    rec.balance.to_string(),
                    rec.holdings.to_string(),
                    rec.last_price.to_string(),
                    rec.cost_price.to_string(),
                    rec.start_price.to_string(),
                    rec.invest_ratio.to_string(),
                    rec.invest.to_string(),
                    rec.invest_now_value.to_string(),
                    rec.holdings_value.to_string(),
                    rec.profit.to_string(),
                    rec.profit_benchmark.to_string(),
                ],
            )?;
        }

        let total_json = snapshot
            .total
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to encode TOTAL record")?;
        tx.execute(
            r#"
            INSERT INTO portfolio_totals (run_key, saved_at, total_json)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(run_key) DO UPDATE SET saved_at = ?2, total_json = ?3
            "#,
            params![run_key, snapshot.saved_at.to_rfc3339(), total_json],
        )?;

        tx.commit()?;
        debug!(
            %run_key,
            instruments = snapshot.instruments.len(),
            "Snapshot saved"
        );
        Ok(())
    }

    pub fn load_snapshot(&self, run_key: &str) -> Result<Option<RunSnapshot>> {
        let conn = self.conn()?;
        let header: Option<(String, Option<String>)> = conn
            .query_row(
                "SELECT saved_at, total_json FROM portfolio_totals WHERE run_key = ?1",
                params![run_key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((saved_at, total_json)) = header else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            r#"
            SELECT code, balance, holdings, last_price, cost_price, start_price, invest_ratio,
                   invest, invest_now_value, holdings_value, profit, profit_benchmark
            FROM strategy_assets WHERE run_key = ?1
            "#,
        )?;
        let instruments: BTreeMap<String, InstrumentRecord> = stmt
            .query_map(params![run_key], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    InstrumentRecord {
                        balance: parse_decimal(&row.get::<_, String>(1)?),
                        holdings: parse_decimal(&row.get::<_, String>(2)?),
                        last_price: parse_decimal(&row.get::<_, String>(3)?),
                        cost_price: parse_decimal(&row.get::<_, String>(4)?),
                        start_price: parse_decimal(&row.get::<_, String>(5)?),
                        invest_ratio: parse_decimal(&row.get::<_, String>(6)?),
                        invest: parse_decimal(&row.get::<_, String>(7)?),
                        invest_now_value: parse_decimal(&row.get::<_, String>(8)?),
                        holdings_value: parse_decimal(&row.get::<_, String>(9)?),
                        profit: parse_decimal(&row.get::<_, String>(10)?),
                        profit_benchmark: parse_decimal(&row.get::<_, String>(11)?),
                    },
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;

        let total = total_json
            .map(|json| serde_json::from_str::<TotalRecord>(&json))
            .transpose()
            .context("Corrupt TOTAL record")?;

        let snapshot = RunSnapshot {
            instruments,
            total,
            saved_at: parse_time(&saved_at),
        };
        info!(
            %run_key,
            instruments = snapshot.instruments.len(),
            saved_at = %snapshot.saved_at,
            "Loaded snapshot"
        );
        Ok(Some(snapshot))
    }

    pub fn save_quote_stats(&self, code: &str, stats: &QuoteStats) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO quote_stats (code, average, volatility, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(code) DO UPDATE SET average = ?2, volatility = ?3, updated_at = ?4
            "#,
            params![
                code,
                stats.average.to_string(),
                stats.volatility.to_string(),
                stats.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn load_quote_stats(&self, code: &str) -> Result<Option<QuoteStats>> {
        let row: Option<(String, String, String)> = self
            .conn()?
            .query_row(
                "SELECT average, volatility, updated_at FROM quote_stats WHERE code = ?1",
                params![code],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        Ok(row.map(|(average, volatility, updated_at)| QuoteStats {
            average: parse_decimal(&average),
            volatility: parse_decimal(&volatility),
            updated_at: parse_time(&updated_at),
        }))
    }
}

fn parse_decimal(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap_or_default()
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn snapshot() -> RunSnapshot {
        let mut instruments = BTreeMap::new();
        instruments.insert(
            "US.AAPL".to_string(),
            InstrumentRecord {
                balance: dec!(4987.123456),
                holdings: dec!(27),
                last_price: dec!(187.33),
                start_price: dec!(150),
                invest_ratio: dec!(0.5),
                invest: dec!(10000),
                invest_now_value: dec!(10045.03),
                ..Default::default()
            },
        );
        RunSnapshot {
            instruments,
            total: Some(TotalRecord {
                profit_total: dec!(1.0045),
                invest_total: dec!(20000),
                default_instrument: Some("US.SGOV".to_string()),
                ..Default::default()
            }),
            saved_at: Utc.with_ymd_and_hms(2024, 7, 1, 20, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_snapshot_round_trip_is_exact() {
        let store = SnapshotStore::in_memory().unwrap();
        store.save_snapshot("US.grid", &snapshot()).unwrap();

        let loaded = store.load_snapshot("US.grid").unwrap().unwrap();
        assert_eq!(loaded, snapshot());
        assert_eq!(loaded.instruments["US.AAPL"].balance, dec!(4987.123456));
    }

    #[test]
    fn test_missing_run_key() {
        let store = SnapshotStore::in_memory().unwrap();
        store.save_snapshot("US.grid", &snapshot()).unwrap();
        assert!(store.load_snapshot("US.shannon").unwrap().is_none());
    }

    #[test]
    fn test_save_replaces_previous_instruments() {
        let store = SnapshotStore::in_memory().unwrap();
        store.save_snapshot("US.grid", &snapshot()).unwrap();

        let mut next = snapshot();
        next.instruments.clear();
        next.instruments.insert("US.MSFT".to_string(), InstrumentRecord::default());
        next.total = None;
        store.save_snapshot("US.grid", &next).unwrap();

        let loaded = store.load_snapshot("US.grid").unwrap().unwrap();
        assert_eq!(loaded.instruments.len(), 1);
        assert!(loaded.instruments.contains_key("US.MSFT"));
        assert!(loaded.total.is_none());
    }

    #[test]
    fn test_quote_stats_upsert() {
        let store = SnapshotStore::in_memory().unwrap();
        assert!(store.load_quote_stats("HK.00700").unwrap().is_none());

        let at = Utc.with_ymd_and_hms(2024, 7, 1, 8, 0, 0).unwrap();
        let stats = QuoteStats {
            average: dec!(350.2),
            volatility: dec!(0.0123),
            updated_at: at,
        };
        store.save_quote_stats("HK.00700", &stats).unwrap();
        store
            .save_quote_stats(
                "HK.00700",
                &QuoteStats {
                    average: dec!(351),
                    ..stats.clone()
                },
            )
            .unwrap();

        let loaded = store.load_quote_stats("HK.00700").unwrap().unwrap();
        assert_eq!(loaded.average, dec!(351));
        assert_eq!(loaded.volatility, dec!(0.0123));
        assert_eq!(loaded.updated_at, at);
    }
}
