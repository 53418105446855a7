//! Configuration management for the trading controller.
//!
//! Loaded once at startup from an optional TOML file plus `TRADER__*`
//! environment variables and passed down explicitly.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::strategy::GridType;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Scheduling loop settings
    #[serde(default)]
    pub frame: FrameConfig,
    /// Account-wide capital and housekeeping settings
    #[serde(default)]
    pub engine: EngineConfig,
    /// Order placement modes shared by every strategy instance
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Simulated broker used for paper trading
    #[serde(default)]
    pub paper: PaperConfig,
    /// Instrument pool, in trading order
    #[serde(default = "default_instruments")]
    pub instruments: Vec<InstrumentConfig>,
}

/// Which strategy engine drives every instrument of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Grid,
    Shannon,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Grid => "grid",
            StrategyKind::Shannon => "shannon",
        }
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "grid" => Ok(StrategyKind::Grid),
            "shannon" => Ok(StrategyKind::Shannon),
            other => anyhow::bail!("unsupported strategy: {other}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameConfig {
    /// Market name, used as the persistence key together with the strategy
    #[serde(default = "default_market")]
    pub market: String,
    #[serde(default = "default_strategy")]
    pub strategy: StrategyKind,
    /// Base delay between cycles, randomized by ±20%
    #[serde(default = "default_loop_interval")]
    pub loop_interval_secs: u64,
    /// Housekeeping runs once every this many cycles
    #[serde(default = "default_other_handle_period")]
    pub other_handle_period: u64,
    /// Max order age for grid runs before it is cancelled
    #[serde(default = "default_max_wait_for_deal")]
    pub max_wait_secs_for_deal: u64,
    /// Housekeeping 24h notional cap, in multiples of the smart segment
    #[serde(default = "default_max_amount_multiplier")]
    pub max_amount_multiplier: Decimal,
    /// Max buy/sell count imbalance per instrument over 24h
    #[serde(default = "default_max_orders_in_24h")]
    pub max_orders_in_24h: usize,
    /// Sleep after a failed run before reconnecting
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    /// Pause after each wait-for-fill phase
    #[serde(default = "default_cycle_pause")]
    pub cycle_pause_secs: u64,
    /// Pause after a trading day is closed
    #[serde(default = "default_day_closed_pause")]
    pub day_closed_pause_secs: u64,
    /// Directory holding the snapshot database
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capital assigned to the whole pool
    #[serde(default = "default_invest_total")]
    pub invest_total: Decimal,
    /// Cash held outside the strategies, excluded from profit
    #[serde(default)]
    pub balance_extra: Decimal,
    /// Cash band for default-instrument rebalancing (-1 disables)
    #[serde(default = "default_disabled")]
    pub balance_reserved_min: Decimal,
    #[serde(default = "default_disabled")]
    pub balance_reserved_max: Decimal,
    #[serde(default)]
    pub default_instrument: Option<String>,
    #[serde(default)]
    pub default_instrument_autorun: bool,
    #[serde(default = "default_one")]
    pub default_instrument_start_price: Decimal,
    /// Sell down holdings outside the pool during housekeeping
    #[serde(default)]
    pub sellout_other_holdings: bool,
    /// Fee multiplier applied to buying-power checks
    #[serde(default = "default_engine_max_fees")]
    pub max_fees: Decimal,
    #[serde(default = "default_smart_wait_minutes")]
    pub smart_wait_minutes: Decimal,
    /// Notional per segment of a smart market order
    #[serde(default = "default_smart_amount_segment")]
    pub smart_amount_segment: Decimal,
    /// Refresh average/volatility at every init instead of every 12h
    #[serde(default)]
    pub always_refresh_stats: bool,
}

/// Strategy-wide placement modes. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Quote both sides passively around the equilibrium price
    #[serde(default)]
    pub be_lurker: bool,
    /// Quote one side passively at bid/ask ± spread
    #[serde(default)]
    pub be_maker: bool,
    #[serde(default = "default_max_wait_taker")]
    pub max_wait_secs_taker: u64,
    #[serde(default = "default_max_wait_maker")]
    pub max_wait_secs_maker: u64,
    #[serde(default = "default_max_wait_lurker")]
    pub max_wait_secs_lurker: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConfig {
    #[serde(default = "default_paper_cash")]
    pub initial_cash: Decimal,
    /// Seed prices as `code -> price`
    #[serde(default)]
    pub prices: Vec<PaperPrice>,
    /// Relative std-dev of each simulated price step
    #[serde(default = "default_paper_volatility")]
    pub step_volatility: Decimal,
    #[serde(default = "default_paper_tick")]
    pub tick_millis: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperPrice {
    pub code: String,
    pub price: Decimal,
    #[serde(default = "default_one")]
    pub lot_size: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Instrument code with market prefix, e.g. `US.AAPL`
    pub code: String,
    /// Absolute capital; wins over `invest_ratio`
    #[serde(default)]
    pub invest: Option<Decimal>,
    /// Share of `engine.invest_total`
    #[serde(default)]
    pub invest_ratio: Option<Decimal>,
    #[serde(default)]
    pub start_price: Option<Decimal>,
    #[serde(default)]
    pub mid_price: Option<Decimal>,
    #[serde(default = "default_true")]
    pub self_adaption_mid_price: bool,
    #[serde(default = "default_mid_price_max_deviation")]
    pub mid_price_max_deviation: Decimal,
    #[serde(default = "default_true")]
    pub self_adaption_threshold: bool,
    #[serde(default)]
    pub need_reposition: bool,
    #[serde(default = "default_one")]
    pub max_fees: Decimal,
    #[serde(default = "default_price_precision")]
    pub price_precision: u32,
    #[serde(default)]
    pub grid: GridParams,
    #[serde(default)]
    pub shannon: ShannonParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridParams {
    #[serde(default = "default_grid_count")]
    pub grid_count: u32,
    #[serde(default = "default_grid_min_price")]
    pub grid_min_price: Decimal,
    #[serde(default = "default_grid_max_price")]
    pub grid_max_price: Decimal,
    #[serde(default)]
    pub grid_type: GridType,
    #[serde(default = "default_geo_ratio")]
    pub geo_ratio: Decimal,
    #[serde(default = "default_arith_delta")]
    pub arith_delta: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShannonParams {
    #[serde(default = "default_threshold")]
    pub threshold: Decimal,
    /// Zero means "derive from the price band"
    #[serde(default)]
    pub base_price: Decimal,
    #[serde(default)]
    pub min_price: Decimal,
    #[serde(default)]
    pub max_price: Decimal,
    #[serde(default)]
    pub use_optimal_leverage: bool,
    #[serde(default = "default_base_leverage")]
    pub base_leverage: Decimal,
    #[serde(default = "default_mid_position")]
    pub mid_position: Decimal,
}

fn default_market() -> String {
    "CC".to_string()
}

fn default_strategy() -> StrategyKind {
    StrategyKind::Grid
}

fn default_loop_interval() -> u64 {
    60
}

fn default_other_handle_period() -> u64 {
    30
}

fn default_max_wait_for_deal() -> u64 {
    18000
}

fn default_max_amount_multiplier() -> Decimal {
    Decimal::new(10, 0)
}

fn default_max_orders_in_24h() -> usize {
    10
}

fn default_cooldown() -> u64 {
    900
}

fn default_cycle_pause() -> u64 {
    60
}

fn default_day_closed_pause() -> u64 {
    1800
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_invest_total() -> Decimal {
    Decimal::new(10000, 0)
}

fn default_disabled() -> Decimal {
    Decimal::NEGATIVE_ONE
}

fn default_one() -> Decimal {
    Decimal::ONE
}

fn default_true() -> bool {
    true
}

fn default_engine_max_fees() -> Decimal {
    Decimal::new(1005, 3) // 1.005
}

fn default_smart_wait_minutes() -> Decimal {
    Decimal::new(5, 0)
}

fn default_smart_amount_segment() -> Decimal {
    Decimal::new(10000, 0)
}

fn default_max_wait_taker() -> u64 {
    300
}

fn default_max_wait_maker() -> u64 {
    600
}

fn default_max_wait_lurker() -> u64 {
    18000
}

fn default_paper_cash() -> Decimal {
    Decimal::new(10000, 0)
}

fn default_paper_volatility() -> Decimal {
    Decimal::new(2, 3) // 0.2% per tick
}

fn default_paper_tick() -> u64 {
    1000
}

fn default_mid_price_max_deviation() -> Decimal {
    Decimal::new(5, 0)
}

fn default_price_precision() -> u32 {
    2
}

fn default_grid_count() -> u32 {
    10
}

fn default_grid_min_price() -> Decimal {
    Decimal::new(300, 0)
}

fn default_grid_max_price() -> Decimal {
    Decimal::new(500, 0)
}

fn default_geo_ratio() -> Decimal {
    Decimal::new(6, 1) // 0.6
}

fn default_arith_delta() -> Decimal {
    Decimal::new(-12, 2) // -0.12
}

fn default_threshold() -> Decimal {
    Decimal::new(5, 3) // 0.005
}

fn default_base_leverage() -> Decimal {
    Decimal::new(20, 0)
}

fn default_mid_position() -> Decimal {
    Decimal::new(5, 1) // 0.5
}

fn default_instruments() -> Vec<InstrumentConfig> {
    vec![InstrumentConfig::new("CC.DEMO", Some(Decimal::ONE))]
}

impl InstrumentConfig {
    /// Instrument with every tunable at its default.
    pub fn new(code: &str, invest_ratio: Option<Decimal>) -> Self {
        Self {
            code: code.to_string(),
            invest: None,
            invest_ratio,
            start_price: None,
            mid_price: None,
            self_adaption_mid_price: true,
            mid_price_max_deviation: default_mid_price_max_deviation(),
            self_adaption_threshold: true,
            need_reposition: false,
            max_fees: Decimal::ONE,
            price_precision: default_price_precision(),
            grid: GridParams::default(),
            shannon: ShannonParams::default(),
        }
    }

    /// Capital assigned to this instrument.
    pub fn resolve_invest(&self, invest_total: Decimal) -> Decimal {
        match (self.invest, self.invest_ratio) {
            (Some(invest), _) if invest > Decimal::ZERO => invest,
            (_, Some(ratio)) => invest_total * ratio,
            _ => Decimal::ZERO,
        }
    }
}

impl Config {
    /// Load configuration from `config.toml` (if present) and environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from("config")
    }

    /// Load configuration from the given file stem or path plus environment variables.
    pub fn load_from(path: &str) -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::default().separator("__").prefix("TRADER"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Persistence key of this run: `<market>.<strategy>`.
    pub fn run_key(&self) -> String {
        format!("{}.{}", self.frame.market, self.frame.strategy.as_str())
    }

    /// Instrument codes of the pool, in configured order.
    pub fn pool(&self) -> Vec<String> {
        self.instruments.iter().map(|i| i.code.clone()).collect()
    }

    pub fn instrument(&self, code: &str) -> Option<&InstrumentConfig> {
        self.instruments.iter().find(|i| i.code == code)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.instruments.is_empty(), "instrument pool must not be empty");

        anyhow::ensure!(
            self.engine.invest_total > Decimal::ZERO,
            "invest_total must be positive"
        );

        anyhow::ensure!(
            self.frame.other_handle_period >= 1,
            "other_handle_period must be at least 1"
        );

        for instrument in &self.instruments {
            anyhow::ensure!(
                instrument.invest.is_some() || instrument.invest_ratio.is_some(),
                "{}: either invest or invest_ratio must be set",
                instrument.code
            );
            anyhow::ensure!(
                instrument.grid.grid_min_price < instrument.grid.grid_max_price,
                "{}: grid_min_price must be below grid_max_price",
                instrument.code
            );
            anyhow::ensure!(
                instrument.mid_price_max_deviation >= Decimal::ONE,
                "{}: mid_price_max_deviation must be >= 1",
                instrument.code
            );
        }

        let mut codes = self.pool();
        codes.sort();
        codes.dedup();
        anyhow::ensure!(
            codes.len() == self.instruments.len(),
            "instrument codes must be unique"
        );

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            frame: FrameConfig::default(),
            engine: EngineConfig::default(),
            execution: ExecutionConfig::default(),
            paper: PaperConfig::default(),
            instruments: default_instruments(),
        }
    }
}

impl FrameConfig {
    pub fn snapshot_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("snapshots.db")
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            market: default_market(),
            strategy: default_strategy(),
            loop_interval_secs: default_loop_interval(),
            other_handle_period: default_other_handle_period(),
            max_wait_secs_for_deal: default_max_wait_for_deal(),
            max_amount_multiplier: default_max_amount_multiplier(),
            max_orders_in_24h: default_max_orders_in_24h(),
            cooldown_secs: default_cooldown(),
            cycle_pause_secs: default_cycle_pause(),
            day_closed_pause_secs: default_day_closed_pause(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            invest_total: default_invest_total(),
            balance_extra: Decimal::ZERO,
            balance_reserved_min: default_disabled(),
            balance_reserved_max: default_disabled(),
            default_instrument: None,
            default_instrument_autorun: false,
            default_instrument_start_price: Decimal::ONE,
            sellout_other_holdings: false,
            max_fees: default_engine_max_fees(),
            smart_wait_minutes: default_smart_wait_minutes(),
            smart_amount_segment: default_smart_amount_segment(),
            always_refresh_stats: false,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            be_lurker: false,
            be_maker: false,
            max_wait_secs_taker: default_max_wait_taker(),
            max_wait_secs_maker: default_max_wait_maker(),
            max_wait_secs_lurker: default_max_wait_lurker(),
        }
    }
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_cash: default_paper_cash(),
            prices: vec![PaperPrice {
                code: "CC.DEMO".to_string(),
                price: Decimal::new(400, 0),
                lot_size: Decimal::ONE,
            }],
            step_volatility: default_paper_volatility(),
            tick_millis: default_paper_tick(),
        }
    }
}

impl Default for GridParams {
    fn default() -> Self {
        Self {
            grid_count: default_grid_count(),
            grid_min_price: default_grid_min_price(),
            grid_max_price: default_grid_max_price(),
            grid_type: GridType::default(),
            geo_ratio: default_geo_ratio(),
            arith_delta: default_arith_delta(),
        }
    }
}

impl Default for ShannonParams {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            base_price: Decimal::ZERO,
            min_price: Decimal::ZERO,
            max_price: Decimal::ZERO,
            use_optimal_leverage: false,
            base_leverage: default_base_leverage(),
            mid_position: default_mid_position(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn from_toml(toml: &str) -> Result<Config> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_instrument_list_with_dotted_codes() {
        let config = from_toml(
            r#"
            [frame]
            market = "US"
            strategy = "shannon"

            [engine]
            invest_total = 20000

            [[instruments]]
            code = "US.AAPL"
            invest_ratio = 0.25
            [instruments.shannon]
            base_leverage = 2
            threshold = 0.05

            [[instruments]]
            code = "US.MSFT"
            invest = 3000
            [instruments.grid]
            grid_type = "geo_arith"
            grid_count = 12
            "#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.frame.strategy, StrategyKind::Shannon);
        assert_eq!(config.pool(), vec!["US.AAPL", "US.MSFT"]);

        let aapl = config.instrument("US.AAPL").unwrap();
        assert_eq!(aapl.shannon.base_leverage, dec!(2));
        assert_eq!(aapl.resolve_invest(config.engine.invest_total), dec!(5000));

        let msft = config.instrument("US.MSFT").unwrap();
        assert_eq!(msft.grid.grid_type, GridType::GeoArith);
        assert_eq!(msft.grid.grid_min_price, dec!(300));
        assert_eq!(msft.resolve_invest(config.engine.invest_total), dec!(3000));
    }

    #[test]
    fn test_unknown_grid_type_is_rejected() {
        let result = from_toml(
            r#"
            [[instruments]]
            code = "HK.00700"
            invest_ratio = 1
            [instruments.grid]
            grid_type = "fibonacci"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_missing_invest() {
        let mut config = Config::default();
        config.instruments[0].invest_ratio = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_band() {
        let mut config = Config::default();
        config.instruments[0].grid.grid_min_price = dec!(600);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_run_key_and_snapshot_path() {
        let mut config = Config::default();
        config.frame.market = "HK".to_string();
        config.frame.strategy = StrategyKind::Shannon;
        config.frame.data_dir = "/tmp/rebalancer".to_string();
        assert_eq!(config.run_key(), "HK.shannon");
        assert_eq!(
            config.frame.snapshot_path(),
            PathBuf::from("/tmp/rebalancer/snapshots.db")
        );
    }

    #[test]
    fn test_strategy_kind_from_str() {
        assert_eq!("Grid".parse::<StrategyKind>().unwrap(), StrategyKind::Grid);
        assert!("martingale".parse::<StrategyKind>().is_err());
    }
}
