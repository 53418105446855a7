//! # Tick Rebalancer
//!
//! A trading controller that runs one grid or Shannon rebalancing strategy
//! per instrument of a configured pool, on a single scheduling task.
//!
//! ## Architecture
//!
//! - `config`: Configuration loading and validation
//! - `exchange`: Broker gateway trait, market calendar and paper gateway
//! - `orders`: Order ledger and cached account
//! - `risk`: 24h buy/sell rate limiter
//! - `engine`: Rounding, placement, retries and smart market orders
//! - `strategy`: Grid and Shannon engines
//! - `frame`: Orchestrator loop, asset accounting and supervisor
//! - `persistence`: SQLite snapshots for restarts
//! - `utils`: Decimal helpers and timed locks

pub mod config;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod frame;
pub mod orders;
pub mod persistence;
pub mod risk;
pub mod strategy;
pub mod utils;

pub use config::Config;
