//! Error types shared across the controller.
//!
//! Retryable collaborator failures ([`GatewayError`]) are separated from
//! run-fatal conditions so that only the latter unwind past the scheduling
//! loop to the supervisor.

use thiserror::Error;

/// Failures reported by the trading collaborator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("no quote for {0}")]
    NoQuote(String),

    #[error("connection closed")]
    Disconnected,
}

impl GatewayError {
    /// Whether the call may succeed if simply retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Network(_) | GatewayError::Timeout)
    }
}

/// Precondition failures inside a strategy engine.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StrategyError {
    #[error("strategy for {0} is already open")]
    AlreadyOpen(String),

    #[error("strategy for {0} is not open")]
    NotOpen(String),

    #[error("grid count must be at least 1, got {0}")]
    InvalidGridCount(u32),
}

/// Orchestrator-level errors.
#[derive(Debug, Error)]
pub enum TradeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("timed out acquiring {0} lock")]
    LockTimeout(&'static str),

    #[error("{call} failed: {source}")]
    Gateway {
        call: &'static str,
        #[source]
        source: GatewayError,
    },

    #[error("account or market snapshot unavailable: {0}")]
    SnapshotUnavailable(#[source] GatewayError),

    #[error("orchestrator is not initialized")]
    NotInitialized,

    #[error("order {0} did not close after cancel")]
    OrderLost(String),

    #[error("persistence error: {0:#}")]
    Persistence(anyhow::Error),

    #[error(transparent)]
    Strategy(#[from] StrategyError),
}

impl TradeError {
    pub fn gateway(call: &'static str, source: GatewayError) -> Self {
        TradeError::Gateway { call, source }
    }

    /// Fatal errors abort the current run and hand control to the supervisor.
    pub fn is_fatal(&self) -> bool {
        match self {
            TradeError::Gateway { source, .. } => !source.is_retryable(),
            TradeError::Strategy(_) => false,
            _ => true,
        }
    }
}

pub type TradeResult<T> = Result<T, TradeError>;
