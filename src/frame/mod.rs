//! Scheduling frame: the orchestrator loop and its supervisor.
//!
//! - `orchestrator`: init/run/close state machine, settlement, fill waits
//! - `assets`: per-instrument asset accounting, snapshot saves, daily report
//! - `housekeeping`: non-pool sell-down and default-instrument rebalancing
//! - `supervisor`: session waits, cooldown-and-reconnect, graceful shutdown

mod assets;
mod housekeeping;
mod orchestrator;
mod supervisor;

pub use assets::{AssetSummary, DailyReport, InstrumentAssets, InstrumentReport};
pub use orchestrator::{CycleOutcome, FrameStats, Orchestrator};
pub use supervisor::{Shutdown, Supervisor};

use tracing::warn;

use crate::error::TradeResult;

/// Swallow a recoverable error after logging it. Fatal errors pass through.
pub(crate) fn tolerate<T>(result: TradeResult<T>, what: &'static str) -> TradeResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if !e.is_fatal() => {
            warn!(error = %e, what, "Recoverable error, continuing");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GatewayError, TradeError};

    #[test]
    fn test_tolerate() {
        assert_eq!(tolerate(Ok(3), "noop").unwrap(), Some(3));

        let soft: TradeResult<()> = Err(TradeError::gateway("cancel_order", GatewayError::Timeout));
        assert_eq!(tolerate(soft, "cancel").unwrap(), None);

        let hard: TradeResult<()> = Err(TradeError::NotInitialized);
        assert!(tolerate(hard, "run").is_err());
    }
}
