//! Broker integration.
//!
//! ## Gateway
//! [`TradingGateway`] is the only surface the controller talks to:
//! - Account and market snapshots
//! - Order placement, queries and cancels
//! - Session predicates (open, continuous bidding, pre-open, rollover)
//!
//! ## Paper trading
//! [`PaperGateway`] simulates a broker in-process, with session times from
//! [`MarketCalendar`].

mod paper;
mod session;
mod traits;
mod types;

pub use paper::PaperGateway;
pub use session::{price_precision, tick_size, MarketCalendar, Venue};
#[cfg(test)]
pub use traits::MockTradingGateway;
pub use traits::TradingGateway;
pub use types::*;
