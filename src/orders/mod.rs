//! Order lifecycle bookkeeping and the cached account it credits.

pub mod account;
pub mod ledger;

pub use account::{AccountBook, AccountState};
pub use ledger::{DealtSummary, Order, OrderLedger};
