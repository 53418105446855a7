//! Shared utilities: decimal helpers and timed locks.

pub mod decimal;
pub mod lock;

pub use lock::{TimedMutex, LOCK_TIMEOUT};
