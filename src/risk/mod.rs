//! Safety valves against runaway order loops.

mod rate_limiter;

pub use rate_limiter::{RateLimiter, DEFAULT_MAX_COUNT};
