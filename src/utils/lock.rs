//! Mutex with a bounded acquisition time.
//!
//! Shared between the scheduler and broker callback tasks. A lock that
//! cannot be taken within the timeout surfaces as
//! [`TradeError::LockTimeout`] instead of hanging the loop.

use crate::error::{TradeError, TradeResult};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::error;

/// Default acquisition timeout.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct TimedMutex<T> {
    name: &'static str,
    timeout: Duration,
    inner: Mutex<T>,
}

impl<T> TimedMutex<T> {
    pub fn new(name: &'static str, value: T) -> Self {
        Self::with_timeout(name, value, LOCK_TIMEOUT)
    }

    pub fn with_timeout(name: &'static str, value: T, timeout: Duration) -> Self {
        Self {
            name,
            timeout,
            inner: Mutex::new(value),
        }
    }

    /// Acquire the lock or fail after the configured timeout.
    pub async fn lock(&self) -> TradeResult<MutexGuard<'_, T>> {
        match tokio::time::timeout(self.timeout, self.inner.lock()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                error!(lock = self.name, timeout_secs = self.timeout.as_secs(), "Lock acquisition timed out");
                Err(TradeError::LockTimeout(self.name))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_and_mutate() {
        let m = TimedMutex::new("counter", 1u32);
        *m.lock().await.unwrap() += 1;
        assert_eq!(*m.lock().await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_times_out_while_held() {
        let m = TimedMutex::new("orders", ());
        let _held = m.lock().await.unwrap();

        let err = m.lock().await.unwrap_err();
        assert!(matches!(err, TradeError::LockTimeout("orders")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_timeout() {
        let m = TimedMutex::with_timeout("account", 0, Duration::from_millis(10));
        let held = m.lock().await.unwrap();
        let start = tokio::time::Instant::now();
        assert!(m.lock().await.is_err());
        assert!(start.elapsed() >= Duration::from_millis(10));
        drop(held);
        assert!(m.lock().await.is_ok());
    }
}
