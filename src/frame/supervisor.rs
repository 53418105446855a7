//! Top-level supervisor: one trading session per day, reconnect on failure.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::orchestrator::{CycleOutcome, Orchestrator};
use super::tolerate;
use crate::error::{TradeError, TradeResult};

/// Process-wide shutdown flag. Cloning shares the flag.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn trigger(&self) {
        if !self.tx.send_replace(true) {
            info!("Shutdown requested");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        // the sender lives as long as any clone of self
        let _ = rx.wait_for(|stop| *stop).await;
    }

    /// Sleep unless interrupted. Returns `false` when shutdown cut it short.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_triggered() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.triggered() => false,
        }
    }
}

/// Seconds to wait before connecting for the next session.
///
/// Markets with a pre-open are joined 30-60 minutes after it starts; an
/// already open market is joined within a few seconds.
pub(crate) fn open_wait_secs(secs_to_open: i64, has_preopen: bool, jitter: f64) -> f64 {
    if secs_to_open > 0 {
        if has_preopen {
            secs_to_open as f64 + 1800.0 * (1.0 + jitter)
        } else {
            secs_to_open as f64 + 1.0
        }
    } else {
        3.0 * jitter
    }
}

pub struct Supervisor {
    orchestrator: Orchestrator,
    shutdown: Shutdown,
}

impl Supervisor {
    pub fn new(orchestrator: Orchestrator, shutdown: Shutdown) -> Self {
        Self {
            orchestrator,
            shutdown,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Run trading sessions until shutdown is requested.
    pub async fn run_forever(&mut self) {
        let cooldown = Duration::from_secs(self.orchestrator.config().frame.cooldown_secs);
        let mut failed = false;

        while !self.shutdown.is_triggered() {
            if failed {
                failed = false;
                warn!(cooldown_secs = cooldown.as_secs(), "Run failed, cooling down before reconnect");
                if !self.shutdown.sleep(cooldown).await {
                    break;
                }
                if self.orchestrator.engine().gateway().secs_to_open() > 0 {
                    self.orchestrator.report_daily().await;
                }
                self.orchestrator.close(false).await;
                self.disconnect().await;
            }

            if let Err(e) = self.run_session().await {
                error!(error = %e, fatal = e.is_fatal(), "Trading session failed");
                failed = true;
            }
        }

        self.shutdown_gracefully().await;
    }

    /// Wait for the open, trade the session, report and disconnect.
    pub async fn run_session(&mut self) -> TradeResult<()> {
        let gateway = Arc::clone(self.orchestrator.engine().gateway());
        let wait = open_wait_secs(
            gateway.secs_to_open(),
            gateway.has_preopen(),
            rand::thread_rng().gen::<f64>(),
        );
        info!(wait_secs = wait.round(), "Waiting for market open");
        if !self.shutdown.sleep(Duration::from_secs_f64(wait)).await {
            return Ok(());
        }

        gateway
            .open_api()
            .await
            .map_err(|e| TradeError::gateway("open_api", e))?;

        if gateway.market_open() {
            tolerate(self.orchestrator.engine().sync_open_orders().await, "sync_open_orders")?;
            self.orchestrator.init().await?;
            let outcome = self.orchestrator.run().await?;
            info!(?outcome, stats = ?self.orchestrator.stats(), "Trading run finished");
            self.orchestrator.report_daily().await;
            self.orchestrator.close(true).await;
            if outcome == CycleOutcome::Interrupted {
                return Ok(());
            }
        }

        self.disconnect().await;
        self.orchestrator.engine().ledger().clear().await?;

        let pause = self.orchestrator.config().frame.day_closed_pause_secs;
        info!(pause_secs = pause, "Day closed, pausing");
        self.shutdown.sleep(Duration::from_secs(pause)).await;
        Ok(())
    }

    async fn disconnect(&self) {
        if let Err(e) = self.orchestrator.engine().gateway().close_api().await {
            warn!(error = %e, "Closing the broker connection failed");
        }
    }

    async fn shutdown_gracefully(&mut self) {
        info!("Shutting down");
        if self.orchestrator.is_initialized() {
            self.orchestrator.close(true).await;
        }
        if self.orchestrator.engine().gateway().is_connected() {
            self.disconnect().await;
        }
        info!(stats = ?self.orchestrator.stats(), "Shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::orchestrator::tests::paper_orchestrator;

    #[test]
    fn test_open_wait_secs() {
        assert_eq!(open_wait_secs(600, false, 0.5), 601.0);
        assert_eq!(open_wait_secs(600, true, 0.5), 600.0 + 2700.0);
        assert_eq!(open_wait_secs(0, true, 0.5), 1.5);
        assert_eq!(open_wait_secs(-10, false, 0.0), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_sleep() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move { waiter.sleep(Duration::from_secs(3600)).await });

        tokio::task::yield_now().await;
        shutdown.trigger();
        assert!(!handle.await.unwrap());
        assert!(shutdown.is_triggered());
        assert!(!shutdown.sleep(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes_without_shutdown() {
        let shutdown = Shutdown::new();
        assert!(shutdown.sleep(Duration::from_secs(5)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_runs_until_market_closes() {
        let (orchestrator, gateway, shutdown) = paper_orchestrator().await;
        let mut supervisor = Supervisor::new(orchestrator, shutdown.clone());

        // the market shuts after the first cycles
        let gw = Arc::clone(&gateway);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(400)).await;
            gw.set_session(false, false);
        });
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1000)).await;
            stopper.trigger();
        });

        supervisor.run_session().await.unwrap();

        let orchestrator = supervisor.orchestrator();
        assert!(!orchestrator.is_initialized());
        assert!(orchestrator.stats().cycles >= 1);
        assert!(!orchestrator.engine().gateway().is_connected());
        assert!(orchestrator.load_saved().unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_forever_stops_on_shutdown() {
        let (orchestrator, gateway, shutdown) = paper_orchestrator().await;
        gateway.set_session(false, false);
        let mut supervisor = Supervisor::new(orchestrator, shutdown.clone());

        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            stopper.trigger();
        });
        supervisor.run_forever().await;
        assert!(shutdown.is_triggered());
        assert!(!supervisor.orchestrator().engine().gateway().is_connected());
    }
}
