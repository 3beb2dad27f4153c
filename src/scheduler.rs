//! Scheduler loop: repeat the propagation sweep, sleeping when idle.

use crate::db::now_ms;
use crate::engine::{Engine, SweepReport};
use anyhow::Result;
use tokio::sync::watch;
use tracing::{info, warn};

pub struct Scheduler {
    engine: Engine,
}

impl Scheduler {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// One sweep at the current time.
    pub fn run_once(&self) -> Result<SweepReport> {
        self.engine.run_sweep(now_ms())
    }

    /// Sweep until `shutdown` flips to true. Busy sweeps run back to back;
    /// idle ones wait one poll interval.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("scheduler started");
        let poll_interval = self.engine.config().poll_interval();
        while !*shutdown.borrow() {
            let idle = match self.run_once() {
                Ok(report) => report.is_idle(),
                Err(e) => {
                    // Usually SQLITE_BUSY from a competing process; the next sweep retries.
                    warn!(error = %e, "sweep failed");
                    true
                }
            };
            if !idle {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("scheduler stopped");
        Ok(())
    }
}
