//! Sweep background worker.
//!
//! Runs the stuck-node sweep on a periodic interval.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, instrument};

use super::StuckNodeSweeper;

/// Worker that runs the sweep until shutdown.
pub struct SweepWorker {
    sweeper: StuckNodeSweeper,
    interval: Duration,
}

impl SweepWorker {
    pub fn new(sweeper: StuckNodeSweeper, interval: Duration) -> Self {
        Self { sweeper, interval }
    }

    /// Run the sweep worker until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting sweep worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so start-up does
        // not race in-flight workflows from a previous process.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.sweeper.sweep_once().await {
                        Ok(stats) if stats.examined > 0 => info!(
                            examined = stats.examined,
                            reclaimed = stats.reclaimed,
                            failed = stats.failed,
                            "Sweep complete"
                        ),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Sweep worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
