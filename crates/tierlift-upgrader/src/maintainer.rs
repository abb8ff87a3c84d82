//! Periodic maintenance loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::orchestrator::Orchestrator;

/// Runs the orchestrator's maintenance on a fixed interval.
///
/// The maintainer can be deactivated at runtime; while inactive, intervals
/// pass without a run.
pub struct Maintainer {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    active: AtomicBool,
}

impl Maintainer {
    pub fn new(orchestrator: Arc<Orchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
            active: AtomicBool::new(true),
        }
    }

    pub fn activate(&self) {
        if !self.active.swap(true, Ordering::SeqCst) {
            info!("upgrade maintainer activated");
        }
    }

    pub fn deactivate(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            info!("upgrade maintainer deactivated");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Run until `shutdown` changes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "upgrade maintainer started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if self.is_active() {
                        // Errors are logged and counted by the orchestrator.
                        let _ = self.orchestrator.maintain().await;
                    } else {
                        debug!("upgrade maintainer inactive; skipping run");
                    }
                }
                _ = shutdown.changed() => {
                    info!("upgrade maintainer shutting down");
                    break;
                }
            }
        }
    }
}
