//! Orchestrator — the serialized entry point to the upgrader.
//!
//! Maintenance runs and completion reports both read and rewrite the pending
//! change of applications, so they take the same single-flight lock. A
//! maintenance run requested while another is in progress waits for it.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error};

use tierlift_core::{JobReport, TierliftConfig};
use tierlift_jobs::JobQueue;
use tierlift_rollout::{Confidence, ConfidenceEvaluator, VersionStatus};
use tierlift_state::StateStore;

use crate::error::UpgradeResult;
use crate::metrics::UpgradeMetrics;
use crate::trigger::{Completion, DeploymentTrigger};
use crate::upgrader::{MaintenanceReport, Upgrader};

/// Serializes maintenance runs and completion reports.
pub struct Orchestrator {
    upgrader: Upgrader,
    metrics: Arc<UpgradeMetrics>,
    lock: Mutex<()>,
}

impl Orchestrator {
    pub fn new(store: StateStore, queue: Arc<dyn JobQueue>, config: &TierliftConfig) -> Self {
        let trigger = DeploymentTrigger::new(store, queue, config.upgrader.queue_timeout());
        let evaluator = ConfidenceEvaluator::new(config.confidence.clone());
        Self {
            upgrader: Upgrader::new(trigger, evaluator),
            metrics: Arc::new(UpgradeMetrics::new()),
            lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &StateStore {
        self.upgrader.store()
    }

    pub fn metrics(&self) -> Arc<UpgradeMetrics> {
        self.metrics.clone()
    }

    /// Run one maintenance pass.
    pub async fn maintain(&self) -> UpgradeResult<MaintenanceReport> {
        let _guard = self.lock.lock().await;
        match self.upgrader.maintain().await {
            Ok(report) => {
                self.metrics.record_run(&report);
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "maintenance run failed");
                self.metrics.record_run_error();
                Err(e)
            }
        }
    }

    /// Apply a completion report from the job system.
    ///
    /// Job failures are recorded and returned as [`Completion::Failed`]; only
    /// state or queue errors are returned as errors.
    pub async fn notify_job_completion(&self, report: &JobReport) -> UpgradeResult<Completion> {
        let _guard = self.lock.lock().await;
        let completion = self.upgrader.trigger().notify(report).await?;
        debug!(job = %report.handle(), ?completion, "completion report applied");
        self.metrics.record_completion(&completion);
        Ok(completion)
    }

    /// Confidence in the system version; `None` when no system version is set.
    pub async fn confidence(&self) -> UpgradeResult<Option<Confidence>> {
        let _guard = self.lock.lock().await;
        let confidence = self.upgrader.assess()?.map(|a| a.confidence);
        self.metrics.set_confidence(confidence);
        Ok(confidence)
    }

    /// Status of every version in use.
    pub async fn version_status(&self) -> UpgradeResult<VersionStatus> {
        let _guard = self.lock.lock().await;
        self.upgrader.version_status()
    }
}
