//! Upgrade metrics — counters for maintenance runs and completion reports.
//!
//! Uses atomics only; readers never block the orchestrator. Rendered in the
//! Prometheus text exposition format.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use tierlift_rollout::Confidence;

use crate::trigger::Completion;
use crate::upgrader::MaintenanceReport;

/// Counters describing the upgrade rollout.
#[derive(Debug)]
pub struct UpgradeMetrics {
    runs: AtomicU64,
    run_errors: AtomicU64,
    triggered: AtomicU64,
    resumed: AtomicU64,
    cancelled: AtomicU64,
    application_failures: AtomicU64,
    broken_runs: AtomicU64,
    reports: AtomicU64,
    job_failures: AtomicU64,
    duplicate_reports: AtomicU64,
    untracked_reports: AtomicU64,
    /// Confidence level of the system version; -1 when unknown.
    confidence: AtomicI64,
}

/// A point-in-time copy of [`UpgradeMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub runs: u64,
    pub run_errors: u64,
    pub triggered: u64,
    pub resumed: u64,
    pub cancelled: u64,
    pub application_failures: u64,
    pub broken_runs: u64,
    pub reports: u64,
    pub job_failures: u64,
    pub duplicate_reports: u64,
    pub untracked_reports: u64,
    pub confidence: Option<u8>,
}

impl Default for UpgradeMetrics {
    fn default() -> Self {
        Self {
            runs: AtomicU64::new(0),
            run_errors: AtomicU64::new(0),
            triggered: AtomicU64::new(0),
            resumed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            application_failures: AtomicU64::new(0),
            broken_runs: AtomicU64::new(0),
            reports: AtomicU64::new(0),
            job_failures: AtomicU64::new(0),
            duplicate_reports: AtomicU64::new(0),
            untracked_reports: AtomicU64::new(0),
            confidence: AtomicI64::new(-1),
        }
    }
}

impl UpgradeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for a finished maintenance run.
    pub fn record_run(&self, report: &MaintenanceReport) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.triggered
            .fetch_add(report.triggered.len() as u64, Ordering::Relaxed);
        self.resumed
            .fetch_add(report.resumed.len() as u64, Ordering::Relaxed);
        self.cancelled
            .fetch_add(report.cancelled.len() as u64, Ordering::Relaxed);
        self.application_failures
            .fetch_add(report.failures.len() as u64, Ordering::Relaxed);
        if report.confidence == Some(Confidence::Broken) {
            self.broken_runs.fetch_add(1, Ordering::Relaxed);
        }
        self.set_confidence(report.confidence);
    }

    /// Account for a maintenance run that failed outright.
    pub fn record_run_error(&self) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.run_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Account for an applied completion report.
    pub fn record_completion(&self, completion: &Completion) {
        self.reports.fetch_add(1, Ordering::Relaxed);
        match completion {
            Completion::Duplicate => {
                self.duplicate_reports.fetch_add(1, Ordering::Relaxed);
            }
            Completion::Untracked => {
                self.untracked_reports.fetch_add(1, Ordering::Relaxed);
            }
            Completion::Failed(_) => {
                self.job_failures.fetch_add(1, Ordering::Relaxed);
            }
            Completion::Triggered(_) => {
                self.triggered.fetch_add(1, Ordering::Relaxed);
            }
            Completion::Stalled => {
                self.application_failures.fetch_add(1, Ordering::Relaxed);
            }
            Completion::Recorded | Completion::ChangeCompleted | Completion::Withdrawn => {}
        }
    }

    pub fn set_confidence(&self, confidence: Option<Confidence>) {
        let level = confidence.map_or(-1, |c| i64::from(c.level()));
        self.confidence.store(level, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let confidence = self.confidence.load(Ordering::Relaxed);
        MetricsSnapshot {
            runs: self.runs.load(Ordering::Relaxed),
            run_errors: self.run_errors.load(Ordering::Relaxed),
            triggered: self.triggered.load(Ordering::Relaxed),
            resumed: self.resumed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            application_failures: self.application_failures.load(Ordering::Relaxed),
            broken_runs: self.broken_runs.load(Ordering::Relaxed),
            reports: self.reports.load(Ordering::Relaxed),
            job_failures: self.job_failures.load(Ordering::Relaxed),
            duplicate_reports: self.duplicate_reports.load(Ordering::Relaxed),
            untracked_reports: self.untracked_reports.load(Ordering::Relaxed),
            confidence: u8::try_from(confidence).ok(),
        }
    }

    /// Render all metrics in Prometheus text format.
    pub fn render_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();

        let counters = [
            ("tierlift_maintenance_runs_total", "Maintenance runs.", s.runs),
            (
                "tierlift_maintenance_errors_total",
                "Maintenance runs that failed outright.",
                s.run_errors,
            ),
            ("tierlift_jobs_triggered_total", "Jobs triggered.", s.triggered),
            (
                "tierlift_changes_resumed_total",
                "Jobs triggered to resume application changes.",
                s.resumed,
            ),
            (
                "tierlift_jobs_cancelled_total",
                "Queued jobs cancelled for broken versions.",
                s.cancelled,
            ),
            (
                "tierlift_application_failures_total",
                "Applications a maintenance run could not handle, and changes stalled by a failed trigger.",
                s.application_failures,
            ),
            (
                "tierlift_broken_runs_total",
                "Maintenance runs that found the system version broken.",
                s.broken_runs,
            ),
            (
                "tierlift_job_reports_total",
                "Completion reports received.",
                s.reports,
            ),
            (
                "tierlift_job_failures_total",
                "Completion reports with a failure.",
                s.job_failures,
            ),
            (
                "tierlift_duplicate_reports_total",
                "Completion reports delivered more than once.",
                s.duplicate_reports,
            ),
            (
                "tierlift_untracked_reports_total",
                "Completion reports for jobs the orchestrator did not trigger.",
                s.untracked_reports,
            ),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {value}");
        }

        out.push_str(
            "# HELP tierlift_confidence Confidence in the system version (0 broken, 1 low, 2 normal, 3 high).\n",
        );
        out.push_str("# TYPE tierlift_confidence gauge\n");
        if let Some(level) = s.confidence {
            let _ = writeln!(out, "tierlift_confidence {level}");
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upgrader::UpgradeFailure;
    use tierlift_core::{ApplicationId, JobError, JobHandle, JobType, Version};

    fn handle(name: &str) -> JobHandle {
        JobHandle {
            application: ApplicationId::new("tenant", name, "default"),
            job_type: JobType::SystemTest,
            version: Version::new(5, 1, 0),
            number: 1,
        }
    }

    #[test]
    fn records_maintenance_runs() {
        let metrics = UpgradeMetrics::new();
        metrics.record_run(&MaintenanceReport {
            confidence: Some(Confidence::Normal),
            triggered: vec![handle("a"), handle("b")],
            ..Default::default()
        });
        metrics.record_run(&MaintenanceReport {
            confidence: Some(Confidence::Broken),
            cancelled: vec![handle("c")],
            ..Default::default()
        });

        let s = metrics.snapshot();
        assert_eq!(s.runs, 2);
        assert_eq!(s.triggered, 2);
        assert_eq!(s.cancelled, 1);
        assert_eq!(s.broken_runs, 1);
        assert_eq!(s.confidence, Some(0));
    }

    #[test]
    fn counts_every_application_failure() {
        let metrics = UpgradeMetrics::new();
        let failure = |name: &str, error: &str| UpgradeFailure {
            application: ApplicationId::new("tenant", name, "default"),
            error: error.to_string(),
        };
        metrics.record_run(&MaintenanceReport {
            confidence: Some(Confidence::Broken),
            failures: vec![
                failure("a", "job queue unavailable: cannot submit system-test"),
                failure("b", "write error: disk full"),
            ],
            ..Default::default()
        });
        metrics.record_completion(&Completion::Stalled);

        assert_eq!(metrics.snapshot().application_failures, 3);
        let output = metrics.render_prometheus();
        assert!(output.contains("tierlift_application_failures_total 3\n"));
        assert!(!output.contains("tierlift_trigger_failures_total"));
    }

    #[test]
    fn records_completions() {
        let metrics = UpgradeMetrics::new();
        metrics.record_completion(&Completion::Failed(JobError::TestFailure));
        metrics.record_completion(&Completion::Duplicate);
        metrics.record_completion(&Completion::ChangeCompleted);

        let s = metrics.snapshot();
        assert_eq!(s.reports, 3);
        assert_eq!(s.job_failures, 1);
        assert_eq!(s.duplicate_reports, 1);
    }

    #[test]
    fn confidence_unknown_until_set() {
        let metrics = UpgradeMetrics::new();
        assert_eq!(metrics.snapshot().confidence, None);
        assert!(!metrics.render_prometheus().contains("tierlift_confidence 0"));

        metrics.set_confidence(Some(Confidence::High));
        assert!(metrics.render_prometheus().contains("tierlift_confidence 3\n"));
    }

    #[test]
    fn prometheus_format() {
        let metrics = UpgradeMetrics::new();
        metrics.record_run_error();
        let output = metrics.render_prometheus();

        assert!(output.contains("# TYPE tierlift_maintenance_runs_total counter"));
        assert!(output.contains("tierlift_maintenance_runs_total 1\n"));
        assert!(output.contains("tierlift_maintenance_errors_total 1\n"));
        assert!(output.contains("# TYPE tierlift_confidence gauge"));
    }
}
