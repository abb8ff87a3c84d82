//! Job handles, job state and completion reports exchanged with the job queue.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{ApplicationId, JobError, JobType};
use crate::version::Version;

/// Identifies one job instance submitted to the job queue.
///
/// The job number is assigned by the queue and increases per
/// (application, job type).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub application: ApplicationId,
    pub job_type: JobType,
    pub version: Version,
    pub number: u64,
}

impl JobHandle {
    /// Whether a completion report belongs to this job instance.
    pub fn matches(&self, report: &JobReport) -> bool {
        self.application == report.application
            && self.job_type == report.job_type
            && self.version == report.version
            && self.number == report.number
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}#{} ({})",
            self.application, self.job_type, self.number, self.version
        )
    }
}

/// Terminal result of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobResult {
    Success,
    Failure(JobError),
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Success)
    }

    pub fn error(&self) -> Option<JobError> {
        match self {
            JobResult::Success => None,
            JobResult::Failure(e) => Some(*e),
        }
    }
}

/// Lifecycle of a triggered job as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued, not yet started.
    Pending,
    /// Picked up by the job system.
    Running,
    /// Cancellation was requested but the job had already started;
    /// its report is still outstanding.
    CancelRequested,
    /// Reported back.
    Completed(JobResult),
}

impl JobState {
    /// Whether a completion report is still expected for the job.
    pub fn is_outstanding(&self) -> bool {
        !matches!(self, JobState::Completed(_))
    }
}

/// Completion notification delivered (at least once) by the job system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub application: ApplicationId,
    pub job_type: JobType,
    pub version: Version,
    pub number: u64,
    pub result: JobResult,
}

impl JobReport {
    pub fn handle(&self) -> JobHandle {
        JobHandle {
            application: self.application.clone(),
            job_type: self.job_type.clone(),
            version: self.version.clone(),
            number: self.number,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(number: u64) -> JobReport {
        JobReport {
            application: ApplicationId::new("t", "a", "default"),
            job_type: JobType::SystemTest,
            version: "5.1".parse().unwrap(),
            number,
            result: JobResult::Failure(JobError::TestFailure),
        }
    }

    #[test]
    fn handle_matches_its_own_report_only() {
        let handle = report(7).handle();
        assert!(handle.matches(&report(7)));
        assert!(!handle.matches(&report(8)));
    }

    #[test]
    fn result_accessors() {
        assert!(JobResult::Success.is_success());
        assert_eq!(JobResult::Success.error(), None);
        assert_eq!(
            JobResult::Failure(JobError::OutOfCapacity).error(),
            Some(JobError::OutOfCapacity)
        );
    }

    #[test]
    fn only_completed_jobs_are_settled() {
        assert!(JobState::Pending.is_outstanding());
        assert!(JobState::Running.is_outstanding());
        assert!(JobState::CancelRequested.is_outstanding());
        assert!(!JobState::Completed(JobResult::Success).is_outstanding());
    }

    #[test]
    fn report_serializes() {
        let json = serde_json::to_value(report(1)).unwrap();
        assert_eq!(json["job_type"], "system-test");
        assert_eq!(json["result"]["failure"], "test_failure");
    }
}
