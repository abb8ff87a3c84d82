//! The job queue interface.

use std::collections::HashSet;

use async_trait::async_trait;
use thiserror::Error;

use tierlift_core::{ApplicationId, JobHandle, JobType, Version};

/// Result type alias for job queue operations.
pub type JobQueueResult<T> = Result<T, JobQueueError>;

/// Errors returned by a job queue.
#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("job queue unavailable: {0}")]
    Unavailable(String),

    #[error("unknown job: {0}")]
    UnknownJob(JobHandle),

    #[error("job rejected: {0}")]
    Rejected(String),
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAck {
    /// The job was removed before it started.
    Cancelled,
    /// The job had already started; its report will still arrive.
    AlreadyStarted,
}

/// A system that runs deployment jobs.
///
/// Every call is I/O against an external system and may fail or stall;
/// callers bound them with a timeout.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Submit a job. Submitting a job identical to one still queued returns
    /// the existing handle.
    async fn trigger(
        &self,
        application: &ApplicationId,
        job_type: &JobType,
        version: &Version,
    ) -> JobQueueResult<JobHandle>;

    /// Best-effort cancellation of a submitted job.
    async fn cancel(&self, handle: &JobHandle) -> JobQueueResult<CancelAck>;

    /// Jobs submitted but not yet started.
    async fn pending_jobs(&self) -> JobQueueResult<HashSet<JobHandle>>;
}
