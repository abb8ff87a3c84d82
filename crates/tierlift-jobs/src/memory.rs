//! In-memory job queue.
//!
//! Jobs wait as pending until a runner takes them with
//! [`InMemoryJobQueue::take_jobs_to_run`], and leave the queue when the runner
//! reports them [`complete`](InMemoryJobQueue::complete). A failed job is put
//! back as pending, under the same handle, until its retry budget is spent;
//! only terminal results produce a completion report.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tierlift_core::{
    ApplicationId, JobHandle, JobReport, JobResult, JobType, JobsConfig, Version,
};

use crate::queue::{CancelAck, JobQueue, JobQueueError, JobQueueResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Pending,
    Running,
}

#[derive(Debug, Clone)]
struct QueuedJob {
    handle: JobHandle,
    state: QueueState,
    /// Failed attempts so far.
    failures: u32,
}

#[derive(Debug, Default)]
struct Inner {
    /// Queued jobs in submission order.
    jobs: Vec<QueuedJob>,
    /// Last job number per (application, job type).
    numbers: HashMap<(ApplicationId, JobType), u64>,
    /// Trigger calls that will fail before the queue accepts jobs again.
    failing_triggers: u32,
    /// Every job ever accepted, in order.
    triggered: Vec<JobHandle>,
    /// Every job removed by cancellation, in order.
    cancelled: Vec<JobHandle>,
}

/// A job queue held in memory.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    retry_budget: u32,
    inner: Mutex<Inner>,
}

impl InMemoryJobQueue {
    /// Create a queue that retries each failed job `retry_budget` times.
    pub fn new(retry_budget: u32) -> Self {
        Self {
            retry_budget,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn from_config(config: &JobsConfig) -> Self {
        Self::new(config.retry_budget)
    }

    /// Make the next `count` trigger calls fail as if the queue were unreachable.
    pub async fn fail_next_triggers(&self, count: u32) {
        self.inner.lock().await.failing_triggers = count;
    }

    /// Start every pending job, returning their handles in submission order.
    pub async fn take_jobs_to_run(&self) -> Vec<JobHandle> {
        let mut inner = self.inner.lock().await;
        inner
            .jobs
            .iter_mut()
            .filter(|job| job.state == QueueState::Pending)
            .map(|job| {
                job.state = QueueState::Running;
                job.handle.clone()
            })
            .collect()
    }

    /// Start one pending job.
    pub async fn start(&self, handle: &JobHandle) -> JobQueueResult<()> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .iter_mut()
            .find(|job| &job.handle == handle && job.state == QueueState::Pending)
            .ok_or_else(|| JobQueueError::UnknownJob(handle.clone()))?;
        job.state = QueueState::Running;
        Ok(())
    }

    /// Finish a running job.
    ///
    /// Returns the completion report to deliver, or `None` if the failure was
    /// absorbed by a retry.
    pub async fn complete(
        &self,
        handle: &JobHandle,
        result: JobResult,
    ) -> JobQueueResult<Option<JobReport>> {
        let mut inner = self.inner.lock().await;
        let index = inner
            .jobs
            .iter()
            .position(|job| &job.handle == handle && job.state == QueueState::Running)
            .ok_or_else(|| JobQueueError::UnknownJob(handle.clone()))?;

        if !result.is_success() && inner.jobs[index].failures < self.retry_budget {
            let job = &mut inner.jobs[index];
            job.failures += 1;
            job.state = QueueState::Pending;
            debug!(job = %handle, attempt = job.failures, "job failed, retrying");
            return Ok(None);
        }

        let job = inner.jobs.remove(index);
        if let Some(error) = result.error() {
            warn!(job = %handle, %error, failures = job.failures + 1, "job failed");
        } else {
            debug!(job = %handle, "job succeeded");
        }
        Ok(Some(JobReport {
            application: job.handle.application,
            job_type: job.handle.job_type,
            version: job.handle.version,
            number: job.handle.number,
            result,
        }))
    }

    /// Every job accepted so far, in order.
    pub async fn triggered(&self) -> Vec<JobHandle> {
        self.inner.lock().await.triggered.clone()
    }

    /// Every job removed by cancellation, in order.
    pub async fn cancelled(&self) -> Vec<JobHandle> {
        self.inner.lock().await.cancelled.clone()
    }

    /// Jobs currently queued, pending or running.
    pub async fn queued(&self) -> Vec<JobHandle> {
        self.inner
            .lock()
            .await
            .jobs
            .iter()
            .map(|job| job.handle.clone())
            .collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.jobs.is_empty()
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::from_config(&JobsConfig::default())
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn trigger(
        &self,
        application: &ApplicationId,
        job_type: &JobType,
        version: &Version,
    ) -> JobQueueResult<JobHandle> {
        if !application.is_valid() {
            return Err(JobQueueError::Rejected(format!(
                "invalid application id '{application}'"
            )));
        }
        let mut inner = self.inner.lock().await;
        if inner.failing_triggers > 0 {
            inner.failing_triggers -= 1;
            return Err(JobQueueError::Unavailable(format!(
                "cannot submit {job_type} for {application}"
            )));
        }

        if let Some(existing) = inner.jobs.iter().find(|job| {
            job.state == QueueState::Pending
                && &job.handle.application == application
                && &job.handle.job_type == job_type
                && &job.handle.version == version
        }) {
            debug!(job = %existing.handle, "identical job already queued");
            return Ok(existing.handle.clone());
        }

        let number = inner
            .numbers
            .entry((application.clone(), job_type.clone()))
            .and_modify(|n| *n += 1)
            .or_insert(1);
        let handle = JobHandle {
            application: application.clone(),
            job_type: job_type.clone(),
            version: version.clone(),
            number: *number,
        };
        inner.jobs.push(QueuedJob {
            handle: handle.clone(),
            state: QueueState::Pending,
            failures: 0,
        });
        inner.triggered.push(handle.clone());
        info!(job = %handle, "job queued");
        Ok(handle)
    }

    async fn cancel(&self, handle: &JobHandle) -> JobQueueResult<CancelAck> {
        let mut inner = self.inner.lock().await;
        let index = inner
            .jobs
            .iter()
            .position(|job| &job.handle == handle)
            .ok_or_else(|| JobQueueError::UnknownJob(handle.clone()))?;

        match inner.jobs[index].state {
            QueueState::Running => Ok(CancelAck::AlreadyStarted),
            QueueState::Pending => {
                let job = inner.jobs.remove(index);
                inner.cancelled.push(job.handle);
                info!(job = %handle, "job cancelled");
                Ok(CancelAck::Cancelled)
            }
        }
    }

    async fn pending_jobs(&self) -> JobQueueResult<HashSet<JobHandle>> {
        Ok(self
            .inner
            .lock()
            .await
            .jobs
            .iter()
            .filter(|job| job.state == QueueState::Pending)
            .map(|job| job.handle.clone())
            .collect())
    }
}
