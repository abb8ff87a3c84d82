//! Deployment trigger — submits the jobs of a change and follows their reports.
//!
//! A change runs through the application's pipeline one job at a time:
//! system test, staging test, then each production region in order. The
//! trigger submits the next job whenever the previous one succeeds, records
//! deployments as production jobs finish, and clears the change after the
//! last one. Every call into the job queue is bounded by a timeout.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use tierlift_core::{Change, JobError, JobHandle, JobReport, JobResult, JobState, JobType};
use tierlift_jobs::{CancelAck, JobQueue, JobQueueResult};
use tierlift_state::{
    ApplicationRecord, InFlightJob, JobOutcome, JobRun, StateError, StateStore, epoch_secs,
};

use crate::error::{UpgradeError, UpgradeResult};

/// What a completion report led to.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// The report was delivered before and has been ignored.
    Duplicate,
    /// Recorded; no job triggered by the orchestrator matched it.
    Untracked,
    /// Recorded; nothing further to do.
    Recorded,
    /// The next job was triggered.
    Triggered(JobHandle),
    /// The last job of the change succeeded; the change is done.
    ChangeCompleted,
    /// The job failed; the change stays pending for a later retry.
    Failed(JobError),
    /// A job whose cancellation was requested finished; its change was dropped.
    Withdrawn,
    /// The job succeeded but the next one could not be submitted. The next
    /// maintenance run submits it.
    Stalled,
}

/// Triggers jobs for application changes and applies their reports.
pub struct DeploymentTrigger {
    store: StateStore,
    queue: Arc<dyn JobQueue>,
    timeout: Duration,
}

impl DeploymentTrigger {
    pub fn new(store: StateStore, queue: Arc<dyn JobQueue>, timeout: Duration) -> Self {
        Self {
            store,
            queue,
            timeout,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Await a job queue call, giving up after the configured timeout.
    async fn bounded<T>(&self, call: impl Future<Output = JobQueueResult<T>>) -> UpgradeResult<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(UpgradeError::Timeout(self.timeout)),
        }
    }

    /// Jobs queued but not yet started.
    pub async fn pending_jobs(&self) -> UpgradeResult<HashSet<JobHandle>> {
        self.bounded(self.queue.pending_jobs()).await
    }

    /// Request cancellation of a job.
    pub async fn cancel(&self, handle: &JobHandle) -> UpgradeResult<CancelAck> {
        self.bounded(self.queue.cancel(handle)).await
    }

    /// Submit the next job of `change` and store it as the application's job in flight.
    ///
    /// Nothing is stored unless the queue accepts the job. Returns `None` when
    /// the change has no job left to run.
    pub async fn trigger_change(
        &self,
        record: &mut ApplicationRecord,
        change: Change,
    ) -> UpgradeResult<Option<JobHandle>> {
        if !record.accepts_change(&change) {
            return Err(StateError::Conflict(format!(
                "{} has a job in flight; not starting {change}",
                record.id
            ))
            .into());
        }
        let Some(job_type) = record.next_job(&change) else {
            debug!(application = %record.id, %change, "no job left to run");
            return Ok(None);
        };
        // Application changes deploy on the platform version already in use.
        let version = match change.target_version() {
            Some(version) => version.clone(),
            None => match record
                .production_version()
                .map_or_else(|| self.store.system_version(), |v| Ok(Some(v)))?
            {
                Some(version) => version,
                None => {
                    debug!(application = %record.id, %change, "no platform version to deploy on");
                    return Ok(None);
                }
            },
        };

        let handle = self
            .bounded(self.queue.trigger(&record.id, &job_type, &version))
            .await?;

        let now = epoch_secs();
        record.job_status_mut(&job_type).last_triggered = Some(JobRun {
            number: handle.number,
            version: version.clone(),
            change: Some(change.clone()),
            at: now,
        });
        record.in_flight = Some(InFlightJob {
            handle: handle.clone(),
            change: change.clone(),
            state: JobState::Pending,
            triggered_at: now,
        });
        record.change = Some(change);
        record.updated_at = now;
        self.store.put_application(record)?;

        info!(
            application = %record.id,
            job = %job_type,
            %version,
            number = handle.number,
            "triggered job"
        );
        Ok(Some(handle))
    }

    /// Apply a completion report.
    ///
    /// Every new report is recorded as an outcome first. Reports are
    /// deduplicated by (application, job type, version, job number).
    pub async fn notify(&self, report: &JobReport) -> UpgradeResult<Completion> {
        let now = epoch_secs();
        let outcome = JobOutcome {
            application: report.application.clone(),
            job_type: report.job_type.clone(),
            version: report.version.clone(),
            number: report.number,
            result: report.result,
            recorded_at: now,
        };
        if !self.store.record_outcome(&outcome)? {
            debug!(job = %report.handle(), "duplicate completion report ignored");
            return Ok(Completion::Duplicate);
        }

        let Some(mut record) = self.store.get_application(&report.application)? else {
            warn!(job = %report.handle(), "completion report for unknown application");
            return Ok(Completion::Untracked);
        };

        if report.job_type == JobType::Component {
            return self.component_completed(record, report, now).await;
        }

        let Some(in_flight) = record
            .in_flight
            .clone()
            .filter(|job| job.handle.matches(report))
        else {
            warn!(
                application = %record.id,
                job = %report.handle(),
                "completion report for a job the orchestrator did not trigger"
            );
            return Ok(Completion::Untracked);
        };

        let cancel_requested = in_flight.state == JobState::CancelRequested;
        record.job_status_mut(&report.job_type).complete(
            JobRun {
                number: report.number,
                version: report.version.clone(),
                change: Some(in_flight.change.clone()),
                at: now,
            },
            report.result,
        );
        if let Some(job) = record.in_flight.as_mut() {
            job.state = JobState::Completed(report.result);
        }
        if report.result.is_success()
            && let Some(zone) = report.job_type.zone()
        {
            record.record_deployment(zone, report.version.clone(), now);
        }
        record.updated_at = now;

        if cancel_requested {
            record.change = None;
            record.in_flight = None;
            self.store.put_application(&record)?;
            info!(
                application = %record.id,
                job = %report.handle(),
                "job finished after cancellation was requested; change withdrawn"
            );
            return Ok(Completion::Withdrawn);
        }

        if let JobResult::Failure(error) = report.result {
            self.store.put_application(&record)?;
            warn!(
                application = %record.id,
                job = %report.job_type,
                version = %report.version,
                %error,
                "job failed; change stays pending"
            );
            return Ok(Completion::Failed(error));
        }

        if record.next_job(&in_flight.change).is_none() {
            record.change = None;
            record.in_flight = None;
            self.store.put_application(&record)?;
            info!(application = %record.id, change = %in_flight.change, "change completed");
            return Ok(Completion::ChangeCompleted);
        }

        self.advance(record, in_flight.change).await
    }

    /// A component job built a new application package; start deploying it
    /// unless another job is in flight.
    async fn component_completed(
        &self,
        mut record: ApplicationRecord,
        report: &JobReport,
        now: u64,
    ) -> UpgradeResult<Completion> {
        record.job_status_mut(&JobType::Component).complete(
            JobRun {
                number: report.number,
                version: report.version.clone(),
                change: None,
                at: now,
            },
            report.result,
        );
        record.updated_at = now;

        if !report.result.is_success() || record.has_outstanding_job() {
            self.store.put_application(&record)?;
            return Ok(Completion::Recorded);
        }

        let change = Change::Application {
            build: report.number,
        };
        let outcome = self.advance(record.clone(), change.clone()).await?;
        if outcome == Completion::Stalled {
            // Keep the build as the pending change so maintenance resumes it.
            record.change = Some(change);
            record.in_flight = None;
            self.store.put_application(&record)?;
        }
        Ok(outcome)
    }

    /// Trigger the next job of `change`, storing `record` as is if that fails.
    async fn advance(
        &self,
        mut record: ApplicationRecord,
        change: Change,
    ) -> UpgradeResult<Completion> {
        match self.trigger_change(&mut record, change).await {
            Ok(Some(handle)) => Ok(Completion::Triggered(handle)),
            Ok(None) => {
                self.store.put_application(&record)?;
                Ok(Completion::Recorded)
            }
            Err(e @ (UpgradeError::Queue(_) | UpgradeError::Timeout(_))) => {
                self.store.put_application(&record)?;
                warn!(
                    application = %record.id,
                    error = %e,
                    "could not trigger next job; maintenance will retry"
                );
                Ok(Completion::Stalled)
            }
            Err(e) => Err(e),
        }
    }
}
