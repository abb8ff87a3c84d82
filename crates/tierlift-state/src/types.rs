//! Records persisted by the tierlift state store.
//!
//! An `ApplicationRecord` is the registry's view of one application: its
//! tier, where it is deployed and at which version, the change it is
//! adopting, the job currently in flight for that change, and the status of
//! every job type it has run. `JobOutcome`s are the append-only history of
//! terminal job results.

use serde::{Deserialize, Serialize};

use tierlift_core::{
    ApplicationId, Change, Environment, JobError, JobHandle, JobResult, JobState, JobType, Tier,
    Version, Zone,
};

// ── Application ───────────────────────────────────────────────────

/// An application and its deployment state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationRecord {
    pub id: ApplicationId,
    pub tier: Tier,
    /// Production regions, in deployment order.
    pub production_regions: Vec<String>,
    /// Current deployments, one per zone.
    pub deployments: Vec<Deployment>,
    /// The change being rolled out, if any.
    pub change: Option<Change>,
    /// The job currently submitted for `change`.
    pub in_flight: Option<InFlightJob>,
    /// Status per job type.
    pub job_status: Vec<JobStatus>,
    /// Unix timestamp (seconds) when this record was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) when this record was last updated.
    pub updated_at: u64,
}

/// A deployment of an application to one zone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub zone: Zone,
    pub version: Version,
    pub deployed_at: u64,
}

/// A job submitted for an application's pending change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InFlightJob {
    pub handle: JobHandle,
    pub change: Change,
    pub state: JobState,
    pub triggered_at: u64,
}

/// One run of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRun {
    pub number: u64,
    pub version: Version,
    /// The change the run was part of; absent for runs the orchestrator did not trigger.
    pub change: Option<Change>,
    pub at: u64,
}

/// History of one job type for one application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStatus {
    pub job_type: JobType,
    pub last_triggered: Option<JobRun>,
    pub last_completed: Option<JobRun>,
    pub last_success: Option<JobRun>,
    /// First run of the current streak of failures.
    pub first_failing: Option<JobRun>,
    /// Error of the last completed run, if it failed.
    pub error: Option<JobError>,
}

impl JobStatus {
    pub fn new(job_type: JobType) -> Self {
        Self {
            job_type,
            last_triggered: None,
            last_completed: None,
            last_success: None,
            first_failing: None,
            error: None,
        }
    }

    pub fn is_failing(&self) -> bool {
        self.error.is_some()
    }

    /// Record a completed run.
    pub fn complete(&mut self, run: JobRun, result: JobResult) {
        match result {
            JobResult::Success => {
                self.last_success = Some(run.clone());
                self.first_failing = None;
                self.error = None;
            }
            JobResult::Failure(error) => {
                if self.first_failing.is_none() {
                    self.first_failing = Some(run.clone());
                }
                self.error = Some(error);
            }
        }
        self.last_completed = Some(run);
    }
}

impl ApplicationRecord {
    /// A new application with no deployments.
    pub fn new(id: ApplicationId, tier: Tier, production_regions: Vec<String>, now: u64) -> Self {
        Self {
            id,
            tier,
            production_regions,
            deployments: Vec::new(),
            change: None,
            in_flight: None,
            job_status: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Build the key for the applications table.
    pub fn table_key(&self) -> String {
        self.id.table_key()
    }

    /// The jobs a change must pass, in order.
    pub fn pipeline(&self) -> Vec<JobType> {
        JobType::pipeline(&self.production_regions)
    }

    /// The lowest version deployed in the given environment.
    pub fn deployed_version(&self, environment: Environment) -> Option<Version> {
        self.deployments
            .iter()
            .filter(|d| d.zone.environment == environment)
            .map(|d| d.version.clone())
            .min()
    }

    /// The version the application runs in production (lowest across regions).
    pub fn production_version(&self) -> Option<Version> {
        self.deployed_version(Environment::Prod)
    }

    pub fn has_production_deployment(&self) -> bool {
        self.deployments
            .iter()
            .any(|d| d.zone.environment == Environment::Prod)
    }

    /// Whether every production deployment runs `version` or newer.
    pub fn is_on_or_beyond(&self, version: &Version) -> bool {
        self.production_version().is_some_and(|v| &v >= version)
    }

    /// Insert or replace the deployment in a zone.
    pub fn record_deployment(&mut self, zone: Zone, version: Version, at: u64) {
        match self.deployments.iter_mut().find(|d| d.zone == zone) {
            Some(existing) => {
                existing.version = version;
                existing.deployed_at = at;
            }
            None => self.deployments.push(Deployment {
                zone,
                version,
                deployed_at: at,
            }),
        }
    }

    pub fn job_status(&self, job_type: &JobType) -> Option<&JobStatus> {
        self.job_status.iter().find(|s| &s.job_type == job_type)
    }

    /// Status of a job type, created empty on first use.
    pub fn job_status_mut(&mut self, job_type: &JobType) -> &mut JobStatus {
        let index = match self.job_status.iter().position(|s| &s.job_type == job_type) {
            Some(i) => i,
            None => {
                self.job_status.push(JobStatus::new(job_type.clone()));
                self.job_status.len() - 1
            }
        };
        &mut self.job_status[index]
    }

    /// Whether any job's last run failed.
    pub fn has_failures(&self) -> bool {
        self.job_status.iter().any(JobStatus::is_failing)
    }

    /// Whether a job report is still expected for this application.
    pub fn has_outstanding_job(&self) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|job| job.state.is_outstanding())
    }

    /// Whether `change` may become the pending change: it already is, or no
    /// job for the current one is outstanding.
    pub fn accepts_change(&self, change: &Change) -> bool {
        self.change.as_ref() == Some(change) || !self.has_outstanding_job()
    }

    /// The first pipeline job that has not yet succeeded as part of `change`.
    pub fn next_job(&self, change: &Change) -> Option<JobType> {
        self.pipeline().into_iter().find(|job| {
            self.job_status(job)
                .and_then(|s| s.last_success.as_ref())
                .and_then(|run| run.change.as_ref())
                != Some(change)
        })
    }
}

// ── Outcomes ──────────────────────────────────────────────────────

/// A terminal job result, kept as confidence evidence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobOutcome {
    pub application: ApplicationId,
    pub job_type: JobType,
    pub version: Version,
    pub number: u64,
    pub result: JobResult,
    /// Unix timestamp (seconds) when the outcome was recorded.
    pub recorded_at: u64,
}

impl JobOutcome {
    /// Build the key for the outcomes table.
    pub fn table_key(&self) -> String {
        outcome_key(&self.version, &self.application, &self.job_type, self.number)
    }

    pub fn is_failure(&self) -> bool {
        !self.result.is_success()
    }
}

pub(crate) fn outcome_key(
    version: &Version,
    application: &ApplicationId,
    job_type: &JobType,
    number: u64,
) -> String {
    format!("{version}/{application}/{job_type}/{number:020}")
}

/// Prefix shared by all outcome keys of a version.
pub(crate) fn outcome_prefix(version: &Version) -> String {
    format!("{version}/")
}
