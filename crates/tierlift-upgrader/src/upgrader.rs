//! Upgrader — one maintenance run of the version rollout.
//!
//! Each run reads the system version, rates confidence in it, and then either
//! withdraws a broken version from the fleet or triggers upgrades for every
//! application whose tier is ready. Tiers are handled in rollout order
//! (canary, default, conservative) and applications in id order within a
//! tier. A failure for one application is logged and reported; it never
//! stops the run for the others.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, info, warn};

use tierlift_core::{ApplicationId, Change, JobHandle, JobState, JobType, Tier, Version};
use tierlift_jobs::CancelAck;
use tierlift_rollout::{
    Assessment, Confidence, ConfidenceEvaluator, VersionStatus, ready_to_upgrade,
    required_confidence,
};
use tierlift_state::{ApplicationRecord, StateStore};

use crate::error::UpgradeResult;
use crate::trigger::DeploymentTrigger;

/// An application the run could not handle, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct UpgradeFailure {
    pub application: ApplicationId,
    pub error: String,
}

/// What one maintenance run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaintenanceReport {
    /// The system version the run worked towards.
    pub version: Option<Version>,
    pub confidence: Option<Confidence>,
    /// Upgrade jobs triggered, in the order they were submitted.
    pub triggered: Vec<JobHandle>,
    /// Jobs triggered to resume pending application changes.
    pub resumed: Vec<JobHandle>,
    /// Queued jobs removed because the version is broken.
    pub cancelled: Vec<JobHandle>,
    /// Jobs of a broken version that had already started; their reports are awaited.
    pub cancel_requested: Vec<JobHandle>,
    /// Applications left alone.
    pub skipped: usize,
    pub failures: Vec<UpgradeFailure>,
    /// Outcomes of superseded versions dropped after the run.
    pub pruned: u32,
}

impl MaintenanceReport {
    fn fail(&mut self, application: &ApplicationId, error: impl ToString) {
        self.failures.push(UpgradeFailure {
            application: application.clone(),
            error: error.to_string(),
        });
    }
}

/// What happened to one application in a run.
enum Step {
    Triggered(JobHandle),
    Resumed(JobHandle),
    Skipped,
}

/// Decides which applications to upgrade, and withdraws broken versions.
pub struct Upgrader {
    store: StateStore,
    trigger: DeploymentTrigger,
    evaluator: ConfidenceEvaluator,
}

impl Upgrader {
    pub fn new(trigger: DeploymentTrigger, evaluator: ConfidenceEvaluator) -> Self {
        Self {
            store: trigger.store().clone(),
            trigger,
            evaluator,
        }
    }

    pub fn trigger(&self) -> &DeploymentTrigger {
        &self.trigger
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Rate the system version; `None` when no system version is set.
    pub fn assess(&self) -> UpgradeResult<Option<Assessment>> {
        let Some(version) = self.store.system_version()? else {
            return Ok(None);
        };
        let applications = self.store.list_applications()?;
        let outcomes = self.store.outcomes_for_version(&version)?;
        Ok(Some(self.evaluator.assess(&version, &applications, &outcomes)))
    }

    /// Status of every version in use.
    pub fn version_status(&self) -> UpgradeResult<VersionStatus> {
        version_status(&self.store, &self.evaluator)
    }

    /// Run one maintenance pass.
    pub async fn maintain(&self) -> UpgradeResult<MaintenanceReport> {
        let mut report = MaintenanceReport::default();
        let Some(version) = self.store.system_version()? else {
            debug!("no system version; nothing to upgrade");
            return Ok(report);
        };
        let applications = self.store.list_applications()?;
        if applications.is_empty() {
            debug!(%version, "no applications; nothing to upgrade");
            return Ok(report);
        }

        let outcomes = self.store.outcomes_for_version(&version)?;
        let assessment = self.evaluator.assess(&version, &applications, &outcomes);
        let confidence = assessment.confidence;
        report.version = Some(version.clone());
        report.confidence = Some(confidence);

        if confidence == Confidence::Broken {
            warn!(
                %version,
                failing = assessment.failing,
                attempted = assessment.attempted,
                fraction = assessment.failure_fraction(),
                "version is broken; withdrawing it from the fleet"
            );
            self.withdraw(&version, &applications, &mut report).await?;
        } else {
            self.mark_started(&applications, &mut report).await;
            for tier in Tier::ROLLOUT_ORDER {
                let ready = ready_to_upgrade(tier, confidence);
                for record in applications.iter().filter(|app| app.tier == tier) {
                    match self.upgrade(record, &version, ready).await {
                        Ok(Step::Triggered(handle)) => report.triggered.push(handle),
                        Ok(Step::Resumed(handle)) => report.resumed.push(handle),
                        Ok(Step::Skipped) => report.skipped += 1,
                        Err(e) => {
                            warn!(application = %record.id, %version, error = %e, "upgrade failed");
                            report.fail(&record.id, e);
                        }
                    }
                }
            }
        }

        match self.prune(&version, &applications) {
            Ok(pruned) => report.pruned = pruned,
            Err(e) => warn!(error = %e, "failed to prune outcome history"),
        }

        info!(
            %version,
            %confidence,
            triggered = report.triggered.len(),
            resumed = report.resumed.len(),
            cancelled = report.cancelled.len(),
            skipped = report.skipped,
            failures = report.failures.len(),
            "maintenance run complete"
        );
        Ok(report)
    }

    /// Decide what to do for one application.
    async fn upgrade(
        &self,
        record: &ApplicationRecord,
        version: &Version,
        ready: bool,
    ) -> UpgradeResult<Step> {
        if !record.has_production_deployment() {
            debug!(application = %record.id, "not deployed in production; skipping");
            return Ok(Step::Skipped);
        }
        if let Some(job) = record.in_flight.as_ref().filter(|j| j.state.is_outstanding()) {
            debug!(application = %record.id, job = %job.handle, "job in flight; skipping");
            return Ok(Step::Skipped);
        }

        let mut record = record.clone();
        if let Some(change) = record.change.clone().filter(Change::is_application_change) {
            // Application changes take precedence over version upgrades.
            return Ok(match self.trigger.trigger_change(&mut record, change).await? {
                Some(handle) => Step::Resumed(handle),
                None => Step::Skipped,
            });
        }

        if record.is_on_or_beyond(version) {
            return Ok(Step::Skipped);
        }
        if !ready {
            debug!(
                application = %record.id,
                tier = %record.tier,
                %version,
                required = %required_confidence(record.tier),
                "tier not ready"
            );
            return Ok(Step::Skipped);
        }
        if let Some(stale) = record
            .change
            .as_ref()
            .filter(|c| c.target_version() != Some(version))
        {
            info!(application = %record.id, superseded = %stale, %version, "replacing stale version change");
        }

        Ok(
            match self
                .trigger
                .trigger_change(&mut record, Change::version(version.clone()))
                .await?
            {
                Some(handle) => Step::Triggered(handle),
                None => Step::Skipped,
            },
        )
    }

    /// Cancel every queued job for a broken version, and stop pursuing it.
    ///
    /// Jobs already running cannot be cancelled; they are marked and their
    /// reports are still recorded when they arrive.
    async fn withdraw(
        &self,
        version: &Version,
        applications: &[ApplicationRecord],
        report: &mut MaintenanceReport,
    ) -> UpgradeResult<()> {
        let pending = self.trigger.pending_jobs().await?;
        let mut tracked = HashSet::new();

        for record in applications {
            let Some(change) = record
                .change
                .as_ref()
                .filter(|c| c.target_version() == Some(version))
            else {
                if let Some(job) = &record.in_flight {
                    tracked.insert(job.handle.clone());
                }
                continue;
            };

            let Some(job) = record.in_flight.as_ref().filter(|j| j.state.is_outstanding()) else {
                // Nothing queued; just stop pursuing the version.
                debug!(application = %record.id, %change, "dropping pending change");
                if let Err(e) = self.store.clear_pending_change(&record.id) {
                    report.fail(&record.id, e);
                }
                continue;
            };
            tracked.insert(job.handle.clone());
            if job.state == JobState::CancelRequested {
                continue;
            }

            if !pending.contains(&job.handle) {
                debug!(application = %record.id, job = %job.handle, "job already running; withdrawing when it reports");
                self.set_job_state(record, JobState::CancelRequested, report);
                report.cancel_requested.push(job.handle.clone());
                continue;
            }

            match self.trigger.cancel(&job.handle).await {
                Ok(CancelAck::Cancelled) => {
                    info!(application = %record.id, job = %job.handle, "cancelled job");
                    match self.store.clear_pending_change(&record.id) {
                        Ok(()) => report.cancelled.push(job.handle.clone()),
                        Err(e) => report.fail(&record.id, e),
                    }
                }
                Ok(CancelAck::AlreadyStarted) => {
                    info!(application = %record.id, job = %job.handle, "job started before it could be cancelled");
                    self.set_job_state(record, JobState::CancelRequested, report);
                    report.cancel_requested.push(job.handle.clone());
                }
                Err(e) => {
                    warn!(application = %record.id, job = %job.handle, error = %e, "failed to cancel job");
                    report.fail(&record.id, e);
                }
            }
        }

        // Jobs the registry does not know of, e.g. from a trigger call that timed out.
        let mut orphans: Vec<&JobHandle> = pending
            .iter()
            .filter(|h| &h.version == version && h.job_type != JobType::Component)
            .filter(|h| !tracked.contains(*h))
            .collect();
        orphans.sort_by(|a, b| (&a.application, &a.job_type).cmp(&(&b.application, &b.job_type)));
        for handle in orphans {
            match self.trigger.cancel(handle).await {
                Ok(CancelAck::Cancelled) => {
                    info!(job = %handle, "cancelled untracked job");
                    report.cancelled.push(handle.clone());
                }
                Ok(CancelAck::AlreadyStarted) => {
                    debug!(job = %handle, "untracked job already started");
                }
                Err(e) => {
                    warn!(job = %handle, error = %e, "failed to cancel untracked job");
                    report.fail(&handle.application, e);
                }
            }
        }
        Ok(())
    }

    /// Record which triggered jobs the job system has picked up.
    async fn mark_started(&self, applications: &[ApplicationRecord], report: &mut MaintenanceReport) {
        let pending = match self.trigger.pending_jobs().await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "could not list pending jobs");
                return;
            }
        };
        for record in applications {
            if let Some(job) = &record.in_flight
                && job.state == JobState::Pending
                && !pending.contains(&job.handle)
            {
                debug!(application = %record.id, job = %job.handle, "job started");
                self.set_job_state(record, JobState::Running, report);
            }
        }
    }

    fn set_job_state(
        &self,
        record: &ApplicationRecord,
        state: JobState,
        report: &mut MaintenanceReport,
    ) {
        let mut record = record.clone();
        if let Some(job) = record.in_flight.as_mut() {
            job.state = state;
        }
        if let Err(e) = self.store.put_application(&record) {
            report.fail(&record.id, e);
        }
    }

    /// Drop outcome history for versions nothing runs any more.
    fn prune(&self, version: &Version, applications: &[ApplicationRecord]) -> UpgradeResult<u32> {
        let oldest = applications
            .iter()
            .filter_map(ApplicationRecord::production_version)
            .min()
            .map_or_else(|| version.clone(), |oldest| oldest.min(version.clone()));
        Ok(self.store.prune_outcomes_before(&oldest)?)
    }
}

/// Status of every version in use, from the state store.
pub fn version_status(
    store: &StateStore,
    evaluator: &ConfidenceEvaluator,
) -> UpgradeResult<VersionStatus> {
    let system_version = store.system_version()?;
    let applications = store.list_applications()?;
    let mut outcomes = BTreeMap::new();
    for version in store.outcome_versions()? {
        let recorded = store.outcomes_for_version(&version)?;
        outcomes.insert(version, recorded);
    }
    Ok(VersionStatus::compute(
        evaluator,
        system_version.as_ref(),
        &applications,
        &outcomes,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tierlift_core::{JobError, JobResult, Zone};
    use tierlift_jobs::{InMemoryJobQueue, JobQueue, JobQueueResult};
    use tierlift_state::JobOutcome;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    fn seeded_store(apps: &[(&str, Tier)]) -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        for (name, tier) in apps {
            let mut record = ApplicationRecord::new(
                ApplicationId::new("tenant", name, "default"),
                *tier,
                vec!["us-east-3".to_string()],
                0,
            );
            record.record_deployment(Zone::prod("us-east-3"), v("5.0"), 0);
            store.put_application(&record).unwrap();
        }
        store
    }

    fn setup(apps: &[(&str, Tier)]) -> (Upgrader, Arc<InMemoryJobQueue>) {
        let queue = Arc::new(InMemoryJobQueue::new(0));
        let trigger =
            DeploymentTrigger::new(seeded_store(apps), queue.clone(), Duration::from_secs(5));
        (Upgrader::new(trigger, ConfidenceEvaluator::default()), queue)
    }

    /// A queue whose next `stalled` trigger calls never answer.
    struct StallingQueue {
        inner: InMemoryJobQueue,
        stalled: AtomicU32,
    }

    #[async_trait]
    impl JobQueue for StallingQueue {
        async fn trigger(
            &self,
            application: &ApplicationId,
            job_type: &JobType,
            version: &Version,
        ) -> JobQueueResult<JobHandle> {
            let stall = self
                .stalled
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if stall {
                std::future::pending::<()>().await;
            }
            self.inner.trigger(application, job_type, version).await
        }

        async fn cancel(&self, handle: &JobHandle) -> JobQueueResult<CancelAck> {
            self.inner.cancel(handle).await
        }

        async fn pending_jobs(&self) -> JobQueueResult<HashSet<JobHandle>> {
            self.inner.pending_jobs().await
        }
    }

    #[tokio::test]
    async fn no_system_version_is_a_no_op() {
        let (upgrader, queue) = setup(&[("c1", Tier::Canary)]);
        let report = upgrader.maintain().await.unwrap();
        assert_eq!(report, MaintenanceReport::default());
        assert!(queue.triggered().await.is_empty());
        assert!(upgrader.assess().unwrap().is_none());
    }

    #[tokio::test]
    async fn no_applications_is_a_no_op() {
        let (upgrader, queue) = setup(&[]);
        upgrader.store().set_system_version(&v("5.1")).unwrap();
        let report = upgrader.maintain().await.unwrap();
        assert!(report.confidence.is_none());
        assert!(queue.triggered().await.is_empty());
    }

    #[tokio::test]
    async fn only_canaries_upgrade_at_low_confidence() {
        let (upgrader, _queue) = setup(&[
            ("c1", Tier::Canary),
            ("d1", Tier::Default),
            ("k1", Tier::Conservative),
        ]);
        upgrader.store().set_system_version(&v("5.1")).unwrap();

        let report = upgrader.maintain().await.unwrap();
        assert_eq!(report.confidence, Some(Confidence::Low));
        assert_eq!(report.triggered.len(), 1);
        assert_eq!(report.triggered[0].application.application, "c1");
        assert_eq!(report.skipped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_trigger_times_out_and_is_retried() {
        let queue = Arc::new(StallingQueue {
            inner: InMemoryJobQueue::new(0),
            stalled: AtomicU32::new(1),
        });
        let store = seeded_store(&[("c1", Tier::Canary)]);
        let trigger = DeploymentTrigger::new(store.clone(), queue.clone(), Duration::from_secs(5));
        let upgrader = Upgrader::new(trigger, ConfidenceEvaluator::default());
        store.set_system_version(&v("5.1")).unwrap();
        let id = ApplicationId::new("tenant", "c1", "default");

        let report = upgrader.maintain().await.unwrap();
        assert!(report.triggered.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].application, id);
        assert!(report.failures[0].error.contains("did not answer"));
        let record = store.require_application(&id).unwrap();
        assert!(record.change.is_none());
        assert!(record.in_flight.is_none());
        assert!(queue.inner.triggered().await.is_empty());

        let report = upgrader.maintain().await.unwrap();
        assert!(report.failures.is_empty());
        assert_eq!(report.triggered.len(), 1);
        let record = store.require_application(&id).unwrap();
        assert_eq!(record.change, Some(Change::version(v("5.1"))));
        assert_eq!(queue.inner.triggered().await, report.triggered);
    }

    #[tokio::test]
    async fn application_change_takes_precedence() {
        let (upgrader, queue) = setup(&[("c1", Tier::Canary)]);
        let id = ApplicationId::new("tenant", "c1", "default");
        upgrader
            .store()
            .set_pending_change(&id, &Change::Application { build: 3 })
            .unwrap();
        upgrader.store().set_system_version(&v("5.1")).unwrap();

        let report = upgrader.maintain().await.unwrap();
        assert!(report.triggered.is_empty());
        assert_eq!(report.resumed.len(), 1);
        assert_eq!(report.resumed[0].version, v("5.0"));
        assert_eq!(queue.triggered().await.len(), 1);
    }

    #[tokio::test]
    async fn per_application_errors_do_not_stop_the_run() {
        let (upgrader, queue) = setup(&[("c1", Tier::Canary), ("c2", Tier::Canary)]);
        upgrader.store().set_system_version(&v("5.1")).unwrap();
        queue.fail_next_triggers(1).await;

        let report = upgrader.maintain().await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].application.application, "c1");
        assert_eq!(report.triggered.len(), 1);
        assert_eq!(report.triggered[0].application.application, "c2");

        // c1 was left without a pending change and is retried.
        let c1 = upgrader
            .store()
            .require_application(&ApplicationId::new("tenant", "c1", "default"))
            .unwrap();
        assert!(c1.change.is_none());
        let report = upgrader.maintain().await.unwrap();
        assert_eq!(report.triggered.len(), 1);
        assert_eq!(report.triggered[0].application.application, "c1");
    }

    #[tokio::test]
    async fn broken_version_drops_idle_changes() {
        let mut apps = vec![("c1", Tier::Canary)];
        let names = ["d1", "d2", "d3", "d4"];
        apps.extend(names.iter().map(|n| (*n, Tier::Default)));
        let (upgrader, queue) = setup(&apps);
        let store = upgrader.store().clone();
        store.set_system_version(&v("5.1")).unwrap();

        // The canary is on 5.1; four defaults failed and hold a pending change.
        let mut canary = store
            .require_application(&ApplicationId::new("tenant", "c1", "default"))
            .unwrap();
        canary.record_deployment(Zone::prod("us-east-3"), v("5.1"), 0);
        store.put_application(&canary).unwrap();
        for name in names {
            let id = ApplicationId::new("tenant", name, "default");
            store
                .set_pending_change(&id, &Change::version(v("5.1")))
                .unwrap();
            store
                .record_outcome(&JobOutcome {
                    application: id,
                    job_type: JobType::SystemTest,
                    version: v("5.1"),
                    number: 1,
                    result: JobResult::Failure(JobError::TestFailure),
                    recorded_at: 0,
                })
                .unwrap();
        }

        let report = upgrader.maintain().await.unwrap();
        assert_eq!(report.confidence, Some(Confidence::Broken));
        assert!(report.triggered.is_empty());
        for record in store.list_applications().unwrap() {
            assert!(record.change.is_none(), "{} kept its change", record.id);
        }
        assert!(queue.triggered().await.is_empty());
    }

    #[tokio::test]
    async fn prunes_history_of_versions_no_longer_in_use() {
        let (upgrader, _queue) = setup(&[("c1", Tier::Canary)]);
        let store = upgrader.store().clone();
        for version in ["4.9", "5.0"] {
            store
                .record_outcome(&JobOutcome {
                    application: ApplicationId::new("tenant", "c1", "default"),
                    job_type: JobType::SystemTest,
                    version: v(version),
                    number: 1,
                    result: JobResult::Success,
                    recorded_at: 0,
                })
                .unwrap();
        }
        store.set_system_version(&v("5.1")).unwrap();

        let report = upgrader.maintain().await.unwrap();
        assert_eq!(report.pruned, 1);
        let kept: Vec<Version> = store.outcome_versions().unwrap().into_iter().collect();
        assert_eq!(kept, vec![v("5.0")]);
    }
}
