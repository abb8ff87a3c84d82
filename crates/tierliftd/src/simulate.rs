//! Fleet rollout simulation.
//!
//! A fleet file describes applications (tier, production regions, current
//! version, versions their tests fail on) and a list of releases. Each release
//! becomes the system version in turn while the maintainer loop runs against
//! an in-memory store and job queue, and a simulated executor runs every
//! queued job once per round.
//!
//! ```toml
//! releases = ["5.1", "5.2"]
//!
//! [[applications]]
//! id = "tenant.shop.default"
//! tier = "canary"
//! regions = ["us-east-3", "eu-west-1"]
//! version = "5.0"
//! fails_on = ["5.1"]
//! ```

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use tierlift_core::{
    ApplicationId, JobError, JobHandle, JobResult, JobType, Tier, TierliftConfig, Version, Zone,
};
use tierlift_jobs::InMemoryJobQueue;
use tierlift_rollout::Confidence;
use tierlift_state::{ApplicationRecord, StateStore, epoch_secs};
use tierlift_upgrader::{Maintainer, Orchestrator, UpgradeMetrics};

/// A simulated fleet and the releases to roll out across it.
#[derive(Debug, Clone, Deserialize)]
pub struct Fleet {
    /// Versions published in order; each must be newer than the last.
    pub releases: Vec<Version>,
    #[serde(default)]
    pub applications: Vec<FleetApplication>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FleetApplication {
    /// `tenant.application.instance`.
    pub id: String,
    #[serde(default)]
    pub tier: Tier,
    #[serde(default = "default_regions")]
    pub regions: Vec<String>,
    /// Version running in every production region at the start.
    pub version: Version,
    /// Versions on which the application's system test fails.
    #[serde(default)]
    pub fails_on: Vec<Version>,
}

fn default_regions() -> Vec<String> {
    vec!["us-east-3".to_string()]
}

impl Fleet {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read fleet file {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let fleet: Fleet = toml::from_str(content)?;
        fleet.validate()?;
        Ok(fleet)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.releases.is_empty() {
            anyhow::bail!("fleet has no releases");
        }
        if self.releases.windows(2).any(|pair| pair[0] >= pair[1]) {
            anyhow::bail!("releases must be strictly increasing");
        }
        let mut seen = HashSet::new();
        for app in &self.applications {
            let id: ApplicationId = app.id.parse()?;
            if !seen.insert(id) {
                anyhow::bail!("application {} is listed twice", app.id);
            }
            if app.regions.is_empty() {
                anyhow::bail!("application {} has no production regions", app.id);
            }
        }
        Ok(())
    }

    /// Register every application as deployed on its starting version.
    pub fn seed(&self, store: &StateStore) -> anyhow::Result<()> {
        let now = epoch_secs();
        for app in &self.applications {
            let mut record =
                ApplicationRecord::new(app.id.parse()?, app.tier, app.regions.clone(), now);
            for region in &app.regions {
                record.record_deployment(Zone::prod(region), app.version.clone(), now);
            }
            store.put_application(&record)?;
        }
        Ok(())
    }

    fn failures(&self) -> anyhow::Result<HashMap<ApplicationId, HashSet<Version>>> {
        let mut failures = HashMap::new();
        for app in &self.applications {
            if !app.fails_on.is_empty() {
                failures.insert(app.id.parse()?, app.fails_on.iter().cloned().collect());
            }
        }
        Ok(failures)
    }
}

/// How the rollout of one release ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseOutcome {
    /// Every production application reached the release.
    Converged,
    /// The release was rated broken and its jobs drained.
    Withdrawn,
    /// Neither happened within the round limit.
    Stalled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReleaseSummary {
    pub version: Version,
    pub outcome: ReleaseOutcome,
    pub rounds: u32,
    /// Production applications on or beyond the release.
    pub upgraded: usize,
    pub applications: usize,
    pub confidence: Option<Confidence>,
}

/// Drives an orchestrator over a simulated fleet.
pub struct Simulation {
    orchestrator: Arc<Orchestrator>,
    queue: Arc<InMemoryJobQueue>,
    releases: Vec<Version>,
    failures: HashMap<ApplicationId, HashSet<Version>>,
}

impl Simulation {
    pub fn new(fleet: Fleet, config: &TierliftConfig) -> anyhow::Result<Self> {
        let store = StateStore::open_in_memory()?;
        fleet.seed(&store)?;
        let queue = Arc::new(InMemoryJobQueue::from_config(&config.jobs));
        let orchestrator = Arc::new(Orchestrator::new(store, queue.clone(), config));
        Ok(Self {
            orchestrator,
            queue,
            failures: fleet.failures()?,
            releases: fleet.releases,
        })
    }

    pub fn metrics(&self) -> Arc<UpgradeMetrics> {
        self.orchestrator.metrics()
    }

    /// Roll every release out in turn, until the last one settles or
    /// `interrupt` resolves.
    ///
    /// Returns a summary for each release that settled.
    pub async fn run(
        &self,
        interval: Duration,
        max_rounds: u32,
        interrupt: impl Future<Output = ()>,
    ) -> anyhow::Result<Vec<ReleaseSummary>> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let maintainer = Arc::new(Maintainer::new(self.orchestrator.clone(), interval));
        let maintainer_handle = {
            let maintainer = maintainer.clone();
            tokio::spawn(async move { maintainer.run(shutdown_rx).await })
        };

        let mut summaries = Vec::new();
        let result = tokio::select! {
            result = self.roll_out(interval, max_rounds, &mut summaries) => result,
            _ = interrupt => {
                info!("simulation interrupted");
                Ok(())
            }
        };

        let _ = shutdown_tx.send(true);
        maintainer_handle.await?;
        result.map(|_| summaries)
    }

    async fn roll_out(
        &self,
        interval: Duration,
        max_rounds: u32,
        summaries: &mut Vec<ReleaseSummary>,
    ) -> anyhow::Result<()> {
        for release in &self.releases {
            self.orchestrator.store().set_system_version(release)?;
            info!(version = %release, "release published");

            let mut rounds = 0;
            let outcome = loop {
                tokio::time::sleep(interval).await;
                rounds += 1;
                let executed = self.execute_jobs().await?;
                debug!(round = rounds, executed, "executor round finished");

                if let Some(outcome) = self.settled(release).await? {
                    break outcome;
                }
                if rounds >= max_rounds {
                    warn!(version = %release, rounds, "release did not settle");
                    break ReleaseOutcome::Stalled;
                }
            };

            let summary = self.summarize(release, outcome, rounds).await?;
            info!(
                version = %release,
                outcome = ?summary.outcome,
                upgraded = summary.upgraded,
                applications = summary.applications,
                "release settled"
            );
            summaries.push(summary);
        }
        Ok(())
    }

    /// Run every queued job once and deliver the terminal reports.
    pub async fn execute_jobs(&self) -> anyhow::Result<usize> {
        let handles = self.queue.take_jobs_to_run().await;
        for handle in &handles {
            let result = self.result_for(handle);
            if let Some(report) = self.queue.complete(handle, result).await? {
                self.orchestrator.notify_job_completion(&report).await?;
            }
        }
        Ok(handles.len())
    }

    fn result_for(&self, handle: &JobHandle) -> JobResult {
        let fails = handle.job_type == JobType::SystemTest
            && self
                .failures
                .get(&handle.application)
                .is_some_and(|versions| versions.contains(&handle.version));
        if fails {
            JobResult::Failure(JobError::TestFailure)
        } else {
            JobResult::Success
        }
    }

    async fn settled(&self, release: &Version) -> anyhow::Result<Option<ReleaseOutcome>> {
        let (upgraded, total) = self.progress(release)?;
        if upgraded == total {
            return Ok(Some(ReleaseOutcome::Converged));
        }
        if self.orchestrator.confidence().await? != Some(Confidence::Broken) {
            return Ok(None);
        }
        let changes_left = self
            .orchestrator
            .store()
            .list_applications()?
            .iter()
            .any(|app| app.change.as_ref().and_then(|c| c.target_version()) == Some(release));
        if !changes_left && self.queue.is_empty().await {
            return Ok(Some(ReleaseOutcome::Withdrawn));
        }
        Ok(None)
    }

    fn progress(&self, release: &Version) -> anyhow::Result<(usize, usize)> {
        let applications = self.orchestrator.store().list_applications()?;
        let production: Vec<_> = applications
            .iter()
            .filter(|app| app.has_production_deployment())
            .collect();
        let upgraded = production
            .iter()
            .filter(|app| app.is_on_or_beyond(release))
            .count();
        Ok((upgraded, production.len()))
    }

    async fn summarize(
        &self,
        release: &Version,
        outcome: ReleaseOutcome,
        rounds: u32,
    ) -> anyhow::Result<ReleaseSummary> {
        let (upgraded, applications) = self.progress(release)?;
        Ok(ReleaseSummary {
            version: release.clone(),
            outcome,
            rounds,
            upgraded,
            applications,
            confidence: self.orchestrator.confidence().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    fn fleet(releases: &[&str], defaults_failing_on: &[&str]) -> Fleet {
        let mut applications = Vec::new();
        let mut add = |name: &str, tier: Tier, fails_on: &[&str]| {
            applications.push(FleetApplication {
                id: format!("tenant.{name}.default"),
                tier,
                regions: default_regions(),
                version: v("5.0"),
                fails_on: fails_on.iter().map(|s| v(s)).collect(),
            });
        };
        add("canary1", Tier::Canary, &[]);
        add("canary2", Tier::Canary, &[]);
        for i in 1..=6 {
            let fails = if i <= 4 { defaults_failing_on } else { &[] };
            add(&format!("default{i}"), Tier::Default, fails);
        }
        add("conservative1", Tier::Conservative, &[]);
        Fleet {
            releases: releases.iter().map(|s| v(s)).collect(),
            applications,
        }
    }

    #[test]
    fn parses_example_fleet() {
        let fleet = Fleet::from_toml_str(include_str!("../fleet.example.toml")).unwrap();
        assert_eq!(fleet.releases, vec![v("5.1"), v("5.2")]);
        assert!(fleet.applications.len() >= 5);
        assert!(
            fleet
                .applications
                .iter()
                .any(|app| app.tier == Tier::Conservative)
        );
    }

    #[test]
    fn fleet_defaults_apply() {
        let fleet = Fleet::from_toml_str(
            r#"
releases = ["5.1"]

[[applications]]
id = "tenant.app.default"
version = "5.0"
"#,
        )
        .unwrap();
        let app = &fleet.applications[0];
        assert_eq!(app.tier, Tier::Default);
        assert_eq!(app.regions, vec!["us-east-3".to_string()]);
        assert!(app.fails_on.is_empty());
    }

    #[test]
    fn rejects_invalid_fleets() {
        assert!(Fleet::from_toml_str("releases = []").is_err());
        assert!(Fleet::from_toml_str(r#"releases = ["5.2", "5.1"]"#).is_err());

        let bad_id = r#"
releases = ["5.1"]

[[applications]]
id = "not-an-id"
version = "5.0"
"#;
        assert!(Fleet::from_toml_str(bad_id).is_err());

        let duplicate = r#"
releases = ["5.1"]

[[applications]]
id = "tenant.app.default"
version = "5.0"

[[applications]]
id = "tenant.app.default"
version = "5.0"
"#;
        assert!(Fleet::from_toml_str(duplicate).is_err());

        let no_regions = r#"
releases = ["5.1"]

[[applications]]
id = "tenant.app.default"
version = "5.0"
regions = []
"#;
        assert!(Fleet::from_toml_str(no_regions).is_err());
    }

    #[test]
    fn seeds_production_deployments() {
        let store = StateStore::open_in_memory().unwrap();
        fleet(&["5.1"], &[]).seed(&store).unwrap();

        let applications = store.list_applications().unwrap();
        assert_eq!(applications.len(), 9);
        assert!(
            applications
                .iter()
                .all(|app| app.production_version() == Some(v("5.0")))
        );
    }

    #[tokio::test]
    async fn system_test_fails_only_on_listed_versions() {
        let simulation =
            Simulation::new(fleet(&["5.1"], &["5.1"]), &TierliftConfig::default()).unwrap();
        let failing = ApplicationId::new("tenant", "default1", "default");
        let handle = |job_type: JobType, version: &str| JobHandle {
            application: failing.clone(),
            job_type,
            version: v(version),
            number: 1,
        };

        assert!(!simulation.result_for(&handle(JobType::SystemTest, "5.1")).is_success());
        assert!(simulation.result_for(&handle(JobType::SystemTest, "5.2")).is_success());
        assert!(simulation.result_for(&handle(JobType::StagingTest, "5.1")).is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_release_converges() {
        let simulation =
            Simulation::new(fleet(&["5.1"], &[]), &TierliftConfig::default()).unwrap();

        let summaries = simulation
            .run(Duration::from_secs(1), 100, std::future::pending())
            .await
            .unwrap();

        assert_eq!(summaries.len(), 1);
        let summary = &summaries[0];
        assert_eq!(summary.outcome, ReleaseOutcome::Converged);
        assert_eq!(summary.upgraded, 9);
        assert_eq!(summary.applications, 9);
        assert_eq!(summary.confidence, Some(Confidence::High));
    }

    #[tokio::test(start_paused = true)]
    async fn broken_release_is_withdrawn_and_next_release_converges() {
        let simulation =
            Simulation::new(fleet(&["5.1", "5.2"], &["5.1"]), &TierliftConfig::default())
                .unwrap();

        let summaries = simulation
            .run(Duration::from_secs(1), 100, std::future::pending())
            .await
            .unwrap();

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].outcome, ReleaseOutcome::Withdrawn);
        assert_eq!(summaries[0].confidence, Some(Confidence::Broken));
        assert!(summaries[0].upgraded < summaries[0].applications);

        assert_eq!(summaries[1].outcome, ReleaseOutcome::Converged);
        assert_eq!(summaries[1].upgraded, 9);
        assert!(simulation.metrics().snapshot().broken_runs >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_stops_the_simulation() {
        let simulation =
            Simulation::new(fleet(&["5.1"], &[]), &TierliftConfig::default()).unwrap();

        let summaries = simulation
            .run(Duration::from_secs(1), 100, async {})
            .await
            .unwrap();

        assert!(summaries.is_empty());
    }
}
