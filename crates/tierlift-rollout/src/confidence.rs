//! Version confidence — how safe a platform version has proven to be.
//!
//! The rating is derived from the applications' deployment state and the job
//! outcomes recorded for the version:
//!
//! 1. Canaries gate everything. Until every canary with a production
//!    deployment runs the version, confidence is `Low`.
//! 2. Among the other applications, those whose latest run of some job failed
//!    on the version count as failing; those already on it as succeeded. When
//!    enough of the attempted applications fail, the version is `Broken`.
//! 3. Once every default-tier application runs the version and no attempted
//!    application is failing on it, it is `High`.
//! 4. Otherwise it is `Normal`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use tierlift_core::{ApplicationId, ConfidenceConfig, JobType, Tier, Version};
use tierlift_state::{ApplicationRecord, JobOutcome};

/// Confidence in a platform version, ordered from worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Too many applications fail on the version; roll it back fleet-wide.
    Broken,
    /// Canaries have not yet proven the version.
    Low,
    /// Canaries run the version; default-tier applications may upgrade.
    Normal,
    /// The default tier runs the version; conservative applications may upgrade.
    High,
}

impl Confidence {
    pub fn name(&self) -> &'static str {
        match self {
            Confidence::Broken => "broken",
            Confidence::Low => "low",
            Confidence::Normal => "normal",
            Confidence::High => "high",
        }
    }

    /// Numeric value for gauges.
    pub fn level(&self) -> u8 {
        match self {
            Confidence::Broken => 0,
            Confidence::Low => 1,
            Confidence::Normal => 2,
            Confidence::High => 3,
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A confidence rating together with the evidence behind it.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub confidence: Confidence,
    /// Non-canary applications failing on the version.
    pub failing: usize,
    /// Non-canary applications failing on or running the version.
    pub attempted: usize,
}

impl Assessment {
    /// Failing share of attempted applications; zero when nothing was attempted.
    pub fn failure_fraction(&self) -> f64 {
        if self.attempted == 0 {
            0.0
        } else {
            self.failing as f64 / self.attempted as f64
        }
    }
}

/// Computes confidence from fleet state.
#[derive(Debug, Clone, Default)]
pub struct ConfidenceEvaluator {
    config: ConfidenceConfig,
}

impl ConfidenceEvaluator {
    pub fn new(config: ConfidenceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConfidenceConfig {
        &self.config
    }

    /// Confidence in `version`.
    pub fn evaluate(
        &self,
        version: &Version,
        applications: &[ApplicationRecord],
        outcomes: &[JobOutcome],
    ) -> Confidence {
        self.assess(version, applications, outcomes).confidence
    }

    /// Confidence in `version` with the failure counts it was derived from.
    ///
    /// `outcomes` must be the outcomes recorded for `version`; others are ignored.
    pub fn assess(
        &self,
        version: &Version,
        applications: &[ApplicationRecord],
        outcomes: &[JobOutcome],
    ) -> Assessment {
        let failing_ids = failing_applications(version, outcomes);
        let production: Vec<&ApplicationRecord> = applications
            .iter()
            .filter(|app| app.has_production_deployment())
            .collect();

        let is_failing = |app: &ApplicationRecord| {
            !app.is_on_or_beyond(version) && failing_ids.contains(&app.id)
        };

        let canaries_done = production
            .iter()
            .filter(|app| app.tier == Tier::Canary)
            .all(|app| app.is_on_or_beyond(version));

        let mut failing = 0;
        let mut succeeded = 0;
        for app in production.iter().filter(|app| app.tier != Tier::Canary) {
            if app.is_on_or_beyond(version) {
                succeeded += 1;
            } else if is_failing(app) {
                failing += 1;
            }
        }
        let attempted = failing + succeeded;

        let mut assessment = Assessment {
            confidence: Confidence::Normal,
            failing,
            attempted,
        };

        assessment.confidence = if !canaries_done {
            Confidence::Low
        } else if failing >= self.config.broken_min_failures as usize
            && assessment.failure_fraction() > self.config.broken_failure_fraction
        {
            Confidence::Broken
        } else if failing == 0
            && production
                .iter()
                .filter(|app| app.tier == Tier::Default)
                .all(|app| app.is_on_or_beyond(version))
        {
            Confidence::High
        } else {
            Confidence::Normal
        };

        debug!(
            %version,
            confidence = %assessment.confidence,
            failing,
            attempted,
            "assessed version confidence"
        );
        assessment
    }
}

/// Applications whose latest run of some job on `version` failed.
pub fn failing_applications(version: &Version, outcomes: &[JobOutcome]) -> BTreeSet<ApplicationId> {
    let mut latest: BTreeMap<(&ApplicationId, &JobType), &JobOutcome> = BTreeMap::new();
    for outcome in outcomes.iter().filter(|o| &o.version == version) {
        latest
            .entry((&outcome.application, &outcome.job_type))
            .and_modify(|current| {
                if outcome.number > current.number {
                    *current = outcome;
                }
            })
            .or_insert(outcome);
    }
    latest
        .into_values()
        .filter(|outcome| outcome.is_failure())
        .map(|outcome| outcome.application.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierlift_core::{JobError, JobResult, Zone};

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    fn app(name: &str, tier: Tier, version: &str) -> ApplicationRecord {
        let mut record = ApplicationRecord::new(
            ApplicationId::new("tenant", name, "default"),
            tier,
            vec!["us-east-3".to_string()],
            0,
        );
        record.record_deployment(Zone::prod("us-east-3"), v(version), 0);
        record
    }

    fn outcome(name: &str, job_type: JobType, number: u64, result: JobResult) -> JobOutcome {
        JobOutcome {
            application: ApplicationId::new("tenant", name, "default"),
            job_type,
            version: v("5.1"),
            number,
            result,
            recorded_at: 0,
        }
    }

    fn failure(name: &str) -> JobOutcome {
        outcome(
            name,
            JobType::SystemTest,
            1,
            JobResult::Failure(JobError::TestFailure),
        )
    }

    #[test]
    fn confidence_is_ordered() {
        assert!(Confidence::Broken < Confidence::Low);
        assert!(Confidence::Low < Confidence::Normal);
        assert!(Confidence::Normal < Confidence::High);
    }

    #[test]
    fn low_until_canaries_upgrade() {
        let evaluator = ConfidenceEvaluator::default();
        let apps = vec![
            app("canary1", Tier::Canary, "5.1"),
            app("canary2", Tier::Canary, "5.0"),
            app("default1", Tier::Default, "5.0"),
        ];
        assert_eq!(evaluator.evaluate(&v("5.1"), &apps, &[]), Confidence::Low);
    }

    #[test]
    fn failing_canary_keeps_confidence_low() {
        let evaluator = ConfidenceEvaluator::default();
        let apps = vec![
            app("canary1", Tier::Canary, "5.0"),
            app("default1", Tier::Default, "5.0"),
        ];
        let outcomes = vec![failure("canary1")];
        assert_eq!(
            evaluator.evaluate(&v("5.1"), &apps, &outcomes),
            Confidence::Low
        );
    }

    #[test]
    fn normal_once_canaries_upgrade() {
        let evaluator = ConfidenceEvaluator::default();
        let apps = vec![
            app("canary1", Tier::Canary, "5.1"),
            app("default1", Tier::Default, "5.0"),
            app("conservative1", Tier::Conservative, "5.0"),
        ];
        assert_eq!(evaluator.evaluate(&v("5.1"), &apps, &[]), Confidence::Normal);
    }

    #[test]
    fn high_once_default_tier_upgrades() {
        let evaluator = ConfidenceEvaluator::default();
        let apps = vec![
            app("canary1", Tier::Canary, "5.1"),
            app("default1", Tier::Default, "5.1"),
            app("default2", Tier::Default, "5.2"),
            app("conservative1", Tier::Conservative, "5.0"),
        ];
        assert_eq!(evaluator.evaluate(&v("5.1"), &apps, &[]), Confidence::High);
    }

    #[test]
    fn failing_conservative_caps_confidence_at_normal() {
        let evaluator = ConfidenceEvaluator::default();
        let apps = vec![
            app("canary1", Tier::Canary, "5.1"),
            app("default1", Tier::Default, "5.1"),
            app("conservative1", Tier::Conservative, "5.0"),
            app("conservative2", Tier::Conservative, "5.0"),
        ];
        let outcomes = vec![failure("conservative1")];

        let assessment = evaluator.assess(&v("5.1"), &apps, &outcomes);
        assert_eq!(assessment.confidence, Confidence::Normal);
        assert_eq!(assessment.failing, 1);
        assert_eq!(assessment.attempted, 2);

        let recovered = vec![
            failure("conservative1"),
            outcome("conservative1", JobType::SystemTest, 2, JobResult::Success),
        ];
        assert_eq!(
            evaluator.evaluate(&v("5.1"), &apps, &recovered),
            Confidence::High
        );
    }

    #[test]
    fn applications_without_production_deployments_are_ignored() {
        let evaluator = ConfidenceEvaluator::default();
        let undeployed = ApplicationRecord::new(
            ApplicationId::new("tenant", "new", "default"),
            Tier::Canary,
            vec!["us-east-3".to_string()],
            0,
        );
        let apps = vec![undeployed, app("default1", Tier::Default, "5.0")];
        assert_eq!(evaluator.evaluate(&v("5.1"), &apps, &[]), Confidence::Normal);
    }

    #[test]
    fn broken_when_failures_exceed_both_thresholds() {
        let evaluator = ConfidenceEvaluator::default();
        let mut apps = vec![app("canary1", Tier::Canary, "5.1")];
        apps.push(app("d0", Tier::Default, "5.1"));
        for i in 1..=4 {
            apps.push(app(&format!("d{i}"), Tier::Default, "5.0"));
        }
        let outcomes: Vec<_> = (1..=4).map(|i| failure(&format!("d{i}"))).collect();

        let assessment = evaluator.assess(&v("5.1"), &apps, &outcomes);
        assert_eq!(assessment.confidence, Confidence::Broken);
        assert_eq!(assessment.failing, 4);
        assert_eq!(assessment.attempted, 5);
        assert!((assessment.failure_fraction() - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn not_broken_below_minimum_failures() {
        let evaluator = ConfidenceEvaluator::default();
        let mut apps = vec![app("canary1", Tier::Canary, "5.1")];
        for i in 1..=3 {
            apps.push(app(&format!("d{i}"), Tier::Default, "5.0"));
        }
        let outcomes: Vec<_> = (1..=3).map(|i| failure(&format!("d{i}"))).collect();
        assert_eq!(
            evaluator.evaluate(&v("5.1"), &apps, &outcomes),
            Confidence::Normal
        );
    }

    #[test]
    fn not_broken_at_low_failure_fraction() {
        let evaluator = ConfidenceEvaluator::default();
        let mut apps = vec![app("canary1", Tier::Canary, "5.1")];
        for i in 0..6 {
            apps.push(app(&format!("ok{i}"), Tier::Default, "5.1"));
        }
        for i in 0..4 {
            apps.push(app(&format!("bad{i}"), Tier::Default, "5.0"));
        }
        let outcomes: Vec<_> = (0..4).map(|i| failure(&format!("bad{i}"))).collect();

        // 4 of 10 is not more than 0.4.
        let assessment = evaluator.assess(&v("5.1"), &apps, &outcomes);
        assert_eq!(assessment.confidence, Confidence::Normal);
        assert_eq!(assessment.attempted, 10);
    }

    #[test]
    fn thresholds_are_configurable() {
        let evaluator = ConfidenceEvaluator::new(ConfidenceConfig {
            broken_failure_fraction: 0.1,
            broken_min_failures: 1,
        });
        let apps = vec![
            app("canary1", Tier::Canary, "5.1"),
            app("d1", Tier::Default, "5.0"),
        ];
        assert_eq!(
            evaluator.evaluate(&v("5.1"), &apps, &[failure("d1")]),
            Confidence::Broken
        );
    }

    #[test]
    fn only_latest_run_counts() {
        let outcomes = vec![
            outcome(
                "d1",
                JobType::SystemTest,
                1,
                JobResult::Failure(JobError::Unknown),
            ),
            outcome("d1", JobType::SystemTest, 2, JobResult::Success),
            outcome("d2", JobType::SystemTest, 1, JobResult::Success),
            outcome(
                "d2",
                JobType::StagingTest,
                1,
                JobResult::Failure(JobError::DeploymentFailure),
            ),
        ];
        let failing = failing_applications(&v("5.1"), &outcomes);
        assert_eq!(
            failing.into_iter().collect::<Vec<_>>(),
            vec![ApplicationId::new("tenant", "d2", "default")]
        );
    }

    #[test]
    fn upgraded_applications_are_not_failing() {
        let evaluator = ConfidenceEvaluator::default();
        let mut apps = vec![app("canary1", Tier::Canary, "5.1")];
        for i in 1..=4 {
            apps.push(app(&format!("d{i}"), Tier::Default, "5.1"));
        }
        // Failures before an eventual success do not count once the app runs 5.1.
        let outcomes: Vec<_> = (1..=4).map(|i| failure(&format!("d{i}"))).collect();
        assert_eq!(
            evaluator.evaluate(&v("5.1"), &apps, &outcomes),
            Confidence::High
        );
    }

    #[test]
    fn confidence_serializes_as_name() {
        assert_eq!(
            serde_json::to_string(&Confidence::Broken).unwrap(),
            "\"broken\""
        );
        assert_eq!(Confidence::High.to_string(), "high");
    }
}
