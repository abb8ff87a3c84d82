//! Shared types used across tierlift crates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::version::Version;

/// Region name used for the test and staging zones.
pub const TEST_REGION: &str = "default";

/// Error returned when a textual identifier cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind} '{input}'")]
pub struct ParseError {
    kind: &'static str,
    input: String,
}

impl ParseError {
    fn new(kind: &'static str, input: &str) -> Self {
        Self {
            kind,
            input: input.to_string(),
        }
    }
}

// ── Application ───────────────────────────────────────────────────

/// Identity of a deployed tenant application instance.
///
/// Components are non-empty and contain neither `.` nor `/`, which keeps the
/// dotted form and the storage keys built from it unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "ApplicationIdFields")]
pub struct ApplicationId {
    pub tenant: String,
    pub application: String,
    pub instance: String,
}

impl ApplicationId {
    /// Builds an id from trusted components. Use [`ApplicationId::try_new`] for input.
    pub fn new(tenant: &str, application: &str, instance: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            application: application.to_string(),
            instance: instance.to_string(),
        }
    }

    pub fn try_new(tenant: &str, application: &str, instance: &str) -> Result<Self, ParseError> {
        let id = Self::new(tenant, application, instance);
        if id.is_valid() {
            Ok(id)
        } else {
            Err(ParseError::new("application id", &id.to_string()))
        }
    }

    pub fn is_valid(&self) -> bool {
        [&self.tenant, &self.application, &self.instance]
            .iter()
            .all(|part| !part.is_empty() && !part.contains(['.', '/']))
    }

    /// Key used for the applications table: `{tenant}.{application}.{instance}`.
    pub fn table_key(&self) -> String {
        self.to_string()
    }
}

#[derive(Deserialize)]
struct ApplicationIdFields {
    tenant: String,
    application: String,
    instance: String,
}

impl TryFrom<ApplicationIdFields> for ApplicationId {
    type Error = ParseError;

    fn try_from(fields: ApplicationIdFields) -> Result<Self, Self::Error> {
        Self::try_new(&fields.tenant, &fields.application, &fields.instance)
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.tenant, self.application, self.instance)
    }
}

impl FromStr for ApplicationId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        match parts.as_slice() {
            [t, a, i] => Self::try_new(t, a, i).map_err(|_| ParseError::new("application id", s)),
            _ => Err(ParseError::new("application id", s)),
        }
    }
}

// ── Tier ──────────────────────────────────────────────────────────

/// Upgrade tier of an application: how early it receives a new platform version.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Upgrades first; probes every new version.
    Canary,
    /// Upgrades once the canaries are done.
    #[default]
    Default,
    /// Upgrades only when the version has proven itself on the default tier.
    Conservative,
}

impl Tier {
    /// Tiers in the order their upgrades are issued.
    pub const ROLLOUT_ORDER: [Tier; 3] = [Tier::Canary, Tier::Default, Tier::Conservative];

    pub fn name(&self) -> &'static str {
        match self {
            Tier::Canary => "canary",
            Tier::Default => "default",
            Tier::Conservative => "conservative",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Tier {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "canary" => Ok(Tier::Canary),
            "default" => Ok(Tier::Default),
            "conservative" => Ok(Tier::Conservative),
            _ => Err(ParseError::new("tier", s)),
        }
    }
}

// ── Zones ─────────────────────────────────────────────────────────

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Test,
    Staging,
    Prod,
}

impl Environment {
    pub fn name(&self) -> &'static str {
        match self {
            Environment::Test => "test",
            Environment::Staging => "staging",
            Environment::Prod => "prod",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An environment/region pair an application can be deployed to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Zone {
    pub environment: Environment,
    pub region: String,
}

impl Zone {
    pub fn new(environment: Environment, region: &str) -> Self {
        Self {
            environment,
            region: region.to_string(),
        }
    }

    pub fn prod(region: &str) -> Self {
        Self::new(Environment::Prod, region)
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.environment, self.region)
    }
}

// ── Jobs ──────────────────────────────────────────────────────────

/// The kinds of deployment job an application pipeline is made of.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum JobType {
    /// Builds a new application package.
    Component,
    /// Deploys to the test zone and runs system tests.
    SystemTest,
    /// Deploys to the staging zone and runs upgrade tests.
    StagingTest,
    /// Deploys to a production region.
    Production(String),
}

impl JobType {
    /// The deployment pipeline for an application with the given production regions.
    pub fn pipeline(regions: &[String]) -> Vec<JobType> {
        let mut jobs = vec![JobType::SystemTest, JobType::StagingTest];
        jobs.extend(regions.iter().cloned().map(JobType::Production));
        jobs
    }

    /// The zone this job deploys to, if any.
    pub fn zone(&self) -> Option<Zone> {
        match self {
            JobType::Component => None,
            JobType::SystemTest => Some(Zone::new(Environment::Test, TEST_REGION)),
            JobType::StagingTest => Some(Zone::new(Environment::Staging, TEST_REGION)),
            JobType::Production(region) => Some(Zone::prod(region)),
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, JobType::Production(_))
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::Component => f.write_str("component"),
            JobType::SystemTest => f.write_str("system-test"),
            JobType::StagingTest => f.write_str("staging-test"),
            JobType::Production(region) => write!(f, "production-{region}"),
        }
    }
}

impl FromStr for JobType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "component" => Ok(JobType::Component),
            "system-test" => Ok(JobType::SystemTest),
            "staging-test" => Ok(JobType::StagingTest),
            _ => match s.strip_prefix("production-") {
                Some(region) if !region.is_empty() => Ok(JobType::Production(region.to_string())),
                _ => Err(ParseError::new("job type", s)),
            },
        }
    }
}

impl TryFrom<String> for JobType {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<JobType> for String {
    fn from(job: JobType) -> Self {
        job.to_string()
    }
}

/// Classification of a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobError {
    Unknown,
    OutOfCapacity,
    TestFailure,
    DeploymentFailure,
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobError::Unknown => "unknown",
            JobError::OutOfCapacity => "out_of_capacity",
            JobError::TestFailure => "test_failure",
            JobError::DeploymentFailure => "deployment_failure",
        })
    }
}

// ── Changes ───────────────────────────────────────────────────────

/// A change an application is in the process of adopting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Change {
    /// Upgrade to a new platform version.
    Version { version: Version },
    /// Roll out a new application package, identified by its component build.
    Application { build: u64 },
}

impl Change {
    pub fn version(version: Version) -> Self {
        Change::Version { version }
    }

    /// The platform version this change moves to, for version changes.
    pub fn target_version(&self) -> Option<&Version> {
        match self {
            Change::Version { version } => Some(version),
            Change::Application { .. } => None,
        }
    }

    pub fn is_application_change(&self) -> bool {
        matches!(self, Change::Application { .. })
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::Version { version } => write!(f, "upgrade to {version}"),
            Change::Application { build } => write!(f, "application build {build}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_id_display_and_parse() {
        let id = ApplicationId::new("tenant1", "app1", "default");
        assert_eq!(id.to_string(), "tenant1.app1.default");
        assert_eq!("tenant1.app1.default".parse::<ApplicationId>().unwrap(), id);
        assert!("tenant1.app1".parse::<ApplicationId>().is_err());
        assert!("..".parse::<ApplicationId>().is_err());
    }

    #[test]
    fn application_id_components_cannot_hold_separators() {
        assert!("a.b.c.d".parse::<ApplicationId>().is_err());
        assert!("a/b.c.d".parse::<ApplicationId>().is_err());
        assert!(ApplicationId::try_new("a.b", "c", "d").is_err());
        assert!(ApplicationId::try_new("a", "b.c", "d").is_err());
        assert!(ApplicationId::try_new("a", "b", "").is_err());
        assert!(!ApplicationId::new("a", "b", "c/d").is_valid());
        assert!(ApplicationId::try_new("a", "b", "c").unwrap().is_valid());

        let json = serde_json::json!({"tenant": "a.b", "application": "c", "instance": "d"});
        assert!(serde_json::from_value::<ApplicationId>(json).is_err());
        let json = serde_json::json!({"tenant": "a", "application": "b", "instance": "c"});
        assert_eq!(
            serde_json::from_value::<ApplicationId>(json).unwrap(),
            ApplicationId::new("a", "b", "c")
        );
    }

    #[test]
    fn tiers_roll_out_canary_first() {
        assert_eq!(Tier::ROLLOUT_ORDER[0], Tier::Canary);
        assert!(Tier::Canary < Tier::Default);
        assert!(Tier::Default < Tier::Conservative);
        assert_eq!("conservative".parse::<Tier>().unwrap(), Tier::Conservative);
        assert!("aggressive".parse::<Tier>().is_err());
    }

    #[test]
    fn job_type_names() {
        let jobs = [
            JobType::Component,
            JobType::SystemTest,
            JobType::StagingTest,
            JobType::Production("us-east-3".to_string()),
        ];
        for job in jobs {
            assert_eq!(job.to_string().parse::<JobType>().unwrap(), job);
        }
        assert_eq!(
            JobType::Production("us-west-1".to_string()).to_string(),
            "production-us-west-1"
        );
        assert!("production-".parse::<JobType>().is_err());
    }

    #[test]
    fn pipeline_runs_tests_before_production() {
        let regions = vec!["us-east-3".to_string(), "us-west-1".to_string()];
        let pipeline = JobType::pipeline(&regions);
        assert_eq!(pipeline.len(), 4);
        assert_eq!(pipeline[0], JobType::SystemTest);
        assert_eq!(pipeline[1], JobType::StagingTest);
        assert_eq!(pipeline[3], JobType::Production("us-west-1".to_string()));
    }

    #[test]
    fn job_zones() {
        assert_eq!(JobType::Component.zone(), None);
        assert_eq!(
            JobType::SystemTest.zone().unwrap().environment,
            Environment::Test
        );
        assert_eq!(
            JobType::Production("eu-1".to_string()).zone().unwrap().to_string(),
            "prod.eu-1"
        );
    }

    #[test]
    fn change_serializes_tagged() {
        let change = Change::version("5.1".parse().unwrap());
        let json = serde_json::to_string(&change).unwrap();
        assert_eq!(json, r#"{"type":"version","version":"5.1.0"}"#);
        let back: Change = serde_json::from_str(&json).unwrap();
        assert_eq!(back, change);
        assert!(Change::Application { build: 3 }.is_application_change());
    }
}
