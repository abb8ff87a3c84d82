//! Fleet version status — every platform version in use and how it is doing.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use tierlift_core::Version;
use tierlift_state::{ApplicationRecord, JobOutcome};

use crate::confidence::{Confidence, ConfidenceEvaluator, failing_applications};

/// Summary of one platform version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSummary {
    pub version: Version,
    /// Whether this is the current system version.
    pub is_system: bool,
    /// Applications whose production deployments run exactly this version.
    pub production_applications: usize,
    /// Applications not yet on this version whose latest run of some job on it failed.
    pub failing_applications: usize,
    pub confidence: Confidence,
}

/// Status of all versions in use, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionStatus {
    pub system_version: Option<Version>,
    pub versions: Vec<VersionSummary>,
}

impl VersionStatus {
    /// Summarize the versions running in production plus the system version.
    ///
    /// `outcomes` holds the recorded outcomes per version; versions without
    /// an entry have none.
    pub fn compute(
        evaluator: &ConfidenceEvaluator,
        system_version: Option<&Version>,
        applications: &[ApplicationRecord],
        outcomes: &BTreeMap<Version, Vec<JobOutcome>>,
    ) -> Self {
        let mut versions: BTreeSet<Version> = applications
            .iter()
            .filter_map(ApplicationRecord::production_version)
            .collect();
        versions.extend(system_version.cloned());

        let summaries = versions
            .into_iter()
            .map(|version| {
                let recorded = outcomes.get(&version).map(Vec::as_slice).unwrap_or(&[]);
                let failing = failing_applications(&version, recorded);
                VersionSummary {
                    is_system: system_version == Some(&version),
                    production_applications: applications
                        .iter()
                        .filter(|app| app.production_version().as_ref() == Some(&version))
                        .count(),
                    failing_applications: applications
                        .iter()
                        .filter(|app| {
                            !app.is_on_or_beyond(&version) && failing.contains(&app.id)
                        })
                        .count(),
                    confidence: evaluator.evaluate(&version, applications, recorded),
                    version,
                }
            })
            .collect();

        Self {
            system_version: system_version.cloned(),
            versions: summaries,
        }
    }

    /// The summary of the system version, if one is set.
    pub fn system(&self) -> Option<&VersionSummary> {
        self.versions.iter().find(|summary| summary.is_system)
    }

    /// Lowest version still running in production.
    pub fn oldest_in_use(&self) -> Option<&Version> {
        self.versions
            .iter()
            .find(|summary| summary.production_applications > 0)
            .map(|summary| &summary.version)
    }
}
