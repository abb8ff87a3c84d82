//! Shared types for the tierlift upgrade orchestrator.
//!
//! - **`version`** — ordered platform versions (lenient `major.minor` parsing)
//! - **`types`** — application identity, upgrade tiers, zones, job types, changes
//! - **`job`** — job handles, job state and completion reports
//! - **`config`** — `tierlift.toml` configuration parser

pub mod config;
pub mod job;
pub mod types;
pub mod version;

pub use config::{ConfidenceConfig, ConfigError, JobsConfig, TierliftConfig, UpgraderConfig};
pub use job::{JobHandle, JobReport, JobResult, JobState};
pub use types::*;
pub use version::{Version, VersionParseError};
