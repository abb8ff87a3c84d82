//! tierlift-upgrader — rolls platform versions out across the fleet.
//!
//! # Architecture
//!
//! ```text
//! Maintainer ── interval ──► Orchestrator::maintain()
//!                               │  (single-flight lock)
//! job system ── report ────► Orchestrator::notify_job_completion()
//!                               │
//!             Upgrader ─────────┤  confidence → tier gating → trigger / withdraw
//!             DeploymentTrigger ┘  pipeline jobs, completion reports
//!                               │
//!                     StateStore + JobQueue
//! ```
//!
//! Confidence in the system version is recomputed from recorded job outcomes
//! on every run. Canaries upgrade first, the default tier once confidence is
//! normal, and conservative applications once it is high. A broken version
//! has its queued jobs cancelled fleet-wide and receives no new triggers.

pub mod error;
pub mod maintainer;
pub mod metrics;
pub mod orchestrator;
pub mod trigger;
pub mod upgrader;

pub use error::{UpgradeError, UpgradeResult};
pub use maintainer::Maintainer;
pub use metrics::{MetricsSnapshot, UpgradeMetrics};
pub use orchestrator::Orchestrator;
pub use trigger::{Completion, DeploymentTrigger};
pub use upgrader::{MaintenanceReport, UpgradeFailure, Upgrader, version_status};
