//! tierlift rollout policy — version confidence, tier gating, fleet version status.
//!
//! This crate decides how far a candidate platform version may roll out.
//! Confidence is recomputed from job outcomes every time it is asked for;
//! nothing here holds state.
//!
//! # Components
//!
//! - **`confidence`** — Confidence rating of a version from fleet job outcomes
//! - **`policy`** — Which tiers may upgrade at a given confidence
//! - **`status`** — Per-version summary of the fleet

pub mod confidence;
pub mod policy;
pub mod status;

pub use confidence::{Assessment, Confidence, ConfidenceEvaluator};
pub use policy::{ready_to_upgrade, required_confidence};
pub use status::{VersionStatus, VersionSummary};
