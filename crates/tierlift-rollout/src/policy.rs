//! Upgrade policy — which tiers may move to a version at a given confidence.

use tierlift_core::Tier;

use crate::confidence::Confidence;

/// Whether an application in `tier` may be upgraded at `confidence`.
///
/// Canaries always upgrade; they are how confidence is gained. A broken
/// version is withdrawn by the upgrader before readiness is consulted.
pub fn ready_to_upgrade(tier: Tier, confidence: Confidence) -> bool {
    match tier {
        Tier::Canary => true,
        Tier::Default => confidence >= Confidence::Normal,
        Tier::Conservative => confidence == Confidence::High,
    }
}

/// Lowest confidence at which `tier` upgrades.
pub fn required_confidence(tier: Tier) -> Confidence {
    match tier {
        Tier::Canary => Confidence::Broken,
        Tier::Default => Confidence::Normal,
        Tier::Conservative => Confidence::High,
    }
}
