// Priority scoring for reach-aware cache entries.

use serde::{Deserialize, Serialize};

use crate::model::ReachLevel;

pub const MIN_PRIORITY: i32 = 0;
pub const MAX_PRIORITY: i32 = 200;

/// Throughput class of the custodian serving an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BandwidthClass {
    Low = 1,
    Medium = 2,
    High = 3,
    Ultra = 4,
}

impl BandwidthClass {
    pub fn score_bonus(self) -> i32 {
        match self {
            BandwidthClass::Ultra => 20,
            BandwidthClass::High => 10,
            BandwidthClass::Medium => 5,
            BandwidthClass::Low => -5,
        }
    }

    /// Classify a measured throughput.
    pub fn from_mbps(mbps: f64) -> Self {
        if mbps >= 100.0 {
            BandwidthClass::Ultra
        } else if mbps >= 25.0 {
            BandwidthClass::High
        } else if mbps >= 5.0 {
            BandwidthClass::Medium
        } else {
            BandwidthClass::Low
        }
    }
}

/// Curation tier of the steward vouching for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StewardTier {
    Caretaker = 1,
    Curator = 2,
    Expert = 3,
    Pioneer = 4,
}

impl StewardTier {
    pub fn score_bonus(self) -> i32 {
        match self {
            StewardTier::Caretaker => 5,
            StewardTier::Curator => 15,
            StewardTier::Expert => 30,
            StewardTier::Pioneer => 50,
        }
    }
}

/// Inputs to the priority score other than the reach level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrioritySignals {
    /// -100 (far) ..= 100 (co-located).
    pub proximity_score: i32,
    pub bandwidth_class: Option<BandwidthClass>,
    pub steward_tier: Option<StewardTier>,
    /// 0.0 ..= 1.0 relevance to the local learner.
    pub affinity: f64,
    pub age_penalty: i32,
}

/// Score in `0..=200`; higher survives eviction longer.
pub fn priority_score(reach: ReachLevel, signals: &PrioritySignals) -> i32 {
    let mut score = reach.as_u8() as i32 * 12;
    score += signals.proximity_score.clamp(-100, 100);
    score += signals.bandwidth_class.map_or(0, BandwidthClass::score_bonus);
    score += signals.steward_tier.map_or(0, StewardTier::score_bonus);
    score += (signals.affinity.clamp(0.0, 1.0) * 10.0) as i32;
    score -= signals.age_penalty.clamp(0, MAX_PRIORITY);
    score.clamp(MIN_PRIORITY, MAX_PRIORITY)
}
