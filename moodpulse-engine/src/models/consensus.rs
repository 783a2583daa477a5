//! Consensus results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::Emotion;

/// The four independent voting algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteAlgorithm {
    Majority,
    Weighted,
    Intensity,
    MedianIntensity,
}

impl VoteAlgorithm {
    pub const ALL: [VoteAlgorithm; 4] = [
        VoteAlgorithm::Majority,
        VoteAlgorithm::Weighted,
        VoteAlgorithm::Intensity,
        VoteAlgorithm::MedianIntensity,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            VoteAlgorithm::Majority => "majority",
            VoteAlgorithm::Weighted => "weighted",
            VoteAlgorithm::Intensity => "intensity",
            VoteAlgorithm::MedianIntensity => "median_intensity",
        }
    }
}

/// One consensus verdict per entity (at most one stored row per entity)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub entity_id: String,
    pub dominant_emotion: Emotion,
    /// Within [0, 1]
    pub confidence: f64,
    pub algorithm_votes: BTreeMap<VoteAlgorithm, Emotion>,
    /// Counts per emotion, summing to `sample_count`
    pub distribution: BTreeMap<Emotion, u32>,
    /// Mean of `confidence * intensity_weight` per emotion
    pub weighted_scores: BTreeMap<Emotion, f64>,
    /// Mean confidence across all samples
    pub average_confidence: f64,
    pub sample_count: u32,
    /// True when no emotion reached the 3-of-4 quorum and the weighted vote decided
    pub tie_broken: bool,
    pub updated_at: DateTime<Utc>,
}

/// Aggregation outcome; `NoData` means "no consensus yet", not a failure
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateOutcome {
    Consensus(ConsensusResult),
    NoData { entity_id: String },
}

impl AggregateOutcome {
    pub fn consensus(&self) -> Option<&ConsensusResult> {
        match self {
            AggregateOutcome::Consensus(result) => Some(result),
            AggregateOutcome::NoData { .. } => None,
        }
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self, AggregateOutcome::NoData { .. })
    }
}
