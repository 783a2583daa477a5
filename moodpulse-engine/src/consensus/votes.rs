//! The four voting algorithms and the resolution rule
//!
//! Every function here is pure: samples in, verdict out. Emotions iterate in
//! alphabetical order, and each vote keeps the first emotion with the strictly
//! highest value, so every tie resolves alphabetically.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::models::{AggregateOutcome, ConsensusResult, Emotion, EmotionSample, VoteAlgorithm};

/// Votes an emotion needs to win outright
pub const QUORUM: usize = 3;

pub const AGREEMENT_WEIGHT: f64 = 0.6;
pub const AVG_CONFIDENCE_WEIGHT: f64 = 0.4;

/// Per-emotion accumulation over one sample set
#[derive(Debug, Clone, Default)]
struct EmotionTally {
    count: u32,
    confidence_sum: f64,
    /// `intensity_weight * confidence` per sample
    intensities: Vec<f64>,
}

impl EmotionTally {
    fn avg_confidence(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.confidence_sum / self.count as f64
        }
    }

    fn mean_intensity(&self) -> f64 {
        if self.intensities.is_empty() {
            0.0
        } else {
            self.intensities.iter().sum::<f64>() / self.intensities.len() as f64
        }
    }
}

fn tally(samples: &[EmotionSample]) -> BTreeMap<Emotion, EmotionTally> {
    let mut tallies: BTreeMap<Emotion, EmotionTally> = BTreeMap::new();
    for sample in samples {
        let entry = tallies.entry(sample.emotion).or_default();
        entry.count += 1;
        entry.confidence_sum += sample.confidence;
        entry
            .intensities
            .push(sample.emotion.intensity_weight() * sample.confidence);
    }
    tallies
}

/// Highest value wins; earlier (alphabetically smaller) emotion keeps a tie
fn arg_max(values: impl Iterator<Item = (Emotion, f64)>) -> Option<Emotion> {
    let mut best: Option<(Emotion, f64)> = None;
    for (emotion, value) in values {
        match best {
            Some((_, best_value)) if value <= best_value => {}
            _ => best = Some((emotion, value)),
        }
    }
    best.map(|(emotion, _)| emotion)
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Highest raw count
pub fn majority_vote(samples: &[EmotionSample]) -> Option<Emotion> {
    arg_max(tally(samples).iter().map(|(e, t)| (*e, t.count as f64)))
}

/// Highest `avg(confidence) * count / total`
pub fn weighted_vote(samples: &[EmotionSample]) -> Option<Emotion> {
    let total = samples.len() as f64;
    arg_max(
        tally(samples)
            .iter()
            .map(|(e, t)| (*e, t.avg_confidence() * t.count as f64 / total)),
    )
}

/// Highest `intensity_weight * avg(confidence) * count`
pub fn intensity_vote(samples: &[EmotionSample]) -> Option<Emotion> {
    arg_max(
        tally(samples)
            .iter()
            .map(|(e, t)| (*e, e.intensity_weight() * t.avg_confidence() * t.count as f64)),
    )
}

/// Highest median of `intensity_weight * confidence`
pub fn median_intensity_vote(samples: &[EmotionSample]) -> Option<Emotion> {
    arg_max(tally(samples).iter().map(|(e, t)| (*e, median(&t.intensities))))
}

/// Run all four algorithms; empty when there are no samples
pub fn collect_votes(samples: &[EmotionSample]) -> BTreeMap<VoteAlgorithm, Emotion> {
    let mut votes = BTreeMap::new();
    for algorithm in VoteAlgorithm::ALL {
        let winner = match algorithm {
            VoteAlgorithm::Majority => majority_vote(samples),
            VoteAlgorithm::Weighted => weighted_vote(samples),
            VoteAlgorithm::Intensity => intensity_vote(samples),
            VoteAlgorithm::MedianIntensity => median_intensity_vote(samples),
        };
        if let Some(emotion) = winner {
            votes.insert(algorithm, emotion);
        }
    }
    votes
}

/// Pick the dominant emotion from the algorithm votes
///
/// An emotion with at least [`QUORUM`] votes wins. Otherwise the weighted vote
/// decides and the second element is `true`.
pub fn resolve(votes: &BTreeMap<VoteAlgorithm, Emotion>) -> Option<(Emotion, bool)> {
    let mut counts: BTreeMap<Emotion, usize> = BTreeMap::new();
    for emotion in votes.values() {
        *counts.entry(*emotion).or_default() += 1;
    }
    if let Some((emotion, _)) = counts.iter().find(|(_, n)| **n >= QUORUM) {
        return Some((*emotion, false));
    }
    votes
        .get(&VoteAlgorithm::Weighted)
        .or_else(|| votes.values().next())
        .map(|emotion| (*emotion, true))
}

/// `agreement_ratio * 0.6 + avg_confidence * 0.4`, capped at 1.0
pub fn calculate_confidence(agreement_ratio: f64, avg_confidence: f64) -> f64 {
    (agreement_ratio * AGREEMENT_WEIGHT + avg_confidence * AVG_CONFIDENCE_WEIGHT).clamp(0.0, 1.0)
}

/// Full consensus for one entity's sample set
pub fn compute_consensus(
    entity_id: &str,
    samples: &[EmotionSample],
    now: DateTime<Utc>,
) -> AggregateOutcome {
    let votes = collect_votes(samples);
    let Some((dominant, tie_broken)) = resolve(&votes) else {
        return AggregateOutcome::NoData {
            entity_id: entity_id.to_string(),
        };
    };

    let tallies = tally(samples);
    let sample_count = samples.len() as u32;
    let average_confidence =
        samples.iter().map(|s| s.confidence).sum::<f64>() / samples.len() as f64;
    let dominant_count = tallies.get(&dominant).map(|t| t.count).unwrap_or(0);
    let agreement_ratio = dominant_count as f64 / sample_count as f64;

    AggregateOutcome::Consensus(ConsensusResult {
        entity_id: entity_id.to_string(),
        dominant_emotion: dominant,
        confidence: calculate_confidence(agreement_ratio, average_confidence),
        algorithm_votes: votes,
        distribution: tallies.iter().map(|(e, t)| (*e, t.count)).collect(),
        weighted_scores: tallies.iter().map(|(e, t)| (*e, t.mean_intensity())).collect(),
        average_confidence,
        sample_count,
        tie_broken,
        updated_at: now,
    })
}
