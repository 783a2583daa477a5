//! Pipeline cycle state machine
//!
//! One cycle progresses through:
//! Idle → Fetching → Enriching → Clustering → Analyzing → Aggregating → Caching → Sleeping → Idle
//!
//! A skipped cycle goes straight from Idle to Sleeping, and a stop signal may end a
//! cycle early by returning to Idle from any stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CycleStage {
    /// Between cycles; data need refresh, skip decision
    Idle,
    /// Per-entity fetch calls on the worker pool
    Fetching,
    /// Article/text enrichment of raw items
    Enriching,
    /// Grouping enriched items per entity
    Clustering,
    /// Emotion classification behind the lifecycle manager
    Analyzing,
    /// Consensus computation and upsert
    Aggregating,
    /// Cache invalidation and durable state flush
    Caching,
    /// Waiting for the scheduler's interval
    Sleeping,
}

impl CycleStage {
    pub fn as_str(self) -> &'static str {
        match self {
            CycleStage::Idle => "IDLE",
            CycleStage::Fetching => "FETCHING",
            CycleStage::Enriching => "ENRICHING",
            CycleStage::Clustering => "CLUSTERING",
            CycleStage::Analyzing => "ANALYZING",
            CycleStage::Aggregating => "AGGREGATING",
            CycleStage::Caching => "CACHING",
            CycleStage::Sleeping => "SLEEPING",
        }
    }

    /// Successor in a full (non-skipped) cycle
    pub fn next(self) -> CycleStage {
        match self {
            CycleStage::Idle => CycleStage::Fetching,
            CycleStage::Fetching => CycleStage::Enriching,
            CycleStage::Enriching => CycleStage::Clustering,
            CycleStage::Clustering => CycleStage::Analyzing,
            CycleStage::Analyzing => CycleStage::Aggregating,
            CycleStage::Aggregating => CycleStage::Caching,
            CycleStage::Caching => CycleStage::Sleeping,
            CycleStage::Sleeping => CycleStage::Idle,
        }
    }

    pub fn can_transition_to(self, to: CycleStage) -> bool {
        to == self.next()
            || (self == CycleStage::Idle && to == CycleStage::Sleeping)
            || (to == CycleStage::Idle && self != CycleStage::Idle)
    }
}

impl fmt::Display for CycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recorded stage change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTransition {
    pub cycle_id: Uuid,
    pub from: CycleStage,
    pub to: CycleStage,
    pub transitioned_at: DateTime<Utc>,
}

/// Outcome summary of one cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stage: CycleStage,
    /// Every stage entered, in order
    pub stage_trace: Vec<CycleStage>,
    pub skipped: bool,
    pub cancelled: bool,
    pub batch: Vec<String>,
    pub entities_fetched: usize,
    pub items_fetched: usize,
    /// (entity id, error) for entities whose fetch failed
    pub fetch_failures: Vec<(String, String)>,
    /// Individual items the source could not deliver
    pub item_failures: usize,
    pub items_enriched: usize,
    /// Items kept as raw fallback because enrichment failed
    pub enrichment_fallbacks: usize,
    pub clusters: usize,
    pub samples_written: usize,
    /// Analysis skipped; items stored as neutral/unclassified samples
    pub analysis_demoted: bool,
    pub consensus_updated: Vec<String>,
    pub no_data: Vec<String>,
    pub cache_keys_invalidated: usize,
    /// Stages that exhausted retries and continued with partial output
    pub degraded_stages: Vec<CycleStage>,
    #[serde(with = "duration_secs")]
    pub next_interval: Duration,
}

impl CycleReport {
    pub fn new() -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            stage: CycleStage::Idle,
            stage_trace: vec![CycleStage::Idle],
            skipped: false,
            cancelled: false,
            batch: Vec::new(),
            entities_fetched: 0,
            items_fetched: 0,
            fetch_failures: Vec::new(),
            item_failures: 0,
            items_enriched: 0,
            enrichment_fallbacks: 0,
            clusters: 0,
            samples_written: 0,
            analysis_demoted: false,
            consensus_updated: Vec::new(),
            no_data: Vec::new(),
            cache_keys_invalidated: 0,
            degraded_stages: Vec::new(),
            next_interval: Duration::ZERO,
        }
    }

    /// Move to a new stage, recording it in the trace
    pub fn transition_to(&mut self, to: CycleStage) -> StageTransition {
        if !self.stage.can_transition_to(to) {
            tracing::warn!(
                cycle_id = %self.cycle_id,
                from = %self.stage,
                to = %to,
                "Unexpected cycle stage transition"
            );
        }

        let transition = StageTransition {
            cycle_id: self.cycle_id,
            from: self.stage,
            to,
            transitioned_at: Utc::now(),
        };
        self.stage = to;
        self.stage_trace.push(to);
        transition
    }

    pub fn mark_degraded(&mut self, stage: CycleStage) {
        if !self.degraded_stages.contains(&stage) {
            self.degraded_stages.push(stage);
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}

impl Default for CycleReport {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_cycle_order() {
        let mut stage = CycleStage::Idle;
        let mut seen = vec![stage];
        for _ in 0..8 {
            stage = stage.next();
            seen.push(stage);
        }
        assert_eq!(
            seen,
            vec![
                CycleStage::Idle,
                CycleStage::Fetching,
                CycleStage::Enriching,
                CycleStage::Clustering,
                CycleStage::Analyzing,
                CycleStage::Aggregating,
                CycleStage::Caching,
                CycleStage::Sleeping,
                CycleStage::Idle,
            ]
        );
    }

    #[test]
    fn test_skip_and_abort_transitions() {
        assert!(CycleStage::Idle.can_transition_to(CycleStage::Sleeping));
        assert!(CycleStage::Analyzing.can_transition_to(CycleStage::Idle));
        assert!(!CycleStage::Fetching.can_transition_to(CycleStage::Analyzing));
        assert!(!CycleStage::Idle.can_transition_to(CycleStage::Idle));
    }

    #[test]
    fn test_report_records_trace() {
        let mut report = CycleReport::new();
        let t = report.transition_to(CycleStage::Fetching);
        assert_eq!(t.from, CycleStage::Idle);
        assert_eq!(report.stage, CycleStage::Fetching);
        assert_eq!(report.stage_trace, vec![CycleStage::Idle, CycleStage::Fetching]);

        report.mark_degraded(CycleStage::Fetching);
        report.mark_degraded(CycleStage::Fetching);
        assert_eq!(report.degraded_stages.len(), 1);
    }
}
