//! Consensus aggregator
//!
//! Reads an entity's most recent samples, runs the four voting algorithms in
//! [`votes`] and upserts the verdict. Zero samples is the expected "no consensus
//! yet" case and comes back as [`AggregateOutcome::NoData`], never as an error.

pub mod votes;

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::db;
use crate::error::PipelineResult;
use crate::models::AggregateOutcome;

pub use votes::{calculate_confidence, compute_consensus};

pub struct ConsensusAggregator {
    db: SqlitePool,
    sample_limit: u32,
}

impl ConsensusAggregator {
    pub fn new(db: SqlitePool, sample_limit: u32) -> Self {
        Self {
            db,
            sample_limit: sample_limit.max(1),
        }
    }

    /// Aggregate one entity and persist the result
    ///
    /// The sample read is a single statement, so it sees a consistent snapshot
    /// even while workers append samples for other entities.
    pub async fn aggregate(&self, entity_id: &str) -> PipelineResult<AggregateOutcome> {
        let samples = db::samples::load_recent_samples(&self.db, entity_id, self.sample_limit).await?;
        let outcome = compute_consensus(entity_id, &samples, Utc::now());

        match &outcome {
            AggregateOutcome::NoData { .. } => {
                debug!(entity = %entity_id, "No samples yet, consensus skipped");
            }
            AggregateOutcome::Consensus(result) => {
                db::consensus::upsert_consensus(&self.db, result).await?;
                info!(
                    entity = %entity_id,
                    dominant = %result.dominant_emotion,
                    confidence = result.confidence,
                    samples = result.sample_count,
                    tie_broken = result.tie_broken,
                    "Consensus updated"
                );
            }
        }
        Ok(outcome)
    }
}
