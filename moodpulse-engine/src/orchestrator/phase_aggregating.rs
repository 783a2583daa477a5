//! Stage: AGGREGATING

use chrono::Utc;
use moodpulse_common::events::PulseEvent;
use tracing::{info, warn};

use super::PipelineOrchestrator;
use crate::error::PipelineResult;
use crate::models::{AggregateOutcome, ConsensusResult, CycleReport, CycleStage};

impl PipelineOrchestrator {
    /// Recompute consensus for every entity fetched this cycle
    ///
    /// Returns the results that were upserted. Entities with no samples yet are
    /// listed in `report.no_data`.
    pub(super) async fn phase_aggregating(
        &self,
        report: &mut CycleReport,
        entities: &[String],
    ) -> PipelineResult<Vec<ConsensusResult>> {
        info!(cycle_id = %report.cycle_id, entities = entities.len(), "AGGREGATING");

        let mut updated = Vec::new();
        for entity_id in entities {
            match self.aggregator.aggregate(entity_id).await {
                Ok(AggregateOutcome::Consensus(result)) => {
                    self.event_bus.emit_lossy(PulseEvent::ConsensusUpdated {
                        entity_id: result.entity_id.clone(),
                        dominant_emotion: result.dominant_emotion.to_string(),
                        confidence: result.confidence,
                        sample_count: result.sample_count,
                        timestamp: Utc::now(),
                    });
                    report.consensus_updated.push(entity_id.clone());
                    updated.push(result);
                }
                Ok(AggregateOutcome::NoData { entity_id }) => report.no_data.push(entity_id),
                Err(e) => {
                    warn!(entity = %entity_id, error = %e, "Aggregation failed");
                    report.mark_degraded(CycleStage::Aggregating);
                }
            }
        }

        Ok(updated)
    }
}
