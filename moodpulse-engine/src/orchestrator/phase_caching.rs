//! Stage: CACHING
//!
//! Drops every cached response about an entity whose consensus changed, warms
//! the consensus key with the fresh row and flushes scheduler and circuit state
//! to the store so a restart resumes where this cycle left off.

use tracing::{debug, info, warn};

use super::PipelineOrchestrator;
use crate::cache::{consensus_key, entity_prefix};
use crate::db;
use crate::error::PipelineResult;
use crate::models::{ConsensusResult, CycleReport};

impl PipelineOrchestrator {
    pub(super) async fn phase_caching(
        &self,
        report: &mut CycleReport,
        updated: &[ConsensusResult],
    ) -> PipelineResult<()> {
        info!(cycle_id = %report.cycle_id, updated = updated.len(), "CACHING");

        for result in updated {
            let key = consensus_key(&result.entity_id);
            report.cache_keys_invalidated += usize::from(self.cache.remove(&key));
            report.cache_keys_invalidated += self.cache.invalidate(&entity_prefix(&result.entity_id));

            match serde_json::to_value(result) {
                Ok(value) => self.cache.set(key, value, Some(self.settings.consensus_ttl)),
                Err(e) => warn!(entity = %result.entity_id, error = %e, "Consensus not cached"),
            }
        }

        let expired = self.cache.clear_expired();
        if expired > 0 {
            debug!(expired, "Expired cache entries removed");
        }

        db::entities::save_entities(&self.db, &self.scheduler.snapshot()).await?;
        db::circuit_states::save_circuit_states(&self.db, &self.breaker.snapshot()).await?;
        Ok(())
    }
}
