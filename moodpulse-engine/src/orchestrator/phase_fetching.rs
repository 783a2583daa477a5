//! Stage: FETCHING
//!
//! Per-entity fetch calls run on a bounded worker pool. Every finished call feeds
//! its outcome back into the scheduler; results are applied in batch order so a
//! cycle's scheduler updates do not depend on completion order.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::PipelineOrchestrator;
use crate::collaborators::{FetchBatch, RawItem};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{CycleReport, CycleStage};
use crate::resilience::collaborators::FETCH;

/// What the Fetching stage hands to the rest of the cycle
pub(super) struct FetchOutput {
    /// Entities fetched successfully, in batch order
    pub entities: Vec<String>,
    pub items: Vec<RawItem>,
}

impl PipelineOrchestrator {
    pub(super) async fn phase_fetching(
        &self,
        report: &mut CycleReport,
        batch: &[String],
    ) -> PipelineResult<FetchOutput> {
        info!(
            cycle_id = %report.cycle_id,
            entities = batch.len(),
            workers = self.settings.fetch_workers,
            "FETCHING"
        );

        // Each worker owns its handles; no borrow of `self` crosses an await
        let invoker = self.invoker.clone();
        let fetcher = Arc::clone(&self.fetcher);

        let mut results: Vec<(usize, PipelineResult<FetchBatch>)> = stream::iter(batch.iter().cloned().enumerate())
            .map(|(position, entity_id)| {
                let invoker = invoker.clone();
                let fetcher = Arc::clone(&fetcher);

                async move {
                    let ids = vec![entity_id];
                    let result = invoker
                        .invoke(FETCH, move || {
                            let fetcher = Arc::clone(&fetcher);
                            let ids = ids.clone();
                            async move { fetcher.fetch(&ids).await }
                        })
                        .await;
                    (position, result)
                }
            })
            .buffer_unordered(self.settings.fetch_workers)
            .collect()
            .await;
        results.sort_by_key(|(position, _)| *position);

        let mut output = FetchOutput {
            entities: Vec::new(),
            items: Vec::new(),
        };

        for (position, result) in results {
            let entity_id = &batch[position];
            let now = Utc::now();

            match result {
                Ok(fetched) => {
                    if let Some(failure) = fetched
                        .failures
                        .iter()
                        .find(|f| f.item_id.is_none() && f.entity_id == *entity_id)
                    {
                        warn!(entity = %entity_id, reason = %failure.reason, "Entity fetch failed");
                        report.fetch_failures.push((entity_id.clone(), failure.reason.clone()));
                        self.scheduler.record_outcome_at(entity_id, false, now);
                        continue;
                    }

                    for failure in fetched.failures.iter().filter(|f| f.item_id.is_some()) {
                        debug!(
                            entity = %entity_id,
                            item = ?failure.item_id,
                            reason = %failure.reason,
                            "Item skipped"
                        );
                        report.item_failures += 1;
                    }

                    let items: Vec<RawItem> = fetched
                        .items
                        .into_iter()
                        .filter(|item| item.entity_id == *entity_id)
                        .collect();
                    self.scheduler.record_activity(entity_id, items.len(), now);
                    self.scheduler.record_outcome_at(entity_id, true, now);

                    debug!(entity = %entity_id, items = items.len(), "Entity fetched");
                    report.entities_fetched += 1;
                    report.items_fetched += items.len();
                    output.entities.push(entity_id.clone());
                    output.items.extend(items);
                }
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e @ PipelineError::CircuitOpen { .. }) => {
                    // Nothing was attempted, so the entity keeps its standing
                    warn!(entity = %entity_id, error = %e, "Fetch skipped");
                    report.fetch_failures.push((entity_id.clone(), e.to_string()));
                    report.mark_degraded(CycleStage::Fetching);
                }
                Err(e) => {
                    warn!(entity = %entity_id, error = %e, "Fetch failed");
                    if e.is_transient() {
                        report.mark_degraded(CycleStage::Fetching);
                    }
                    report.fetch_failures.push((entity_id.clone(), e.to_string()));
                    self.scheduler.record_outcome_at(entity_id, false, now);
                }
            }
        }

        Ok(output)
    }
}
