//! Stage: ENRICHING
//!
//! One enrichment call covers the whole batch. Items the enricher did not return,
//! or every item when the call fails, continue as their raw originals.

use std::collections::HashMap;
use tracing::{info, warn};

use super::PipelineOrchestrator;
use crate::collaborators::{EnrichedItem, RawItem};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{CycleReport, CycleStage};
use crate::resilience::collaborators::ENRICH;

impl PipelineOrchestrator {
    pub(super) async fn phase_enriching(
        &self,
        report: &mut CycleReport,
        items: Vec<RawItem>,
    ) -> PipelineResult<Vec<EnrichedItem>> {
        info!(cycle_id = %report.cycle_id, items = items.len(), "ENRICHING");

        if items.is_empty() {
            return Ok(Vec::new());
        }

        let enricher = &self.enricher;
        let raw = items.as_slice();
        let mut by_key: HashMap<(String, String), EnrichedItem> =
            match self.invoker.invoke(ENRICH, move || enricher.enrich(raw)).await {
                Ok(enriched) => enriched
                    .into_iter()
                    .map(|item| ((item.entity_id.clone(), item.item_id.clone()), item))
                    .collect(),
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) => {
                    warn!(error = %e, items = items.len(), "Enrichment failed, keeping raw items");
                    report.mark_degraded(CycleStage::Enriching);
                    HashMap::new()
                }
            };

        let enriched: Vec<EnrichedItem> = items
            .iter()
            .map(|raw| {
                by_key
                    .remove(&(raw.entity_id.clone(), raw.item_id.clone()))
                    .unwrap_or_else(|| EnrichedItem::fallback(raw))
            })
            .collect();

        report.items_enriched = enriched.iter().filter(|item| item.enriched).count();
        report.enrichment_fallbacks = enriched.len() - report.items_enriched;
        Ok(enriched)
    }
}
